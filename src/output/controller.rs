//! Fan-out controller
//!
//! Owns the receiver set, the encoder and the pacing bucket. Raw PCM goes in
//! through [`AudioFanOut::write_audio`]; every encoded frame is paced by the
//! leaky bucket and then queued to each receiver's own delivery task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::delivery::{shutdown_all, Enqueued, ReceiverId, ReceiverInfo, ReceiverLink};
use super::negotiation::{check_receiver, negotiate, EncoderSettings};
use crate::audio::{FormatConverter, FrameDuration, PcmFormat};
use crate::codec::Encoder;
use crate::config::{SessionConfig, TransmitterConfig};
use crate::error::{AudioError, OutputError, Result};
use crate::network::{LeakyBucket, ReceiverSession};

type ReceiverSet = Arc<Vec<Arc<ReceiverLink>>>;

/// Encoder plus the optional converter in front of it
struct Pipeline {
    encoder: Box<dyn Encoder>,
    converter: Option<Box<dyn FormatConverter>>,
    source_format: PcmFormat,
}

impl Pipeline {
    fn apply(&mut self, settings: EncoderSettings) -> Result<()> {
        self.encoder.set_frame_duration(settings.frame_duration);
        self.encoder.set_max_encoded_frame_size(settings.max_encoded_frame_size)?;
        Ok(())
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>> {
        let input_format = self.encoder.input_format();
        match self.converter.as_mut() {
            Some(converter) if self.source_format != input_format => {
                let converted = converter.convert(pcm, self.source_format, input_format)?;
                self.encoder.submit(&converted)
            }
            _ => self.encoder.submit(pcm),
        }
    }
}

/// Streams one encoded audio feed to every connected receiver
pub struct AudioFanOut {
    pipeline: Mutex<Pipeline>,
    /// Format the encoder takes; fixed for the controller's lifetime
    encoder_format: PcmFormat,
    settings: parking_lot::Mutex<EncoderSettings>,
    /// Copy-on-write snapshot; writers hold `membership`
    receivers: RwLock<ReceiverSet>,
    membership: Mutex<()>,
    bucket: LeakyBucket,
    session_config: SessionConfig,
    closed: AtomicBool,
}

impl AudioFanOut {
    /// Create a controller whose source PCM already matches the encoder input.
    pub fn new(encoder: Box<dyn Encoder>, config: &TransmitterConfig) -> Result<Self> {
        let input_format = encoder.input_format();
        if config.source_format != input_format {
            return Err(AudioError::UnsupportedFormat(format!(
                "source is {} but the encoder takes {}, a format converter is required",
                config.source_format, input_format
            ))
            .into());
        }
        Self::build(encoder, None, config)
    }

    /// Create a controller that converts source PCM before encoding.
    pub fn with_converter(
        encoder: Box<dyn Encoder>,
        converter: Box<dyn FormatConverter>,
        config: &TransmitterConfig,
    ) -> Result<Self> {
        Self::build(encoder, Some(converter), config)
    }

    fn build(
        encoder: Box<dyn Encoder>,
        converter: Option<Box<dyn FormatConverter>>,
        config: &TransmitterConfig,
    ) -> Result<Self> {
        config.validate()?;
        let encoder_format = encoder.input_format();
        encoder_format.validate_encoder_input()?;

        let settings = EncoderSettings {
            frame_duration: encoder.frame_duration(),
            max_encoded_frame_size: encoder.max_encoded_frame_size(),
        };

        // Bucket counts microseconds of audio so 2.5 ms frames stay exact
        let bucket = LeakyBucket::new(
            config.rate_limit.capacity_ms * 1000,
            config.rate_limit.drain_rate_ms_per_second * 1000,
        );

        tracing::info!(
            "Fan-out ready: encoder input {}, frame {}, bucket {} ms",
            encoder_format,
            settings.frame_duration,
            config.rate_limit.capacity_ms
        );

        Ok(Self {
            pipeline: Mutex::new(Pipeline {
                encoder,
                converter,
                source_format: config.source_format,
            }),
            encoder_format,
            settings: parking_lot::Mutex::new(settings),
            receivers: RwLock::new(Arc::new(Vec::new())),
            membership: Mutex::new(()),
            bucket,
            session_config: config.session.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OutputError::Closed.into());
        }
        Ok(())
    }

    fn snapshot(&self) -> ReceiverSet {
        self.receivers.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Frame duration currently agreed with the receivers
    pub fn frame_duration(&self) -> FrameDuration {
        self.settings.lock().frame_duration
    }

    /// Encoded size bound currently agreed with the receivers
    pub fn max_encoded_frame_size(&self) -> usize {
        self.settings.lock().max_encoded_frame_size
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.read().len()
    }

    /// Snapshot of the connected receivers
    pub fn receivers(&self) -> Vec<ReceiverInfo> {
        self.snapshot().iter().map(|link| link.info()).collect()
    }

    /// Connect to a receiver and add it to the set.
    pub async fn add_receiver(&self, addr: SocketAddr) -> Result<ReceiverId> {
        self.ensure_open()?;
        let session = ReceiverSession::connect(addr, &self.session_config).await?;
        self.add_session(session).await
    }

    /// Add an already established session.
    ///
    /// The session is closed if it cannot join: its decode buffer is below
    /// the shortest frame, or no frame duration fits the new set.
    pub async fn add_session(&self, session: ReceiverSession) -> Result<ReceiverId> {
        let capabilities = session.capabilities();
        if let Err(e) = check_receiver(&self.encoder_format, &capabilities) {
            tracing::warn!(receiver = %session.peer_addr(), "Rejecting receiver: {}", e);
            session.close().await;
            return Err(e.into());
        }

        let _membership = self.membership.lock().await;
        if let Err(e) = self.ensure_open() {
            session.close().await;
            return Err(e);
        }

        let current = self.snapshot();
        let negotiated = negotiate(
            &self.encoder_format,
            current
                .iter()
                .map(|link| link.capabilities())
                .chain(std::iter::once(capabilities)),
        );
        let settings = match negotiated {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(receiver = %session.peer_addr(), "Rejecting receiver: {}", e);
                session.close().await;
                return Err(e.into());
            }
        };

        if let Some(settings) = settings {
            if let Err(e) = self.apply_settings(settings).await {
                session.close().await;
                return Err(e);
            }
        }

        let address = session.peer_addr();
        let link = ReceiverLink::spawn(session, self.session_config.outbound_queue_frames);
        let id = link.id;

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(link);
        *self.receivers.write() = Arc::new(next);

        tracing::info!(receiver = %address, %id, "Receiver added ({} total)", current.len() + 1);
        Ok(id)
    }

    /// Close one receiver and renegotiate for the rest.
    pub async fn remove_receiver(&self, id: ReceiverId) -> Result<()> {
        self.ensure_open()?;
        let _membership = self.membership.lock().await;

        let current = self.snapshot();
        let Some(link) = current.iter().find(|link| link.id == id).cloned() else {
            return Err(OutputError::UnknownReceiver(id).into());
        };

        self.publish_without(&current, &[id]).await;
        link.shutdown().await;
        tracing::info!(receiver = %link.session.peer_addr(), %id, "Receiver removed");
        Ok(())
    }

    /// Drop receivers whose session or delivery task has ended.
    async fn prune_dead(&self) {
        if self.snapshot().iter().all(|link| link.is_alive()) {
            return;
        }

        let _membership = self.membership.lock().await;
        let current = self.snapshot();
        let dead: Vec<Arc<ReceiverLink>> = current.iter().filter(|link| !link.is_alive()).cloned().collect();
        if dead.is_empty() {
            return;
        }

        let ids: Vec<ReceiverId> = dead.iter().map(|link| link.id).collect();
        self.publish_without(&current, &ids).await;
        for link in dead {
            tracing::info!(receiver = %link.session.peer_addr(), id = %link.id, "Pruning disconnected receiver");
            link.shutdown().await;
        }
    }

    /// Publish `current` minus `ids` and renegotiate. Caller holds `membership`.
    async fn publish_without(&self, current: &ReceiverSet, ids: &[ReceiverId]) {
        let next: Vec<Arc<ReceiverLink>> = current
            .iter()
            .filter(|link| !ids.contains(&link.id))
            .cloned()
            .collect();

        // Fewer receivers only loosen the limits, so this cannot fail to fit
        match negotiate(&self.encoder_format, next.iter().map(|link| link.capabilities())) {
            Ok(Some(settings)) => {
                if let Err(e) = self.apply_settings(settings).await {
                    tracing::warn!("Renegotiation after removal failed: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Renegotiation after removal failed: {}", e),
        }

        *self.receivers.write() = Arc::new(next);
    }

    async fn apply_settings(&self, settings: EncoderSettings) -> Result<()> {
        let previous = *self.settings.lock();
        if previous == settings {
            return Ok(());
        }

        self.pipeline.lock().await.apply(settings)?;
        *self.settings.lock() = settings;

        tracing::info!(
            frame_bytes = settings.frame_duration.frame_bytes(&self.encoder_format),
            "Renegotiated encoder: frame {} -> {}, max encoded {} -> {} bytes",
            previous.frame_duration,
            settings.frame_duration,
            previous.max_encoded_frame_size,
            settings.max_encoded_frame_size
        );
        Ok(())
    }

    /// Encode `pcm` and send every complete frame to all receivers.
    ///
    /// Suspends while the receivers' buffers are full.
    pub async fn write_audio(&self, pcm: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.prune_dead().await;

        let mut pipeline = self.pipeline.lock().await;
        let frames = pipeline.encode(pcm)?;
        let duration = pipeline.encoder.frame_duration();
        self.distribute(frames, duration).await
    }

    /// Encode the buffered tail, padded with silence, and send it.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.prune_dead().await;

        let mut pipeline = self.pipeline.lock().await;
        let frames = pipeline.encoder.finish()?;
        let duration = pipeline.encoder.frame_duration();
        self.distribute(frames, duration).await
    }

    async fn distribute(&self, frames: Vec<Bytes>, duration: FrameDuration) -> Result<()> {
        for frame in frames {
            self.bucket.wait_for_capacity(duration.as_micros()).await?;
            self.ensure_open()?;

            for link in self.snapshot().iter() {
                match link.offer(&frame) {
                    Enqueued::Queued => {}
                    Enqueued::Dropped => {
                        tracing::warn!(receiver = %link.session.peer_addr(), "Receiver queue full, frame dropped");
                    }
                    Enqueued::Dead => {
                        tracing::trace!(receiver = %link.session.peer_addr(), "Skipping dead receiver");
                    }
                }
            }
            tracing::trace!(frame_bytes = frame.len(), "Frame distributed");
        }
        Ok(())
    }

    /// Close every session. Later calls to other methods fail with `Closed`.
    ///
    /// Queued frames get up to the configured drain timeout to go out.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let links = {
            let _membership = self.membership.lock().await;
            std::mem::take(&mut *self.receivers.write())
        };

        shutdown_all(&links, self.session_config.close_drain_timeout()).await;
        tracing::info!("Fan-out closed, {} receiver(s) disconnected", links.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PcmFramer;
    use crate::error::{CodecError, Error};
    use crate::protocol::{
        read_delimited, sample_announcement, write_delimited, ReceiverCapabilities, ReceiverHello,
        ReceiverMessage, TransmitterMessage,
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::sync::mpsc;

    /// Emits a fixed-size packet per frame, tagged with a running counter
    struct StubEncoder {
        format: PcmFormat,
        duration: FrameDuration,
        max_encoded: usize,
        packet_size: usize,
        framer: PcmFramer,
        produced: u32,
    }

    impl StubEncoder {
        fn new(packet_size: usize) -> Box<Self> {
            let format = PcmFormat::default();
            Box::new(Self {
                format,
                duration: FrameDuration::Ms20,
                max_encoded: 4096,
                packet_size,
                framer: PcmFramer::new(&format),
                produced: 0,
            })
        }

        fn packets(&mut self, frames: Vec<Vec<u8>>) -> Vec<Bytes> {
            frames
                .into_iter()
                .map(|_| {
                    let mut packet = vec![0u8; self.packet_size.min(self.max_encoded)];
                    packet[..4].copy_from_slice(&self.produced.to_le_bytes());
                    self.produced += 1;
                    Bytes::from(packet)
                })
                .collect()
        }
    }

    impl Encoder for StubEncoder {
        fn input_format(&self) -> PcmFormat {
            self.format
        }

        fn frame_duration(&self) -> FrameDuration {
            self.duration
        }

        fn set_frame_duration(&mut self, duration: FrameDuration) {
            self.duration = duration;
        }

        fn max_encoded_frame_size(&self) -> usize {
            self.max_encoded
        }

        fn set_max_encoded_frame_size(&mut self, size: usize) -> std::result::Result<(), CodecError> {
            self.max_encoded = size;
            Ok(())
        }

        fn submit(&mut self, pcm: &[u8]) -> Result<Vec<Bytes>> {
            let frames = self.framer.push(pcm, self.frame_bytes())?;
            Ok(self.packets(frames))
        }

        fn finish(&mut self) -> Result<Vec<Bytes>> {
            let frames = self.framer.finish(self.frame_bytes())?;
            Ok(self.packets(frames))
        }
    }

    /// Mono to stereo by sample duplication
    struct MonoToStereo;

    impl FormatConverter for MonoToStereo {
        fn convert(&mut self, input: &[u8], _from: PcmFormat, _to: PcmFormat) -> std::result::Result<Vec<u8>, AudioError> {
            Ok(input.chunks_exact(2).flat_map(|s| [s[0], s[1], s[0], s[1]]).collect())
        }
    }

    fn fan_out(packet_size: usize) -> AudioFanOut {
        AudioFanOut::new(StubEncoder::new(packet_size), &TransmitterConfig::default()).unwrap()
    }

    async fn fake_receiver(max_decoded: u32, buffer: usize) -> (ReceiverSession, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(buffer);
        let hello = ReceiverMessage::Hello(ReceiverHello {
            capabilities: ReceiverCapabilities {
                max_decoded_frame_size: max_decoded,
                max_encoded_frame_size: 4000,
            },
            announcement: sample_announcement(),
        });
        write_delimited(&mut remote, &hello.encode_to_vec()).await.unwrap();
        let addr = "192.168.1.50:58764".parse().unwrap();
        let session = ReceiverSession::handshake(local, addr, 64 * 1024).await.unwrap();
        (session, remote)
    }

    /// Forward every audio frame the receiver gets to a channel
    fn collect_frames(mut remote: DuplexStream) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(body) = read_delimited(&mut remote, 64 * 1024).await {
                let TransmitterMessage::AudioData(frame) = TransmitterMessage::decode(&body).unwrap();
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });
        rx
    }

    fn pcm(frames: usize, duration: FrameDuration) -> Vec<u8> {
        vec![0x11; duration.frame_bytes(&PcmFormat::default()) * frames]
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within two seconds");
    }

    #[test]
    fn test_source_format_mismatch_needs_converter() {
        let config = TransmitterConfig {
            source_format: PcmFormat::s16le(48000, 1),
            ..TransmitterConfig::default()
        };
        let result = AudioFanOut::new(StubEncoder::new(16), &config);
        assert!(matches!(result, Err(Error::Audio(AudioError::UnsupportedFormat(_)))));
    }

    #[tokio::test]
    async fn test_negotiation_follows_membership() {
        let output = fan_out(16);
        assert_eq!(output.frame_duration(), FrameDuration::Ms20);

        let (first, _r1) = fake_receiver(3840, 4096).await;
        let (second, _r2) = fake_receiver(2000, 4096).await;
        output.add_session(first).await.unwrap();
        assert_eq!(output.frame_duration(), FrameDuration::Ms20);

        let second_id = output.add_session(second).await.unwrap();
        assert_eq!(output.frame_duration(), FrameDuration::Ms10);
        assert_eq!(output.max_encoded_frame_size(), 4000);

        let (tiny, mut tiny_remote) = fake_receiver(100, 4096).await;
        let err = output.add_session(tiny).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Output(OutputError::ReceiverBufferTooSmall { offered: 100, required: 480 })
        ));
        assert_eq!(output.receiver_count(), 2);
        assert_eq!(output.frame_duration(), FrameDuration::Ms10);

        // The rejected receiver's stream was shut down
        let mut rest = Vec::new();
        assert_eq!(tiny_remote.read_to_end(&mut rest).await.unwrap(), 0);

        output.remove_receiver(second_id).await.unwrap();
        assert_eq!(output.receiver_count(), 1);
        assert_eq!(output.frame_duration(), FrameDuration::Ms20);

        let unknown = uuid::Uuid::new_v4();
        assert!(matches!(
            output.remove_receiver(unknown).await,
            Err(Error::Output(OutputError::UnknownReceiver(id))) if id == unknown
        ));
    }

    #[tokio::test]
    async fn test_frames_reach_every_receiver() {
        let output = fan_out(16);
        let (a, ra) = fake_receiver(3840, 4096).await;
        let (b, rb) = fake_receiver(3840, 4096).await;
        output.add_session(a).await.unwrap();
        output.add_session(b).await.unwrap();
        let mut frames_a = collect_frames(ra);
        let mut frames_b = collect_frames(rb);

        // Two and a half frames, then the padded tail
        let mut audio = pcm(2, FrameDuration::Ms20);
        audio.extend(pcm(1, FrameDuration::Ms10));
        output.write_audio(&audio).await.unwrap();
        output.flush().await.unwrap();

        for frames in [&mut frames_a, &mut frames_b] {
            for expected in 0u32..3 {
                let frame = tokio::time::timeout(Duration::from_secs(2), frames.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(frame[..4], expected.to_le_bytes());
            }
        }

        eventually(|| output.receivers().iter().all(|info| info.stats.frames_sent == 3)).await;
        let infos = output.receivers();
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().all(|info| info.device_name == "Audio-Network Receiver"));
    }

    #[tokio::test]
    async fn test_converter_runs_before_encoder() {
        let config = TransmitterConfig {
            source_format: PcmFormat::s16le(48000, 1),
            ..TransmitterConfig::default()
        };
        let output = AudioFanOut::with_converter(StubEncoder::new(16), Box::new(MonoToStereo), &config).unwrap();
        let (session, remote) = fake_receiver(3840, 4096).await;
        output.add_session(session).await.unwrap();
        let mut frames = collect_frames(remote);

        // 20 ms of mono is half a stereo frame's bytes
        let mono = vec![0u8; FrameDuration::Ms20.frame_bytes(&config.source_format) * 2];
        output.write_audio(&mono).await.unwrap();

        for _ in 0..2 {
            tokio::time::timeout(Duration::from_secs(2), frames.recv())
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_stalled_receiver_only_hurts_itself() {
        let config = TransmitterConfig {
            session: SessionConfig {
                outbound_queue_frames: 32,
                ..SessionConfig::default()
            },
            ..TransmitterConfig::default()
        };
        let output = AudioFanOut::new(StubEncoder::new(200), &config).unwrap();

        // Room for the handshake and about one frame, never read
        let (stalled, _stalled_remote) = fake_receiver(3840, 256).await;
        let (healthy, healthy_remote) = fake_receiver(3840, 64 * 1024).await;
        output.add_session(stalled).await.unwrap();
        output.add_session(healthy).await.unwrap();
        let mut frames = collect_frames(healthy_remote);

        let mut received = 0;
        for _ in 0..2 {
            output.write_audio(&pcm(20, FrameDuration::Ms20)).await.unwrap();
            for _ in 0..20 {
                tokio::time::timeout(Duration::from_secs(2), frames.recv())
                    .await
                    .unwrap()
                    .unwrap();
                received += 1;
            }
        }
        assert_eq!(received, 40);

        let infos = output.receivers();
        let dropped: Vec<u64> = infos.iter().map(|info| info.stats.frames_dropped).collect();
        assert!(dropped[0] > 0);
        assert_eq!(dropped[1], 0);
    }

    #[tokio::test]
    async fn test_disconnected_receiver_pruned() {
        let output = fan_out(16);
        let (keeps, _keeps_remote) = fake_receiver(3840, 4096).await;
        let (leaves, leaves_remote) = fake_receiver(1920, 4096).await;
        output.add_session(keeps).await.unwrap();
        output.add_session(leaves).await.unwrap();
        assert_eq!(output.frame_duration(), FrameDuration::Ms10);

        drop(leaves_remote);
        eventually(|| output.receivers().iter().any(|info| !info.connected)).await;

        output.write_audio(&pcm(1, FrameDuration::Ms10)).await.unwrap();
        assert_eq!(output.receiver_count(), 1);
        assert_eq!(output.frame_duration(), FrameDuration::Ms20);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = TransmitterConfig::default();
        config.rate_limit.drain_rate_ms_per_second = 0;
        assert!(matches!(
            AudioFanOut::new(StubEncoder::new(16), &config),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_paced_by_bucket() {
        let mut config = TransmitterConfig::default();
        config.rate_limit.capacity_ms = 60;
        let output = AudioFanOut::new(StubEncoder::new(16), &config).unwrap();

        let start = tokio::time::Instant::now();
        output.write_audio(&pcm(6, FrameDuration::Ms20)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_close_is_final_and_idempotent() {
        let output = fan_out(16);
        let (session, mut remote) = fake_receiver(3840, 4096).await;
        output.add_session(session).await.unwrap();

        output.close().await;
        output.close().await;
        assert!(output.is_closed());
        assert_eq!(output.receiver_count(), 0);

        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);

        assert!(matches!(
            output.write_audio(&[0u8; 4]).await,
            Err(Error::Output(OutputError::Closed))
        ));
        assert!(matches!(output.flush().await, Err(Error::Output(OutputError::Closed))));

        let (late, _late_remote) = fake_receiver(3840, 4096).await;
        assert!(matches!(
            output.add_session(late).await,
            Err(Error::Output(OutputError::Closed))
        ));
    }
}

//! One TCP session per receiver
//!
//! After connecting, the receiver sends a single handshake carrying its
//! buffer sizes. From then on the transmitter writes audio-data messages and
//! the receiver may report playback problems on the same stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::constants::PROTOCOL_VERSION;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::protocol::{
    read_delimited, write_delimited, ReceiverAnnouncement, ReceiverCapabilities, ReceiverHello,
    ReceiverMessage, TransmitterMessage,
};

/// Any ordered, reliable duplex byte stream a session can run over
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

type BoxedStream = Box<dyn ByteStream>;

/// Session counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// Frames skipped because the receiver's queue was full
    pub frames_dropped: u64,
    pub receiver_underflows: u64,
    pub receiver_decode_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_sent: AtomicU64,
    bytes_sent: AtomicU64,
    frames_dropped: AtomicU64,
    receiver_underflows: AtomicU64,
    receiver_decode_errors: AtomicU64,
}

/// A live session with one receiver
pub struct ReceiverSession {
    peer: SocketAddr,
    hello: ReceiverHello,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverSession {
    /// Connect over TCP and run the handshake.
    pub async fn connect(addr: SocketAddr, config: &SessionConfig) -> Result<Self> {
        tracing::debug!(receiver = %addr, "Connecting");

        let stream = tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("{}: timed out", addr)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(receiver = %addr, "Failed to set TCP_NODELAY: {}", e);
        }

        Self::handshake_within(stream, addr, config.max_message_size, config.handshake_timeout()).await
    }

    /// Read the receiver's handshake from an established stream.
    ///
    /// Anything other than a capability announcement fails with
    /// `ProtocolMismatch`; the stream is shut down and dropped first.
    pub async fn handshake<S: ByteStream>(stream: S, peer: SocketAddr, max_message_size: usize) -> Result<Self> {
        Self::establish(Box::new(stream), peer, max_message_size, None).await
    }

    /// Like [`handshake`](Self::handshake), but a peer that stays silent
    /// for `timeout` fails with `HandshakeTimeout`.
    pub async fn handshake_within<S: ByteStream>(
        stream: S,
        peer: SocketAddr,
        max_message_size: usize,
        timeout: Duration,
    ) -> Result<Self> {
        Self::establish(Box::new(stream), peer, max_message_size, Some(timeout)).await
    }

    async fn establish(
        mut stream: BoxedStream,
        peer: SocketAddr,
        max_message_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let read = match timeout {
            Some(limit) => tokio::time::timeout(limit, read_delimited(&mut stream, max_message_size))
                .await
                .unwrap_or_else(|_| {
                    Err(NetworkError::HandshakeTimeout(format!("{}: nothing received in {:?}", peer, limit)).into())
                }),
            None => read_delimited(&mut stream, max_message_size).await,
        };

        let body = match read {
            Ok(body) => body,
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(e);
            }
        };

        let hello = match ReceiverMessage::decode(&body) {
            Ok(ReceiverMessage::Hello(hello)) => hello,
            Ok(ReceiverMessage::Error(_)) => {
                let _ = stream.shutdown().await;
                return Err(ProtocolError::ProtocolMismatch(
                    "expected receiver information, got an error report".into(),
                )
                .into());
            }
            Err(e) => {
                let _ = stream.shutdown().await;
                return Err(ProtocolError::ProtocolMismatch(format!("unreadable handshake: {}", e)).into());
            }
        };

        if hello.announcement.protocol_version != PROTOCOL_VERSION {
            tracing::warn!(
                receiver = %peer,
                "Receiver speaks protocol version {}, expected {}",
                hello.announcement.protocol_version,
                PROTOCOL_VERSION
            );
        }

        tracing::info!(
            receiver = %peer,
            max_decoded = hello.capabilities.max_decoded_frame_size,
            max_encoded = hello.capabilities.max_encoded_frame_size,
            "Session established with {}",
            hello.announcement
        );

        let (reader, writer) = tokio::io::split(stream);
        let connected = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let monitor = tokio::spawn(monitor_receiver(
            reader,
            peer,
            max_message_size,
            connected.clone(),
            counters.clone(),
        ));

        Ok(Self {
            peer,
            hello,
            writer: Mutex::new(Some(writer)),
            connected,
            counters,
            monitor: parking_lot::Mutex::new(Some(monitor)),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn capabilities(&self) -> ReceiverCapabilities {
        self.hello.capabilities
    }

    pub fn announcement(&self) -> &ReceiverAnnouncement {
        &self.hello.announcement
    }

    /// False once the stream failed, the receiver hung up, or `close` ran
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            receiver_underflows: self.counters.receiver_underflows.load(Ordering::Relaxed),
            receiver_decode_errors: self.counters.receiver_decode_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_dropped(&self) {
        self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Write one encoded frame.
    ///
    /// The frame must fit the receiver's encoded frame limit; a larger one
    /// fails with `FrameTooLarge` without touching the stream.
    pub async fn send(&self, frame: &Bytes) -> Result<()> {
        let max = self.hello.capabilities.max_encoded_frame_size as usize;
        if frame.len() > max {
            return Err(NetworkError::FrameTooLarge {
                size: frame.len(),
                max,
            }
            .into());
        }

        let body = TransmitterMessage::AudioData(frame.clone()).encode();

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| NetworkError::SendFailed(format!("{}: session closed", self.peer)))?;

        if let Err(e) = write_delimited(writer, &body).await {
            self.connected.store(false, Ordering::Release);
            return Err(match e {
                Error::Io(io) => NetworkError::SendFailed(format!("{}: {}", self.peer, io)).into(),
                other => other,
            });
        }

        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
        tracing::trace!(receiver = %self.peer, frame_bytes = frame.len(), "Frame sent");
        Ok(())
    }

    /// Shut down both directions. Safe to call more than once.
    pub async fn close(&self) {
        self.connected.store(false, Ordering::Release);

        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(receiver = %self.peer, "Shutdown error: {}", e);
            }
            tracing::info!(receiver = %self.peer, "Session closed");
        }
    }
}

impl Drop for ReceiverSession {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.abort();
        }
    }
}

/// Read what the receiver sends after the handshake until the stream ends.
async fn monitor_receiver(
    mut reader: ReadHalf<BoxedStream>,
    peer: SocketAddr,
    max_message_size: usize,
    connected: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    loop {
        let body = match read_delimited(&mut reader, max_message_size).await {
            Ok(body) => body,
            Err(e) if e.is_connection_loss() => {
                tracing::info!(receiver = %peer, "Receiver disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(receiver = %peer, "Receiver stream broken: {}", e);
                break;
            }
        };

        match ReceiverMessage::decode(&body) {
            Ok(ReceiverMessage::Error(report)) => {
                if report.audio_underflow {
                    counters.receiver_underflows.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(receiver = %peer, "Receiver reports audio underflow");
                }
                if report.audio_decode_error {
                    counters.receiver_decode_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(receiver = %peer, "Receiver reports a decode error");
                }
            }
            Ok(ReceiverMessage::Hello(_)) => {
                tracing::debug!(receiver = %peer, "Ignoring repeated handshake");
            }
            Err(e) => {
                tracing::debug!(receiver = %peer, "Discarding unreadable receiver message: {}", e);
            }
        }
    }

    connected.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{sample_announcement, ReceiverErrorReport};
    use tokio::io::{AsyncReadExt, DuplexStream};

    const MAX_MESSAGE: usize = 64 * 1024;

    fn peer() -> SocketAddr {
        "10.0.0.7:58764".parse().unwrap()
    }

    fn hello(max_decoded: u32, max_encoded: u32) -> Vec<u8> {
        ReceiverMessage::Hello(ReceiverHello {
            capabilities: ReceiverCapabilities {
                max_decoded_frame_size: max_decoded,
                max_encoded_frame_size: max_encoded,
            },
            announcement: sample_announcement(),
        })
        .encode_to_vec()
    }

    async fn established(max_encoded: u32) -> (ReceiverSession, DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        write_delimited(&mut remote, &hello(3840, max_encoded)).await.unwrap();
        let session = ReceiverSession::handshake(local, peer(), MAX_MESSAGE).await.unwrap();
        (session, remote)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met within a second");
    }

    #[tokio::test]
    async fn test_handshake_reads_capabilities() {
        let (session, _remote) = established(1500).await;
        assert_eq!(
            session.capabilities(),
            ReceiverCapabilities {
                max_decoded_frame_size: 3840,
                max_encoded_frame_size: 1500,
            }
        );
        assert_eq!(session.announcement(), &sample_announcement());
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_non_handshake_first_message_is_protocol_mismatch() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let report = ReceiverMessage::Error(ReceiverErrorReport {
            audio_underflow: true,
            audio_decode_error: false,
        });
        write_delimited(&mut remote, &report.encode_to_vec()).await.unwrap();

        let err = ReceiverSession::handshake(local, peer(), MAX_MESSAGE)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Protocol(ProtocolError::ProtocolMismatch(_))));

        // Our side is gone: the peer reads end of stream
        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_garbage_handshake_is_protocol_mismatch() {
        let (local, mut remote) = tokio::io::duplex(1024);
        write_delimited(&mut remote, &[0xFF, 0xFF, 0xFF]).await.unwrap();

        let err = ReceiverSession::handshake(local, peer(), MAX_MESSAGE)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Protocol(ProtocolError::ProtocolMismatch(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (local, mut remote) = tokio::io::duplex(1024);

        let err = ReceiverSession::handshake_within(local, peer(), MAX_MESSAGE, Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Network(NetworkError::HandshakeTimeout(_))));

        // Our side was shut down
        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_to_silent_listener_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the connection open without ever writing
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(stream);
        });

        let config = SessionConfig {
            connect_timeout_ms: 100,
            handshake_timeout_ms: 100,
            ..SessionConfig::default()
        };
        let result = tokio::time::timeout(Duration::from_secs(3), ReceiverSession::connect(addr, &config))
            .await
            .expect("connect must not hang on a silent peer");
        assert!(matches!(
            result.err().unwrap(),
            Error::Network(NetworkError::HandshakeTimeout(_))
        ));
        accepted.abort();
    }

    #[tokio::test]
    async fn test_eof_before_handshake() {
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);
        let err = ReceiverSession::handshake(local, peer(), MAX_MESSAGE)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_send_wraps_frames() {
        let (session, mut remote) = established(1500).await;

        session.send(&Bytes::from_static(b"first")).await.unwrap();
        session.send(&Bytes::from_static(b"second")).await.unwrap();

        for expected in [&b"first"[..], &b"second"[..]] {
            let body = read_delimited(&mut remote, MAX_MESSAGE).await.unwrap();
            assert_eq!(
                TransmitterMessage::decode(&body).unwrap(),
                TransmitterMessage::AudioData(Bytes::copy_from_slice(expected))
            );
        }

        let stats = session.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.bytes_sent, 11);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (session, _remote) = established(4).await;
        let err = session.send(&Bytes::from_static(b"12345")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Network(NetworkError::FrameTooLarge { size: 5, max: 4 })
        ));
        assert_eq!(session.stats().frames_sent, 0);
    }

    #[tokio::test]
    async fn test_receiver_error_reports_counted() {
        let (session, mut remote) = established(1500).await;
        let report = ReceiverMessage::Error(ReceiverErrorReport {
            audio_underflow: true,
            audio_decode_error: true,
        });
        write_delimited(&mut remote, &report.encode_to_vec()).await.unwrap();

        eventually(|| session.stats().receiver_decode_errors == 1).await;
        assert_eq!(session.stats().receiver_underflows, 1);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn test_receiver_hangup_marks_disconnected() {
        let (session, remote) = established(1500).await;
        drop(remote);
        eventually(|| !session.is_connected()).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, mut remote) = established(1500).await;
        session.close().await;
        session.close().await;

        assert!(!session.is_connected());
        assert!(session.send(&Bytes::from_static(b"late")).await.is_err());

        let mut rest = Vec::new();
        assert_eq!(remote.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_connect_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            write_delimited(&mut stream, &hello(1920, 1000)).await.unwrap();
            let body = read_delimited(&mut stream, MAX_MESSAGE).await.unwrap();
            assert!(TransmitterMessage::decode(&body).is_ok());
        });

        let session = ReceiverSession::connect(addr, &SessionConfig::default()).await.unwrap();
        assert_eq!(session.capabilities().max_decoded_frame_size, 1920);
        session.send(&Bytes::from_static(b"opus")).await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ReceiverSession::connect(addr, &SessionConfig::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Network(NetworkError::ConnectionFailed(_))));
    }
}

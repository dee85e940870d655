//! Audio Transmitter Application
//!
//! Discovers receivers on the local network and streams raw PCM from a file
//! or stdin to all of them.
//!
//! Usage: `transmitter [PCM_FILE | -] [CONFIG_FILE]`

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_transmitter::{
    codec::OpusEncoder,
    config::TransmitterConfig,
    network::{discovery::discover_with_buffer, AnnouncementListener, DiscoveredReceiver},
    output::AudioFanOut,
};

/// Bytes read from the source per write
const READ_CHUNK: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LAN Audio Transmitter");

    let mut args = std::env::args().skip(1);
    let input = args.next().unwrap_or_else(|| "-".to_string());
    let config = match args.next() {
        Some(path) => TransmitterConfig::load(&PathBuf::from(&path))
            .with_context(|| format!("loading configuration from {}", path))?,
        None => TransmitterConfig::load_default()?,
    };

    let encoder = OpusEncoder::new(config.source_format, config.encoder.clone())?;
    let output = Arc::new(AudioFanOut::new(Box::new(encoder), &config)?);

    let found = discover_with_buffer(
        config.discovery.port,
        config.discovery.timeout(),
        config.discovery.receive_buffer_bytes,
    )
    .await?;
    // Connect concurrently so one silent receiver does not hold up the rest.
    // Discovery keeps repeated answers, so only the first per IP is used.
    let mut seen = HashSet::new();
    let unique = found.iter().filter(|receiver| seen.insert(receiver.address.ip()));
    join_all(unique.map(|receiver| connect_receiver(&output, &config, receiver))).await;

    // Keep picking up discovery responses that arrive after the first round
    let (listener, mut announcements) = AnnouncementListener::start(config.discovery.port)?;
    let joiner = {
        let output = output.clone();
        let config = config.clone();
        tokio::spawn(async move {
            while let Some(receiver) = announcements.recv().await {
                if !receiver.announcement.currently_streaming {
                    connect_receiver(&output, &config, &receiver).await;
                }
            }
        })
    };

    tracing::info!("Streaming to {} receiver(s), source {}", output.receiver_count(), config.source_format);

    let source: Box<dyn AsyncRead + Unpin + Send> = if input == "-" {
        Box::new(tokio::io::stdin())
    } else {
        Box::new(
            tokio::fs::File::open(&input)
                .await
                .with_context(|| format!("opening {}", input))?,
        )
    };

    tokio::select! {
        result = stream(&output, source) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    output.flush().await?;

    for info in output.receivers() {
        tracing::info!(
            receiver = %info.address,
            "{}: {} frames sent, {} dropped, {} underflows reported",
            info.device_name,
            info.stats.frames_sent,
            info.stats.frames_dropped,
            info.stats.receiver_underflows
        );
    }

    listener.stop().await;
    joiner.abort();
    output.close().await;

    tracing::info!("Transmitter stopped");
    Ok(())
}

/// Open a session to a discovered receiver's audio port, unless one is open
async fn connect_receiver(output: &AudioFanOut, config: &TransmitterConfig, receiver: &DiscoveredReceiver) {
    let addr = SocketAddr::new(receiver.address.ip(), config.session.port);
    if output.receivers().iter().any(|info| info.address.ip() == addr.ip()) {
        tracing::debug!(receiver = %addr, "Already connected");
        return;
    }
    match output.add_receiver(addr).await {
        Ok(id) => tracing::info!(receiver = %addr, %id, "Connected to {}", receiver.announcement),
        Err(e) => tracing::warn!(receiver = %addr, "Could not add {}: {}", receiver.announcement, e),
    }
}

/// Feed the source into the controller until it ends
async fn stream(output: &AudioFanOut, mut source: Box<dyn AsyncRead + Unpin + Send>) -> Result<()> {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        output.write_audio(&buf[..n]).await?;
        total += n as u64;
    }
    tracing::info!("Source finished after {} bytes", total);
    Ok(())
}

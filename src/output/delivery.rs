//! Per-receiver outbound queue and delivery task

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::network::{ReceiverSession, SessionStats};
use crate::protocol::ReceiverCapabilities;

/// Identifies one receiver inside a fan-out controller
pub type ReceiverId = Uuid;

/// Snapshot of one connected receiver
#[derive(Debug, Clone)]
pub struct ReceiverInfo {
    pub id: ReceiverId,
    pub address: SocketAddr,
    pub device_name: String,
    pub capabilities: ReceiverCapabilities,
    pub stats: SessionStats,
    pub connected: bool,
}

/// What happened to a frame offered to a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// Queue full; the oldest queued frame was evicted for this receiver only
    Dropped,
    /// The delivery task is gone
    Dead,
}

/// A session plus the queue and task feeding it.
///
/// Every frame is a shared `Bytes`, so each receiver walks the same
/// immutable content at its own pace. The queue is a single-subscriber
/// broadcast channel: once it is full, each new frame evicts the oldest one.
pub(crate) struct ReceiverLink {
    pub(crate) id: ReceiverId,
    pub(crate) session: Arc<ReceiverSession>,
    queue: Mutex<Option<broadcast::Sender<Bytes>>>,
    /// Effective queue length (the channel rounds up to a power of two)
    capacity: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReceiverLink {
    /// Spawn the delivery task for `session`.
    pub(crate) fn spawn(session: ReceiverSession, queue_frames: usize) -> Arc<Self> {
        let session = Arc::new(session);
        let capacity = queue_frames.max(1).next_power_of_two();
        let (tx, rx) = broadcast::channel(capacity);
        let task = tokio::spawn(deliver(session.clone(), rx));

        Arc::new(Self {
            id: Uuid::new_v4(),
            session,
            queue: Mutex::new(Some(tx)),
            capacity,
            task: Mutex::new(Some(task)),
        })
    }

    pub(crate) fn capabilities(&self) -> ReceiverCapabilities {
        self.session.capabilities()
    }

    pub(crate) fn is_alive(&self) -> bool {
        let queue_open = self.queue.lock().as_ref().is_some_and(|tx| tx.receiver_count() > 0);
        queue_open && self.session.is_connected()
    }

    pub(crate) fn info(&self) -> ReceiverInfo {
        ReceiverInfo {
            id: self.id,
            address: self.session.peer_addr(),
            device_name: self.session.announcement().device_name.clone(),
            capabilities: self.session.capabilities(),
            stats: self.session.stats(),
            connected: self.is_alive(),
        }
    }

    /// Queue a frame without waiting.
    pub(crate) fn offer(&self, frame: &Bytes) -> Enqueued {
        let queue = self.queue.lock();
        let Some(tx) = queue.as_ref() else {
            return Enqueued::Dead;
        };
        let full = tx.len() >= self.capacity;
        match tx.send(frame.clone()) {
            Ok(_) if full => {
                self.session.record_dropped();
                Enqueued::Dropped
            }
            Ok(_) => Enqueued::Queued,
            Err(_) => Enqueued::Dead,
        }
    }

    /// Stop immediately, discarding queued frames.
    pub(crate) async fn shutdown(&self) {
        self.queue.lock().take();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.session.close().await;
    }
}

/// Close every link, letting queued frames drain for up to `drain_timeout`.
pub(crate) async fn shutdown_all(links: &[Arc<ReceiverLink>], drain_timeout: Duration) {
    // Dropping the senders ends each delivery task once its queue is empty
    for link in links {
        link.queue.lock().take();
    }

    let mut tasks: Vec<JoinHandle<()>> = links.iter().filter_map(|link| link.task.lock().take()).collect();

    if tokio::time::timeout(drain_timeout, join_all(tasks.iter_mut()))
        .await
        .is_err()
    {
        tracing::warn!("Receivers did not drain within {:?}, aborting", drain_timeout);
    }
    for task in &tasks {
        task.abort();
    }

    join_all(links.iter().map(|link| link.session.close())).await;
}

async fn deliver(session: Arc<ReceiverSession>, mut rx: broadcast::Receiver<Bytes>) {
    loop {
        let frame = match rx.recv().await {
            Ok(frame) => frame,
            // Evictions were already counted when the frame was offered
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(receiver = %session.peer_addr(), "Skipped {} stale frames", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Err(e) = session.send(&frame).await {
            if e.is_connection_loss() {
                tracing::info!(receiver = %session.peer_addr(), "Receiver connection lost: {}", e);
            } else {
                tracing::warn!(receiver = %session.peer_addr(), "Delivery failed: {}", e);
            }
            break;
        }
    }
    tracing::debug!(receiver = %session.peer_addr(), "Delivery task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        read_delimited, sample_announcement, write_delimited, ReceiverHello, ReceiverMessage, TransmitterMessage,
    };

    async fn link_over_duplex(queue_frames: usize) -> (Arc<ReceiverLink>, tokio::io::DuplexStream) {
        let (local, mut remote) = tokio::io::duplex(64);
        let hello = ReceiverMessage::Hello(ReceiverHello {
            capabilities: ReceiverCapabilities {
                max_decoded_frame_size: 3840,
                max_encoded_frame_size: 1024,
            },
            announcement: sample_announcement(),
        });
        write_delimited(&mut remote, &hello.encode_to_vec()).await.unwrap();
        let session = ReceiverSession::handshake(local, "10.0.0.9:58764".parse().unwrap(), 4096)
            .await
            .unwrap();
        (ReceiverLink::spawn(session, queue_frames), remote)
    }

    async fn next_marker(remote: &mut tokio::io::DuplexStream) -> u8 {
        let body = read_delimited(remote, 4096).await.unwrap();
        let TransmitterMessage::AudioData(frame) = TransmitterMessage::decode(&body).unwrap();
        frame[0]
    }

    #[tokio::test]
    async fn test_full_queue_evicts_oldest() {
        let (link, mut remote) = link_over_duplex(4).await;

        // Nothing yields in between, so the delivery task has not run yet
        let outcomes: Vec<Enqueued> = (0u8..10).map(|n| link.offer(&Bytes::from(vec![n; 16]))).collect();
        assert!(outcomes[..4].iter().all(|o| *o == Enqueued::Queued));
        assert!(outcomes[4..].iter().all(|o| *o == Enqueued::Dropped));
        assert_eq!(link.session.stats().frames_dropped, 6);

        for expected in 6u8..10 {
            assert_eq!(next_marker(&mut remote).await, expected);
        }

        shutdown_all(&[link], Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_queue_rounds_up_to_power_of_two() {
        let (link, _remote) = link_over_duplex(3).await;
        assert_eq!(link.capacity, 4);
        assert!(link.is_alive());

        link.shutdown().await;
        assert!(!link.is_alive());
        assert_eq!(link.offer(&Bytes::from_static(b"late")), Enqueued::Dead);
    }
}

//! Network subsystem: receiver discovery, sessions and pacing

pub mod discovery;
pub mod leaky_bucket;
pub mod session;

pub use discovery::{broadcast_addresses, discover, AnnouncementListener, DiscoveredReceiver, DiscoverySocket};
pub use leaky_bucket::{Admission, LeakyBucket};
pub use session::{ByteStream, ReceiverSession, SessionStats};

//! Cross-instance cue sync.
//!
//! Groups with a `sync_group` publish every transition they make on their
//! own; peers follow with `send_sync` off so messages never echo back.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Accepted skew between a peer's entry time and ours, seconds
pub const SYNC_CLAMP: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
	pub time: f64,
	pub cue: String,
	pub sender_session_id: String,
}

impl SyncMessage {
	/// Entry time to use locally: the peer's, unless clocks disagree too much
	pub fn clamped_time(&self, now: f64) -> f64 {
		return self.time.clamp(now - SYNC_CLAMP, now + SYNC_CLAMP);
	}
}

/// A message together with the topic it was published on
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEnvelope {
	pub topic: String,
	pub message: SyncMessage,
}

pub trait SyncTransport: Send + Sync {
	fn publish(&self, topic: &str, message: &SyncMessage) -> anyhow::Result<()>;

	fn subscribe(&self) -> broadcast::Receiver<SyncEnvelope>;
}

/// In-process bus. Instances sharing one bus behave like peers on a broker.
#[derive(Clone)]
pub struct LocalSyncBus {
	sender: broadcast::Sender<SyncEnvelope>,
}

impl LocalSyncBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		return LocalSyncBus { sender };
	}
}

impl Default for LocalSyncBus {
	fn default() -> Self {
		return LocalSyncBus::new(64);
	}
}

impl SyncTransport for LocalSyncBus {
	fn publish(&self, topic: &str, message: &SyncMessage) -> anyhow::Result<()> {
		// No subscribers is not an error
		let receivers = self
			.sender
			.send(SyncEnvelope {
				topic: String::from(topic),
				message: message.clone(),
			})
			.unwrap_or(0);
		trace!(topic, receivers, cue = %message.cue, "Published sync message");
		return Ok(());
	}

	fn subscribe(&self) -> broadcast::Receiver<SyncEnvelope> {
		return self.sender.subscribe();
	}
}

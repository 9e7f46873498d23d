//! Persisted "where was this group" markers.

#[cfg(feature = "sqlite-checkpoints")]
use std::path::Path;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::utilities::clock;
use crate::utilities::rate_limit::{CheckpointLimitConfig, TokenBucket};

#[derive(Debug, Error)]
pub enum CheckpointError {
	#[error("Checkpoint rate limit exceeded")]
	RateLimited,
	#[error("Checkpoint storage error: {0}")]
	Storage(String),
}

#[cfg(feature = "sqlite-checkpoints")]
impl From<rusqlite::Error> for CheckpointError {
	fn from(value: rusqlite::Error) -> Self {
		return CheckpointError::Storage(value.to_string());
	}
}

/// Key-value store of `(cue name, timestamp)` per group id.
pub trait CheckpointStore: Send + Sync {
	fn set_checkpoint(&self, group_id: &str, cue: &str) -> Result<(), CheckpointError>;
	fn get_checkpoint(&self, group_id: &str) -> Result<Option<(String, f64)>, CheckpointError>;
	fn del_checkpoint(&self, group_id: &str) -> Result<(), CheckpointError>;
}

/// Forgets everything on restart
#[derive(Default)]
pub struct MemoryCheckpointStore {
	data: Mutex<FxHashMap<String, (String, f64)>>,
}

impl CheckpointStore for MemoryCheckpointStore {
	fn set_checkpoint(&self, group_id: &str, cue: &str) -> Result<(), CheckpointError> {
		self.data
			.lock()
			.insert(String::from(group_id), (String::from(cue), clock::now()));
		return Ok(());
	}

	fn get_checkpoint(&self, group_id: &str) -> Result<Option<(String, f64)>, CheckpointError> {
		return Ok(self.data.lock().get(group_id).cloned());
	}

	fn del_checkpoint(&self, group_id: &str) -> Result<(), CheckpointError> {
		self.data.lock().remove(group_id);
		return Ok(());
	}
}

/// Checkpoints in a sqlite table `checkpoint(groupid, cuename, timestamp)`.
#[cfg(feature = "sqlite-checkpoints")]
pub struct SqliteCheckpointStore {
	connection: Mutex<rusqlite::Connection>,
}

#[cfg(feature = "sqlite-checkpoints")]
impl SqliteCheckpointStore {
	pub fn open(path: &Path) -> Result<Self, CheckpointError> {
		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent).map_err(|e| CheckpointError::Storage(e.to_string()))?;
			}
		}
		return Self::init(rusqlite::Connection::open(path)?);
	}

	pub fn in_memory() -> Result<Self, CheckpointError> {
		return Self::init(rusqlite::Connection::open_in_memory()?);
	}

	fn init(connection: rusqlite::Connection) -> Result<Self, CheckpointError> {
		connection.execute_batch(
			"CREATE TABLE IF NOT EXISTS checkpoint (
				groupid   TEXT PRIMARY KEY,
				cuename   TEXT NOT NULL,
				timestamp REAL NOT NULL
			);",
		)?;
		return Ok(SqliteCheckpointStore {
			connection: Mutex::new(connection),
		});
	}
}

#[cfg(feature = "sqlite-checkpoints")]
impl CheckpointStore for SqliteCheckpointStore {
	fn set_checkpoint(&self, group_id: &str, cue: &str) -> Result<(), CheckpointError> {
		self.connection.lock().execute(
			"INSERT OR REPLACE INTO checkpoint (groupid, cuename, timestamp) VALUES (?1, ?2, ?3)",
			rusqlite::params![group_id, cue, clock::now()],
		)?;
		return Ok(());
	}

	fn get_checkpoint(&self, group_id: &str) -> Result<Option<(String, f64)>, CheckpointError> {
		let connection = self.connection.lock();
		let mut stmt = connection.prepare_cached("SELECT cuename, timestamp FROM checkpoint WHERE groupid = ?1")?;
		let row = stmt.query_row(rusqlite::params![group_id], |row| {
			return Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?));
		});
		return match row {
			Ok(found) => Ok(Some(found)),
			Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
			Err(err) => Err(err.into()),
		};
	}

	fn del_checkpoint(&self, group_id: &str) -> Result<(), CheckpointError> {
		self.connection
			.lock()
			.execute("DELETE FROM checkpoint WHERE groupid = ?1", rusqlite::params![group_id])?;
		return Ok(());
	}
}

/// Token bucket in front of another store. Over the limit, calls fail with
/// [`CheckpointError::RateLimited`] instead of blocking.
pub struct RateLimitedCheckpoints {
	inner: Box<dyn CheckpointStore>,
	bucket: Mutex<TokenBucket>,
}

impl RateLimitedCheckpoints {
	pub fn new(inner: Box<dyn CheckpointStore>, config: &CheckpointLimitConfig) -> Self {
		return RateLimitedCheckpoints {
			inner,
			bucket: Mutex::new(TokenBucket::from_config(config)),
		};
	}

	fn acquire(&self) -> Result<(), CheckpointError> {
		if self.bucket.lock().try_acquire() {
			return Ok(());
		}
		return Err(CheckpointError::RateLimited);
	}
}

impl CheckpointStore for RateLimitedCheckpoints {
	fn set_checkpoint(&self, group_id: &str, cue: &str) -> Result<(), CheckpointError> {
		self.acquire()?;
		return self.inner.set_checkpoint(group_id, cue);
	}

	fn get_checkpoint(&self, group_id: &str) -> Result<Option<(String, f64)>, CheckpointError> {
		self.acquire()?;
		return self.inner.get_checkpoint(group_id);
	}

	fn del_checkpoint(&self, group_id: &str) -> Result<(), CheckpointError> {
		self.acquire()?;
		return self.inner.del_checkpoint(group_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn memory_store() {
		let store = MemoryCheckpointStore::default();
		assert!(store.get_checkpoint("g").unwrap().is_none());
		store.set_checkpoint("g", "intro").unwrap();
		assert_eq!(store.get_checkpoint("g").unwrap().map(|(c, _)| c).as_deref(), Some("intro"));
		store.del_checkpoint("g").unwrap();
		assert!(store.get_checkpoint("g").unwrap().is_none());
	}

	#[test]
	fn burst_then_rate_limited() {
		let config = CheckpointLimitConfig {
			refill_ms: 60_000,
			burst: 3,
		};
		let store = RateLimitedCheckpoints::new(Box::new(MemoryCheckpointStore::default()), &config);
		for _ in 0..3 {
			store.set_checkpoint("g", "a").unwrap();
		}
		assert!(matches!(store.set_checkpoint("g", "a"), Err(CheckpointError::RateLimited)));
	}

	#[cfg(feature = "sqlite-checkpoints")]
	#[test]
	fn sqlite_store_persists() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("state").join("checkpoints.db");
		{
			let store = SqliteCheckpointStore::open(&path).unwrap();
			store.set_checkpoint("g", "first").unwrap();
			store.set_checkpoint("g", "second").unwrap();
		}
		let store = SqliteCheckpointStore::open(&path).unwrap();
		let (cue, ts) = store.get_checkpoint("g").unwrap().unwrap();
		assert_eq!(cue, "second");
		assert!(ts > 0.0);
		store.del_checkpoint("g").unwrap();
		assert!(store.get_checkpoint("g").unwrap().is_none());
		assert!(SqliteCheckpointStore::in_memory().unwrap().get_checkpoint("x").unwrap().is_none());
	}
}

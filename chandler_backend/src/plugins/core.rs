//! Process-wide plumbing: logging setup and the lock-ordering context.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `level` when set. Calling this more than once is harmless.
pub fn init_logging(level: &str) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init();
}

const ERROR_REPEAT_WINDOW: Duration = Duration::from_secs(10);

fn recent_errors() -> &'static Mutex<FxHashMap<String, Instant>> {
	static RECENT: OnceLock<Mutex<FxHashMap<String, Instant>>> = OnceLock::new();
	return RECENT.get_or_init(|| Mutex::new(FxHashMap::default()));
}

/// Logs an error unless the same `key` was logged in the last few seconds.
///
/// Used from the render loop, where a broken blend or output would otherwise
/// log the same failure on every frame. Returns whether anything was logged.
pub fn log_error_limited(key: &str, message: &dyn fmt::Display) -> bool {
	let now = Instant::now();
	let mut recent = recent_errors().lock();
	if let Some(last) = recent.get(key) {
		if now.duration_since(*last) < ERROR_REPEAT_WINDOW {
			return false;
		}
	}
	if recent.len() > 1024 {
		recent.retain(|_, last| now.duration_since(*last) < ERROR_REPEAT_WINDOW);
	}
	recent.insert(String::from(key), now);
	drop(recent);

	error!(key, "{message}");
	return true;
}

/// Lock domains, in the only order they may be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
	/// Board state: groups, active list, shortcuts, scripts
	Core = 1,
	/// Universe arena used by the compositor
	Render = 2,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cannot lock {requested:?} while holding {held:?}")]
pub struct LockOrderError {
	pub requested: LockLevel,
	pub held: LockLevel,
}

thread_local! {
	static HELD_LEVELS: RefCell<Vec<LockLevel>> = const { RefCell::new(Vec::new()) };
}

/// Mutex that refuses to be locked out of order.
///
/// Every acquisition records its level for the current thread. Requesting a
/// level at or below one already held fails instead of risking a deadlock.
pub struct OrderedMutex<T> {
	level: LockLevel,
	inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
	pub fn new(level: LockLevel, value: T) -> Self {
		return OrderedMutex {
			level,
			inner: Mutex::new(value),
		};
	}

	pub fn level(&self) -> LockLevel {
		return self.level;
	}

	fn check_order(&self) -> Result<(), LockOrderError> {
		return HELD_LEVELS.with(|held| {
			match held.borrow().iter().max() {
				Some(highest) if *highest >= self.level => Err(LockOrderError {
					requested: self.level,
					held: *highest,
				}),
				_ => Ok(()),
			}
		});
	}

	fn register(&self) {
		HELD_LEVELS.with(|held| held.borrow_mut().push(self.level));
	}

	pub fn lock(&self) -> Result<OrderedGuard<'_, T>, LockOrderError> {
		self.check_order()?;
		let guard = self.inner.lock();
		self.register();
		return Ok(OrderedGuard {
			guard,
			level: self.level,
		});
	}

	/// Like [`lock`](Self::lock), but gives up after `timeout`.
	pub fn try_lock_for(&self, timeout: Duration) -> Result<Option<OrderedGuard<'_, T>>, LockOrderError> {
		self.check_order()?;
		return Ok(self.inner.try_lock_for(timeout).map(|guard| {
			self.register();
			OrderedGuard {
				guard,
				level: self.level,
			}
		}));
	}
}

pub struct OrderedGuard<'a, T> {
	guard: MutexGuard<'a, T>,
	level: LockLevel,
}

impl<T> Deref for OrderedGuard<'_, T> {
	type Target = T;
	fn deref(&self) -> &T {
		return &self.guard;
	}
}

impl<T> DerefMut for OrderedGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut T {
		return &mut self.guard;
	}
}

impl<T> Drop for OrderedGuard<'_, T> {
	fn drop(&mut self) {
		HELD_LEVELS.with(|held| {
			let mut held = held.borrow_mut();
			if let Some(pos) = held.iter().rposition(|l| *l == self.level) {
				held.remove(pos);
			}
		});
	}
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thread_priority::{set_current_thread_priority, ThreadPriority};
use tracing::{info, warn};

use crate::plugins::board::BoardInterface;
use crate::plugins::core::log_error_limited;
use crate::utilities::clock;

/// Called at most `poll_push_hz` times per second, off the lock, with the board
pub type PushCallback = Box<dyn FnMut(&BoardInterface) + Send>;

/// The render thread: polls groups, composites and outputs every tick.
pub struct RenderLoop {
	shutdown_trigger: Arc<AtomicBool>,
	thread_handle: Option<tokio::task::JoinHandle<()>>,
}

impl RenderLoop {
	/// Starts ticking `board`. Must be called inside a tokio runtime.
	pub fn start(board: BoardInterface, push: Option<PushCallback>) -> Self {
		let shutdown_trigger = Arc::new(AtomicBool::new(false));
		let thread_shutdown_trigger = Arc::clone(&shutdown_trigger);
		let thread_handle = tokio::task::spawn_blocking(move || thread_loop(board, thread_shutdown_trigger, push));
		return RenderLoop {
			shutdown_trigger,
			thread_handle: Some(thread_handle),
		};
	}

	pub fn is_running(&self) -> bool {
		return self.thread_handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
	}

	pub async fn shutdown(mut self) {
		self.shutdown_trigger.store(true, Ordering::Relaxed);
		if let Some(handle) = self.thread_handle.take() {
			if let Err(err) = handle.await {
				warn!(error = %err, "Render thread panicked");
			}
		}
	}
}

impl Drop for RenderLoop {
	fn drop(&mut self) {
		self.shutdown_trigger.store(true, Ordering::Relaxed);
	}
}

fn thread_loop(board: BoardInterface, shutdown_trigger: Arc<AtomicBool>, mut push: Option<PushCallback>) {
	set_current_thread_priority(ThreadPriority::Max).ok();
	let config = board.config();
	let interval = Duration::from_secs_f64(1.0 / config.frame_rate.clamp(1.0, 1000.0));
	let push_interval = Duration::from_secs_f64(1.0 / config.poll_push_hz.clamp(0.1, 1000.0));
	let mut last_push = Instant::now();
	info!(fps = config.frame_rate, "Render loop started");

	loop {
		if shutdown_trigger.load(Ordering::Relaxed) {
			break;
		}
		let start = Instant::now();

		if let Err(err) = board.tick(clock::now()) {
			log_error_limited("render-tick", &format!("Render tick failed: {err}"));
		}

		if let Some(push) = push.as_mut() {
			if last_push.elapsed() >= push_interval {
				last_push = Instant::now();
				push(&board);
			}
		}

		std::thread::sleep(interval.saturating_sub(start.elapsed()));
	}
	info!(frames = board.frames_completed(), "Render loop stopped");
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plugins::board::Board;
	use crate::plugins::saver::checkpoints::MemoryCheckpointStore;
	use crate::plugins::universes::UniverseArena;
	use crate::utilities::config::EngineConfig;

	#[tokio::test(flavor = "multi_thread")]
	async fn ticks_until_shutdown() {
		let mut config = EngineConfig::permissive();
		config.frame_rate = 200.0;
		config.poll_push_hz = 100.0;
		let board = Board::new(&config, Arc::new(MemoryCheckpointStore::default()));
		let board = BoardInterface::new(board, UniverseArena::new(), config, None);

		let pushes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
		let counter = Arc::clone(&pushes);
		let render = RenderLoop::start(
			board.clone(),
			Some(Box::new(move |_| {
				counter.fetch_add(1, Ordering::Relaxed);
			})),
		);
		tokio::time::sleep(Duration::from_millis(100)).await;
		assert!(render.is_running());
		render.shutdown().await;

		let frames = board.frames_completed();
		assert!(frames > 0);
		assert!(pushes.load(Ordering::Relaxed) > 0);
		tokio::time::sleep(Duration::from_millis(30)).await;
		assert_eq!(board.frames_completed(), frames);
	}
}

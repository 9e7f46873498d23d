use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::plugins::board::sync::{LocalSyncBus, SyncTransport};
use crate::plugins::board::{Board, BoardInterface};
use crate::plugins::media::FileMedia;
use crate::plugins::mixer::{PushCallback, RenderLoop};
use crate::plugins::saver::checkpoints::{CheckpointStore, MemoryCheckpointStore, RateLimitedCheckpoints};
use crate::plugins::universes::UniverseArena;
use crate::utilities::config::EngineConfig;
use crate::utilities::workers::WorkQueue;

/// A running engine. Dropping it stops the render loop.
pub struct Engine {
	pub board: BoardInterface,
	pub sync: Arc<dyn SyncTransport>,
	render: RenderLoop,
	sync_listener: tokio::task::JoinHandle<()>,
}

impl Engine {
	/// Stops rendering and saves the show file, if one is configured.
	pub async fn shutdown(self) -> anyhow::Result<()> {
		self.sync_listener.abort();
		self.render.shutdown().await;
		if let Some(path) = self.board.config().show_file.clone() {
			self.board
				.save_show(&path)
				.with_context(|| format!("Could not save show file {}", path.display()))?;
			info!(path = %path.display(), "Saved show");
		}
		return Ok(());
	}
}

#[cfg(feature = "sqlite-checkpoints")]
fn open_checkpoints(config: &EngineConfig) -> anyhow::Result<Box<dyn CheckpointStore>> {
	use crate::plugins::saver::checkpoints::SqliteCheckpointStore;

	let Some(path) = &config.checkpoint_db else {
		return Ok(Box::new(MemoryCheckpointStore::default()));
	};
	let store = SqliteCheckpointStore::open(path)
		.with_context(|| format!("Could not open checkpoint database {}", path.display()))?;
	info!(path = %path.display(), "Using checkpoint database");
	return Ok(Box::new(store));
}

#[cfg(not(feature = "sqlite-checkpoints"))]
fn open_checkpoints(config: &EngineConfig) -> anyhow::Result<Box<dyn CheckpointStore>> {
	if config.checkpoint_db.is_some() {
		warn!("Built without sqlite support, checkpoints are kept in memory");
	}
	return Ok(Box::new(MemoryCheckpointStore::default()));
}

/// Builds the board and arena from `config` without starting anything.
pub fn build_board(config: &EngineConfig, work: Option<WorkQueue>) -> anyhow::Result<BoardInterface> {
	let checkpoints = RateLimitedCheckpoints::new(open_checkpoints(config)?, &config.checkpoint_limit);
	let board = Board::new(config, Arc::new(checkpoints)).with_media(Arc::new(FileMedia::new(config.media_root.clone())));
	return Ok(BoardInterface::new(board, UniverseArena::new(), config.clone(), work));
}

/// Starts the engine: loads the show, then runs the render loop and the
/// sync listener. Must be called inside a tokio runtime.
pub async fn async_main(config: EngineConfig, push: Option<PushCallback>) -> anyhow::Result<Engine> {
	let work = WorkQueue::start("chandler-work").context("Could not start the work queue")?;
	let sync: Arc<dyn SyncTransport> = Arc::new(LocalSyncBus::default());
	let interface = build_board(&config, Some(work))?;
	interface.with_board(|board, _| board.set_sync(Arc::clone(&sync)))?;

	if let Some(path) = &config.show_file {
		if path.exists() {
			interface
				.load_show(path)
				.with_context(|| format!("Could not load show file {}", path.display()))?;
			info!(path = %path.display(), "Loaded show");
		} else {
			warn!(path = %path.display(), "Show file does not exist yet, starting empty");
		}
	}

	let sync_listener = interface.spawn_sync_listener(Arc::clone(&sync));
	let render = RenderLoop::start(interface.clone(), push);
	return Ok(Engine {
		board: interface,
		sync,
		render,
		sync_listener,
	});
}

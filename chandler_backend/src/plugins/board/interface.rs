use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use super::sync::{SyncEnvelope, SyncTransport};
use super::{Board, BoardError, Deferred, GotoOptions};
use crate::plugins::core::{LockLevel, LockOrderError, OrderedMutex};
use crate::plugins::groups::{GroupConfig, TransitionCause};
use crate::plugins::media::MediaBackend;
use crate::plugins::mixer::compositor::render_frame;
use crate::plugins::saver::show::ShowFile;
use crate::plugins::universes::UniverseArena;
use crate::utilities::clock;
use crate::utilities::config::EngineConfig;
use crate::utilities::workers::WorkQueue;

pub struct BoardShared {
	core: OrderedMutex<Board>,
	render: OrderedMutex<UniverseArena>,
	/// Mirror of `Board::frames_completed`, readable without the lock
	frames: AtomicU64,
	/// Set once the render loop ticks. Transitions only wait for frames then.
	rendering: AtomicBool,
	work: Option<WorkQueue>,
	config: EngineConfig,
}

/// Snapshot of one group for status displays
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
	pub id: Uuid,
	pub name: String,
	pub active: bool,
	pub cue: String,
	pub entered_cue: f64,
	pub cue_len: f64,
	pub alpha: f64,
	pub priority: f64,
	pub fade_position: f64,
}

/// Thread-safe handle to the board and the universe arena.
///
/// Every call takes the core lock, then the render lock, in that order.
/// Work the board defers (shortcut triggers, media transitions) runs on the
/// work queue after both are released, or inline when there is no queue.
#[derive(Clone)]
pub struct BoardInterface(Arc<BoardShared>);

impl BoardInterface {
	pub fn new(board: Board, arena: UniverseArena, config: EngineConfig, work: Option<WorkQueue>) -> Self {
		let frames = board.frames_completed;
		return BoardInterface(Arc::new(BoardShared {
			core: OrderedMutex::new(LockLevel::Core, board),
			render: OrderedMutex::new(LockLevel::Render, arena),
			frames: AtomicU64::new(frames),
			rendering: AtomicBool::new(false),
			work,
			config,
		}));
	}

	pub fn config(&self) -> &EngineConfig {
		return &self.0.config;
	}

	/// Runs `f` with both locks held, then dispatches deferred work.
	pub fn with_board<T>(&self, f: impl FnOnce(&mut Board, &mut UniverseArena) -> T) -> Result<T, LockOrderError> {
		let (result, deferred, media) = {
			let mut board = self.0.core.lock()?;
			let mut arena = self.0.render.lock()?;
			let result = f(&mut board, &mut arena);
			if self.0.work.is_none() {
				board.run_deferred(clock::now(), &mut arena);
			}
			(result, board.take_deferred(), board.media())
		};
		self.dispatch(deferred, media);
		return Ok(result);
	}

	fn dispatch(&self, deferred: Vec<Deferred>, media: Option<Arc<dyn MediaBackend>>) {
		let Some(work) = &self.0.work else {
			return;
		};
		for item in deferred {
			match item {
				Deferred::Shortcut { code, exclude } => {
					let board = self.clone();
					work.spawn(format!("shortcut {code}"), async move {
						return board
							.trigger_shortcut_excluding(&code, Some(exclude), TransitionCause::Shortcut)
							.map(|_| ())
							.map_err(anyhow::Error::from);
					});
				}
				Deferred::Media(cue) => {
					if let Some(media) = media.clone() {
						work.spawn(format!("media {}", cue.group), async move {
							return media.transition(&cue);
						});
					}
				}
				Deferred::MediaStop(group) => {
					if let Some(media) = media.clone() {
						work.spawn(format!("media stop {group}"), async move {
							return media.stop(&group);
						});
					}
				}
			}
		}
	}

	fn lookup(&self, group: &str) -> Result<Uuid, BoardError> {
		let board = self.0.core.lock()?;
		return board
			.find_group(group)
			.ok_or_else(|| BoardError::UnknownGroup(String::from(group)));
	}

	/// Gives the renderer a chance to show the current cue at least once
	/// before it is replaced.
	fn wait_for_frame(&self, id: Uuid) {
		if !self.0.rendering.load(Ordering::Acquire) {
			return;
		}
		let pause = Duration::from_millis(self.0.config.frame_wait_ms);
		for _ in 0..self.0.config.frame_wait_polls {
			let entered = match self.0.core.lock() {
				Ok(board) => board.group(id).map(|g| g.entered_frame),
				Err(_) => return,
			};
			match entered {
				Some(entered) if entered >= self.0.frames.load(Ordering::Acquire) => std::thread::sleep(pause),
				_ => return,
			}
		}
		debug!(group = %id, "Gave up waiting for a frame");
	}

	// Transitions

	pub fn goto_cue(&self, group: &str, cue: &str, options: GotoOptions) -> Result<bool, BoardError> {
		let id = self.lookup(group)?;
		self.wait_for_frame(id);
		return Ok(self.with_board(|board, arena| board.goto_cue(id, cue, clock::now(), options, arena))??);
	}

	pub fn next_cue(&self, group: &str, options: GotoOptions) -> Result<bool, BoardError> {
		let id = self.lookup(group)?;
		self.wait_for_frame(id);
		return Ok(self.with_board(|board, arena| board.next_cue(id, clock::now(), options, arena))??);
	}

	pub fn prev_cue(&self, group: &str, options: GotoOptions) -> Result<bool, BoardError> {
		let id = self.lookup(group)?;
		self.wait_for_frame(id);
		return Ok(self.with_board(|board, arena| board.prev_cue(id, clock::now(), options, arena))??);
	}

	pub fn trigger_shortcut(&self, code: &str) -> Result<usize, BoardError> {
		return self.trigger_shortcut_excluding(code, None, TransitionCause::Shortcut);
	}

	fn trigger_shortcut_excluding(&self, code: &str, exclude: Option<Uuid>, cause: TransitionCause) -> Result<usize, BoardError> {
		return Ok(self.with_board(|board, arena| board.trigger_shortcut(code, exclude, clock::now(), cause, arena))??);
	}

	// Group lifecycle

	pub fn add_group(&self, config: GroupConfig) -> Result<Uuid, BoardError> {
		return self.with_board(|board, arena| board.add_group(config, clock::now(), arena))?;
	}

	pub fn close_group(&self, group: &str) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		self.with_board(|board, arena| board.close(id, arena))??;
		return Ok(());
	}

	pub fn go(&self, group: &str) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		return Ok(self.with_board(|board, arena| board.go(id, clock::now(), arena))??);
	}

	pub fn stop(&self, group: &str) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		return Ok(self.with_board(|board, arena| board.stop(id, arena))??);
	}

	pub fn set_alpha(&self, group: &str, alpha: f64) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		return Ok(self.with_board(|board, arena| board.set_alpha(id, alpha, clock::now(), arena))??);
	}

	pub fn set_priority(&self, group: &str, priority: f64) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		return self.with_board(|board, arena| board.set_priority(id, priority, arena))?;
	}

	pub fn set_backtrack(&self, group: &str, backtrack: bool) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		return self.with_board(|board, arena| board.set_backtrack(id, backtrack, arena))?;
	}

	/// Called by a media backend when the sound of `group`'s current cue ended.
	pub fn media_ended(&self, group: &str, at: f64) -> Result<(), BoardError> {
		let id = self.lookup(group)?;
		let mut board = self.0.core.lock()?;
		if let Some(group) = board.group_mut(id) {
			group.media_ended_at = Some(at);
		}
		return Ok(());
	}

	// Sync

	pub fn handle_sync(&self, envelope: &SyncEnvelope) -> Result<(), BoardError> {
		self.with_board(|board, arena| board.handle_sync(envelope, clock::now(), arena))?;
		return Ok(());
	}

	/// Follows `transport` until it closes. Must be called inside a tokio runtime.
	pub fn spawn_sync_listener(&self, transport: Arc<dyn SyncTransport>) -> tokio::task::JoinHandle<()> {
		let mut receiver = transport.subscribe();
		let board = self.clone();
		return tokio::spawn(async move {
			loop {
				match receiver.recv().await {
					Ok(envelope) => {
						let board = board.clone();
						let handled = tokio::task::spawn_blocking(move || board.handle_sync(&envelope)).await;
						match handled {
							Ok(Ok(())) => {}
							Ok(Err(err)) => warn!(error = %err, "Sync message failed"),
							Err(err) => warn!(error = %err, "Sync handler panicked"),
						}
					}
					Err(RecvError::Lagged(skipped)) => warn!(skipped, "Sync listener fell behind"),
					Err(RecvError::Closed) => break,
				}
			}
			debug!("Sync listener finished");
		});
	}

	// Rendering

	/// One render tick: timed transitions, then compositing and output.
	/// Returns how many universes were sent.
	pub fn tick(&self, now: f64) -> Result<usize, LockOrderError> {
		self.0.rendering.store(true, Ordering::Release);
		let frames = &self.0.frames;
		return self.with_board(|board, arena| {
			board.poll_all(now, arena);
			let sent = render_frame(board, arena, now);
			board.frames_completed += 1;
			frames.store(board.frames_completed, Ordering::Release);
			return sent;
		});
	}

	pub fn frames_completed(&self) -> u64 {
		return self.0.frames.load(Ordering::Acquire);
	}

	pub fn group_status(&self) -> Result<Vec<GroupStatus>, LockOrderError> {
		let board = self.0.core.lock()?;
		let now = clock::now();
		let mut status: Vec<GroupStatus> = board
			.groups()
			.map(|g| GroupStatus {
				id: g.id,
				name: g.name.clone(),
				active: g.active,
				cue: String::from(g.cue_name()),
				entered_cue: g.entered_cue,
				cue_len: g.cue_len,
				alpha: g.alpha(),
				priority: g.priority(),
				fade_position: if g.active { g.fade_position(now) } else { 0.0 },
			})
			.collect();
		status.sort_by(|a, b| a.name.cmp(&b.name));
		return Ok(status);
	}

	/// Copies of the universe arrays, for displays and tests
	pub fn universe_values(&self, universe: &str) -> Result<Option<Vec<f32>>, LockOrderError> {
		let _board = self.0.core.lock()?;
		let arena = self.0.render.lock()?;
		return Ok(arena.get(universe).map(|u| u.values.clone()));
	}

	// Show files

	pub fn save_show(&self, path: &Path) -> Result<(), BoardError> {
		let show = self.with_board(|board, arena| board.to_show(arena))?;
		show.save(path)?;
		return Ok(());
	}

	pub fn load_show(&self, path: &Path) -> Result<(), BoardError> {
		let show = ShowFile::load(path)?;
		self.with_board(|board, arena| board.load_show(show, clock::now(), arena))?;
		return Ok(());
	}
}

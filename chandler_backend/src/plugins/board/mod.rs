//! The board: every group, the active-group ordering and the indices that
//! span groups (shortcuts, sync topics, checkpoints).
//!
//! [`Board`] is plain data guarded by the core lock. All of its methods take
//! the universe arena explicitly, so callers decide how the two locks are
//! taken; [`BoardInterface`] is the thread-safe handle that does it in the
//! right order.

pub mod interface;
pub mod shortcuts;
pub mod sync;
pub mod transitions;

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use interface::BoardInterface;
pub use transitions::GotoOptions;

use self::shortcuts::ShortcutIndex;
use self::sync::{SyncEnvelope, SyncTransport};
use crate::plugins::core::{log_error_limited, LockOrderError};
use crate::plugins::groups::cue::{normalize_cue_name, Cue};
use crate::plugins::groups::{Group, GroupConfig, GroupError, PollAction, TransitionCause, TransitionError};
use crate::plugins::media::{MediaBackend, MediaCue};
use crate::plugins::saver::checkpoints::CheckpointStore;
use crate::plugins::saver::show::{ShowFile, ShowFileError};
use crate::plugins::universes::{FixtureError, UniverseArena, UniverseError};
use crate::utilities::config::EngineConfig;
use crate::utilities::rate_limit::TransitionLimiter;

/// Rounds of deferred work `run_deferred` will process before giving up
const DEFERRED_ROUNDS: usize = 32;

#[derive(Debug, Error)]
pub enum BoardError {
	#[error("No such group {0:?}")]
	UnknownGroup(String),
	#[error("A group named {0:?} already exists")]
	GroupExists(String),
	#[error(transparent)]
	Group(#[from] GroupError),
	#[error(transparent)]
	Transition(#[from] TransitionError),
	#[error(transparent)]
	Universe(#[from] UniverseError),
	#[error(transparent)]
	Fixture(#[from] FixtureError),
	#[error(transparent)]
	ShowFile(#[from] ShowFileError),
	#[error(transparent)]
	Lock(#[from] LockOrderError),
}

/// Work a transition produced that must run after the locks are released
#[derive(Debug, Clone, PartialEq)]
pub enum Deferred {
	/// A cue's `trigger_shortcut`. The entering group is excluded.
	Shortcut { code: String, exclude: Uuid },
	Media(MediaCue),
	MediaStop(String),
}

pub struct Board {
	groups: FxHashMap<Uuid, Group>,
	/// Running groups in compositing order, lowest `(priority, started)` first
	active: Vec<Uuid>,
	shortcuts: ShortcutIndex,
	limiter: TransitionLimiter,
	rng: StdRng,
	checkpoints: Arc<dyn CheckpointStore>,
	media: Option<Arc<dyn MediaBackend>>,
	sync: Option<Arc<dyn SyncTransport>>,
	session_id: String,
	deferred: Vec<Deferred>,
	/// Frames fully rendered so far
	pub frames_completed: u64,
}

impl Board {
	pub fn new(config: &EngineConfig, checkpoints: Arc<dyn CheckpointStore>) -> Self {
		return Board {
			groups: FxHashMap::default(),
			active: Vec::new(),
			shortcuts: ShortcutIndex::new(),
			limiter: TransitionLimiter::new(config.transition_limit),
			rng: StdRng::from_entropy(),
			checkpoints,
			media: None,
			sync: None,
			session_id: config.session_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
			deferred: Vec::new(),
			frames_completed: 0,
		};
	}

	pub fn with_media(mut self, media: Arc<dyn MediaBackend>) -> Self {
		self.media = Some(media);
		return self;
	}

	pub fn with_sync(mut self, sync: Arc<dyn SyncTransport>) -> Self {
		self.sync = Some(sync);
		return self;
	}

	/// Replaces the sync transport on a running board
	pub fn set_sync(&mut self, sync: Arc<dyn SyncTransport>) {
		self.sync = Some(sync);
	}

	/// Makes random cue choices reproducible
	pub fn with_seed(mut self, seed: u64) -> Self {
		self.rng = StdRng::seed_from_u64(seed);
		return self;
	}

	pub fn session_id(&self) -> &str {
		return &self.session_id;
	}

	pub fn media(&self) -> Option<Arc<dyn MediaBackend>> {
		return self.media.clone();
	}

	pub fn shortcuts(&self) -> &ShortcutIndex {
		return &self.shortcuts;
	}

	// Lookup

	pub fn group(&self, id: Uuid) -> Option<&Group> {
		return self.groups.get(&id);
	}

	pub fn group_mut(&mut self, id: Uuid) -> Option<&mut Group> {
		return self.groups.get_mut(&id);
	}

	pub fn groups(&self) -> impl Iterator<Item = &Group> {
		return self.groups.values();
	}

	/// Accepts a group name or the string form of its id
	pub fn find_group(&self, name_or_id: &str) -> Option<Uuid> {
		if let Ok(id) = Uuid::parse_str(name_or_id) {
			if self.groups.contains_key(&id) {
				return Some(id);
			}
		}
		return self.groups.values().find(|g| g.name == name_or_id).map(|g| g.id);
	}

	pub fn active_ids(&self) -> &[Uuid] {
		return &self.active;
	}

	fn sort_active(&mut self) {
		let groups = &self.groups;
		self.active.retain(|id| groups.get(id).map(|g| g.active).unwrap_or(false));
		self.active.sort_by(|a, b| {
			let ka = groups.get(a).map(Group::layer_key).unwrap_or_default();
			let kb = groups.get(b).map(Group::layer_key).unwrap_or_default();
			return ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal);
		});
	}

	// Group lifecycle

	pub fn add_group(&mut self, config: GroupConfig, now: f64, arena: &mut UniverseArena) -> Result<Uuid, BoardError> {
		if self.groups.values().any(|g| g.name == config.name) {
			return Err(BoardError::GroupExists(config.name));
		}
		if self.groups.contains_key(&config.id) {
			return Err(BoardError::GroupExists(config.id.to_string()));
		}
		let start = config.active;
		let group = Group::from_config(config)?;
		let id = group.id;
		for cue in group.cues() {
			self.shortcuts.register(&cue.shortcut, id, &cue.name);
		}
		info!(group = %group.name, cues = group.cues_ordered().len(), "Added group");
		self.groups.insert(id, group);
		if start {
			if let Err(err) = self.go(id, now, arena) {
				self.shortcuts.unregister_group(id);
				self.groups.remove(&id);
				return Err(err.into());
			}
		}
		return Ok(id);
	}

	/// Stops the group and forgets it entirely.
	pub fn close(&mut self, id: Uuid, arena: &mut UniverseArena) -> Result<Group, BoardError> {
		self.stop(id, arena)?;
		self.shortcuts.unregister_group(id);
		let group = self
			.groups
			.remove(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		info!(group = %group.name, "Closed group");
		return Ok(group);
	}

	/// Starts a group: enters `__setup__` if it has one, else resumes from
	/// its checkpoint, else enters `default`.
	pub fn go(&mut self, id: Uuid, now: f64, arena: &mut UniverseArena) -> Result<(), TransitionError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		if group.active {
			return Ok(());
		}
		group.start_local(now);
		let first = if group.get_cue("__setup__").is_some() { "__setup__" } else { "__checkpoint__" };
		info!(group = %group.name, "Starting group");
		self.active.push(id);
		self.sort_active();

		if let Err(err) = self.goto_cue(id, first, now, GotoOptions::cause(TransitionCause::Start), arena) {
			warn!(group = %id, error = %err, "Could not enter the first cue");
		}
		let entered = self.groups.get(&id).map(|g| g.entered_cue != 0.0).unwrap_or(false);
		if !entered {
			if let Err(err) = self.goto_cue(id, "default", now, GotoOptions::cause(TransitionCause::Start), arena) {
				self.abort_start(id, arena);
				return Err(err);
			}
		}
		return Ok(());
	}

	/// Undoes `go` for a group that never entered a cue.
	fn abort_start(&mut self, id: Uuid, arena: &mut UniverseArena) {
		if let Some(group) = self.groups.get_mut(&id) {
			group.stop_local(arena);
			warn!(group = %group.name, "Group could not start");
		}
		self.active.retain(|g| *g != id);
	}

	/// Back to `default`, painting nothing
	pub fn stop(&mut self, id: Uuid, arena: &mut UniverseArena) -> Result<(), TransitionError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		if !group.active {
			return Ok(());
		}
		group.stop_local(arena);
		info!(group = %group.name, "Stopped group");
		if self.media.is_some() {
			self.deferred.push(Deferred::MediaStop(group.name.clone()));
		}
		self.active.retain(|g| *g != id);
		return Ok(());
	}

	// Group settings that affect the rest of the board

	pub fn set_alpha(&mut self, id: Uuid, alpha: f64, now: f64, arena: &mut UniverseArena) -> Result<(), TransitionError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		if group.set_alpha(alpha) {
			self.go(id, now, arena)?;
		}
		return Ok(());
	}

	pub fn set_priority(&mut self, id: Uuid, priority: f64, arena: &mut UniverseArena) -> Result<(), BoardError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		group.set_priority(priority);
		// Every universe the group touches now stacks differently
		group.lighting.refresh(arena);
		self.sort_active();
		return Ok(());
	}

	/// Changes tracking and reloads the current cue with its old entry time.
	pub fn set_backtrack(&mut self, id: Uuid, backtrack: bool, arena: &mut UniverseArena) -> Result<(), BoardError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		if group.backtrack == backtrack {
			return Ok(());
		}
		group.backtrack = backtrack;
		if group.active {
			group.reload_lighting(arena);
		}
		return Ok(());
	}

	// Cue list changes that touch board indices

	pub fn add_cue(&mut self, id: Uuid, name: &str, after: Option<&str>) -> Result<Cue, BoardError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		return Ok(group.add_cue(name, after)?.clone());
	}

	/// Removes a cue. If the group is showing it, it first moves on to the
	/// default next cue, or to `default`.
	pub fn rm_cue(&mut self, id: Uuid, name: &str, now: f64, arena: &mut UniverseArena) -> Result<Cue, BoardError> {
		let group = self
			.groups
			.get(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		if name == "default" {
			return Err(GroupError::DeleteDefault.into());
		}
		if group.active && group.cue_name() == name {
			let target = group
				.get_default_next()
				.filter(|next| next != name)
				.unwrap_or_else(|| String::from("default"));
			self.goto_cue(id, &target, now, GotoOptions::cause(TransitionCause::Deletion), arena)?;
			if self.groups.get(&id).map(|g| g.cue_name() == name).unwrap_or(false) {
				self.goto_cue(id, "default", now, GotoOptions::cause(TransitionCause::Deletion), arena)?;
			}
		}
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		let removed = group.rm_cue(name)?;
		self.shortcuts.unregister(&removed.shortcut, id, name);
		return Ok(removed);
	}

	pub fn rename_cue(&mut self, id: Uuid, old: &str, new: &str) -> Result<(), BoardError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		let new = normalize_cue_name(new)?;
		group.rename_cue(old, &new)?;
		self.shortcuts.rename_cue(id, old, &new);
		return Ok(());
	}

	pub fn set_cue_shortcut(&mut self, id: Uuid, cue: &str, code: &str) -> Result<(), BoardError> {
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| BoardError::UnknownGroup(id.to_string()))?;
		let old = group.set_cue_shortcut(cue, code)?;
		self.shortcuts.unregister(&old, id, cue);
		self.shortcuts.register(code, id, cue);
		return Ok(());
	}

	/// Fires a shortcut code: every owning group is started if needed and
	/// sent to its cue. Returns how many groups moved.
	pub fn trigger_shortcut(
		&mut self,
		code: &str,
		exclude: Option<Uuid>,
		now: f64,
		cause: TransitionCause,
		arena: &mut UniverseArena,
	) -> Result<usize, TransitionError> {
		let targets = self.shortcuts.lookup(code);
		debug!(code, targets = targets.len(), "Shortcut");
		let mut fired = 0;
		for target in targets {
			if Some(target.group) == exclude || !self.groups.contains_key(&target.group) {
				continue;
			}
			self.go(target.group, now, arena)?;
			match self.goto_cue(target.group, &target.cue, now, GotoOptions::cause(cause), arena) {
				Ok(_) => fired += 1,
				Err(TransitionError::RateLimited) => return Err(TransitionError::RateLimited),
				Err(err) => warn!(code, cue = %target.cue, error = %err, "Shortcut transition failed"),
			}
		}
		return Ok(fired);
	}

	// Per-frame work

	/// Advances fades and fires timed, scheduled and media-ended transitions.
	pub fn poll_all(&mut self, now: f64, arena: &mut UniverseArena) {
		let ids = self.active.clone();
		for id in ids {
			let Some(group) = self.groups.get_mut(&id) else {
				continue;
			};
			let entered_before = group.entered_cue;
			let action = group.poll(now, arena, false);
			let result = match &action {
				Some(PollAction::Next { entered }) => {
					let options = GotoOptions::cause(TransitionCause::Time).at(*entered);
					self.next_cue(id, now, options, arena)
				}
				Some(PollAction::Goto { cue, entered }) => {
					let options = GotoOptions::cause(TransitionCause::Time).at(*entered);
					self.goto_cue(id, cue, now, options, arena)
				}
				None => continue,
			};
			match result {
				// Nowhere to go: stop re-checking the length every frame
				Ok(false) if matches!(action, Some(PollAction::Next { .. })) => {
					if let Some(group) = self.groups.get_mut(&id) {
						if group.entered_cue == entered_before {
							group.cue_len = 0.0;
						}
					}
				}
				Ok(_) => {}
				Err(err) => {
					log_error_limited(&format!("poll-{id}"), &format!("Timed transition of {id} failed: {err}"));
				}
			}
		}
	}

	/// Follows a peer's transition on every active group sharing the topic.
	pub fn handle_sync(&mut self, envelope: &SyncEnvelope, now: f64, arena: &mut UniverseArena) {
		let message = &envelope.message;
		if message.sender_session_id == self.session_id {
			return;
		}
		let targets: Vec<Uuid> = self
			.active
			.iter()
			.filter(|id| self.groups.get(*id).map(|g| g.sync_group == envelope.topic).unwrap_or(false))
			.copied()
			.collect();
		for id in targets {
			let options = GotoOptions {
				entered: Some(message.clamped_time(now)),
				send_sync: false,
				generate_events: true,
				cause: TransitionCause::Sync,
			};
			if let Err(err) = self.goto_cue(id, &message.cue, now, options, arena) {
				warn!(group = %id, cue = %message.cue, error = %err, "Could not follow sync message");
			}
		}
	}

	pub fn take_deferred(&mut self) -> Vec<Deferred> {
		return std::mem::take(&mut self.deferred);
	}

	/// Runs deferred work inline. For callers without a work queue.
	pub fn run_deferred(&mut self, now: f64, arena: &mut UniverseArena) {
		for _ in 0..DEFERRED_ROUNDS {
			let work = self.take_deferred();
			if work.is_empty() {
				return;
			}
			for item in work {
				let result = match item {
					Deferred::Shortcut { code, exclude } => self
						.trigger_shortcut(&code, Some(exclude), now, TransitionCause::Shortcut, arena)
						.map(|_| ())
						.map_err(anyhow::Error::from),
					Deferred::Media(cue) => match &self.media {
						Some(media) => media.transition(&cue),
						None => Ok(()),
					},
					Deferred::MediaStop(group) => match &self.media {
						Some(media) => media.stop(&group),
						None => Ok(()),
					},
				};
				if let Err(err) = result {
					warn!("Deferred work failed: {err:?}");
				}
			}
		}
		warn!("Deferred work keeps producing more work, dropping the rest");
		self.deferred.clear();
	}

	// Show files

	/// Loads universes, fixtures and groups. Broken entries are logged and skipped.
	pub fn load_show(&mut self, show: ShowFile, now: f64, arena: &mut UniverseArena) {
		for universe in show.universes {
			let output = universe.output.build(&universe.name);
			let name = universe.name.clone();
			if let Err(err) = arena.add_universe(universe, output) {
				warn!(universe = %name, error = %err, "Skipping universe");
			}
		}
		for fixture in show.fixtures {
			let name = fixture.name.clone();
			if let Err(err) = arena.add_fixture(fixture) {
				warn!(fixture = %name, error = %err, "Skipping fixture");
			}
		}
		for group in show.groups {
			let name = group.name.clone();
			if let Err(err) = self.add_group(group, now, arena) {
				warn!(group = %name, error = %err, "Skipping group");
			}
		}
	}

	pub fn to_show(&self, arena: &UniverseArena) -> ShowFile {
		let mut groups: Vec<GroupConfig> = self.groups.values().map(Group::to_config).collect();
		groups.sort_by(|a, b| a.name.cmp(&b.name));
		return ShowFile {
			universes: arena.universe_configs(),
			fixtures: arena.fixture_configs(),
			groups,
		};
	}
}

//! Groups: sequencers that own a cue list and walk through it.
//!
//! This module holds the per-group state and every operation that only
//! touches one group. Transitions that involve the rest of the board
//! (shortcuts, checkpoints, sync, other groups) live in `plugins::board`.

pub mod cue;
pub mod cue_length;
pub mod cue_names;
pub mod lighting;
pub mod scheduling;

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use rand::RngCore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use self::cue::{normalize_cue_name, Cue, CueValue};
use self::lighting::{ease, LightingManager};
use crate::mixer_utils::blend_mode::{create_blend_mode, BlendError};
use crate::mixer_utils::state::LayerKey;
use crate::plugins::core::LockOrderError;
use crate::plugins::media::MediaBackend;
use crate::plugins::scripting::{RulesEngine, ScriptContext};
use crate::plugins::universes::UniverseArena;
use crate::utilities::expressions::{ExpressionError, Value};
use crate::utilities::recurrence::RecurrenceError;

/// Cap on `cue_history`
pub const HISTORY_LIMIT: usize = 1024;
/// Cap on backtracking walks
const BACKTRACK_LIMIT: usize = 10_000;
/// Taps further apart than this start a new tempo sequence
const TAP_TIMEOUT: f64 = 8.0;

#[derive(Debug, Error)]
pub enum GroupError {
	#[error("A cue named {0:?} already exists")]
	CueExists(String),
	#[error("No such cue {0:?}")]
	NoSuchCue(String),
	#[error("The default cue cannot be deleted")]
	DeleteDefault,
	#[error("A group must have at least one cue")]
	LastCue,
	#[error("Cannot remove the active cue {0:?}")]
	RemoveActive(String),
	#[error("Cannot rename the active cue")]
	RenameActive,
	#[error("Cannot rename the default cue")]
	RenameDefault,
	#[error("Invalid cue name {0:?}")]
	InvalidCueName(String),
	#[error("Could not find a number for a new cue")]
	NoNumberAvailable,
	#[error("Cue {0:?} is locked out after an error")]
	ErrorLockout(String),
	#[error("Invalid value for {field}: {message}")]
	InvalidValue { field: &'static str, message: String },
	#[error(transparent)]
	Blend(#[from] BlendError),
	#[error(transparent)]
	Expression(#[from] ExpressionError),
	#[error(transparent)]
	Recurrence(#[from] RecurrenceError),
}

#[derive(Debug, Error)]
pub enum TransitionError {
	#[error("Too many cue transitions happening")]
	RateLimited,
	#[error("Too many script redirects")]
	TooManyRedirects,
	#[error("No cue matches pattern {0:?}")]
	NoGlobMatch(String),
	#[error("No cue could be picked")]
	NoCandidates,
	#[error("Cannot fast forward schedule: {0}")]
	Schedule(String),
	#[error("No such group {0:?}")]
	UnknownGroup(String),
	#[error(transparent)]
	Group(#[from] GroupError),
	#[error(transparent)]
	Lock(#[from] LockOrderError),
	#[error(transparent)]
	Expression(#[from] ExpressionError),
}

/// Why a transition happened. Reported to `cue.exit`/`cue.enter` handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransitionCause {
	#[default]
	Generic,
	/// Entering the first cue after `go()`
	Start,
	/// The previous cue's length ran out
	Time,
	Manual,
	/// Followed a peer's sync message
	Sync,
	Shortcut,
	/// The current cue was deleted
	Deletion,
	/// Issued by a rule, with the redirect depth
	Script(u8),
}

impl TransitionCause {
	pub fn script_depth(&self) -> u8 {
		return match self {
			TransitionCause::Script(depth) => *depth,
			_ => 0,
		};
	}
}

impl fmt::Display for TransitionCause {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		return match self {
			TransitionCause::Generic => write!(f, "generic"),
			TransitionCause::Start => write!(f, "start"),
			TransitionCause::Time => write!(f, "time"),
			TransitionCause::Manual => write!(f, "manual"),
			TransitionCause::Sync => write!(f, "sync"),
			TransitionCause::Shortcut => write!(f, "shortcut"),
			TransitionCause::Deletion => write!(f, "deletion"),
			TransitionCause::Script(depth) => write!(f, "script.{depth}"),
		};
	}
}

/// Saved form of a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
	pub id: Uuid,
	pub name: String,
	pub cues: Vec<Cue>,
	pub bpm: f64,
	pub alpha: f64,
	pub priority: f64,
	pub blend: String,
	pub blend_args: BTreeMap<String, f64>,
	pub backtrack: bool,
	pub default_next: String,
	/// Start the group when the show loads
	pub active: bool,
	/// Sync topic shared with peers. Empty disables sync.
	pub sync_group: String,
	/// Seconds media should overlap between cues
	pub crossfade: f64,
	/// Advance cues when their length runs out
	pub enable_timing: bool,
}

impl Default for GroupConfig {
	fn default() -> Self {
		return GroupConfig {
			id: Uuid::new_v4(),
			name: String::new(),
			cues: Vec::new(),
			bpm: 60.0,
			alpha: 1.0,
			priority: 50.0,
			blend: String::from("normal"),
			blend_args: BTreeMap::new(),
			backtrack: true,
			default_next: String::new(),
			active: false,
			sync_group: String::new(),
			crossfade: 0.0,
			enable_timing: true,
		};
	}
}

/// Something `poll` wants the board to do
#[derive(Debug, Clone, PartialEq)]
pub enum PollAction {
	/// Length ran out or media ended: follow the cue's next link
	Next { entered: f64 },
	/// A `schedule_at` occurrence passed
	Goto { cue: String, entered: f64 },
}

pub struct Group {
	pub id: Uuid,
	pub name: String,

	cues: FxHashMap<String, Cue>,
	/// Cue names sorted by number
	cues_ordered: Vec<String>,
	/// Index of `cue` in `cues_ordered`
	cue_pointer: usize,
	cue: String,

	pub entered_cue: f64,
	pub started: f64,
	/// Effective length of the current cue, in beats
	pub cue_len: f64,
	pub randomize_modifier: f64,
	bpm: f64,
	alpha: f64,
	priority: f64,
	blend_name: String,

	pub active: bool,
	pub backtrack: bool,
	pub default_next: String,
	pub sync_group: String,
	pub crossfade: f64,
	pub enable_timing: bool,

	cue_history: VecDeque<(String, f64)>,
	/// Repaint on the next poll
	pub poll_again: bool,
	/// Set by the media backend when the current cue's sound finished
	pub media_ended_at: Option<f64>,
	/// Bumped on every committed transition. A transition that sees this
	/// change under it has been overtaken by a nested one.
	pub transition_serial: u64,
	/// Render frame number when the current cue was entered
	pub entered_frame: u64,
	last_tap: f64,
	tap_sequence: u32,
	next_scheduled: Option<(f64, String)>,

	pub lighting: LightingManager,
	pub script: Box<dyn ScriptContext>,
}

impl Group {
	pub fn from_config(config: GroupConfig) -> Result<Self, GroupError> {
		let blend = create_blend_mode(&config.blend, &config.blend_args)?;
		let mut group = Group {
			id: config.id,
			name: config.name,
			cues: FxHashMap::default(),
			cues_ordered: Vec::new(),
			cue_pointer: 0,
			cue: String::from("default"),
			entered_cue: 0.0,
			started: 0.0,
			cue_len: 0.0,
			randomize_modifier: 0.0,
			bpm: if config.bpm > 0.0 { config.bpm } else { 60.0 },
			alpha: config.alpha.clamp(0.0, 1.0),
			priority: config.priority,
			blend_name: config.blend,
			active: false,
			backtrack: config.backtrack,
			default_next: config.default_next,
			sync_group: config.sync_group,
			crossfade: config.crossfade,
			enable_timing: config.enable_timing,
			cue_history: VecDeque::new(),
			poll_again: false,
			media_ended_at: None,
			transition_serial: 0,
			entered_frame: 0,
			last_tap: 0.0,
			tap_sequence: 0,
			next_scheduled: None,
			lighting: LightingManager::new(blend),
			script: Box::new(RulesEngine::new()),
		};

		for cue in config.cues {
			if let Err(err) = group.insert_cue(cue) {
				warn!(group = %group.name, error = %err, "Skipping cue while loading group");
			}
		}
		if !group.cues.contains_key("default") {
			let number = group.cues.values().map(|c| c.number).min().map(|n| n - 1000).unwrap_or(5000);
			group.insert_cue(Cue::new("default", number)?)?;
		}
		group.reset_pointer();

		group.script.set_var("GROUP", Value::from(group.name.as_str()));
		group.script.set_var("SCENE", Value::from(group.name.as_str()));
		return Ok(group);
	}

	pub fn to_config(&self) -> GroupConfig {
		return GroupConfig {
			id: self.id,
			name: self.name.clone(),
			cues: self.cues_ordered.iter().filter_map(|n| self.cues.get(n)).cloned().collect(),
			bpm: self.bpm,
			alpha: self.alpha,
			priority: self.priority,
			blend: self.blend_name.clone(),
			blend_args: self.lighting.blend().args(),
			backtrack: self.backtrack,
			default_next: self.default_next.clone(),
			active: self.active,
			sync_group: self.sync_group.clone(),
			crossfade: self.crossfade,
			enable_timing: self.enable_timing,
		};
	}

	// Accessors

	pub fn cue_name(&self) -> &str {
		return &self.cue;
	}

	pub fn current_cue(&self) -> Option<&Cue> {
		return self.cues.get(&self.cue);
	}

	pub fn get_cue(&self, name: &str) -> Option<&Cue> {
		return self.cues.get(name);
	}

	pub fn cues(&self) -> impl Iterator<Item = &Cue> {
		return self.cues_ordered.iter().filter_map(|name| self.cues.get(name));
	}

	pub fn cues_ordered(&self) -> &[String] {
		return &self.cues_ordered;
	}

	pub fn cue_pointer(&self) -> usize {
		return self.cue_pointer;
	}

	/// Oldest first
	pub fn cue_history(&self) -> impl DoubleEndedIterator<Item = &(String, f64)> {
		return self.cue_history.iter();
	}

	pub fn bpm(&self) -> f64 {
		return self.bpm;
	}

	pub fn alpha(&self) -> f64 {
		return self.alpha;
	}

	pub fn priority(&self) -> f64 {
		return self.priority;
	}

	pub fn blend_name(&self) -> &str {
		return &self.blend_name;
	}

	pub fn is_monitor(&self) -> bool {
		return self.lighting.blend().is_monitor();
	}

	/// Compositing order among active groups
	pub fn layer_key(&self) -> LayerKey {
		return LayerKey::new(self.priority, self.started);
	}

	pub fn next_scheduled(&self) -> Option<&(f64, String)> {
		return self.next_scheduled.as_ref();
	}

	/// Seconds per beat
	pub fn beat(&self) -> f64 {
		return 60.0 / self.bpm;
	}

	// Cue list management

	fn resort(&mut self) {
		let mut ordered: Vec<(i64, String)> = self.cues.values().map(|c| (c.number, c.name.clone())).collect();
		ordered.sort();
		self.cues_ordered = ordered.into_iter().map(|(_, name)| name).collect();
		self.reset_pointer();
	}

	fn reset_pointer(&mut self) {
		self.cue_pointer = self.cues_ordered.iter().position(|n| n == &self.cue).unwrap_or(0);
	}

	/// Adds a fully built cue, as loaded from a show file.
	pub fn insert_cue(&mut self, cue: Cue) -> Result<(), GroupError> {
		let name = normalize_cue_name(&cue.name)?;
		if self.cues.contains_key(&name) {
			return Err(GroupError::CueExists(name));
		}
		let mut cue = cue;
		cue.name = name.clone();
		self.cues.insert(name, cue);
		self.resort();
		return Ok(());
	}

	/// Creates an empty cue numbered to land after `after` (or at the end).
	pub fn add_cue(&mut self, name: &str, after: Option<&str>) -> Result<&Cue, GroupError> {
		let name = normalize_cue_name(name)?;
		if self.cues.contains_key(&name) {
			return Err(GroupError::CueExists(name));
		}
		let after = match after {
			Some(after) => self.cues.get(after).ok_or_else(|| GroupError::NoSuchCue(String::from(after)))?.number,
			None => self.cues.values().map(|c| c.number).max().unwrap_or(0),
		};
		let number = self.get_number_for_new_cue(after)?;
		self.insert_cue(Cue::new(&name, number)?)?;
		return self.cues.get(&name).ok_or(GroupError::NoSuchCue(name));
	}

	fn cues_between(&self, start: i64, end: i64) -> bool {
		return self.cues.values().any(|c| c.number >= start && c.number <= end);
	}

	/// Numbers are ×1000. Tries a gap of 5, then 1..4, 0.1..0.9, 0.01..0.09.
	pub fn get_number_for_new_cue(&self, after: i64) -> Result<i64, GroupError> {
		if !self.cues_between(after + 1, after + 5000) {
			return Ok(after + 5000);
		}
		for step in [1000, 100, 10] {
			let limit = if step == 1000 { 4 } else { 9 };
			for i in 1..=limit {
				if !self.cues_between(after + 1, after + i * step) {
					return Ok(after + i * step);
				}
			}
		}
		return Err(GroupError::NoNumberAvailable);
	}

	/// Removes a cue. The board moves the group off it first if it is current.
	pub fn rm_cue(&mut self, name: &str) -> Result<Cue, GroupError> {
		if !self.cues.contains_key(name) {
			return Err(GroupError::NoSuchCue(String::from(name)));
		}
		if self.cues.len() <= 1 {
			return Err(GroupError::LastCue);
		}
		if name == "default" {
			return Err(GroupError::DeleteDefault);
		}
		if self.active && self.cue == name {
			return Err(GroupError::RemoveActive(String::from(name)));
		}
		let removed = self.cues.remove(name).ok_or_else(|| GroupError::NoSuchCue(String::from(name)))?;
		self.resort();
		return Ok(removed);
	}

	pub fn rename_cue(&mut self, old: &str, new: &str) -> Result<(), GroupError> {
		let new = normalize_cue_name(new)?;
		if self.cue == old {
			return Err(GroupError::RenameActive);
		}
		if old == "default" {
			return Err(GroupError::RenameDefault);
		}
		if self.cues.contains_key(&new) {
			return Err(GroupError::CueExists(new));
		}
		let mut cue = self.cues.remove(old).ok_or_else(|| GroupError::NoSuchCue(String::from(old)))?;
		cue.name = new.clone();
		self.cues.insert(new, cue);
		self.resort();
		return Ok(());
	}

	pub fn set_cue_number(&mut self, name: &str, number: i64) -> Result<(), GroupError> {
		let cue = self.cues.get_mut(name).ok_or_else(|| GroupError::NoSuchCue(String::from(name)))?;
		cue.number = number;
		self.resort();
		return Ok(());
	}

	/// Edits cue metadata in place. Name, id, number and shortcut have
	/// dedicated setters and are restored if `edit` touches them.
	pub fn edit_cue<F: FnOnce(&mut Cue)>(&mut self, name: &str, edit: F) -> Result<(), GroupError> {
		let cue = self.cues.get_mut(name).ok_or_else(|| GroupError::NoSuchCue(String::from(name)))?;
		let (id, number, shortcut) = (cue.id, cue.number, cue.shortcut.clone());
		edit(cue);
		cue.name = String::from(name);
		cue.id = id;
		cue.number = number;
		cue.shortcut = shortcut;
		if self.cue == name {
			self.poll_again = true;
		}
		return Ok(());
	}

	/// Stores the raw shortcut code. Registration is the board's job.
	pub(crate) fn set_cue_shortcut(&mut self, name: &str, code: &str) -> Result<String, GroupError> {
		let cue = self.cues.get_mut(name).ok_or_else(|| GroupError::NoSuchCue(String::from(name)))?;
		let old = std::mem::replace(&mut cue.shortcut, String::from(code.trim()));
		return Ok(old);
	}

	/// Sets or clears one channel of a cue. If the cue is showing, the dense
	/// state is patched and the group repaints.
	pub fn set_cue_value(
		&mut self,
		cue_name: &str,
		universe: &str,
		channel: &str,
		value: Option<CueValue>,
		arena: &mut UniverseArena,
	) -> Result<(), GroupError> {
		let channel = channel.trim();
		if channel.is_empty() {
			return Err(GroupError::InvalidValue {
				field: "channel",
				message: String::from("empty channel name"),
			});
		}
		let value = match value {
			Some(CueValue::Text(text)) => match text.trim().parse::<f64>() {
				Ok(number) => Some(CueValue::Number(number)),
				Err(_) => Some(CueValue::Text(text)),
			},
			other => other,
		};
		let cue = self.cues.get_mut(cue_name).ok_or_else(|| GroupError::NoSuchCue(String::from(cue_name)))?;
		let evaluated = match &value {
			Some(v) if !v.is_null() => Some(v.evaluate(self.script.as_scope())? as f32),
			_ => None,
		};
		let reshaped = cue.set_value(universe, channel, value);

		if !(self.active && self.cue == cue_name) {
			return Ok(());
		}
		if reshaped || channel.starts_with("__") {
			// Pseudo channels change the shape of the whole entry
			if let Some(cue) = self.cues.get(cue_name) {
				self.lighting.update_state_from_cue_vals(cue, false, arena, self.script.as_scope());
			}
		}
		if let Some((mapped, slot)) = arena.map_channel(universe, channel) {
			let count = arena.get(&mapped).map(|u| u.count()).unwrap_or(0);
			self.lighting.set_channel(&mapped, count, slot, evaluated);
		}
		self.lighting.rerender();
		self.poll_again = true;
		return Ok(());
	}

	// Sequencing helpers

	/// Where `next_cue` goes when the current cue has no explicit next
	pub fn get_default_next(&self) -> Option<String> {
		let default_next = self.default_next.trim();
		if !default_next.is_empty() {
			return Some(String::from(default_next));
		}
		let next = self.cues_ordered.get(self.cue_pointer + 1)?;
		if next.starts_with("__") {
			return None;
		}
		return Some(next.clone());
	}

	/// The cue `name` inherits tracked values from, if any.
	pub fn get_parent(&self, name: &str) -> Option<&str> {
		let cue = self.cues.get(name)?;
		if !cue.track {
			return None;
		}
		let idx = if self.cue == name {
			self.cue_pointer
		} else {
			self.cues_ordered.iter().position(|n| n == name)?
		};
		if idx == 0 {
			return None;
		}
		let prev = self.cues.get(&self.cues_ordered[idx - 1])?;
		if prev.next_cue.is_empty() || prev.next_cue == name {
			return Some(&prev.name);
		}
		return None;
	}

	/// Ancestors whose values `name` tracks, oldest first.
	///
	/// Stops before `live`, the cue whose values are already showing, at
	/// cycles and after a fixed number of steps.
	pub fn backtrack_chain(&self, name: &str, live: Option<&str>) -> Vec<String> {
		let mut chain = Vec::new();
		let mut seen = vec![String::from(name)];
		let mut current = String::from(name);
		for _ in 0..BACKTRACK_LIMIT {
			let Some(parent) = self.get_parent(&current) else {
				break;
			};
			if seen.iter().any(|s| s == parent) || live == Some(parent) {
				break;
			}
			seen.push(String::from(parent));
			chain.push(String::from(parent));
			current = String::from(parent);
		}
		chain.reverse();
		return chain;
	}

	/// Whether entering `name` replays ancestors
	pub fn should_backtrack(&self, name: &str) -> bool {
		let tracks = self.cues.get(name).map(|c| c.track).unwrap_or(false);
		return self.backtrack && tracks && self.get_default_next().as_deref() != Some(name);
	}

	pub(crate) fn push_history(&mut self, name: &str, now: f64) {
		self.cue_history.push_back((String::from(name), now));
		while self.cue_history.len() > HISTORY_LIMIT {
			self.cue_history.pop_front();
		}
	}

	/// Makes `name` current, stepping the pointer when it is simply the next cue.
	pub(crate) fn set_current(&mut self, name: &str) {
		let next_in_order = self.cues_ordered.get(self.cue_pointer + 1).map(|n| n == name).unwrap_or(false);
		self.cue = String::from(name);
		if next_in_order {
			self.cue_pointer += 1;
		} else {
			self.reset_pointer();
		}
	}

	/// Loads `name`'s rules, its `inherit_rules` chain and the `__rules__` cue.
	pub(crate) fn refresh_rules(&mut self, name: &str) {
		self.script.clear_bindings();
		self.script.set_var("GROUP", Value::from(self.name.as_str()));
		self.script.set_var("SCENE", Value::from(self.name.as_str()));
		if !self.active {
			return;
		}
		let Some(cue) = self.cues.get(name) else {
			return;
		};
		self.script.set_var("CUE", Value::from(name));
		self.script.add_bindings(&cue.rules);

		let mut seen = vec![String::from(name)];
		let mut inherit = cue.inherit_rules.trim().to_string();
		while !inherit.is_empty() && inherit != "__rules__" && !seen.contains(&inherit) {
			let Some(parent) = self.cues.get(&inherit) else {
				warn!(group = %self.name, cue = %inherit, "Missing cue for rule inheritance");
				break;
			};
			self.script.add_bindings(&parent.rules);
			seen.push(inherit);
			inherit = parent.inherit_rules.trim().to_string();
		}

		if let Some(rules) = self.cues.get("__rules__") {
			self.script.add_bindings(&rules.rules);
		}
	}

	pub fn recalc_randomize_modifier(&mut self, rng: &mut dyn RngCore) {
		let spread = self.current_cue().map(|c| c.length_randomize).unwrap_or(0.0);
		self.randomize_modifier = cue_length::randomize_modifier(rng, spread);
	}

	pub fn recalc_cue_len(&mut self, now: f64, media: Option<&dyn MediaBackend>) {
		if !self.active {
			return;
		}
		let Some(cue) = self.cues.get(&self.cue) else {
			return;
		};
		self.cue_len = cue_length::compute_cue_len(
			cue,
			self.randomize_modifier,
			self.crossfade,
			now,
			self.script.as_scope(),
			media,
		);
	}

	/// Hands the current cue to the lighting manager, with backtracking.
	pub(crate) fn enter_lighting(&mut self, arena: &mut UniverseArena) {
		let name = self.cue.clone();
		let live = self.lighting.current_cue();
		let chain = if self.should_backtrack(&name) && live != Some(name.as_str()) {
			self.backtrack_chain(&name, live)
		} else {
			Vec::new()
		};
		let Some(cue) = self.cues.get(&name) else {
			return;
		};
		let ancestors: Vec<&Cue> = chain.iter().filter_map(|n| self.cues.get(n)).collect();
		self.lighting.next(cue, &ancestors, arena, self.script.as_scope());
		self.lighting.rerender();
		self.poll_again = true;
	}

	/// Rebuilds the current cue's state, including tracked ancestors.
	pub(crate) fn reload_lighting(&mut self, arena: &mut UniverseArena) {
		self.lighting.reset_state();
		self.enter_lighting(arena);
	}

	/// Recomputes the dense state of the current cue, used when variables
	/// its expressions read have changed.
	pub fn refresh_dynamic_values(&mut self, arena: &UniverseArena) {
		if !self.lighting.rerender_on_var_change {
			return;
		}
		if let Some(cue) = self.cues.get(&self.cue) {
			self.lighting.update_state_from_cue_vals(cue, false, arena, self.script.as_scope());
			self.lighting.rerender();
			self.poll_again = true;
		}
	}

	pub fn set_var(&mut self, name: &str, value: Value, arena: &UniverseArena) {
		self.script.set_var(name, value);
		self.refresh_dynamic_values(arena);
	}

	pub fn refresh_schedule(&mut self, now: f64) {
		self.next_scheduled = scheduling::next_scheduled_cue(self, now);
	}

	/// Marks the group running. Board-level registration happens in `Board::go`.
	pub(crate) fn start_local(&mut self, now: f64) {
		self.active = true;
		self.started = now;
		self.poll_again = true;
		self.lighting.rerender();
		self.refresh_schedule(now);
	}

	/// Unwinds everything the group is doing, back to `default`.
	pub(crate) fn stop_local(&mut self, arena: &mut UniverseArena) {
		self.script.clear_bindings();
		self.script.clear_state();
		self.script.set_var("GROUP", Value::from(self.name.as_str()));
		self.script.set_var("SCENE", Value::from(self.name.as_str()));
		self.lighting.stop(arena);
		self.active = false;
		self.cue = String::from("default");
		self.reset_pointer();
		self.entered_cue = 0.0;
		self.cue_len = 0.0;
		self.poll_again = false;
		self.media_ended_at = None;
		self.next_scheduled = None;
	}

	// Tempo, alpha and blending

	pub fn set_bpm(&mut self, bpm: f64) -> Result<(), GroupError> {
		if !(bpm.is_finite() && bpm > 0.0) {
			return Err(GroupError::InvalidValue {
				field: "bpm",
				message: format!("{bpm} is not a positive tempo"),
			});
		}
		self.bpm = bpm;
		self.poll_again = true;
		return Ok(());
	}

	/// Tap tempo. Also nudges `entered_cue` so beats line up with the taps.
	pub fn tap(&mut self, t: f64) {
		let x = t - self.last_tap;
		self.last_tap = t;
		let time_per_beat = self.beat();

		if x > TAP_TIMEOUT {
			self.tap_sequence = 0;
		}
		if self.tap_sequence > 1 && (x - time_per_beat).abs() > time_per_beat * 0.05 {
			self.tap_sequence = 0;
		}
		if self.tap_sequence > 0 && x > 0.0 {
			let f = (1.0 / self.tap_sequence as f64).powi(2).max(0.0025);
			self.bpm = (self.bpm * (1.0 - f) + (60.0 / x) * f).trunc().max(1.0);
		}
		self.tap_sequence += 1;

		let beats = (t - self.entered_cue) / time_per_beat;
		let fbeat = beats.rem_euclid(1.0);
		let new_ts = beats.round() * time_per_beat;
		let phase = t - new_ts;
		if fbeat < 0.1 || fbeat > 0.9 {
			let f = 1.0 / (self.tap_sequence as f64).powf(1.2);
			self.entered_cue = self.entered_cue * (1.0 - f) + phase * f;
		} else {
			self.entered_cue = phase;
		}
		debug!(group = %self.name, bpm = self.bpm, "Tap");
	}

	/// Clamps to 0..1. Returns true when the board should start the group.
	pub fn set_alpha(&mut self, alpha: f64) -> bool {
		self.alpha = if alpha.is_finite() { alpha.clamp(0.0, 1.0) } else { 0.0 };
		self.lighting.rerender();
		self.poll_again = true;
		return !self.active && self.alpha > 0.0;
	}

	/// Board re-sorts its active list after this.
	pub(crate) fn set_priority(&mut self, priority: f64) {
		self.priority = priority;
		self.lighting.rerender();
	}

	pub fn set_blend(&mut self, name: &str, arena: &mut UniverseArena) -> Result<(), GroupError> {
		let blend = create_blend_mode(name, &BTreeMap::new())?;
		self.blend_name = String::from(name);
		self.lighting.set_blend(blend);
		self.lighting.refresh(arena);
		return Ok(());
	}

	pub fn set_blend_arg(&mut self, name: &str, value: f64) -> Result<(), GroupError> {
		self.lighting.set_blend_arg(name, value)?;
		return Ok(());
	}

	// Per-frame work

	/// Eased fade progress of the current cue
	pub fn fade_position(&self, now: f64) -> f64 {
		let fade_in = self.current_cue().map(|c| c.fade_in).unwrap_or(0.0) * self.beat();
		if fade_in <= 0.0 {
			return 1.0;
		}
		return ease(((now - self.entered_cue) / fade_in).clamp(0.0, 1.0));
	}

	pub fn cue_time_finished(&self, now: f64) -> bool {
		return self.cue_len > 0.0 && (now - self.entered_cue) > self.cue_len * self.beat();
	}

	/// Advances the fade and reports whether a timed transition is due.
	pub fn poll(&mut self, now: f64, arena: &UniverseArena, force_repaint: bool) -> Option<PollAction> {
		if !self.active {
			return None;
		}

		if self.poll_again || force_repaint {
			self.poll_again = false;
			let fade = self.fade_position(now);
			if fade < 1.0 {
				self.poll_again = true;
				self.lighting.rerender();
			}
			// Edits to a settled cue only flag a rerender, they still need paint
			if force_repaint || !self.lighting.fade_in_completed() || self.lighting.should_rerender {
				self.lighting.paint_canvas(fade, arena);
				self.lighting.rerender();
			}
		}

		if let Some((at, cue)) = self.next_scheduled.clone() {
			if at <= now {
				self.refresh_schedule(now);
				return Some(PollAction::Goto { cue, entered: at });
			}
		}

		if self.enable_timing && self.cue_time_finished(now) {
			let end = self.entered_cue + self.cue_len * self.beat();
			return Some(PollAction::Next {
				entered: (end * 1000.0).round() / 1000.0,
			});
		}

		if let Some(ended) = self.media_ended_at.take() {
			if self.current_cue().map(|c| c.rel_length).unwrap_or(false) {
				return Some(PollAction::Next { entered: ended });
			}
		}
		return None;
	}

	/// Monitor groups copy the composited output back into their cue.
	pub fn update_monitor_values(&mut self, arena: &UniverseArena) {
		if let Some(cue) = self.cues.get_mut(&self.cue) {
			self.lighting.update_monitor_values(cue, arena);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plugins::universes::outputs::NullOutput;
	use crate::plugins::universes::universe::UniverseConfig;
	use pretty_assertions::assert_eq;

	fn group(names: &[&str]) -> Group {
		let mut config = GroupConfig::default();
		config.name = String::from("g");
		for (i, name) in names.iter().enumerate() {
			config.cues.push(Cue::new(name, (i as i64 + 1) * 1000).unwrap());
		}
		return Group::from_config(config).unwrap();
	}

	#[test]
	fn default_cue_always_exists() {
		let g = group(&["a"]);
		assert!(g.get_cue("default").is_some());
		assert_eq!(g.cues_ordered(), &[String::from("default"), String::from("a")]);
		assert_eq!(g.cue_name(), "default");
	}

	#[test]
	fn new_cue_numbers_fill_gaps() {
		let mut g = group(&["default", "b"]);
		assert_eq!(g.get_number_for_new_cue(2000).unwrap(), 7000);
		// default at 1000, b at 2000: only 0.1 steps fit
		assert_eq!(g.get_number_for_new_cue(1000).unwrap(), 1100);
		g.insert_cue(Cue::new("c", 6000).unwrap()).unwrap();
		assert_eq!(g.get_number_for_new_cue(2000).unwrap(), 3000);

		let added = g.add_cue("d", Some("default")).unwrap();
		assert_eq!(added.number, 1100);
		assert_eq!(g.cues_ordered()[1], "d");
	}

	#[test]
	fn removal_rules() {
		let mut g = group(&["default"]);
		assert!(matches!(g.rm_cue("default"), Err(GroupError::LastCue)));
		let mut g = group(&["default", "a"]);
		assert!(matches!(g.rm_cue("default"), Err(GroupError::DeleteDefault)));
		assert!(matches!(g.rm_cue("zzz"), Err(GroupError::NoSuchCue(_))));
		g.rm_cue("a").unwrap();
		assert_eq!(g.cues_ordered().len(), 1);
	}

	#[test]
	fn rename_rules() {
		let mut g = group(&["default", "a", "b"]);
		assert!(matches!(g.rename_cue("default", "x"), Err(GroupError::RenameActive)));
		g.set_current("a");
		assert!(matches!(g.rename_cue("default", "x"), Err(GroupError::RenameDefault)));
		assert!(matches!(g.rename_cue("b", "a"), Err(GroupError::CueExists(_))));
		g.rename_cue("b", "2nd").unwrap();
		assert!(g.get_cue("x2nd").is_some());
	}

	#[test]
	fn default_next_and_parents() {
		let mut g = group(&["default", "a", "b", "__special__"]);
		assert_eq!(g.get_default_next().as_deref(), Some("a"));
		g.set_current("b");
		assert_eq!(g.cue_pointer(), 2);
		assert_eq!(g.get_default_next(), None);
		g.default_next = String::from("a");
		assert_eq!(g.get_default_next().as_deref(), Some("a"));

		assert_eq!(g.get_parent("b"), Some("a"));
		g.edit_cue("a", |c| c.next_cue = String::from("default")).unwrap();
		assert_eq!(g.get_parent("b"), None);
		g.edit_cue("b", |c| c.track = false).unwrap();
		assert_eq!(g.get_parent("b"), None);
	}

	#[test]
	fn backtrack_chain_is_oldest_first() {
		let g = group(&["default", "x", "y", "z"]);
		assert_eq!(g.backtrack_chain("z", None), vec!["default", "x", "y"]);
		assert_eq!(g.backtrack_chain("z", Some("x")), vec!["y"]);
	}

	#[test]
	fn history_is_bounded() {
		let mut g = group(&["default"]);
		for i in 0..(HISTORY_LIMIT + 10) {
			g.push_history("default", i as f64);
		}
		assert_eq!(g.cue_history().count(), HISTORY_LIMIT);
		assert_eq!(g.cue_history().next().map(|(_, t)| *t), Some(10.0));
	}

	#[test]
	fn alpha_clamps_and_requests_start() {
		let mut g = group(&["default"]);
		assert!(g.set_alpha(3.0));
		assert_eq!(g.alpha(), 1.0);
		assert!(!g.set_alpha(-1.0));
		assert_eq!(g.alpha(), 0.0);
	}

	#[test]
	fn tap_tempo_converges() {
		let mut g = group(&["default"]);
		g.set_bpm(60.0).unwrap();
		let mut t = 100.0;
		for _ in 0..12 {
			g.tap(t);
			t += 0.5;
		}
		assert!(g.bpm() > 100.0, "{}", g.bpm());
		assert!(g.set_bpm(0.0).is_err());
	}

	#[test]
	fn timed_poll_rounds_target() {
		let mut arena = UniverseArena::new();
		arena.add_universe(UniverseConfig::new("u1"), Box::new(NullOutput)).unwrap();
		let mut g = group(&["default"]);
		g.start_local(10.0);
		g.entered_cue = 10.0;
		g.cue_len = 1.23456;
		assert_eq!(g.poll(10.5, &arena, false), None);
		assert_eq!(g.poll(20.0, &arena, false), Some(PollAction::Next { entered: 11.235 }));
		g.enable_timing = false;
		assert_eq!(g.poll(20.0, &arena, false), None);
	}

	#[test]
	fn config_round_trip_keeps_cues() {
		let g = group(&["default", "a"]);
		let config = g.to_config();
		let text = serde_json::to_string(&config).unwrap();
		let back: GroupConfig = serde_json::from_str(&text).unwrap();
		assert_eq!(back.cues.len(), 2);
		assert_eq!(back.cues[1].name, "a");
		assert_eq!(back.id, g.id);
	}

	#[test]
	fn cause_names() {
		assert_eq!(TransitionCause::Script(2).to_string(), "script.2");
		assert_eq!(TransitionCause::Script(2).script_depth(), 2);
		assert_eq!(TransitionCause::Time.script_depth(), 0);
	}
}

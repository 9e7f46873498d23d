//! Cue transitions: `goto_cue`, `next_cue`, `prev_cue` and the rule commands
//! they trigger.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sync::SyncMessage;
use super::{Board, Deferred};
use crate::plugins::groups::cue::parse_cue_number;
use crate::plugins::groups::cue_names::resolve_cue_name;
use crate::plugins::groups::{Group, GroupError, TransitionCause, TransitionError};
use crate::plugins::media::MediaCue;
use crate::plugins::scripting::ScriptCommand;
use crate::plugins::universes::UniverseArena;
use crate::utilities::expressions::{self, Value};

/// Rules may redirect this many times before a transition is refused
pub const MAX_SCRIPT_DEPTH: u8 = 3;
/// Entry times this far behind the current one are stale duplicates
const STALE_ENTRY: f64 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GotoOptions {
	/// Entry time to record instead of now
	pub entered: Option<f64>,
	/// Publish the transition to sync peers
	pub send_sync: bool,
	/// Fire `cue.exit` and `cue.enter`
	pub generate_events: bool,
	pub cause: TransitionCause,
}

impl Default for GotoOptions {
	fn default() -> Self {
		return GotoOptions {
			entered: None,
			send_sync: true,
			generate_events: true,
			cause: TransitionCause::Generic,
		};
	}
}

impl GotoOptions {
	pub fn cause(cause: TransitionCause) -> Self {
		return GotoOptions {
			cause,
			..GotoOptions::default()
		};
	}

	pub fn at(mut self, entered: f64) -> Self {
		self.entered = Some(entered);
		return self;
	}
}

/// `name?a=1&b=x` -> `{a: 1, b: "x"}`
fn parse_kwargs(raw: &str) -> BTreeMap<String, Value> {
	let mut kwargs = BTreeMap::new();
	let Some((_, query)) = raw.split_once('?') else {
		return kwargs;
	};
	for pair in query.split('&').filter(|p| !p.is_empty()) {
		let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
		let value = match value.trim().parse::<f64>() {
			Ok(number) => Value::Number(number),
			Err(_) => Value::from(value),
		};
		kwargs.insert(String::from(key.trim()), value);
	}
	return kwargs;
}

/// Whether a cue's `next_cue` names something `goto_cue` can resolve
fn has_explicit_next(group: &Group, next: &str) -> bool {
	let next = next.trim();
	if next.is_empty() {
		return false;
	}
	let name = next.split_once('?').map(|(n, _)| n).unwrap_or(next);
	return group.get_cue(name).is_some()
		|| next.starts_with("__")
		|| next.starts_with('=')
		|| next.contains('|')
		|| next.contains('*')
		|| parse_cue_number(name).is_some();
}

impl Board {
	/// Moves a group to a cue.
	///
	/// Returns `Ok(false)` when nothing happened: the name resolved to nothing,
	/// the cue is current and not reentrant, the entry time is stale, or a
	/// transition fired by one of this call's own rules overtook it.
	pub fn goto_cue(
		&mut self,
		id: Uuid,
		cue: &str,
		now: f64,
		options: GotoOptions,
		arena: &mut UniverseArena,
	) -> Result<bool, TransitionError> {
		let depth = options.cause.script_depth();
		if depth > MAX_SCRIPT_DEPTH {
			return Err(TransitionError::TooManyRedirects);
		}
		let active = self
			.groups
			.get(&id)
			.map(|g| g.active)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		// One charge per request; starting the group and `__setup__` chaining are free
		if options.cause != TransitionCause::Start && !self.limiter.limit(now) {
			return Err(TransitionError::RateLimited);
		}
		if !active {
			self.go(id, now, arena)?;
		}

		let group = self
			.groups
			.get(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		let raw = expressions::resolve(cue.trim(), group.script.as_scope())?.to_string();
		let kwargs = parse_kwargs(&raw);
		let Some(resolved) = resolve_cue_name(group, raw.trim(), now, &mut self.rng, self.checkpoints.as_ref())? else {
			debug!(group = %group.name, cue = %raw, "Cue resolved to nothing");
			return Ok(false);
		};
		if resolved.name == "__stop__" {
			self.stop(id, arena)?;
			return Ok(true);
		}
		let name = resolved.name;

		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		let in_cue = group.active && group.entered_cue != 0.0;
		let explicit_time = options.entered.or(resolved.entered);
		let entered = explicit_time.unwrap_or(now);
		if in_cue {
			if entered < group.entered_cue - STALE_ENTRY {
				debug!(group = %group.name, cue = %name, "Ignoring stale transition");
				return Ok(false);
			}
			if explicit_time.is_some() && entered == group.entered_cue {
				return Ok(false);
			}
		}
		let target = group
			.get_cue(&name)
			.ok_or_else(|| GroupError::NoSuchCue(name.clone()))?
			.clone();
		if target.error_lockout && name != "default" {
			return Err(GroupError::ErrorLockout(name).into());
		}
		if in_cue && group.cue_name() == name && !target.reentrant {
			return Ok(false);
		}

		group.script.set_var("KWARGS", Value::Map(kwargs));
		group.transition_serial += 1;
		let serial = group.transition_serial;
		let old = String::from(group.cue_name());

		if in_cue && options.generate_events {
			let commands = group.script.event("cue.exit", &Value::from(old.as_str()));
			self.run_script_commands(id, commands, depth, now, arena);
			if self.overtaken(id, serial) {
				return Ok(false);
			}
		}

		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		group.entered_cue = entered;
		group.push_history(&name, now);
		group.media_ended_at = None;
		// Rules first, so a broken cue never leaves the group half entered
		group.refresh_rules(&name);
		group.set_current(&name);
		info!(group = %group.name, from = %old, cue = %name, cause = %options.cause, "Entered cue");

		if !target.trigger_shortcut.trim().is_empty() {
			self.deferred.push(Deferred::Shortcut {
				code: String::from(target.trigger_shortcut.trim()),
				exclude: id,
			});
		}
		if target.checkpoint && options.cause != TransitionCause::Start {
			if let Err(err) = self.checkpoints.set_checkpoint(&id.to_string(), &name) {
				warn!(group = %id, cue = %name, error = %err, "Could not save checkpoint");
			}
		}

		let media = self.media.clone();
		let group = self
			.groups
			.get_mut(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		group.recalc_randomize_modifier(&mut self.rng);
		group.recalc_cue_len(now, media.as_deref());
		group.enter_lighting(arena);
		group.entered_frame = self.frames_completed;
		group.refresh_schedule(now);

		if media.is_some() {
			let scope = group.script.as_scope();
			let media_cue = MediaCue {
				group: group.name.clone(),
				cue: name.clone(),
				sound: target.sound.clone(),
				slide: target.slide.clone(),
				markdown: target.markdown.clone(),
				start_position: target.sound_start_position.evaluate(scope).unwrap_or(0.0),
				speed: target.media_speed.evaluate(scope).unwrap_or(1.0),
				loops: target.sound_loops,
				entered,
			};
			self.deferred.push(Deferred::Media(media_cue));
		}

		if options.send_sync && !group.sync_group.is_empty() {
			if let Some(sync) = &self.sync {
				let message = SyncMessage {
					time: entered,
					cue: name.clone(),
					sender_session_id: self.session_id.clone(),
				};
				if let Err(err) = sync.publish(&group.sync_group, &message) {
					warn!(group = %group.name, error = %err, "Could not publish sync message");
				}
			}
		}

		if options.generate_events {
			let commands = group.script.event("cue.enter", &Value::from(name.as_str()));
			self.run_script_commands(id, commands, depth, now, arena);
			if self.overtaken(id, serial) {
				return Ok(true);
			}
		}

		// `__setup__` is never a resting state
		if name == "__setup__" {
			let chained = self.goto_cue(id, "__checkpoint__", now, GotoOptions::cause(TransitionCause::Start), arena);
			let still_setup = self.groups.get(&id).map(|g| g.cue_name() == "__setup__").unwrap_or(false);
			if let Err(err) = &chained {
				warn!(group = %id, error = %err, "Could not restore checkpoint after setup");
			}
			if chained.is_err() || still_setup {
				self.goto_cue(id, "default", now, GotoOptions::cause(TransitionCause::Start), arena)?;
			}
		}
		return Ok(true);
	}

	/// Follows the current cue's `next_cue`, or the group's default next.
	pub fn next_cue(
		&mut self,
		id: Uuid,
		now: f64,
		options: GotoOptions,
		arena: &mut UniverseArena,
	) -> Result<bool, TransitionError> {
		let group = self
			.groups
			.get(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		let target = match group.current_cue() {
			Some(cue) if has_explicit_next(group, &cue.next_cue) => Some(String::from(cue.next_cue.trim())),
			_ => group.get_default_next(),
		};
		let Some(target) = target else {
			return Ok(false);
		};
		return self.goto_cue(id, &target, now, options, arena);
	}

	/// Goes back to the cue before the current one in history.
	pub fn prev_cue(
		&mut self,
		id: Uuid,
		now: f64,
		options: GotoOptions,
		arena: &mut UniverseArena,
	) -> Result<bool, TransitionError> {
		let group = self
			.groups
			.get(&id)
			.ok_or_else(|| TransitionError::UnknownGroup(id.to_string()))?;
		let Some((previous, _)) = group.cue_history().rev().nth(1) else {
			return Ok(false);
		};
		let previous = previous.clone();
		return self.goto_cue(id, &previous, now, options, arena);
	}

	fn overtaken(&self, id: Uuid, serial: u64) -> bool {
		return self.groups.get(&id).map(|g| g.transition_serial != serial).unwrap_or(true);
	}

	/// Executes commands returned by `id`'s rules one level deeper.
	/// Failures are logged; they never undo the transition that fired them.
	pub(crate) fn run_script_commands(
		&mut self,
		id: Uuid,
		commands: Vec<ScriptCommand>,
		depth: u8,
		now: f64,
		arena: &mut UniverseArena,
	) {
		let cause = TransitionCause::Script(depth.saturating_add(1));
		for command in commands {
			let result = match &command {
				ScriptCommand::Goto { group, cue } => match self.find_group(group) {
					Some(target) => self
						.goto_cue(target, cue, now, GotoOptions::cause(cause), arena)
						.map(|_| ()),
					None => Err(TransitionError::UnknownGroup(group.clone())),
				},
				ScriptCommand::SetAlpha { group, alpha } => match self.find_group(group) {
					Some(target) => self.set_alpha(target, *alpha, now, arena),
					None => Err(TransitionError::UnknownGroup(group.clone())),
				},
				ScriptCommand::Shortcut { code } => {
					if cause.script_depth() > MAX_SCRIPT_DEPTH {
						Err(TransitionError::TooManyRedirects)
					} else {
						self.trigger_shortcut(code, None, now, cause, arena).map(|_| ())
					}
				}
				ScriptCommand::Stop { group } => match self.find_group(group) {
					Some(target) => self.stop(target, arena),
					None => Err(TransitionError::UnknownGroup(group.clone())),
				},
				ScriptCommand::SetVar { name, value } => match self.groups.get_mut(&id) {
					Some(group) => {
						group.set_var(name, value.clone(), arena);
						Ok(())
					}
					None => Err(TransitionError::UnknownGroup(id.to_string())),
				},
			};
			if let Err(err) = result {
				warn!(group = %id, command = ?command, error = %err, "Rule command failed");
			}
		}
	}
}

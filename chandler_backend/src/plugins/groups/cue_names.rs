//! Turns the cue name a caller asked for into a concrete cue.
//!
//! Besides literal names this understands `__shuffle__`, `__random__`,
//! `__checkpoint__`, `__schedule__`, `a|b|c` choices, `*` globs (optionally
//! `shuffle:`-prefixed) and cue numbers such as `5.5`.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use regex::Regex;
use tracing::warn;

use super::scheduling::schedule_jump_point;
use super::{Group, GroupError, TransitionError};
use crate::plugins::saver::checkpoints::CheckpointStore;

/// History entries considered when avoiding repeats
const RECENT_HISTORY: usize = 15;
/// Repeat avoidance never shrinks the pool below this
const MIN_CANDIDATES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCue {
	pub name: String,
	/// Entry time carried by the resolution itself (checkpoints, schedules)
	pub entered: Option<f64>,
}

impl ResolvedCue {
	fn now(name: String) -> Self {
		return ResolvedCue { name, entered: None };
	}
}

/// Resolves `raw`. `Ok(None)` means there is nothing to do.
pub fn resolve_cue_name(
	group: &Group,
	raw: &str,
	now: f64,
	rng: &mut dyn RngCore,
	checkpoints: &dyn CheckpointStore,
) -> Result<Option<ResolvedCue>, TransitionError> {
	let current = group.cue_name();
	let chosen = match raw {
		"__shuffle__" => {
			let mut pool: Vec<String> = group
				.cues_ordered()
				.iter()
				.filter(|name| name.as_str() != current)
				.cloned()
				.collect();
			avoid_recent(group, &mut pool);
			pick_weighted(group, &pool, rng)?
		}
		"__random__" => {
			let pool: Vec<String> = group
				.cues_ordered()
				.iter()
				.filter(|name| name.as_str() != current)
				.cloned()
				.collect();
			pick_weighted(group, &pool, rng)?
		}
		"__checkpoint__" => return Ok(checkpoint_cue(group, checkpoints)),
		"__schedule__" => {
			return Ok(schedule_jump_point(group, now)?.map(|(name, entered)| ResolvedCue {
				name,
				entered: Some(entered),
			}));
		}
		"__stop__" => return Ok(Some(ResolvedCue::now(String::from(raw)))),
		_ if raw.contains('|') => {
			let mut pool: Vec<String> = raw.split('|').map(|s| String::from(s.trim())).collect();
			// Sometimes allow repeats so the avoidance does not become a fixed pattern
			if rng.gen::<f64>() > 0.3 {
				avoid_recent(group, &mut pool);
			}
			pick_weighted(group, &pool, rng)?
		}
		_ if raw.contains('*') => {
			let (pattern, shuffle) = match raw.strip_prefix("shuffle:") {
				Some(pattern) => (pattern, true),
				None => (raw, false),
			};
			let matcher = glob_to_regex(pattern)?;
			let mut pool: Vec<String> = group
				.cues_ordered()
				.iter()
				.filter(|name| matcher.is_match(name))
				.cloned()
				.collect();
			if pool.is_empty() {
				return Err(TransitionError::NoGlobMatch(String::from(pattern)));
			}
			if shuffle {
				avoid_recent(group, &mut pool);
			}
			pick_weighted(group, &pool, rng)?
		}
		_ => String::from(raw),
	};

	let name = match chosen.split_once('?') {
		Some((name, _)) => String::from(name),
		None => chosen,
	};
	if name.is_empty() {
		return Ok(None);
	}
	if group.get_cue(&name).is_some() {
		return Ok(Some(ResolvedCue::now(name)));
	}
	return match find_by_number(group, &name) {
		Some(found) => Ok(Some(ResolvedCue::now(found))),
		None => Err(TransitionError::Group(GroupError::NoSuchCue(name))),
	};
}

/// Drops recently visited cues, newest first, while enough candidates remain.
fn avoid_recent(group: &Group, pool: &mut Vec<String>) {
	for (name, _) in group.cue_history().rev().take(RECENT_HISTORY) {
		if pool.len() < MIN_CANDIDATES {
			break;
		}
		if let Some(pos) = pool.iter().position(|candidate| candidate == name) {
			pool.remove(pos);
		}
	}
}

/// Weighted pick by each cue's `probability`. Special and unknown names
/// never win.
fn pick_weighted(group: &Group, pool: &[String], rng: &mut dyn RngCore) -> Result<String, TransitionError> {
	let mut names = Vec::new();
	let mut weights = Vec::new();
	for candidate in pool {
		let candidate = candidate.trim();
		if candidate.starts_with("__") {
			continue;
		}
		let Some(cue) = group.get_cue(candidate) else {
			continue;
		};
		let weight = if cue.probability.is_null() {
			1.0
		} else {
			match cue.probability.evaluate(group.script.as_scope()) {
				Ok(weight) if weight.is_finite() && weight >= 0.0 => weight,
				Ok(_) => 0.0,
				Err(err) => {
					warn!(group = %group.name, cue = %cue.name, error = %err, "Bad cue probability");
					0.0
				}
			}
		};
		names.push(cue.name.clone());
		weights.push(weight);
	}

	let dist = WeightedIndex::new(&weights).map_err(|_| TransitionError::NoCandidates)?;
	return Ok(names[dist.sample(rng)].clone());
}

fn checkpoint_cue(group: &Group, checkpoints: &dyn CheckpointStore) -> Option<ResolvedCue> {
	let (name, entered) = match checkpoints.get_checkpoint(&group.id.to_string()) {
		Ok(Some(found)) => found,
		Ok(None) => return None,
		Err(err) => {
			warn!(group = %group.name, error = %err, "Could not read checkpoint");
			return None;
		}
	};
	if name.starts_with("__") {
		return None;
	}
	let cue = group.get_cue(&name)?;
	if !cue.checkpoint {
		return None;
	}
	return Some(ResolvedCue {
		name,
		entered: Some(entered),
	});
}

fn find_by_number(group: &Group, text: &str) -> Option<String> {
	let number: f64 = text.trim().parse().ok()?;
	let target = number * 1000.0;
	return group
		.cues_ordered()
		.iter()
		.filter_map(|name| group.get_cue(name))
		.find(|cue| (cue.number as f64 - target).abs() < 0.001)
		.map(|cue| cue.name.clone());
}

/// Shell-style pattern: `*` matches anything, `?` one character.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, TransitionError> {
	let mut out = String::from("^");
	for c in pattern.chars() {
		match c {
			'*' => out.push_str(".*"),
			'?' => out.push('.'),
			other => out.push_str(&regex::escape(&other.to_string())),
		}
	}
	out.push('$');
	return Regex::new(&out).map_err(|_| TransitionError::NoGlobMatch(String::from(pattern)));
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plugins::groups::cue::Cue;
	use crate::plugins::groups::GroupConfig;
	use crate::plugins::saver::checkpoints::MemoryCheckpointStore;
	use rand::rngs::StdRng;

	fn group(names: &[(&str, i64)]) -> Group {
		let mut config = GroupConfig::default();
		config.name = String::from("g");
		for (name, number) in names {
			config.cues.push(Cue::new(name, *number).unwrap());
		}
		return Group::from_config(config).unwrap();
	}

	fn resolve(group: &Group, raw: &str, rng: &mut StdRng) -> Option<String> {
		return resolve_cue_name(group, raw, 0.0, rng, &MemoryCheckpointStore::default())
			.unwrap()
			.map(|r| r.name);
	}

	#[test]
	fn literal_and_number() {
		let g = group(&[("default", 1000), ("intro", 2500)]);
		let mut rng = StdRng::seed_from_u64(1);
		assert_eq!(resolve(&g, "intro", &mut rng).as_deref(), Some("intro"));
		assert_eq!(resolve(&g, "2.5", &mut rng).as_deref(), Some("intro"));
		assert_eq!(resolve(&g, "intro?x=1", &mut rng).as_deref(), Some("intro"));
		assert!(resolve_cue_name(&g, "nope", 0.0, &mut rng, &MemoryCheckpointStore::default()).is_err());
		assert!(resolve_cue_name(&g, "9", 0.0, &mut rng, &MemoryCheckpointStore::default()).is_err());
	}

	#[test]
	fn shuffle_never_picks_current_or_special() {
		let g = group(&[("default", 1000), ("a", 2000), ("b", 3000), ("__hidden__", 4000)]);
		let mut rng = StdRng::seed_from_u64(2);
		for _ in 0..50 {
			let picked = resolve(&g, "__shuffle__", &mut rng).unwrap();
			assert!(picked == "a" || picked == "b", "{picked}");
			let picked = resolve(&g, "__random__", &mut rng).unwrap();
			assert!(picked == "a" || picked == "b", "{picked}");
		}
	}

	#[test]
	fn zero_probability_is_never_chosen() {
		let mut g = group(&[("default", 1000), ("a", 2000), ("b", 3000)]);
		g.edit_cue("a", |cue| cue.probability = 0.0.into()).unwrap();
		let mut rng = StdRng::seed_from_u64(3);
		for _ in 0..50 {
			assert_eq!(resolve(&g, "a|b", &mut rng).as_deref(), Some("b"));
		}
	}

	#[test]
	fn globs() {
		let g = group(&[("default", 1000), ("loop1", 2000), ("loop2", 3000), ("other", 4000)]);
		let mut rng = StdRng::seed_from_u64(4);
		for _ in 0..20 {
			let picked = resolve(&g, "shuffle:loop*", &mut rng).unwrap();
			assert!(picked.starts_with("loop"));
		}
		assert!(matches!(
			resolve_cue_name(&g, "zzz*", 0.0, &mut rng, &MemoryCheckpointStore::default()),
			Err(TransitionError::NoGlobMatch(_))
		));
		assert!(glob_to_regex("a.b*").unwrap().is_match("a.bcd"));
		assert!(!glob_to_regex("a.b*").unwrap().is_match("axbcd"));
	}

	#[test]
	fn checkpoint_requires_flag() {
		let mut g = group(&[("default", 1000), ("saved", 2000), ("plain", 3000)]);
		g.edit_cue("saved", |cue| cue.checkpoint = true).unwrap();
		let store = MemoryCheckpointStore::default();
		let mut rng = StdRng::seed_from_u64(5);
		let id = g.id.to_string();

		store.set_checkpoint(&id, "plain").unwrap();
		assert_eq!(resolve_cue_name(&g, "__checkpoint__", 0.0, &mut rng, &store).unwrap(), None);

		store.set_checkpoint(&id, "saved").unwrap();
		let resolved = resolve_cue_name(&g, "__checkpoint__", 0.0, &mut rng, &store).unwrap().unwrap();
		assert_eq!(resolved.name, "saved");
		assert!(resolved.entered.is_some());
	}
}

//! Fast-forwarding through timed cue chains.

use tracing::error;

use super::cue::{Cue, CueValue};
use super::{Group, TransitionError};
use crate::utilities::recurrence::Recurrence;

const CHAIN_LIMIT: usize = 1000;

/// Length as a schedule-relevant string: empty for zero, `@rule` kept as is.
fn processed_length(length: &CueValue) -> String {
	return match length {
		CueValue::Null => String::new(),
		CueValue::Number(n) if *n == 0.0 => String::new(),
		CueValue::Number(n) => n.to_string(),
		CueValue::Text(text) => match text.trim().parse::<f64>() {
			Ok(n) if n == 0.0 => String::new(),
			_ => String::from(text.trim()),
		},
	};
}

/// The cue that follows `cue` when the group runs unattended, if any
fn successor(group: &Group, cue: &Cue) -> Result<Option<String>, TransitionError> {
	if !cue.next_cue.is_empty() && cue.next_cue != "__schedule__" {
		if group.get_cue(&cue.next_cue).is_none() {
			if cue.next_cue.starts_with("__") {
				return Ok(None);
			}
			return Err(TransitionError::Schedule(format!(
				"reference to nonexistent cue {} in group {}",
				cue.next_cue, group.name
			)));
		}
		return Ok(Some(cue.next_cue.clone()));
	}
	let ordered = group.cues_ordered();
	let idx = ordered.iter().position(|name| name == &cue.name);
	return Ok(idx.and_then(|idx| ordered.get(idx + 1)).cloned());
}

/// Finds the cue the group would be in now had it been running all along,
/// and when it would have been entered.
///
/// Walks the timed chain from the current cue, placing every `@rule` cue's
/// most recent occurrence and the fixed lengths after it, plus any cue with
/// an absolute `schedule_at`. Returns `None` without any scheduled cue.
pub fn schedule_jump_point(group: &Group, now: f64) -> Result<Option<(String, f64)>, TransitionError> {
	if !group.default_next.trim().is_empty() {
		return Err(TransitionError::Schedule(String::from(
			"default next is set, __schedule__ does not work here",
		)));
	}

	let Some(start) = group.current_cue() else {
		return Ok(None);
	};

	// (cue, what follows it)
	let mut chain: Vec<(&Cue, Option<String>)> = Vec::new();
	let mut pointer = start;
	for _ in 0..CHAIN_LIMIT {
		let next = successor(group, pointer)?;
		if !std::ptr::eq(pointer, start) {
			if pointer.next_cue.starts_with("__") {
				return Err(TransitionError::Schedule(String::from(
					"special __ cue in the chain, fast forward not possible",
				)));
			}
			if pointer.length.is_expression() {
				return Err(TransitionError::Schedule(String::from(
					"=expression length in the chain, fast forward not possible",
				)));
			}
		}

		if processed_length(&pointer.length).is_empty() && !std::ptr::eq(pointer, start) {
			break;
		}
		chain.push((pointer, next.clone()));

		let Some(next) = next else {
			break;
		};
		if chain.iter().any(|(cue, _)| cue.name == next) {
			break;
		}
		match group.get_cue(&next) {
			Some(cue) => pointer = cue,
			None => break,
		}
	}

	let mut times: Vec<(String, f64)> = Vec::new();
	let mut last: Option<f64> = None;
	let mut scheduled = 0;

	for (cue, next) in &chain {
		let length = processed_length(&cue.length);
		if length.starts_with('@') {
			let rule = match Recurrence::parse(&length) {
				Ok(rule) => rule,
				Err(err) => {
					error!(group = %group.name, cue = %cue.name, error = %err, "Bad schedule");
					break;
				}
			};
			scheduled += 1;
			// The cue ends at the occurrence, so what follows starts there
			let ended = rule.before(now);
			times.push((next.clone().unwrap_or_else(|| cue.name.clone()), ended));
			last = Some(ended);
		} else if let (Some(entered), Ok(seconds)) = (last, length.parse::<f64>()) {
			let ended = entered + seconds;
			if let Some(next) = next {
				times.push((next.clone(), ended));
			}
			last = Some(ended);
		}
	}

	for name in group.cues_ordered() {
		let Some(cue) = group.get_cue(name) else {
			continue;
		};
		if cue.schedule_at.len() <= 1 {
			continue;
		}
		match Recurrence::parse(&cue.schedule_at) {
			Ok(rule) => {
				scheduled += 1;
				times.push((cue.name.clone(), rule.before(now)));
			}
			Err(err) => error!(group = %group.name, cue = %cue.name, error = %err, "Bad schedule_at"),
		}
	}

	if scheduled == 0 {
		return Ok(None);
	}
	let mut best: Option<(String, f64)> = None;
	for (name, at) in times {
		if at < now && best.as_ref().map(|(_, t)| at > *t).unwrap_or(true) {
			best = Some((name, at));
		}
	}
	return Ok(best);
}

/// Earliest upcoming `schedule_at` occurrence among the group's cues
pub fn next_scheduled_cue(group: &Group, now: f64) -> Option<(f64, String)> {
	let mut best: Option<(f64, String)> = None;
	for name in group.cues_ordered() {
		let Some(cue) = group.get_cue(name) else {
			continue;
		};
		if cue.schedule_at.len() <= 1 {
			continue;
		}
		let Ok(rule) = Recurrence::parse(&cue.schedule_at) else {
			continue;
		};
		let at = rule.after(now, false);
		if best.as_ref().map(|(t, _)| at < *t).unwrap_or(true) {
			best = Some((at, cue.name.clone()));
		}
	}
	return best;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plugins::groups::GroupConfig;

	fn group(cues: Vec<Cue>) -> Group {
		let mut config = GroupConfig::default();
		config.name = String::from("sched");
		config.cues = cues;
		return Group::from_config(config).unwrap();
	}

	fn cue(name: &str, number: i64, length: CueValue) -> Cue {
		let mut cue = Cue::new(name, number).unwrap();
		cue.length = length;
		return cue;
	}

	#[test]
	fn needs_a_scheduled_cue() {
		let g = group(vec![cue("default", 1000, CueValue::Number(5.0)), cue("b", 2000, CueValue::Number(5.0))]);
		assert_eq!(schedule_jump_point(&g, 1_000_000.0).unwrap(), None);
	}

	#[test]
	fn refuses_with_default_next() {
		let mut g = group(vec![cue("default", 1000, CueValue::Number(5.0))]);
		g.default_next = String::from("default");
		assert!(schedule_jump_point(&g, 1_000_000.0).is_err());
	}

	#[test]
	fn jumps_past_recurring_boundary() {
		// default lasts until the next 10 minute mark, then b runs 60s, then c
		let g = group(vec![
			cue("default", 1000, CueValue::from("@every 10 minutes")),
			cue("b", 2000, CueValue::Number(60.0)),
			cue("c", 3000, CueValue::Number(0.0)),
		]);
		let rule = Recurrence::parse("@every 10 minutes").unwrap();
		let boundary = rule.after(1_000_000.0, false);

		let (name, at) = schedule_jump_point(&g, boundary + 30.0).unwrap().unwrap();
		assert_eq!(name, "b");
		assert_eq!(at, boundary);

		let (name, at) = schedule_jump_point(&g, boundary + 90.0).unwrap().unwrap();
		assert_eq!(name, "c");
		assert_eq!(at, boundary + 60.0);
	}

	#[test]
	fn expression_lengths_block_fast_forward() {
		let g = group(vec![
			cue("default", 1000, CueValue::from("@every 10 minutes")),
			cue("b", 2000, CueValue::from("=5")),
		]);
		assert!(schedule_jump_point(&g, 1_000_000.0).is_err());
	}

	#[test]
	fn upcoming_schedule_at() {
		let mut late = cue("late", 2000, CueValue::Number(0.0));
		late.set_schedule_at("every 1 hours").unwrap();
		let g = group(vec![cue("default", 1000, CueValue::Number(0.0)), late]);
		let (at, name) = next_scheduled_cue(&g, 1_000_000.0).unwrap();
		assert_eq!(name, "late");
		assert!(at > 1_000_000.0 && at <= 1_003_600.0);
	}
}

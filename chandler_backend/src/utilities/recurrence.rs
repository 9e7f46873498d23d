//! Recurring schedule rules used by `@`-prefixed cue lengths and `schedule_at`.
//!
//! Supported forms (case-insensitive, leading `@` optional):
//!
//! - `every 5 minutes`, `every second`, `every 2 hours`, `every 3 days`
//! - `every day at 18:30`, `daily at 6pm`, `18:30:15`
//! - `every friday at 21:00`

use chrono::{Datelike, Duration, NaiveTime, Weekday};
use thiserror::Error;

use super::clock::{local_timestamp, to_local};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecurrenceError {
	#[error("Empty recurrence rule")]
	Empty,
	#[error("Could not understand recurrence rule {0:?}")]
	Unrecognized(String),
	#[error("Invalid time of day {0:?}")]
	InvalidTime(String),
	#[error("Interval must be greater than zero")]
	ZeroInterval,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Recurrence {
	/// Fixed period. Periods that divide a day evenly are anchored at local
	/// midnight, longer ones at the Unix epoch.
	Interval { seconds: i64 },
	Daily { time: NaiveTime },
	Weekly { weekday: Weekday, time: NaiveTime },
}

impl Recurrence {
	pub fn parse(rule: &str) -> Result<Self, RecurrenceError> {
		let rule = rule.trim();
		let rule = rule.strip_prefix('@').unwrap_or(rule).trim().to_lowercase();
		if rule.is_empty() {
			return Err(RecurrenceError::Empty);
		}

		let words: Vec<&str> = rule.split_whitespace().collect();
		match words.as_slice() {
			["every", unit] => {
				if let Some(seconds) = unit_seconds(unit) {
					return Ok(Recurrence::Interval { seconds });
				}
			}
			["every", count, unit] => {
				if let (Ok(count), Some(seconds)) = (count.parse::<i64>(), unit_seconds(unit)) {
					if count <= 0 {
						return Err(RecurrenceError::ZeroInterval);
					}
					return Ok(Recurrence::Interval { seconds: count * seconds });
				}
			}
			["every", "day", "at", time] | ["daily", "at", time] => {
				return Ok(Recurrence::Daily { time: parse_time_of_day(time)? });
			}
			["every", day, "at", time] => {
				if let Some(weekday) = parse_weekday(day) {
					return Ok(Recurrence::Weekly {
						weekday,
						time: parse_time_of_day(time)?,
					});
				}
			}
			[time] => {
				if let Ok(time) = parse_time_of_day(time) {
					return Ok(Recurrence::Daily { time });
				}
			}
			_ => {}
		}
		return Err(RecurrenceError::Unrecognized(rule));
	}

	/// First occurrence after `reference` (or at it, if `inclusive`).
	pub fn after(&self, reference: f64, inclusive: bool) -> f64 {
		match self {
			Recurrence::Interval { seconds } => {
				let period = *seconds as f64;
				let anchor = self.interval_anchor(reference);
				let steps = ((reference - anchor) / period).floor();
				let mut candidate = anchor + steps * period;
				if candidate < reference || (!inclusive && candidate <= reference) {
					candidate += period;
				}
				return candidate;
			}
			Recurrence::Daily { time } => {
				let date = to_local(reference).date_naive();
				let mut candidate = local_timestamp(date, *time);
				if candidate < reference || (!inclusive && candidate <= reference) {
					candidate = local_timestamp(date + Duration::days(1), *time);
				}
				return candidate;
			}
			Recurrence::Weekly { weekday, time } => {
				let local = to_local(reference);
				let ahead = (7 + weekday.num_days_from_monday() as i64
					- local.weekday().num_days_from_monday() as i64) % 7;
				let date = local.date_naive() + Duration::days(ahead);
				let mut candidate = local_timestamp(date, *time);
				if candidate < reference || (!inclusive && candidate <= reference) {
					candidate = local_timestamp(date + Duration::days(7), *time);
				}
				return candidate;
			}
		}
	}

	/// Most recent occurrence at or before `reference`.
	pub fn before(&self, reference: f64) -> f64 {
		match self {
			Recurrence::Interval { seconds } => {
				let period = *seconds as f64;
				let anchor = self.interval_anchor(reference);
				let steps = ((reference - anchor) / period).floor();
				return anchor + steps * period;
			}
			Recurrence::Daily { time } => {
				let date = to_local(reference).date_naive();
				let candidate = local_timestamp(date, *time);
				if candidate <= reference {
					return candidate;
				}
				return local_timestamp(date - Duration::days(1), *time);
			}
			Recurrence::Weekly { weekday, time } => {
				let local = to_local(reference);
				let behind = (7 + local.weekday().num_days_from_monday() as i64
					- weekday.num_days_from_monday() as i64) % 7;
				let date = local.date_naive() - Duration::days(behind);
				let candidate = local_timestamp(date, *time);
				if candidate <= reference {
					return candidate;
				}
				return local_timestamp(date - Duration::days(7), *time);
			}
		}
	}

	fn interval_anchor(&self, reference: f64) -> f64 {
		if let Recurrence::Interval { seconds } = self {
			if 86400 % seconds == 0 {
				let date = to_local(reference).date_naive();
				return local_timestamp(date, NaiveTime::MIN);
			}
		}
		return 0.0;
	}
}

fn unit_seconds(unit: &str) -> Option<i64> {
	return match unit.trim_end_matches('s') {
		"second" | "sec" => Some(1),
		"minute" | "min" => Some(60),
		"hour" => Some(3600),
		"day" => Some(86400),
		"week" => Some(7 * 86400),
		_ => None,
	};
}

fn parse_weekday(word: &str) -> Option<Weekday> {
	return match word.trim_end_matches('s') {
		"monday" | "mon" => Some(Weekday::Mon),
		"tuesday" | "tue" => Some(Weekday::Tue),
		"wednesday" | "wed" => Some(Weekday::Wed),
		"thursday" | "thu" => Some(Weekday::Thu),
		"friday" | "fri" => Some(Weekday::Fri),
		"saturday" | "sat" => Some(Weekday::Sat),
		"sunday" | "sun" => Some(Weekday::Sun),
		_ => None,
	};
}

/// `18:30`, `18:30:15`, `6pm`, `6:30am`
fn parse_time_of_day(raw: &str) -> Result<NaiveTime, RecurrenceError> {
	let invalid = || RecurrenceError::InvalidTime(String::from(raw));
	let (body, offset) = if let Some(body) = raw.strip_suffix("am") {
		(body, Some(0))
	} else if let Some(body) = raw.strip_suffix("pm") {
		(body, Some(12))
	} else {
		(raw, None)
	};

	let parts: Vec<&str> = body.split(':').collect();
	if parts.is_empty() || parts.len() > 3 {
		return Err(invalid());
	}
	let mut numbers = [0u32; 3];
	for (idx, part) in parts.iter().enumerate() {
		numbers[idx] = part.parse().map_err(|_| invalid())?;
	}
	if parts.len() == 1 && offset.is_none() {
		return Err(invalid());
	}

	let mut hour = numbers[0];
	if let Some(offset) = offset {
		if hour == 0 || hour > 12 {
			return Err(invalid());
		}
		hour = hour % 12 + offset;
	}
	return NaiveTime::from_hms_opt(hour, numbers[1], numbers[2]).ok_or_else(invalid);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::utilities::clock::from_datetime;
	use chrono::{Local, NaiveDate, TimeZone};

	fn at(h: u32, m: u32, s: u32) -> f64 {
		let dt = Local
			.from_local_datetime(&NaiveDate::from_ymd_opt(2024, 3, 13).unwrap().and_hms_opt(h, m, s).unwrap())
			.earliest()
			.unwrap();
		return from_datetime(&dt);
	}

	#[test]
	fn parses_rule_forms() {
		assert_eq!(Recurrence::parse("@every 5 minutes").unwrap(), Recurrence::Interval { seconds: 300 });
		assert_eq!(Recurrence::parse("every second").unwrap(), Recurrence::Interval { seconds: 1 });
		assert_eq!(
			Recurrence::parse("daily at 6pm").unwrap(),
			Recurrence::Daily { time: NaiveTime::from_hms_opt(18, 0, 0).unwrap() },
		);
		assert_eq!(
			Recurrence::parse("Every Friday at 21:15").unwrap(),
			Recurrence::Weekly {
				weekday: Weekday::Fri,
				time: NaiveTime::from_hms_opt(21, 15, 0).unwrap(),
			},
		);
		assert!(Recurrence::parse("whenever").is_err());
		assert_eq!(Recurrence::parse("every 0 minutes"), Err(RecurrenceError::ZeroInterval));
	}

	#[test]
	fn interval_neighbours() {
		let rule = Recurrence::parse("every 5 minutes").unwrap();
		let reference = at(10, 2, 30);
		assert_eq!(rule.after(reference, false), at(10, 5, 0));
		assert_eq!(rule.before(reference), at(10, 0, 0));
		assert_eq!(rule.after(at(10, 5, 0), true), at(10, 5, 0));
		assert_eq!(rule.after(at(10, 5, 0), false), at(10, 10, 0));
	}

	#[test]
	fn daily_neighbours() {
		let rule = Recurrence::parse("every day at 12:00").unwrap();
		assert_eq!(rule.after(at(10, 0, 0), false), at(12, 0, 0));
		assert!(rule.after(at(13, 0, 0), false) > at(23, 59, 59));
		assert_eq!(rule.before(at(13, 0, 0)), at(12, 0, 0));
		assert!(rule.before(at(11, 0, 0)) < at(0, 0, 0));
	}

	#[test]
	fn weekly_neighbours() {
		// 2024-03-13 is a Wednesday
		let rule = Recurrence::parse("every wednesday at 09:00").unwrap();
		assert_eq!(rule.before(at(10, 0, 0)), at(9, 0, 0));
		assert_eq!(rule.after(at(8, 0, 0), false), at(9, 0, 0));
		let next = rule.after(at(10, 0, 0), false);
		assert!(next - at(9, 0, 0) > 6.0 * 86400.0);
	}
}

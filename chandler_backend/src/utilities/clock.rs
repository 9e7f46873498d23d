use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// Wall-clock time as fractional seconds since the Unix epoch.
///
/// Cue timing is stored in this form so that it survives restarts (checkpoints)
/// and can be exchanged with peers over the sync channel.
pub fn now() -> f64 {
	return Utc::now().timestamp_micros() as f64 / 1_000_000.0;
}

pub fn to_local(ts: f64) -> DateTime<Local> {
	let micros = (ts * 1_000_000.0).round() as i64;
	return match Utc.timestamp_micros(micros).single() {
		Some(utc) => utc.with_timezone(&Local),
		None => Utc::now().with_timezone(&Local),
	};
}

pub fn from_datetime<Tz: TimeZone>(dt: &DateTime<Tz>) -> f64 {
	return dt.timestamp_micros() as f64 / 1_000_000.0;
}

/// Timestamp of a local wall-clock time on a given date.
///
/// Ambiguous times (DST fall-back) resolve to the earlier instant. Times that
/// don't exist (DST spring-forward) are pushed forward by an hour.
pub fn local_timestamp(date: NaiveDate, time: NaiveTime) -> f64 {
	let naive = date.and_time(time);
	if let Some(dt) = Local.from_local_datetime(&naive).earliest() {
		return from_datetime(&dt);
	}
	let shifted = naive + chrono::Duration::hours(1);
	return match Local.from_local_datetime(&shifted).earliest() {
		Some(dt) => from_datetime(&dt),
		None => from_datetime(&Utc.from_utc_datetime(&naive)),
	};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn local_round_trip() {
		let ts = 1_700_000_000.25;
		let local = to_local(ts);
		assert!((from_datetime(&local) - ts).abs() < 1e-6);
	}
}

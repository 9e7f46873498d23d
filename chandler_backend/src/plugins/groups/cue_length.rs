//! Effective cue duration, in beats.

use rand::Rng;
use tracing::{error, warn};

use super::cue::{Cue, CueValue};
use crate::mixer_utils::dynamic_blends::triangular;
use crate::plugins::media::MediaBackend;
use crate::utilities::expressions::VariableScope;
use crate::utilities::recurrence::Recurrence;

/// Used when media was supposed to set the length but could not be probed,
/// so the cue still ends eventually.
pub const MEDIA_FAILURE_LENGTH: f64 = 300.0;

/// Endless loops are treated as this many seconds
const ENDLESS: f64 = 2147483648.0;

/// Playback parameters of one media file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaTiming {
	pub duration: f64,
	pub loops: i64,
	pub start: f64,
	pub speed: f64,
	/// Seconds spent ramping up from 0.1x to `speed`
	pub wind_up: f64,
}

/// Wall-clock seconds the file takes to play with the given timing.
pub fn media_play_time(timing: &MediaTiming) -> f64 {
	let mut duration = timing.duration;
	if timing.loops > 1 {
		duration *= timing.loops as f64;
	}
	if timing.loops < 0 {
		duration = ENDLESS;
	}
	let speed = if timing.speed > 0.0 { timing.speed } else { 1.0 };

	duration -= timing.start;
	// Average speed during the ramp
	duration -= (0.1 + speed) / 2.0 * timing.wind_up;
	duration /= speed;
	duration += timing.wind_up;
	return duration;
}

/// Random length offset for a cue, triangular on `[-r, r]`
pub fn randomize_modifier<R: Rng + ?Sized>(rng: &mut R, length_randomize: f64) -> f64 {
	let spread = length_randomize.abs();
	return triangular(rng, -spread, spread, 0.0);
}

/// Randomization may never take a cue below a tenth of its nominal length.
pub fn floor_length(length: f64, randomize_modifier: f64) -> f64 {
	if length <= 0.0 || !length.is_finite() {
		return 0.0;
	}
	return (0.1 * length).max(randomize_modifier + length).max(0.0);
}

/// Nominal length before the floor: `@rule`s give the time until the next
/// occurrence, expressions are evaluated and media with `rel_length` uses
/// the file's playback time with the nominal length as an offset.
pub fn base_length(
	cue: &Cue,
	crossfade: f64,
	now: f64,
	scope: &dyn VariableScope,
	media: Option<&dyn MediaBackend>,
) -> Result<f64, String> {
	if let CueValue::Text(text) = &cue.length {
		if text.trim().starts_with('@') {
			let rule = Recurrence::parse(text).map_err(|e| e.to_string())?;
			let mut next = rule.after(now, true);
			if next <= now {
				next = rule.after(next, false);
			}
			return Ok(next - now);
		}
	}

	let nominal = cue.length.evaluate(scope).map_err(|e| e.to_string())?;
	if !cue.rel_length || (cue.sound.is_empty() && cue.slide.is_empty()) {
		return Ok(nominal);
	}
	let Some(media) = media else {
		return Err(String::from("no media backend to measure relative length"));
	};

	let mut length = nominal;
	if !cue.sound.is_empty() {
		if media.is_image(&cue.sound) {
			length = 0.0;
		} else {
			let timing = MediaTiming {
				duration: media.duration(&cue.sound).map_err(|e| e.to_string())?,
				loops: cue.sound_loops,
				start: cue.sound_start_position.evaluate(scope).map_err(|e| e.to_string())?,
				speed: cue.media_speed.evaluate(scope).map_err(|e| e.to_string())?,
				wind_up: cue.media_wind_up.evaluate(scope).map_err(|e| e.to_string())?,
			};
			length = media_play_time(&timing) - crossfade + nominal;
		}
	}
	if !cue.slide.is_empty() && !media.is_image(&cue.slide) {
		let duration = media.duration(&cue.slide).map_err(|e| e.to_string())?;
		// The longer of sound and video wins
		length = length.max(duration - crossfade + nominal);
	}
	return Ok(length);
}

/// Full cue length computation, logging failures.
pub fn compute_cue_len(
	cue: &Cue,
	randomize_modifier: f64,
	crossfade: f64,
	now: f64,
	scope: &dyn VariableScope,
	media: Option<&dyn MediaBackend>,
) -> f64 {
	return match base_length(cue, crossfade, now, scope, media) {
		Ok(length) => floor_length(length, randomize_modifier),
		Err(err) if cue.rel_length && !(cue.sound.is_empty() && cue.slide.is_empty()) => {
			error!(cue = %cue.name, error = %err, "Could not get media length");
			MEDIA_FAILURE_LENGTH
		}
		Err(err) => {
			warn!(cue = %cue.name, error = %err, "Bad cue length");
			0.0
		}
	};
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::plugins::media::{MediaCue, MediaError};
	use crate::utilities::expressions::NoVariables;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	struct FixedMedia(f64);

	impl MediaBackend for FixedMedia {
		fn duration(&self, path: &str) -> Result<f64, MediaError> {
			if path.contains("missing") {
				return Err(MediaError::NoDuration(String::from(path)));
			}
			return Ok(self.0);
		}

		fn transition(&self, _cue: &MediaCue) -> anyhow::Result<()> {
			return Ok(());
		}

		fn stop(&self, _group: &str) -> anyhow::Result<()> {
			return Ok(());
		}
	}

	#[test]
	fn randomized_length_never_drops_below_a_tenth() {
		let mut rng = StdRng::seed_from_u64(7);
		for length in [0.5, 1.0, 10.0, 120.0] {
			for spread in [0.0, 1.0, 50.0, 1000.0] {
				for _ in 0..200 {
					let modifier = randomize_modifier(&mut rng, spread);
					assert!(modifier.abs() <= spread);
					let len = floor_length(length, modifier);
					assert!(len >= 0.1 * length, "{len} < 0.1 * {length}");
				}
			}
		}
		assert_eq!(floor_length(0.0, 5.0), 0.0);
		assert_eq!(floor_length(-3.0, 5.0), 0.0);
	}

	#[test]
	fn media_play_time_math() {
		let plain = MediaTiming {
			duration: 100.0,
			loops: 0,
			start: 10.0,
			speed: 2.0,
			wind_up: 0.0,
		};
		assert_eq!(media_play_time(&plain), 45.0);

		let looped = MediaTiming { loops: 3, start: 0.0, speed: 1.0, ..plain };
		assert_eq!(media_play_time(&looped), 300.0);

		let wound = MediaTiming {
			duration: 10.0,
			loops: 0,
			start: 0.0,
			speed: 1.0,
			wind_up: 2.0,
		};
		// 10 - 0.55 * 2 + 2
		assert!((media_play_time(&wound) - 10.9).abs() < 1e-9);

		let endless = MediaTiming { loops: -1, ..wound };
		assert!(media_play_time(&endless) > 1e9);
	}

	#[test]
	fn relative_length_uses_media() {
		let mut cue = Cue::new("song", 1000).unwrap();
		cue.sound = String::from("song.ogg");
		cue.rel_length = true;
		cue.length = CueValue::Number(1.0);
		let media = FixedMedia(30.0);
		let len = compute_cue_len(&cue, 0.0, 2.0, 0.0, &NoVariables, Some(&media));
		assert_eq!(len, 29.0);

		cue.sound = String::from("cover.png");
		assert_eq!(compute_cue_len(&cue, 0.0, 0.0, 0.0, &NoVariables, Some(&media)), 0.0);

		cue.sound = String::from("missing.ogg");
		assert_eq!(
			compute_cue_len(&cue, 0.0, 0.0, 0.0, &NoVariables, Some(&media)),
			MEDIA_FAILURE_LENGTH
		);
	}

	#[test]
	fn scheduled_length_counts_down() {
		let mut cue = Cue::new("timer", 1000).unwrap();
		cue.length = CueValue::from("@every 10 seconds");
		let len = compute_cue_len(&cue, 0.0, 0.0, 1_000_003.0, &NoVariables, None);
		assert!(len > 0.0 && len <= 10.0, "{len}");
	}

	#[test]
	fn expression_length() {
		let mut cue = Cue::new("e", 1000).unwrap();
		cue.length = CueValue::from("=2*3");
		assert_eq!(compute_cue_len(&cue, 0.0, 0.0, 0.0, &NoVariables, None), 6.0);
	}
}

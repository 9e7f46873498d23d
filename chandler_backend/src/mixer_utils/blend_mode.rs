use std::collections::BTreeMap;

use rayon::prelude::*;
use thiserror::Error;
use tracing::warn;

use super::dynamic_blends::{FlickerBlend, GammaBlend, SparksBlend, VaryBlend};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlendError {
	#[error("Unknown blend mode {0:?}")]
	UnknownMode(String),

	#[error("Blend mode {mode} has no parameter named {name:?}")]
	UnknownParameter { mode: String, name: String },

	#[error("Invalid value {value} for blend parameter {name}")]
	InvalidValue { name: String, value: f64 },

	#[error("Layer for universe {universe} has {layer} channels, universe has {expected}")]
	LengthMismatch {
		universe: String,
		layer: usize,
		expected: usize,
	},
}

/// Describes one tunable argument of a blend mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendParameter {
	pub name: &'static str,
	pub label: &'static str,
	pub description: &'static str,
	pub default: f64,
}

/// The universe state a layer is being composited onto.
pub struct BlendTarget<'a> {
	pub universe: &'a str,
	pub values: &'a mut [f32],
	pub alphas: &'a mut [f32],
	pub hue_blend_mask: &'a [bool],
	/// `false` for devices that interpolate on their own
	pub local_fading: bool,
	/// Longest onboard interpolation time requested by any layer this frame
	pub interpolation_time: &'a mut f64,
}

/// One group's canvas output for a single universe.
#[derive(Clone, Copy)]
pub struct BlendLayer<'a> {
	pub values: &'a [f32],
	pub alphas: &'a [f32],
	pub group_alpha: f32,
	/// Frame timestamp, seconds
	pub now: f64,
}

impl BlendLayer<'_> {
	pub(crate) fn check_len(&self, target: &BlendTarget) -> Result<(), BlendError> {
		let expected = target.values.len();
		if self.values.len() != expected || self.alphas.len() != expected || target.alphas.len() != expected {
			return Err(BlendError::LengthMismatch {
				universe: String::from(target.universe),
				layer: self.values.len(),
				expected,
			});
		}
		return Ok(());
	}
}

/// Compositing behaviour of a group.
///
/// Implementations must validate before mutating `target`: on error the
/// universe is expected to be left as it was before this layer.
pub trait BlendMode: Send {
	fn name(&self) -> &str;

	/// Layer changes every frame even when the group's cue does not
	fn always_rerender(&self) -> bool {
		return false;
	}

	/// Monitor layers are never composited; they read values back instead
	fn is_monitor(&self) -> bool {
		return false;
	}

	fn parameters(&self) -> &'static [BlendParameter] {
		return &[];
	}

	fn set_arg(&mut self, name: &str, _value: f64) -> Result<(), BlendError> {
		return Err(BlendError::UnknownParameter {
			mode: String::from(self.name()),
			name: String::from(name),
		});
	}

	/// Current argument values, for persistence
	fn args(&self) -> BTreeMap<String, f64> {
		return BTreeMap::new();
	}

	/// Drops per-universe state. Called when the owning group stops.
	fn reset(&mut self) {}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError>;
}

/// Standard "over" compositing.
///
/// Hue-type channels that nothing below has touched are treated as fully
/// opaque, since they have no meaningful zero to fade from.
pub struct NormalBlend;

impl BlendMode for NormalBlend {
	fn name(&self) -> &str {
		return "normal";
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		let group_alpha = layer.group_alpha;
		let mask = target.hue_blend_mask;
		target
			.values
			.par_iter_mut()
			.zip(target.alphas.par_iter_mut())
			.enumerate()
			.for_each(|(i, (value, alpha))| {
				let unset_hue = *alpha == 0.0 && mask.get(i).copied().unwrap_or(false);
				let fade = if unset_hue { group_alpha.max(1.0) } else { group_alpha };
				let weight = layer.alphas[i] * fade;
				*value = *value * (1.0 - weight) + layer.values[i] * weight;
				*alpha = 1.0 - (1.0 - weight) * (1.0 - *alpha);
			});
		return Ok(());
	}
}

/// Highest takes precedence
pub struct HtpBlend;

impl BlendMode for HtpBlend {
	fn name(&self) -> &str {
		return "HTP";
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		extreme_blend(target, layer, f32::max);
		return Ok(());
	}
}

/// Lowest takes precedence: this layer can only limit what is below it
pub struct InhibitBlend;

impl BlendMode for InhibitBlend {
	fn name(&self) -> &str {
		return "inhibit";
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		extreme_blend(target, layer, f32::min);
		return Ok(());
	}
}

fn extreme_blend(target: &mut BlendTarget, layer: &BlendLayer, pick: fn(f32, f32) -> f32) {
	let group_alpha = layer.group_alpha;
	target
		.values
		.par_iter_mut()
		.zip(target.alphas.par_iter_mut())
		.enumerate()
		.for_each(|(i, (value, alpha))| {
			let weight = layer.alphas[i] * group_alpha;
			*value = pick(*value, layer.values[i] * weight);
			*alpha = presence(weight);
		});
}

/// Multiplicative filter, approximating a physical gel over the layers below.
pub struct GelBlend {
	name: &'static str,
}

impl BlendMode for GelBlend {
	fn name(&self) -> &str {
		return self.name;
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		let group_alpha = layer.group_alpha;
		if group_alpha <= 0.0 {
			return Ok(());
		}
		let divisor = 255.0 / group_alpha;
		target
			.values
			.par_iter_mut()
			.zip(target.alphas.par_iter_mut())
			.enumerate()
			.for_each(|(i, (value, alpha))| {
				let weight = layer.alphas[i] * group_alpha;
				*value = *value * (1.0 - weight) + (*value * layer.values[i]) / divisor;
				*alpha = presence(weight);
			});
		return Ok(());
	}
}

/// Copies what is below it back into the cue instead of painting.
pub struct MonitorBlend;

impl BlendMode for MonitorBlend {
	fn name(&self) -> &str {
		return "monitor";
	}

	fn is_monitor(&self) -> bool {
		return true;
	}

	fn frame(&mut self, _target: &mut BlendTarget, _layer: &BlendLayer) -> Result<(), BlendError> {
		return Ok(());
	}
}

/// Boolean presence used where the real alpha math is not worth it
#[inline]
pub(crate) fn presence(weight: f32) -> f32 {
	return if weight > 0.0 { 1.0 } else { 0.0 };
}

pub const BLEND_MODE_NAMES: &[&str] = &[
	"normal", "HTP", "inhibit", "gel", "multiply", "monitor", "flicker", "vary", "sparks", "gamma",
];

/// Builds a blend mode by name and applies saved arguments.
///
/// Arguments the mode doesn't know are logged and skipped.
pub fn create_blend_mode(name: &str, args: &BTreeMap<String, f64>) -> Result<Box<dyn BlendMode>, BlendError> {
	let mut mode: Box<dyn BlendMode> = match name {
		"normal" | "" => Box::new(NormalBlend),
		"HTP" | "htp" => Box::new(HtpBlend),
		"inhibit" => Box::new(InhibitBlend),
		"gel" => Box::new(GelBlend { name: "gel" }),
		"multiply" => Box::new(GelBlend { name: "multiply" }),
		"monitor" => Box::new(MonitorBlend),
		"flicker" => Box::new(FlickerBlend::default()),
		"vary" => Box::new(VaryBlend::default()),
		"sparks" => Box::new(SparksBlend::default()),
		"gamma" => Box::new(GammaBlend),
		other => return Err(BlendError::UnknownMode(String::from(other))),
	};
	for (key, value) in args {
		if let Err(err) = mode.set_arg(key, *value) {
			warn!(blend = name, error = %err, "Ignoring saved blend argument");
		}
	}
	return Ok(mode);
}

#[cfg(test)]
mod tests {
	use super::*;

	struct Scratch {
		values: Vec<f32>,
		alphas: Vec<f32>,
		mask: Vec<bool>,
		interpolation: f64,
	}

	impl Scratch {
		fn new(values: &[f32], alphas: &[f32]) -> Self {
			return Scratch {
				values: values.to_vec(),
				alphas: alphas.to_vec(),
				mask: vec![false; values.len()],
				interpolation: 0.0,
			};
		}

		fn apply(&mut self, mode: &mut dyn BlendMode, values: &[f32], alphas: &[f32], group_alpha: f32) -> Result<(), BlendError> {
			let mut target = BlendTarget {
				universe: "u1",
				values: &mut self.values,
				alphas: &mut self.alphas,
				hue_blend_mask: &self.mask,
				local_fading: true,
				interpolation_time: &mut self.interpolation,
			};
			let layer = BlendLayer {
				values,
				alphas,
				group_alpha,
				now: 0.0,
			};
			return mode.frame(&mut target, &layer);
		}
	}

	#[test]
	fn normal_composites_over() {
		let mut u = Scratch::new(&[100.0, 100.0, 0.0], &[1.0, 1.0, 0.0]);
		u.apply(&mut NormalBlend, &[200.0, 200.0, 50.0], &[1.0, 0.0, 1.0], 0.5).unwrap();
		assert_eq!(u.values, vec![150.0, 100.0, 25.0]);
		assert_eq!(u.alphas, vec![1.0, 1.0, 0.5]);
	}

	#[test]
	fn normal_treats_unset_hue_as_opaque() {
		let mut u = Scratch::new(&[0.0, 0.0], &[0.0, 1.0]);
		u.mask = vec![true, true];
		u.apply(&mut NormalBlend, &[180.0, 180.0], &[1.0, 1.0], 0.25).unwrap();
		assert_eq!(u.values[0], 180.0);
		assert_eq!(u.values[1], 45.0);
	}

	#[test]
	fn htp_and_inhibit() {
		let mut u = Scratch::new(&[100.0, 10.0], &[1.0, 1.0]);
		u.apply(&mut HtpBlend, &[50.0, 50.0], &[1.0, 1.0], 1.0).unwrap();
		assert_eq!(u.values, vec![100.0, 50.0]);
		assert_eq!(u.alphas, vec![1.0, 1.0]);

		u.apply(&mut InhibitBlend, &[80.0, 80.0], &[1.0, 0.0], 1.0).unwrap();
		assert_eq!(u.values, vec![80.0, 0.0]);
		assert_eq!(u.alphas, vec![1.0, 0.0]);
	}

	#[test]
	fn gel_filters_and_skips_zero_alpha() {
		let mut u = Scratch::new(&[200.0], &[1.0]);
		let mut gel = GelBlend { name: "gel" };
		u.apply(&mut gel, &[127.5], &[1.0], 0.0).unwrap();
		assert_eq!(u.values, vec![200.0]);
		u.apply(&mut gel, &[127.5], &[1.0], 1.0).unwrap();
		assert_eq!(u.values, vec![100.0]);
	}

	#[test]
	fn length_mismatch_leaves_target_alone() {
		let mut u = Scratch::new(&[1.0, 2.0], &[1.0, 1.0]);
		let err = u.apply(&mut NormalBlend, &[9.0], &[1.0], 1.0).unwrap_err();
		assert!(matches!(err, BlendError::LengthMismatch { .. }));
		assert_eq!(u.values, vec![1.0, 2.0]);
	}

	#[test]
	fn factory_applies_known_args() {
		let mut args = BTreeMap::new();
		args.insert(String::from("gustiness"), 0.5);
		args.insert(String::from("bogus"), 1.0);
		let mode = create_blend_mode("flicker", &args).unwrap();
		assert_eq!(mode.args().get("gustiness"), Some(&0.5));
		assert!(!mode.args().contains_key("bogus"));
		assert!(create_blend_mode("sideways", &BTreeMap::new()).is_err());
		assert!(create_blend_mode("monitor", &BTreeMap::new()).unwrap().is_monitor());
	}
}

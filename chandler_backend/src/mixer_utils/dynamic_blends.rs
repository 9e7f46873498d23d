//! Stateful effect layers. Each keeps per-universe simulation state and
//! changes every frame, so all of them except gamma always re-render.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;

use super::blend_mode::{presence, BlendError, BlendLayer, BlendMode, BlendParameter, BlendTarget};

/// Samples a triangular distribution over `[low, high]` peaking at `mode`.
pub fn triangular<R: Rng + ?Sized>(rng: &mut R, low: f64, high: f64, mode: f64) -> f64 {
	if high <= low {
		return low;
	}
	let mode = mode.clamp(low, high);
	let u: f64 = rng.gen();
	let split = (mode - low) / (high - low);
	if u < split {
		return low + ((high - low) * (mode - low) * u).sqrt();
	}
	return high - ((high - low) * (high - mode) * (1.0 - u)).sqrt();
}

/// Box-Muller normal sample
pub fn normal<R: Rng + ?Sized>(rng: &mut R, mean: f64, sd: f64) -> f64 {
	let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
	let u2: f64 = rng.gen();
	return mean + sd * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
}

fn set_param(
	mode: &str,
	params: &'static [BlendParameter],
	values: &mut [f64],
	name: &str,
	value: f64,
) -> Result<(), BlendError> {
	let idx = params.iter().position(|p| p.name == name).ok_or_else(|| BlendError::UnknownParameter {
		mode: String::from(mode),
		name: String::from(name),
	})?;
	if !value.is_finite() {
		return Err(BlendError::InvalidValue {
			name: String::from(name),
			value,
		});
	}
	values[idx] = value;
	return Ok(());
}

fn param_map(params: &'static [BlendParameter], values: &[f64]) -> BTreeMap<String, f64> {
	return params.iter().zip(values).map(|(p, v)| (String::from(p.name), *v)).collect();
}

fn defaults<const N: usize>(params: &'static [BlendParameter]) -> [f64; N] {
	let mut out = [0.0; N];
	for (slot, param) in out.iter_mut().zip(params) {
		*slot = param.default;
	}
	return out;
}

/// Elapsed time in 60ths of a second, treating the first frame as one tick
fn ticks_since(last: Option<f64>, now: f64) -> f64 {
	return match last {
		Some(last) => ((now - last) * 60.0).max(0.0),
		None => 1.0,
	};
}

const FLICKER_PARAMS: &[BlendParameter] = &[
	BlendParameter {
		name: "gustiness",
		label: "Gustiness",
		description: "",
		default: 0.2,
	},
	BlendParameter {
		name: "lowpass",
		label: "Lowpass",
		description: "",
		default: 0.06,
	},
	BlendParameter {
		name: "topple_chance",
		label: "Windiness",
		description: "",
		default: 0.1,
	},
	BlendParameter {
		name: "agility",
		label: "Flame agility",
		description: "",
		default: 0.15,
	},
	BlendParameter {
		name: "group",
		label: "Group",
		description: "Groups of this many channels flicker together, e.g. to make RGB look right",
		default: 3.0,
	},
];

struct FlickerUniverse {
	heights: Vec<f32>,
	heights_lp: Vec<f32>,
	last: f64,
}

/// Flame simulation. Channel value sets how much the channels below are darkened.
pub struct FlickerBlend {
	args: [f64; 5],
	wind: f64,
	riserate: f64,
	last: Option<f64>,
	universes: FxHashMap<String, FlickerUniverse>,
	rng: StdRng,
}

impl Default for FlickerBlend {
	fn default() -> Self {
		return FlickerBlend {
			args: defaults(FLICKER_PARAMS),
			wind: 1.0,
			riserate: 0.04,
			last: None,
			universes: FxHashMap::default(),
			rng: StdRng::from_entropy(),
		};
	}
}

impl BlendMode for FlickerBlend {
	fn name(&self) -> &str {
		return "flicker";
	}

	fn always_rerender(&self) -> bool {
		return true;
	}

	fn parameters(&self) -> &'static [BlendParameter] {
		return FLICKER_PARAMS;
	}

	fn set_arg(&mut self, name: &str, value: f64) -> Result<(), BlendError> {
		return set_param("flicker", FLICKER_PARAMS, &mut self.args, name, value);
	}

	fn args(&self) -> BTreeMap<String, f64> {
		return param_map(FLICKER_PARAMS, &self.args);
	}

	fn reset(&mut self) {
		self.universes.clear();
		self.last = None;
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		let [gustiness, lowpass, topple_chance, agility, group] = self.args;
		let group = group.max(1.0) as usize;
		let now = layer.now;
		let count = target.values.len();

		*target.interpolation_time = target.interpolation_time.max(0.2);

		let t60 = ticks_since(self.last, now);
		self.last = Some(now);
		let lp = (t60 * 0.05).min(1.0);
		self.wind = lp + self.wind * (1.0 - lp);
		if self.rng.gen::<f64>() < gustiness * t60 {
			self.wind = normal(&mut self.rng, 1.3, 1.0).max(1.2);
		}
		if self.rng.gen::<f64>() < 0.08 {
			self.riserate = normal(&mut self.rng, agility, agility / 4.0).max(0.0);
		}

		let state = self
			.universes
			.entry(String::from(target.universe))
			.or_insert_with(|| FlickerUniverse {
				heights: vec![1.0; count],
				heights_lp: vec![1.0; count],
				last: now - 1.0 / 60.0,
			});
		let t60 = ((now - state.last) * 60.0).max(0.0);
		state.last = now;

		let mut ctr = 0usize;
		let mut last_k = 0usize;
		let (mut t, mut nv, mut lp, mut rise) = (0.0, 0.0, 0.0, 0.0);
		for k in 0..count {
			if layer.values[k] == 0.0 {
				continue;
			}
			// Channels in runs of `group` share one simulation, a gap starts a new run
			if ctr % group == 0 || k - last_k > 1 {
				t = self.rng.gen::<f64>();
				ctr = 0;
				nv = triangular(&mut self.rng, 0.0, 1.0, 0.35);
				lp = t60 * triangular(&mut self.rng, 0.0, lowpass, lowpass / 2.0);
				rise = self.rng.gen::<f64>() * self.riserate * t60;
			}
			ctr += 1;
			last_k = k;

			let value = f64::from(layer.values[k]);
			let height = f64::from(state.heights[k]);
			let height = if t < topple_chance * self.wind * t60 {
				(1.0 - nv * (value / 255.0)).min(height + 0.1)
			} else if height < 1.0 && value > 0.0 {
				height + rise * t60
			} else {
				1.0
			};
			state.heights[k] = height.max(0.0) as f32;

			let f = (lp * t60).min(1.0) as f32;
			state.heights_lp[k] = state.heights_lp[k] * (1.0 - f) + state.heights[k] * f;
		}

		for k in 0..count {
			let weight = layer.alphas[k] * layer.group_alpha;
			target.values[k] *= weight * state.heights_lp[k].min(1.0) + 1.0 - weight;
			target.alphas[k] = presence(weight);
		}
		return Ok(());
	}
}

const VARY_PARAMS: &[BlendParameter] = &[
	BlendParameter {
		name: "interval",
		label: "Change Interval",
		description: "How many seconds between changes",
		default: 1.2,
	},
	BlendParameter {
		name: "rinterval",
		label: "Randomize Interval",
		description: "Amount to randomly vary change interval",
		default: 0.5,
	},
	BlendParameter {
		name: "speed",
		label: "Speed",
		description: "How fast to change",
		default: 0.015,
	},
	BlendParameter {
		name: "mode",
		label: "Mode",
		description: "Mode value for the triangular distribution that defines the random values",
		default: 0.8,
	},
];

struct VaryUniverse {
	vals: Vec<f32>,
	vals_lp: Vec<f32>,
	next_change: f64,
	last: f64,
}

/// Random time-varying gel.
pub struct VaryBlend {
	args: [f64; 4],
	universes: FxHashMap<String, VaryUniverse>,
	rng: StdRng,
}

impl Default for VaryBlend {
	fn default() -> Self {
		return VaryBlend {
			args: defaults(VARY_PARAMS),
			universes: FxHashMap::default(),
			rng: StdRng::from_entropy(),
		};
	}
}

impl BlendMode for VaryBlend {
	fn name(&self) -> &str {
		return "vary";
	}

	fn always_rerender(&self) -> bool {
		return true;
	}

	fn parameters(&self) -> &'static [BlendParameter] {
		return VARY_PARAMS;
	}

	fn set_arg(&mut self, name: &str, value: f64) -> Result<(), BlendError> {
		return set_param("vary", VARY_PARAMS, &mut self.args, name, value);
	}

	fn args(&self) -> BTreeMap<String, f64> {
		return param_map(VARY_PARAMS, &self.args);
	}

	fn reset(&mut self) {
		self.universes.clear();
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		let [interval, rinterval, speed, mode] = self.args;
		let now = layer.now;
		let count = target.values.len();

		let state = self
			.universes
			.entry(String::from(target.universe))
			.or_insert_with(|| VaryUniverse {
				vals: vec![0.0; count],
				vals_lp: vec![0.0; count],
				next_change: 0.0,
				last: now - 1.0 / 60.0,
			});
		let t60 = ((now - state.last) * 60.0).max(0.0);
		state.last = now;

		if now > state.next_change {
			let peak = (1.0 - mode).clamp(0.0, 1.0);
			for k in 0..count {
				let nv = triangular(&mut self.rng, 0.0, 1.0, peak) as f32;
				state.vals[k] = 1.0 - nv * (layer.values[k] / 255.0);
			}
			state.next_change = now + triangular(&mut self.rng, interval - rinterval, interval + rinterval, interval);
		}

		let mut lp = (t60 * speed).min(1.0);
		if !target.local_fading {
			lp = 1.0;
			if speed > 0.0 {
				*target.interpolation_time = target.interpolation_time.max((1.0 / 60.0) / speed);
			}
		}
		let lp = lp as f32;

		let alpha = layer.group_alpha;
		for k in 0..count {
			state.vals_lp[k] = state.vals_lp[k] * (1.0 - lp) + state.vals[k] * lp;
			target.values[k] *= (alpha * state.vals_lp[k] + 1.0 - alpha).min(255.0);
			target.alphas[k] = presence(layer.alphas[k] * alpha);
		}
		return Ok(());
	}
}

/// Per-channel gamma curve, channel value 100 is identity.
pub struct GammaBlend;

impl BlendMode for GammaBlend {
	fn name(&self) -> &str {
		return "gamma";
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		for k in 0..target.values.len() {
			let exponent = layer.values[k] / 100.0;
			let below = target.values[k].max(0.0);
			let curved = (below.powf(exponent) / 255f32.powf(exponent)) * 255.0;
			let weight = layer.alphas[k] * layer.group_alpha;
			target.values[k] = curved * weight + below * (1.0 - weight);
			target.alphas[k] = presence(weight);
		}
		return Ok(());
	}
}

const SPARKS_PARAMS: &[BlendParameter] = &[
	BlendParameter {
		name: "fadetime",
		label: "Fade Time",
		description: "How fast to fade out again.",
		default: 1.0,
	},
	BlendParameter {
		name: "interval",
		label: "Interval",
		description: "How often to do a spark",
		default: 3.0,
	},
	BlendParameter {
		name: "variation",
		label: "Variation",
		description: "How much to vary the spark intensity",
		default: 0.3,
	},
	BlendParameter {
		name: "group",
		label: "Group",
		description: "Detect groups of channels to connect, e.g. to make RGB look right",
		default: 3.0,
	},
];

struct SparksUniverse {
	levels: Vec<f32>,
	spark_times: Vec<f64>,
	last: f64,
}

/// Randomly jumps channels up to this layer's value, then decays back.
pub struct SparksBlend {
	args: [f64; 4],
	universes: FxHashMap<String, SparksUniverse>,
	rng: StdRng,
}

impl Default for SparksBlend {
	fn default() -> Self {
		return SparksBlend {
			args: defaults(SPARKS_PARAMS),
			universes: FxHashMap::default(),
			rng: StdRng::from_entropy(),
		};
	}
}

impl BlendMode for SparksBlend {
	fn name(&self) -> &str {
		return "sparks";
	}

	fn always_rerender(&self) -> bool {
		return true;
	}

	fn parameters(&self) -> &'static [BlendParameter] {
		return SPARKS_PARAMS;
	}

	fn set_arg(&mut self, name: &str, value: f64) -> Result<(), BlendError> {
		if name == "fadetime" && value <= 0.0 {
			return Err(BlendError::InvalidValue {
				name: String::from(name),
				value,
			});
		}
		return set_param("sparks", SPARKS_PARAMS, &mut self.args, name, value);
	}

	fn args(&self) -> BTreeMap<String, f64> {
		return param_map(SPARKS_PARAMS, &self.args);
	}

	fn reset(&mut self) {
		self.universes.clear();
	}

	fn frame(&mut self, target: &mut BlendTarget, layer: &BlendLayer) -> Result<(), BlendError> {
		layer.check_len(target)?;
		let [fadetime, interval, variation, group] = self.args;
		let group = group.max(1.0) as usize;
		let now = layer.now;
		let count = target.values.len();

		let state = self
			.universes
			.entry(String::from(target.universe))
			.or_insert_with(|| SparksUniverse {
				levels: vec![0.0; count],
				spark_times: vec![0.0; count],
				last: now - 1.0 / 60.0,
			});

		let mut ctr = 0usize;
		let mut last_k = 0usize;
		let mut sparking = false;
		let mut nv = 1.0f32;
		for k in 0..count {
			if layer.alphas[k] == 0.0 {
				continue;
			}
			if ctr % group == 0 || k - last_k > 1 {
				ctr = 0;
				nv = triangular(&mut self.rng, 1.0 - variation, 1.0, 1.0 - variation / 2.0) as f32;
				if now > state.spark_times[k] {
					sparking = true;
					let earliest = (interval / 3.0).max(0.35);
					let latest = (interval * 2.0).max(earliest + f64::EPSILON);
					state.spark_times[k] = now + self.rng.gen_range(earliest..latest);
				} else {
					sparking = false;
				}
			}
			if sparking {
				state.levels[k] = state.levels[k].max(nv);
			}
			ctr += 1;
			last_k = k;
		}

		let elapsed = (now - state.last).max(0.0);
		state.last = now;
		let decay = (-elapsed / fadetime).exp() as f32;

		for k in 0..count {
			state.levels[k] *= decay;
			let weight = state.levels[k] * layer.group_alpha * layer.alphas[k];
			target.values[k] = layer.values[k] * weight + target.values[k] * (1.0 - weight);
			target.alphas[k] = presence(layer.alphas[k] * layer.group_alpha);
		}
		return Ok(());
	}
}

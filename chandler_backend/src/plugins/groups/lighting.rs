//! Turns a group's sparse cue values into dense per-universe layers and
//! fades between them.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use tracing::warn;

use super::cue::{Cue, CueValue};
use crate::mixer_utils::blend_mode::{BlendError, BlendLayer, BlendMode, NormalBlend};
use crate::mixer_utils::fade_canvas::FadeCanvas;
use crate::mixer_utils::state::LayerData;
use crate::plugins::universes::universe::Universe;
use crate::plugins::universes::UniverseArena;
use crate::utilities::expressions::VariableScope;

const LENGTH_KEY: &str = "__length__";
const SPACING_KEY: &str = "__spacing__";
const DEST_PREFIX: &str = "__dest__.";

/// Quadratic ease-in-out on 0..=1
pub fn ease(x: f64) -> f64 {
	let x = x.clamp(0.0, 1.0);
	if x < 0.5 {
		return 2.0 * x * x;
	}
	return 1.0 - (-2.0 * x + 2.0).powi(2) / 2.0;
}

pub struct LightingManager {
	/// Universes this group paints onto right now
	affect: Vec<String>,
	canvas: FadeCanvas,
	/// Dense target state of the current cue, after tracking
	state: FxHashMap<String, LayerData>,
	/// Cue whose values are loaded into `state`
	cue: Option<String>,
	fade_in_completed: bool,
	/// Composite this group again on the next frame
	pub should_rerender: bool,
	/// State depends on expressions that may change between frames
	pub rerender_on_var_change: bool,
	blend: Box<dyn BlendMode>,
}

impl Default for LightingManager {
	fn default() -> Self {
		return LightingManager::new(Box::new(NormalBlend));
	}
}

impl LightingManager {
	pub fn new(blend: Box<dyn BlendMode>) -> Self {
		return LightingManager {
			affect: Vec::new(),
			canvas: FadeCanvas::new(),
			state: FxHashMap::default(),
			cue: None,
			fade_in_completed: true,
			should_rerender: false,
			rerender_on_var_change: false,
			blend,
		};
	}

	pub fn affect(&self) -> &[String] {
		return &self.affect;
	}

	pub fn canvas(&self) -> &FadeCanvas {
		return &self.canvas;
	}

	pub fn state(&self) -> &FxHashMap<String, LayerData> {
		return &self.state;
	}

	pub fn current_cue(&self) -> Option<&str> {
		return self.cue.as_deref();
	}

	pub fn fade_in_completed(&self) -> bool {
		return self.fade_in_completed;
	}

	pub fn blend(&self) -> &dyn BlendMode {
		return self.blend.as_ref();
	}

	pub fn blend_mut(&mut self) -> &mut dyn BlendMode {
		return self.blend.as_mut();
	}

	pub fn set_blend(&mut self, blend: Box<dyn BlendMode>) {
		self.blend = blend;
		self.should_rerender = true;
	}

	pub fn set_blend_arg(&mut self, name: &str, value: f64) -> Result<(), BlendError> {
		self.blend.set_arg(name, value)?;
		self.should_rerender = true;
		return Ok(());
	}

	pub fn rerender(&mut self) {
		self.should_rerender = true;
	}

	/// Flags every affected universe for a full recomposite.
	pub fn refresh(&self, arena: &mut UniverseArena) {
		for universe in &self.affect {
			arena.request_rerender(universe);
		}
	}

	/// Loads `cue`, replaying `ancestors` (oldest first) before it.
	///
	/// The canvas keeps whatever was showing as the background of the new fade.
	pub fn next(&mut self, cue: &Cue, ancestors: &[&Cue], arena: &mut UniverseArena, scope: &dyn VariableScope) {
		self.canvas.save();
		// Universes we stop touching must be recomposited without us
		self.refresh(arena);

		let same_cue = self.cue.as_deref() == Some(cue.name.as_str());
		if !same_cue {
			for ancestor in ancestors {
				self.update_state_from_cue_vals(ancestor, false, arena, scope);
			}
		}

		// Old universes stay affected until the fade completes
		for reference in cue.values.keys() {
			if let Some(universe) = arena.map_universe(reference) {
				if arena.contains(&universe) && !self.affect.contains(&universe) {
					self.affect.push(universe);
				}
			}
		}

		self.update_state_from_cue_vals(cue, !cue.track, arena, scope);
		self.cue = Some(cue.name.clone());
		self.fade_in_completed = false;
	}

	/// Evaluates `cue`'s sparse values into the dense state.
	///
	/// `__length__` repeats a fixture's pattern over a row of identical
	/// fixtures, `__spacing__` overrides the stride between them and
	/// `__dest__.<channel>` gives the value at the last repeat, with the
	/// ones in between interpolated linearly.
	pub fn update_state_from_cue_vals(
		&mut self,
		cue: &Cue,
		clear_before: bool,
		arena: &UniverseArena,
		scope: &dyn VariableScope,
	) {
		if clear_before {
			self.state.clear();
		}
		self.rerender_on_var_change = false;

		for (reference, channels) in &cue.values {
			let Some(universe) = arena.map_universe(reference) else {
				continue;
			};
			let Some(count) = arena.get(&universe).map(|u| u.count()) else {
				continue;
			};

			let mut stride = arena.fixture_len(reference);
			let mut repeats = 1usize;
			if let Some(raw) = channels.get(LENGTH_KEY) {
				match raw.evaluate(scope) {
					// Every repeat past the last channel would land off the end
					Ok(n) if n >= 1.0 => repeats = (n as usize).min(count),
					Ok(_) => {}
					Err(err) => warn!(cue = %cue.name, universe = %reference, error = %err, "Bad __length__"),
				}
			}
			if let Some(raw) = channels.get(SPACING_KEY) {
				match raw.evaluate(scope) {
					Ok(n) if n >= 0.0 => stride = n as usize,
					Ok(_) => {}
					Err(err) => warn!(cue = %cue.name, universe = %reference, error = %err, "Bad __spacing__"),
				}
			}

			self.state
				.entry(universe.clone())
				.or_insert_with(|| LayerData::zeroed(count));
			if !self.affect.contains(&universe) {
				self.affect.push(universe.clone());
			}

			let mut dest: BTreeMap<&str, f64> = BTreeMap::new();
			for (channel, raw) in channels {
				if let Some(target) = channel.strip_prefix(DEST_PREFIX) {
					match raw.evaluate(scope) {
						Ok(value) => {
							dest.insert(target, value);
						}
						Err(err) => warn!(cue = %cue.name, channel = %channel, error = %err, "Bad gradient endpoint"),
					}
				}
			}

			for idx in 0..repeats {
				for (channel, raw) in channels {
					if channel.starts_with("__") {
						continue;
					}
					if raw.is_expression() {
						self.rerender_on_var_change = true;
					}
					let mut value = match raw.evaluate(scope) {
						Ok(value) => value,
						Err(err) => {
							warn!(cue = %cue.name, universe = %reference, channel = %channel, error = %err, "Could not evaluate cue value");
							continue;
						}
					};
					if let Some(end) = dest.get(channel.as_str()) {
						let divider = idx as f64 / (repeats.saturating_sub(1).max(1)) as f64;
						value = value * (1.0 - divider) + end * divider;
					}

					let Some((mapped, slot)) = arena.map_channel(reference, channel) else {
						continue;
					};
					let slot = slot + idx * stride;
					let Some(layer) = self.state.get_mut(&mapped) else {
						continue;
					};
					if slot >= layer.len() {
						warn!(cue = %cue.name, universe = %mapped, slot, "Cue value past the end of the universe");
						continue;
					}
					layer.values[slot] = value as f32;
					layer.alphas[slot] = if raw.is_null() { 0.0 } else { 1.0 };
				}
			}
		}
	}

	/// Applies one edited channel without recomputing the whole cue.
	pub fn set_channel(&mut self, universe: &str, count: usize, slot: usize, value: Option<f32>) {
		if value.is_none() && !self.state.contains_key(universe) {
			return;
		}
		let layer = self
			.state
			.entry(String::from(universe))
			.or_insert_with(|| LayerData::zeroed(count));
		if slot >= layer.len() {
			return;
		}
		layer.values[slot] = value.unwrap_or(0.0);
		layer.alphas[slot] = if value.is_some() { 1.0 } else { 0.0 };
		if !self.affect.iter().any(|u| u == universe) {
			self.affect.push(String::from(universe));
		}
		self.should_rerender = true;
	}

	/// Paints the canvas at `fade` (already eased). Completes the fade at 1.
	pub fn paint_canvas(&mut self, fade: f64, arena: &UniverseArena) {
		self.canvas.paint(fade as f32, &self.state, &|u: &str| {
			return arena.get(u).map(|u| u.local_fading()).unwrap_or(true);
		});
		if fade >= 1.0 {
			self.fade_complete(arena);
		}
	}

	/// Blends the painted layer for `universe` onto it. `Ok(false)` if the
	/// canvas has nothing for that universe yet.
	pub fn blend_onto(&mut self, universe: &mut Universe, group_alpha: f32, now: f64) -> Result<bool, BlendError> {
		let Some(layer) = self.canvas.layer(universe.name()) else {
			return Ok(false);
		};
		let mut target = universe.blend_target();
		self.blend.frame(
			&mut target,
			&BlendLayer {
				values: &layer.values,
				alphas: &layer.alphas,
				group_alpha,
				now,
			},
		)?;
		return Ok(true);
	}

	/// Stops affecting universes the current state no longer covers.
	pub fn fade_complete(&mut self, arena: &UniverseArena) {
		self.affect = self
			.state
			.keys()
			.filter(|u| arena.contains(u))
			.cloned()
			.collect();
		self.affect.sort();
		self.canvas.clean(&self.state);
		self.fade_in_completed = true;
		// One more pass so the cache sees the settled layer
		self.should_rerender = true;
	}

	/// Forgets the loaded cue so the next `next()` rebuilds the state from scratch.
	/// The canvas is kept, so nothing visibly jumps.
	pub fn reset_state(&mut self) {
		self.state.clear();
		self.cue = None;
	}

	/// Unwinds everything: the group no longer paints anywhere.
	pub fn stop(&mut self, arena: &mut UniverseArena) {
		self.refresh(arena);
		self.affect.clear();
		self.state.clear();
		self.canvas.clear();
		self.cue = None;
		self.fade_in_completed = true;
		self.should_rerender = false;
		self.blend.reset();
	}

	/// Monitor groups read the composited output back into their cue.
	pub fn update_monitor_values(&self, cue: &mut Cue, arena: &UniverseArena) {
		for (reference, channels) in cue.values.iter_mut() {
			for (channel, value) in channels.iter_mut() {
				let Some((universe, slot)) = arena.map_channel(reference, channel) else {
					continue;
				};
				if let Some(current) = arena.get(&universe).and_then(|u| u.values.get(slot)) {
					*value = CueValue::Number(*current as f64);
				}
			}
		}
	}
}

//! Frame compositor.
//!
//! Each frame runs three phases over the active groups, lowest layer key
//! first:
//!
//! 1. `pre_render` decides per universe whether it can resume from its
//!    cached layer or must be recomposited from zero.
//! 2. `composite` blends every group above a universe's top layer onto it,
//!    and moves the cache boundary to just below the lowest layer that keeps
//!    changing.
//! 3. `do_output` runs fixture post-processing and hands changed universes
//!    to their output backends.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::trace;
use uuid::Uuid;

use crate::plugins::board::Board;
use crate::plugins::core::log_error_limited;
use crate::plugins::universes::UniverseArena;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Reset {
	/// A layer at or below the cache changed: start from zero
	Full,
	/// Resume from the cached layer
	ToCache,
}

/// Renders one frame. Returns the number of universes sent to their outputs.
pub fn render_frame(board: &mut Board, arena: &mut UniverseArena, now: f64) -> usize {
	let mut changed = pre_render(board, arena);
	composite(board, arena, now, &mut changed);
	return do_output(arena, &changed);
}

fn is_internal(universe: &str) -> bool {
	return universe.starts_with("__") && universe.ends_with("__");
}

fn pre_render(board: &Board, arena: &mut UniverseArena) -> FxHashSet<String> {
	let mut to_reset: FxHashMap<String, Reset> = FxHashMap::default();

	for id in board.active_ids() {
		let Some(group) = board.group(*id) else {
			continue;
		};
		let key = group.layer_key();
		let wants_rerender = group.lighting.should_rerender || group.lighting.blend().always_rerender();
		for name in group.lighting.affect() {
			let Some(universe) = arena.get_mut(name) else {
				continue;
			};
			universe.all_static = true;
			if !wants_rerender || group.is_monitor() {
				continue;
			}
			let reset = if key <= universe.prerendered_layer { Reset::Full } else { Reset::ToCache };
			to_reset
				.entry(name.clone())
				.and_modify(|r| *r = (*r).min(reset))
				.or_insert(reset);
		}
	}

	for (name, universe) in arena.iter_mut() {
		if universe.full_rerender {
			to_reset.insert(name.clone(), Reset::Full);
		}
		universe.fade_end_time = 0.0;
		universe.interpolation_time = 0.0;
	}

	let mut changed = FxHashSet::default();
	for (name, reset) in to_reset {
		let Some(universe) = arena.get_mut(&name) else {
			continue;
		};
		if reset == Reset::Full || universe.prerendered_layer.is_empty() {
			universe.reset();
		} else {
			universe.reset_to_cache();
		}
		changed.insert(name);
	}
	return changed;
}

fn composite(board: &mut Board, arena: &mut UniverseArena, now: f64, changed: &mut FxHashSet<String>) {
	let ids: Vec<Uuid> = board.active_ids().to_vec();
	let topmost = ids.last().copied();

	for id in ids {
		let Some(group) = board.group_mut(id) else {
			continue;
		};
		if group.is_monitor() {
			group.update_monitor_values(arena);
			continue;
		}

		let key = group.layer_key();
		let alpha = group.alpha() as f32;
		let keeps_changing = group.lighting.should_rerender
			|| group.lighting.blend().always_rerender()
			|| !group.lighting.fade_in_completed();
		let is_top = topmost == Some(id);
		let affect: Vec<String> = group.lighting.affect().to_vec();

		for name in affect {
			if is_internal(&name) {
				continue;
			}
			let Some(universe) = arena.get_mut(&name) else {
				continue;
			};
			if key <= universe.top_layer {
				continue;
			}
			if universe.save_before_layer == key && !key.is_empty() {
				let below = universe.top_layer;
				universe.save_prerendered(below);
			}

			match group.lighting.blend_onto(universe, alpha, now) {
				Ok(true) => {}
				Ok(false) => continue,
				Err(err) => {
					log_error_limited(
						&format!("blend-{}-{name}", group.id),
						&format!("Blend of group {} onto {name} failed: {err}", group.name),
					);
				}
			}
			universe.top_layer = key;
			changed.insert(name.clone());

			if (keeps_changing || is_top) && universe.all_static {
				universe.all_static = false;
				universe.save_before_layer = key;
			}
		}
		group.lighting.should_rerender = false;
	}
}

fn do_output(arena: &mut UniverseArena, changed: &FxHashSet<String>) -> usize {
	let mut sent = 0;
	for name in changed {
		let Some(universe) = arena.get_mut(name) else {
			continue;
		};
		universe.pre_frame();
		match universe.on_frame() {
			Ok(()) => sent += 1,
			Err(err) => {
				log_error_limited(&format!("output-{name}"), &format!("Output of universe {name} failed: {err}"));
			}
		}
	}
	for (_, universe) in arena.iter_mut() {
		universe.full_rerender = false;
	}
	trace!(universes = sent, "Frame rendered");
	return sent;
}

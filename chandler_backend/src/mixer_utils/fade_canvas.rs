use rustc_hash::{FxHashMap, FxHashSet};

use super::state::LayerData;

/// Interpolates a group's output between the previous cue's state and the
/// state of the cue being faded in.
#[derive(Debug, Default, Clone)]
pub struct FadeCanvas {
	/// Background: what was showing when the current fade started
	old: FxHashMap<String, LayerData>,
	/// Last painted frame
	current: FxHashMap<String, LayerData>,
}

impl FadeCanvas {
	pub fn new() -> Self {
		return FadeCanvas::default();
	}

	/// Paints one frame at `fade` (0..=1) towards `target`.
	///
	/// Channels whose old alpha is exactly zero jump straight to the new value
	/// instead of fading up from zero. `local_fading` reports whether a
	/// universe wants interpolated values; universes that don't always get
	/// the final state.
	pub fn paint(&mut self, fade: f32, target: &FxHashMap<String, LayerData>, local_fading: &dyn Fn(&str) -> bool) {
		let fade = fade.clamp(0.0, 1.0);

		for (universe, new) in target {
			let old = self
				.old
				.entry(universe.clone())
				.or_insert_with(|| LayerData::zeroed(new.len()));
			if old.len() != new.len() {
				*old = LayerData::zeroed(new.len());
			}
			let f = if local_fading(universe) { fade } else { 1.0 };

			let painted = self
				.current
				.entry(universe.clone())
				.or_insert_with(|| LayerData::zeroed(new.len()));
			painted.values.resize(new.len(), 0.0);
			painted.alphas.resize(new.len(), 0.0);
			for i in 0..new.len() {
				painted.values[i] = if old.alphas[i] == 0.0 {
					new.values[i]
				} else {
					old.values[i] * (1.0 - f) + f * new.values[i]
				};
			}
		}

		// Universes only in the background fade out towards transparent
		for (universe, old) in &self.old {
			let f = if local_fading(universe) { fade } else { 1.0 };
			let painted = self.current.entry(universe.clone()).or_insert_with(|| old.clone());
			painted.alphas.resize(old.len(), 0.0);
			if !target.contains_key(universe) {
				painted.values.clone_from(&old.values);
			}
			let new_alphas = target.get(universe).map(|l| l.alphas.as_slice());
			for i in 0..old.len() {
				let new_alpha = new_alphas.and_then(|a| a.get(i)).copied().unwrap_or(0.0);
				painted.alphas[i] = old.alphas[i] * (1.0 - f) + f * new_alpha;
			}
		}
	}

	/// Commits the last painted frame as the background for the next fade.
	pub fn save(&mut self) {
		for (universe, painted) in &self.current {
			self.old
				.entry(universe.clone())
				.or_insert_with(LayerData::default)
				.copy_from(painted);
		}
	}

	/// Drops every universe not in `keep`.
	pub fn clean<T>(&mut self, keep: &FxHashMap<String, T>) {
		self.old.retain(|u, _| keep.contains_key(u));
		self.current.retain(|u, _| keep.contains_key(u));
	}

	pub fn clear(&mut self) {
		self.old.clear();
		self.current.clear();
	}

	/// Painted output for one universe
	pub fn layer(&self, universe: &str) -> Option<&LayerData> {
		return self.current.get(universe);
	}

	pub fn universes(&self) -> FxHashSet<String> {
		return self.current.keys().cloned().collect();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn target(values: &[f32], alphas: &[f32]) -> FxHashMap<String, LayerData> {
		let mut map = FxHashMap::default();
		map.insert(
			String::from("u1"),
			LayerData {
				values: values.to_vec(),
				alphas: alphas.to_vec(),
			},
		);
		return map;
	}

	#[test]
	fn unused_channel_snaps_instead_of_fading_from_black() {
		let mut canvas = FadeCanvas::new();
		canvas.paint(0.3, &target(&[200.0], &[1.0]), &|_| true);
		let layer = canvas.layer("u1").unwrap();
		assert_eq!(layer.values[0], 200.0);
		assert!((layer.alphas[0] - 0.3).abs() < 1e-6);
	}

	#[test]
	fn fades_from_saved_background() {
		let mut canvas = FadeCanvas::new();
		canvas.paint(1.0, &target(&[100.0, 50.0], &[1.0, 1.0]), &|_| true);
		canvas.save();
		canvas.paint(0.5, &target(&[200.0, 0.0], &[1.0, 0.0]), &|_| true);
		let layer = canvas.layer("u1").unwrap();
		assert_eq!(layer.values, vec![150.0, 25.0]);
		assert_eq!(layer.alphas, vec![1.0, 0.5]);
	}

	#[test]
	fn universes_without_local_fading_jump() {
		let mut canvas = FadeCanvas::new();
		canvas.paint(1.0, &target(&[100.0], &[1.0]), &|_| false);
		canvas.save();
		canvas.paint(0.1, &target(&[200.0], &[1.0]), &|_| false);
		assert_eq!(canvas.layer("u1").unwrap().values, vec![200.0]);
	}

	#[test]
	fn dropped_universes_fade_out_then_clean() {
		let mut canvas = FadeCanvas::new();
		canvas.paint(1.0, &target(&[80.0], &[1.0]), &|_| true);
		canvas.save();
		let empty: FxHashMap<String, LayerData> = FxHashMap::default();
		canvas.paint(0.25, &empty, &|_| true);
		let layer = canvas.layer("u1").unwrap();
		assert_eq!(layer.values, vec![80.0]);
		assert_eq!(layer.alphas, vec![0.75]);

		canvas.clean(&empty);
		assert!(canvas.layer("u1").is_none());
	}
}

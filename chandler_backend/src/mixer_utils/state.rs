use std::fmt;

use serde::{Deserialize, Serialize};

/// Compositing order of a group's layer: `(priority, started)`.
///
/// Lower keys are painted first, so later (higher) layers end up on top.
/// `(0, 0)` is the empty key used by universes that have nothing cached.
#[derive(Debug, Clone, Copy, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct LayerKey {
	pub priority: f64,
	pub started: f64,
}

impl LayerKey {
	pub const EMPTY: LayerKey = LayerKey {
		priority: 0.0,
		started: 0.0,
	};

	pub fn new(priority: f64, started: f64) -> Self {
		return LayerKey { priority, started };
	}

	pub fn is_empty(&self) -> bool {
		return *self == LayerKey::EMPTY;
	}
}

impl fmt::Display for LayerKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		return write!(f, "({}, {:.3})", self.priority, self.started);
	}
}

/// Dense per-universe value/alpha arrays.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LayerData {
	pub values: Vec<f32>,
	pub alphas: Vec<f32>,
}

impl LayerData {
	pub fn zeroed(count: usize) -> Self {
		return LayerData {
			values: vec![0.0; count],
			alphas: vec![0.0; count],
		};
	}

	pub fn len(&self) -> usize {
		return self.values.len();
	}

	pub fn is_empty(&self) -> bool {
		return self.values.is_empty();
	}

	/// Copies `other` into this buffer, reusing the allocation.
	pub fn copy_from(&mut self, other: &LayerData) {
		self.values.clear();
		self.values.extend_from_slice(&other.values);
		self.alphas.clear();
		self.alphas.extend_from_slice(&other.alphas);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_order_by_priority_then_start() {
		let low = LayerKey::new(1.0, 500.0);
		let high = LayerKey::new(5.0, 100.0);
		let high_later = LayerKey::new(5.0, 200.0);
		assert!(low < high);
		assert!(high < high_later);
		assert!(LayerKey::EMPTY < low);
		assert!(LayerKey::EMPTY.is_empty());
	}
}

use std::collections::BTreeMap;
use std::path::PathBuf;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[cfg(feature = "output-dmx-enttecopendmx")]
use super::outputs::EnttecOpenDevice;
#[cfg(feature = "output-dmx-enttecpro")]
use super::outputs::EnttecProDevice;
use super::outputs::{DmxConnector, DmxThreadOutput, NullOutput, OutputError, OutputFrame, UniverseOutput};
use super::UniverseError;
use crate::mixer_utils::blend_mode::BlendTarget;
use crate::mixer_utils::state::{LayerData, LayerKey};
use crate::plugins::core::log_error_limited;

pub const DEFAULT_CHANNEL_COUNT: usize = 512;
const FORBIDDEN_NAME_CHARS: &str = ":/[]()*\\`~!@#$%^&=+|{}'\";<>,";

fn default_count() -> usize {
	return DEFAULT_CHANNEL_COUNT;
}

fn default_true() -> bool {
	return true;
}

fn default_framerate() -> f64 {
	return 44.0;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
	#[default]
	Null,
	/// Enttec DMX USB Pro on a serial port
	EnttecPro {
		port: PathBuf,
		#[serde(default = "default_framerate")]
		framerate: f64,
	},
	/// First Enttec Open DMX USB found by the FTDI driver
	EnttecOpen {
		#[serde(default = "default_framerate")]
		framerate: f64,
	},
}

impl OutputConfig {
	/// Starts the backend for universe `name`. Backends that are not compiled
	/// in or fail to start discard frames instead.
	pub fn build(&self, name: &str) -> Box<dyn UniverseOutput> {
		let connect: DmxConnector = match self {
			OutputConfig::Null => return Box::new(NullOutput),
			#[cfg(feature = "output-dmx-enttecpro")]
			OutputConfig::EnttecPro { port, .. } => EnttecProDevice::connector(port.clone()),
			#[cfg(feature = "output-dmx-enttecopendmx")]
			OutputConfig::EnttecOpen { .. } => EnttecOpenDevice::connector(),
			#[allow(unreachable_patterns)]
			other => {
				warn!(universe = %name, output = ?other, "Output backend is not compiled in, discarding frames");
				return Box::new(NullOutput);
			}
		};
		let framerate = match self {
			OutputConfig::EnttecPro { framerate, .. } | OutputConfig::EnttecOpen { framerate } => *framerate,
			OutputConfig::Null => default_framerate(),
		};
		return match DmxThreadOutput::new(name, connect, framerate) {
			Ok(output) => Box::new(output),
			Err(err) => {
				warn!(universe = %name, error = %err, "Could not start output, discarding frames");
				Box::new(NullOutput)
			}
		};
	}
}

/// Saved form of a universe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniverseConfig {
	pub name: String,
	#[serde(default = "default_count")]
	pub count: usize,
	#[serde(default)]
	pub output: OutputConfig,
	/// Lets cues address channels by name
	#[serde(default)]
	pub channel_names: BTreeMap<String, usize>,
	#[serde(default = "default_true")]
	pub local_fading: bool,
}

impl UniverseConfig {
	pub fn new(name: &str) -> Self {
		return UniverseConfig {
			name: String::from(name),
			count: DEFAULT_CHANNEL_COUNT,
			output: OutputConfig::Null,
			channel_names: BTreeMap::new(),
			local_fading: true,
		};
	}
}

/// A named array of output channels, plus the compositor's per-universe cache.
pub struct Universe {
	config: UniverseConfig,
	pub values: Vec<f32>,
	pub alphas: Vec<f32>,
	/// Channels that blend like hue: no implicit zero background
	pub hue_blend_mask: Vec<bool>,

	/// Key of the highest layer composited onto `values` so far
	pub top_layer: LayerKey,
	/// Key of the layer `prerendered` was captured just after
	pub prerendered_layer: LayerKey,
	prerendered: LayerData,
	/// Cache before this layer on the next pass
	pub save_before_layer: LayerKey,
	/// Still true while no layer that will change soon has been seen this pass
	pub all_static: bool,

	/// Ignore the cache and recomposite everything next frame
	pub full_rerender: bool,
	pub fade_end_time: f64,
	pub interpolation_time: f64,

	/// Channel -> owning fixture
	pub(super) fixture_channels: FxHashMap<usize, String>,
	/// Fine channel -> coarse channel
	pub(super) fine_channels: BTreeMap<usize, usize>,
	pub(super) fixed_channels: BTreeMap<usize, f32>,

	output: Box<dyn UniverseOutput>,
	closed: bool,
}

impl Universe {
	pub fn new(config: UniverseConfig, output: Box<dyn UniverseOutput>) -> Result<Self, UniverseError> {
		validate_name(&config.name)?;
		if config.count == 0 || config.count > 65536 {
			return Err(UniverseError::InvalidCount(config.count));
		}
		let count = config.count;
		let data = LayerData::zeroed(count);
		return Ok(Universe {
			config,
			values: data.values.clone(),
			alphas: data.alphas.clone(),
			hue_blend_mask: vec![false; count],
			top_layer: LayerKey::EMPTY,
			prerendered_layer: LayerKey::EMPTY,
			prerendered: data,
			save_before_layer: LayerKey::EMPTY,
			all_static: true,
			full_rerender: false,
			fade_end_time: 0.0,
			interpolation_time: 0.0,
			fixture_channels: FxHashMap::default(),
			fine_channels: BTreeMap::new(),
			fixed_channels: BTreeMap::new(),
			output,
			closed: false,
		});
	}

	pub fn name(&self) -> &str {
		return &self.config.name;
	}

	pub fn count(&self) -> usize {
		return self.config.count;
	}

	pub fn local_fading(&self) -> bool {
		return self.config.local_fading;
	}

	pub fn config(&self) -> &UniverseConfig {
		return &self.config;
	}

	pub fn channel_index(&self, name: &str) -> Option<usize> {
		return self.config.channel_names.get(name).copied();
	}

	pub fn fixture_at(&self, channel: usize) -> Option<&str> {
		return self.fixture_channels.get(&channel).map(String::as_str);
	}

	pub fn is_closed(&self) -> bool {
		return self.closed;
	}

	fn closed_warning(&self, operation: &str) -> bool {
		if self.closed {
			log_error_limited(
				&format!("universe-closed-{}", self.name()),
				&format!("Universe {} was used after close ({operation})", self.name()),
			);
		}
		return self.closed;
	}

	/// Zeroes everything, including the cached layer.
	pub fn reset(&mut self) {
		if self.closed_warning("reset") {
			return;
		}
		self.prerendered_layer = LayerKey::EMPTY;
		self.values.iter_mut().for_each(|v| *v = 0.0);
		self.alphas.iter_mut().for_each(|a| *a = 0.0);
		self.top_layer = LayerKey::EMPTY;
	}

	/// Drops every layer composited since the cached one.
	pub fn reset_to_cache(&mut self) {
		if self.closed_warning("reset_to_cache") {
			return;
		}
		self.values.copy_from_slice(&self.prerendered.values);
		self.alphas.copy_from_slice(&self.prerendered.alphas);
		self.top_layer = self.prerendered_layer;
	}

	/// Caches the current state as "everything up to and including `key`".
	pub fn save_prerendered(&mut self, key: LayerKey) {
		if self.closed_warning("save_prerendered") {
			return;
		}
		self.prerendered_layer = key;
		self.prerendered.values.copy_from_slice(&self.values);
		self.prerendered.alphas.copy_from_slice(&self.alphas);
	}

	/// Applies fixture post-processing: fine channels take the fractional
	/// part of their coarse channel, fixed channels are forced.
	pub fn pre_frame(&mut self) {
		if self.closed_warning("pre_frame") {
			return;
		}
		for (fine, coarse) in &self.fine_channels {
			if let (Some(coarse_value), true) = (self.values.get(*coarse).copied(), *fine < self.values.len()) {
				self.values[*fine] = coarse_value.rem_euclid(1.0) * 255.0;
			}
		}
		for (channel, value) in &self.fixed_channels {
			if let Some(slot) = self.values.get_mut(*channel) {
				*slot = *value;
			}
		}
	}

	/// Hands the frame to the output backend.
	pub fn on_frame(&mut self) -> Result<(), OutputError> {
		if self.closed {
			return Err(OutputError::Closed);
		}
		return self.output.on_frame(&OutputFrame {
			values: &self.values,
			fade_end_time: self.fade_end_time,
			interpolation_time: self.interpolation_time,
		});
	}

	pub fn close(&mut self) {
		if !self.closed {
			self.output.close();
			self.closed = true;
		}
	}

	pub fn blend_target(&mut self) -> BlendTarget<'_> {
		return BlendTarget {
			universe: &self.config.name,
			values: &mut self.values,
			alphas: &mut self.alphas,
			hue_blend_mask: &self.hue_blend_mask,
			local_fading: self.config.local_fading,
			interpolation_time: &mut self.interpolation_time,
		};
	}
}

impl Drop for Universe {
	fn drop(&mut self) {
		self.close();
	}
}

pub fn validate_name(name: &str) -> Result<(), UniverseError> {
	if name.trim().is_empty() || name.chars().any(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
		return Err(UniverseError::InvalidName(String::from(name)));
	}
	return Ok(());
}

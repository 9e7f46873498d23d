use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::rate_limit::{CheckpointLimitConfig, TransitionLimitConfig};

/// Local override file, checked when no explicit path is given
pub const LOCAL_CONFIG_FILE: &str = "chandler.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("Failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("Failed to parse config file {path}: {message}")]
	Parse { path: PathBuf, message: String },

	#[error("Invalid value for {key}: {value:?}")]
	InvalidValue { key: String, value: String },
}

/// Engine-wide settings.
///
/// ```toml
/// log_level = "debug"
/// frame_rate = 60
/// show_file = "shows/main.json"
/// checkpoint_db = "~/.local/chandler/state.db"
///
/// [transition_limit]
/// window_ms = 300
/// threshold = 6
/// weight = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	pub log_level: String,
	/// Render ticks per second
	pub frame_rate: f64,
	/// Upper bound on how often media polling and metadata pushes happen
	pub poll_push_hz: f64,
	pub transition_limit: TransitionLimitConfig,
	pub checkpoint_limit: CheckpointLimitConfig,
	pub checkpoint_db: Option<PathBuf>,
	pub show_file: Option<PathBuf>,
	pub media_root: Option<PathBuf>,
	/// Identifies this instance on the sync channel. Random when unset.
	pub session_id: Option<String>,
	/// How many times a transition polls for the previous cue's first frame
	pub frame_wait_polls: u32,
	pub frame_wait_ms: u64,
}

impl Default for EngineConfig {
	fn default() -> Self {
		return EngineConfig {
			log_level: String::from("info"),
			frame_rate: 60.0,
			poll_push_hz: 14.0,
			transition_limit: TransitionLimitConfig::default(),
			checkpoint_limit: CheckpointLimitConfig::default(),
			checkpoint_db: None,
			show_file: None,
			media_root: None,
			session_id: None,
			frame_wait_polls: 10,
			frame_wait_ms: 50,
		};
	}
}

impl EngineConfig {
	/// Load from `path`, or from `./chandler.toml` if it exists, then apply
	/// `CHANDLER_*` environment overrides.
	pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
		let mut config = match path {
			Some(path) => Self::load_file(path)?,
			None => {
				let local = Path::new(LOCAL_CONFIG_FILE);
				if local.exists() {
					Self::load_file(local)?
				} else {
					EngineConfig::default()
				}
			}
		};
		config.apply_overrides(std::env::vars())?;
		return Ok(config);
	}

	pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
			path: path.to_path_buf(),
			source,
		})?;
		return toml::from_str(&content).map_err(|err| ConfigError::Parse {
			path: path.to_path_buf(),
			message: err.to_string(),
		});
	}

	/// Applies `CHANDLER_LOG`, `CHANDLER_FPS`, `CHANDLER_CHECKPOINT_DB` and
	/// `CHANDLER_SHOW` from the given key/value pairs.
	pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: Into<String>,
	{
		for (key, value) in vars {
			let value: String = value.into();
			match key.as_ref() {
				"CHANDLER_LOG" => self.log_level = value,
				"CHANDLER_FPS" => {
					self.frame_rate = match value.parse::<f64>() {
						Ok(fps) if fps > 0.0 => fps,
						_ => return Err(ConfigError::InvalidValue {
							key: String::from("CHANDLER_FPS"),
							value,
						}),
					};
				}
				"CHANDLER_CHECKPOINT_DB" => self.checkpoint_db = Some(PathBuf::from(value)),
				"CHANDLER_SHOW" => self.show_file = Some(PathBuf::from(value)),
				_ => {}
			}
		}
		return Ok(());
	}

	/// Settings for tests and embedding: no transition limit worth hitting
	pub fn permissive() -> Self {
		let mut config = EngineConfig::default();
		config.transition_limit.threshold = u32::MAX / 2;
		config.checkpoint_limit.burst = u32::MAX / 2;
		return config;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_partial_toml() {
		let config: EngineConfig = toml::from_str(
			"frame_rate = 30\n[transition_limit]\nthreshold = 10\n",
		)
		.unwrap();
		assert_eq!(config.frame_rate, 30.0);
		assert_eq!(config.transition_limit.threshold, 10);
		assert_eq!(config.transition_limit.window_ms, 300);
		assert_eq!(config.poll_push_hz, 14.0);
	}

	#[test]
	fn env_overrides_apply() {
		let mut config = EngineConfig::default();
		config
			.apply_overrides(vec![("CHANDLER_FPS", "44"), ("CHANDLER_LOG", "trace"), ("HOME", "/x")])
			.unwrap();
		assert_eq!(config.frame_rate, 44.0);
		assert_eq!(config.log_level, "trace");
	}

	#[test]
	fn bad_fps_is_rejected() {
		let mut config = EngineConfig::default();
		let err = config.apply_overrides(vec![("CHANDLER_FPS", "fast")]).unwrap_err();
		assert!(matches!(err, ConfigError::InvalidValue { .. }));
	}

	#[test]
	fn loads_from_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("chandler.toml");
		std::fs::write(&path, "log_level = \"warn\"\n").unwrap();
		let config = EngineConfig::load_file(&path).unwrap();
		assert_eq!(config.log_level, "warn");
	}
}

//! Sound and slideshow boundary.
//!
//! The engine never plays anything itself. It asks a [`MediaBackend`] how
//! long a file is (for relative cue lengths) and tells it when a group moves
//! to a cue with media attached.

use std::path::{Path, PathBuf};

use lofty::prelude::*;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "avif"];

#[derive(Debug, Error)]
pub enum MediaError {
	#[error("Could not read {path}: {message}")]
	Probe { path: String, message: String },
	#[error("{0} has no known duration")]
	NoDuration(String),
}

/// What a group wants on screen and on the speakers after a transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCue {
	pub group: String,
	pub cue: String,
	pub sound: String,
	pub slide: String,
	pub markdown: String,
	pub start_position: f64,
	pub speed: f64,
	pub loops: i64,
	/// Time the cue was entered
	pub entered: f64,
}

pub trait MediaBackend: Send + Sync {
	/// Playback length in seconds
	fn duration(&self, path: &str) -> Result<f64, MediaError>;

	fn is_image(&self, path: &str) -> bool {
		return is_image_path(path);
	}

	/// Called off the render thread after a group entered a cue.
	fn transition(&self, cue: &MediaCue) -> anyhow::Result<()>;

	/// Stops everything the group is playing
	fn stop(&self, group: &str) -> anyhow::Result<()>;
}

pub fn is_image_path(path: &str) -> bool {
	return Path::new(path)
		.extension()
		.and_then(|ext| ext.to_str())
		.map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
		.unwrap_or(false);
}

/// Probes local files with `lofty` and keeps a "now playing" table that
/// viewers can poll.
#[derive(Default)]
pub struct FileMedia {
	root: Option<PathBuf>,
	playing: Mutex<FxHashMap<String, MediaCue>>,
}

impl FileMedia {
	pub fn new(root: Option<PathBuf>) -> Self {
		return FileMedia {
			root,
			playing: Mutex::new(FxHashMap::default()),
		};
	}

	/// Relative paths are looked up under the media root.
	pub fn resolve(&self, path: &str) -> PathBuf {
		let candidate = PathBuf::from(path);
		match &self.root {
			Some(root) if candidate.is_relative() => return root.join(candidate),
			_ => return candidate,
		}
	}

	pub fn now_playing(&self, group: &str) -> Option<MediaCue> {
		return self.playing.lock().get(group).cloned();
	}
}

impl MediaBackend for FileMedia {
	fn duration(&self, path: &str) -> Result<f64, MediaError> {
		let resolved = self.resolve(path);
		let tagged = lofty::read_from_path(&resolved).map_err(|err| MediaError::Probe {
			path: resolved.display().to_string(),
			message: err.to_string(),
		})?;
		let seconds = tagged.properties().duration().as_secs_f64();
		if seconds <= 0.0 {
			return Err(MediaError::NoDuration(resolved.display().to_string()));
		}
		return Ok(seconds);
	}

	fn transition(&self, cue: &MediaCue) -> anyhow::Result<()> {
		if cue.sound.is_empty() && cue.slide.is_empty() {
			if self.playing.lock().remove(&cue.group).is_some() {
				debug!(group = %cue.group, "Media cleared");
			}
			return Ok(());
		}
		info!(group = %cue.group, cue = %cue.cue, sound = %cue.sound, slide = %cue.slide, "Media transition");
		self.playing.lock().insert(cue.group.clone(), cue.clone());
		return Ok(());
	}

	fn stop(&self, group: &str) -> anyhow::Result<()> {
		self.playing.lock().remove(group);
		return Ok(());
	}
}

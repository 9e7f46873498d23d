//! Whole-show save files.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::impl_deserialize_err;
use crate::plugins::groups::GroupConfig;
use crate::plugins::universes::fixture::FixtureConfig;
use crate::plugins::universes::universe::UniverseConfig;
use crate::utilities::serialized_data::{SerializeError, SerializedData};

/// Describes an entire show: outputs, patch and every group with its cues
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShowFile {
	pub universes: Vec<UniverseConfig>,
	pub fixtures: Vec<FixtureConfig>,
	pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Error)]
pub enum ShowFileError {
	#[error("Could not access show file: {0}")]
	Io(#[from] std::io::Error),
	#[error("Could not parse show file: {0}")]
	Deserialize(String),
	#[error("Could not encode show file: {0}")]
	Serialize(String),
}

impl_deserialize_err!(ShowFileError, ShowFileError::Deserialize);

impl From<SerializeError> for ShowFileError {
	fn from(err: SerializeError) -> Self {
		return ShowFileError::Serialize(err.0);
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowFormat {
	Json,
	Cbor,
}

impl ShowFormat {
	/// `.cbor` files are binary, everything else is written as JSON
	pub fn for_path(path: &Path) -> ShowFormat {
		return match path.extension().and_then(|ext| ext.to_str()) {
			Some(ext) if ext.eq_ignore_ascii_case("cbor") => ShowFormat::Cbor,
			_ => ShowFormat::Json,
		};
	}
}

impl ShowFile {
	/// Decodes either format, detected from the content
	pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShowFileError> {
		return Ok(SerializedData::sniff(bytes)?.deserialize()?);
	}

	pub fn to_bytes(&self, format: ShowFormat) -> Result<Vec<u8>, ShowFileError> {
		let encoded = match format {
			ShowFormat::Json => SerializedData::encode_json(self)?,
			ShowFormat::Cbor => SerializedData::encode_cbor(self)?,
		};
		return Ok(encoded.into_bytes()?);
	}

	pub fn load(path: &Path) -> Result<Self, ShowFileError> {
		return ShowFile::from_bytes(&std::fs::read(path)?);
	}

	/// Writes to a sibling temp file first so a crash never leaves half a show behind.
	pub fn save(&self, path: &Path) -> Result<(), ShowFileError> {
		let bytes = self.to_bytes(ShowFormat::for_path(path))?;
		let mut tmp = path.as_os_str().to_owned();
		tmp.push(".tmp");
		std::fs::write(&tmp, bytes)?;
		std::fs::rename(&tmp, path)?;
		return Ok(());
	}
}

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Role of one fixture channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
	Red,
	Green,
	Blue,
	White,
	Amber,
	Uv,
	#[serde(alias = "dim", alias = "value")]
	Intensity,
	Hue,
	Sat,
	Custom,
	/// Low byte of a 16 bit pair, derived from the coarse channel
	Fine,
	/// Always output the configured value
	Fixed,
	Fog,
	#[serde(other)]
	Unused,
}

impl ChannelType {
	/// Channels that blend without an implicit zero background
	pub fn blends_like_hue(&self) -> bool {
		return matches!(self, ChannelType::Hue | ChannelType::Sat | ChannelType::Custom);
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
	pub name: String,
	#[serde(rename = "type")]
	pub kind: ChannelType,
	/// Fine: coarse channel offset within the fixture. Fixed: output value.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub arg: Option<f64>,
}

impl ChannelDescriptor {
	pub fn new(name: &str, kind: ChannelType) -> Self {
		return ChannelDescriptor {
			name: String::from(name),
			kind,
			arg: None,
		};
	}
}

/// Saved form of a fixture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureConfig {
	pub name: String,
	pub channels: Vec<ChannelDescriptor>,
	#[serde(default)]
	pub universe: Option<String>,
	#[serde(default)]
	pub start: Option<usize>,
}

/// Named, contiguous range of typed channels in one universe.
#[derive(Debug, Clone)]
pub struct Fixture {
	name: String,
	channels: Vec<ChannelDescriptor>,
	name_to_offset: FxHashMap<String, usize>,
	pub(super) universe: Option<String>,
	pub(super) start: Option<usize>,
}

impl Fixture {
	pub fn new(name: &str, channels: Vec<ChannelDescriptor>) -> Self {
		let name_to_offset = channels
			.iter()
			.enumerate()
			.map(|(idx, ch)| (ch.name.clone(), idx))
			.collect();
		return Fixture {
			name: String::from(name),
			channels,
			name_to_offset,
			universe: None,
			start: None,
		};
	}

	pub fn name(&self) -> &str {
		return &self.name;
	}

	pub fn channels(&self) -> &[ChannelDescriptor] {
		return &self.channels;
	}

	pub fn len(&self) -> usize {
		return self.channels.len();
	}

	pub fn is_empty(&self) -> bool {
		return self.channels.is_empty();
	}

	pub fn offset_of(&self, channel: &str) -> Option<usize> {
		return self.name_to_offset.get(channel).copied();
	}

	/// Current `(universe, start address)`, if fully assigned
	pub fn assignment(&self) -> Option<(&str, usize)> {
		return match (&self.universe, self.start) {
			(Some(universe), Some(start)) if start > 0 => Some((universe.as_str(), start)),
			_ => None,
		};
	}

	pub fn config(&self) -> FixtureConfig {
		return FixtureConfig {
			name: self.name.clone(),
			channels: self.channels.clone(),
			universe: self.universe.clone(),
			start: self.start,
		};
	}
}

/// Splits `name[3]` into `("name", 3)`. Plain names have index 1.
pub fn split_index(raw: &str) -> (&str, usize) {
	if let Some(open) = raw.find('[') {
		let inner = raw[open + 1..].trim_end_matches(']').trim();
		let index = inner.parse().unwrap_or(1);
		return (&raw[..open], index);
	}
	return (raw, 1);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_channel_descriptors() {
		let json = r#"[
			{"name": "dim", "type": "value"},
			{"name": "dim_fine", "type": "fine"},
			{"name": "mode", "type": "fixed", "arg": 12},
			{"name": "mystery", "type": "gobo"}
		]"#;
		let channels: Vec<ChannelDescriptor> = serde_json::from_str(json).unwrap();
		assert_eq!(channels[0].kind, ChannelType::Intensity);
		assert_eq!(channels[1].kind, ChannelType::Fine);
		assert_eq!(channels[2].arg, Some(12.0));
		assert_eq!(channels[3].kind, ChannelType::Unused);
	}

	#[test]
	fn splits_indices() {
		assert_eq!(split_index("red[3]"), ("red", 3));
		assert_eq!(split_index("@par[ 2 ]"), ("@par", 2));
		assert_eq!(split_index("red"), ("red", 1));
	}
}

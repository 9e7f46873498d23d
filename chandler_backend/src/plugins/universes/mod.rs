//! Universes, fixtures and the arena that owns both.
//!
//! Cues reference universes by name and fixtures as `@fixture`; every lookup
//! goes through [`UniverseArena`], so removing an entry invalidates all
//! references to it at once.

pub mod fixture;
pub mod outputs;
pub mod universe;

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{info, warn};

use fixture::{split_index, ChannelType, Fixture, FixtureConfig};
use outputs::UniverseOutput;
use universe::{Universe, UniverseConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UniverseError {
	#[error("Invalid universe name {0:?}: special characters other than _ are not allowed")]
	InvalidName(String),
	#[error("Invalid channel count {0}")]
	InvalidCount(usize),
	#[error("No universe named {0:?}")]
	UnknownUniverse(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FixtureError {
	#[error("Fixture name {0:?} is already in use")]
	NameInUse(String),
	#[error("Invalid fixture name {0:?}")]
	InvalidName(String),
	#[error("No fixture named {0:?}")]
	UnknownFixture(String),
	#[error("No universe named {0:?}")]
	UnknownUniverse(String),
	#[error("Channel {channel} of {fixture} would overlap with {other}")]
	Overlap {
		fixture: String,
		channel: usize,
		other: String,
	},
	#[error("{fixture} needs channels {start}..{end} but the universe has {count}")]
	OutOfRange {
		fixture: String,
		start: usize,
		end: usize,
		count: usize,
	},
}

#[derive(Default)]
pub struct UniverseArena {
	universes: FxHashMap<String, Universe>,
	fixtures: FxHashMap<String, Fixture>,
}

impl UniverseArena {
	pub fn new() -> Self {
		return UniverseArena::default();
	}

	/// Adds a universe, closing and replacing any existing one with that name.
	pub fn add_universe(&mut self, config: UniverseConfig, output: Box<dyn UniverseOutput>) -> Result<(), UniverseError> {
		let name = config.name.clone();
		let universe = Universe::new(config, output)?;
		if let Some(mut old) = self.universes.insert(name.clone(), universe) {
			info!(universe = %name, "Replacing universe");
			old.close();
		}

		// Reapply fixtures that were waiting for this universe
		let waiting: Vec<(String, usize)> = self
			.fixtures
			.values()
			.filter_map(|f| match f.assignment() {
				Some((u, start)) if u == name => Some((String::from(f.name()), start)),
				_ => None,
			})
			.collect();
		for (fixture, start) in waiting {
			if let Err(err) = self.assign_fixture(&fixture, Some(&name), Some(start)) {
				warn!(fixture = %fixture, universe = %name, error = %err, "Could not restore fixture assignment");
			}
		}

		if let Some(universe) = self.universes.get_mut(&name) {
			universe.full_rerender = true;
		}
		return Ok(());
	}

	pub fn remove_universe(&mut self, name: &str) -> Option<Universe> {
		let mut universe = self.universes.remove(name)?;
		universe.close();
		return Some(universe);
	}

	pub fn get(&self, name: &str) -> Option<&Universe> {
		return self.universes.get(name);
	}

	pub fn get_mut(&mut self, name: &str) -> Option<&mut Universe> {
		return self.universes.get_mut(name);
	}

	pub fn contains(&self, name: &str) -> bool {
		return self.universes.contains_key(name);
	}

	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.universes.keys().cloned().collect();
		names.sort();
		return names;
	}

	pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Universe)> {
		return self.universes.iter_mut();
	}

	pub fn universe_configs(&self) -> Vec<UniverseConfig> {
		let mut configs: Vec<UniverseConfig> = self.universes.values().map(|u| u.config().clone()).collect();
		configs.sort_by(|a, b| a.name.cmp(&b.name));
		return configs;
	}

	pub fn fixture(&self, name: &str) -> Option<&Fixture> {
		return self.fixtures.get(name);
	}

	pub fn fixture_configs(&self) -> Vec<FixtureConfig> {
		let mut configs: Vec<FixtureConfig> = self.fixtures.values().map(Fixture::config).collect();
		configs.sort_by(|a, b| a.name.cmp(&b.name));
		return configs;
	}

	pub fn add_fixture(&mut self, config: FixtureConfig) -> Result<(), FixtureError> {
		if config.name.is_empty() || config.name.contains('.') || config.name.contains('[') {
			return Err(FixtureError::InvalidName(config.name));
		}
		if self.fixtures.contains_key(&config.name) {
			return Err(FixtureError::NameInUse(config.name));
		}
		let name = config.name.clone();
		self.fixtures.insert(name.clone(), Fixture::new(&name, config.channels));
		if config.universe.is_some() || config.start.is_some() {
			if let Err(err) = self.assign_fixture(&name, config.universe.as_deref(), config.start) {
				self.fixtures.remove(&name);
				return Err(err);
			}
		}
		return Ok(());
	}

	pub fn remove_fixture(&mut self, name: &str) -> Result<(), FixtureError> {
		self.assign_fixture(name, None, None)?;
		self.fixtures.remove(name);
		return Ok(());
	}

	/// Moves a fixture. Every target channel is checked before anything changes.
	///
	/// Assigning to a universe that doesn't exist yet just records the
	/// assignment; it takes effect when the universe is added.
	pub fn assign_fixture(&mut self, name: &str, universe: Option<&str>, start: Option<usize>) -> Result<(), FixtureError> {
		let fixture = self
			.fixtures
			.get(name)
			.ok_or_else(|| FixtureError::UnknownFixture(String::from(name)))?;
		let len = fixture.len();

		if let (Some(target), Some(start)) = (universe.and_then(|u| self.universes.get(u)), start) {
			let end = start + len;
			if start == 0 || end > target.count() {
				return Err(FixtureError::OutOfRange {
					fixture: String::from(name),
					start,
					end,
					count: target.count(),
				});
			}
			for channel in start..end {
				if let Some(other) = target.fixture_at(channel) {
					if other != name {
						return Err(FixtureError::Overlap {
							fixture: String::from(name),
							channel,
							other: String::from(other),
						});
					}
				}
			}
		}

		// Clear the old assignment
		let old_universe = fixture.universe.clone();
		if let Some(old) = old_universe.as_deref().and_then(|u| self.universes.get_mut(u)) {
			old.fixture_channels.retain(|_, owner| owner != name);
			old.full_rerender = true;
		}

		if let Some(fixture) = self.fixtures.get_mut(name) {
			fixture.universe = universe.map(String::from);
			fixture.start = start;
		}

		if let Some(old) = old_universe {
			self.rebuild_channel_maps(&old);
		}
		if let (Some(target), Some(start)) = (universe, start) {
			if let Some(target_universe) = self.universes.get_mut(target) {
				for channel in start..start + len {
					target_universe.fixture_channels.insert(channel, String::from(name));
				}
			}
			self.rebuild_channel_maps(target);
		}
		return Ok(());
	}

	/// Recomputes hue mask and fine/fixed maps from the fixtures assigned to `universe`.
	fn rebuild_channel_maps(&mut self, universe: &str) {
		let Some(target) = self.universes.get_mut(universe) else {
			return;
		};
		target.fine_channels.clear();
		target.fixed_channels.clear();
		target.hue_blend_mask.iter_mut().for_each(|m| *m = false);

		for (channel, owner) in &target.fixture_channels {
			let Some(fixture) = self.fixtures.get(owner) else {
				continue;
			};
			let Some((_, start)) = fixture.assignment() else {
				continue;
			};
			let Some(descriptor) = fixture.channels().get(channel - start) else {
				continue;
			};
			if descriptor.kind.blends_like_hue() {
				if let Some(mask) = target.hue_blend_mask.get_mut(*channel) {
					*mask = true;
				}
			}
			match descriptor.kind {
				ChannelType::Fine => match descriptor.arg {
					Some(offset) => {
						target.fine_channels.insert(*channel, start + offset as usize);
					}
					None if *channel > 1 => {
						target.fine_channels.insert(*channel, channel - 1);
					}
					None => {}
				},
				ChannelType::Fixed => {
					target.fixed_channels.insert(*channel, descriptor.arg.unwrap_or(0.0) as f32);
				}
				_ => {}
			}
		}
		target.full_rerender = true;
	}

	/// Resolves a cue's universe reference. `@fixture` maps to the fixture's universe.
	pub fn map_universe(&self, reference: &str) -> Option<String> {
		let Some(fixture) = reference.strip_prefix('@') else {
			return Some(String::from(reference));
		};
		let (fixture, _) = split_index(fixture);
		return self.fixtures.get(fixture)?.universe.clone();
	}

	/// Resolves a cue's `(universe reference, channel)` pair to an absolute slot.
	///
	/// `@fixture` + `red[3]` addresses the red channel of the third of a row
	/// of identical fixtures starting at `@fixture`. `__`-prefixed channels are
	/// metadata and never map.
	pub fn map_channel(&self, reference: &str, channel: &str) -> Option<(String, usize)> {
		if channel.starts_with("__") {
			return None;
		}

		let Some(fixture_ref) = reference.strip_prefix('@') else {
			let universe = self.universes.get(reference)?;
			let index = match channel.trim().parse::<usize>() {
				Ok(index) => index,
				Err(_) => universe.channel_index(channel)?,
			};
			if index >= universe.count() {
				return None;
			}
			return Some((String::from(reference), index));
		};

		let (fixture_name, fixture_index) = split_index(fixture_ref);
		let (channel_name, channel_index) = split_index(channel);
		let index = if channel.contains('[') { channel_index } else { fixture_index };
		let fixture = self.fixtures.get(fixture_name)?;
		let (universe, start) = fixture.assignment()?;
		let offset = match fixture.offset_of(channel_name) {
			Some(offset) => offset,
			None => channel_name.trim().parse::<usize>().ok()?,
		};
		let slot = start + offset + index.saturating_sub(1) * fixture.len();
		if slot >= self.universes.get(universe)?.count() {
			return None;
		}
		return Some((String::from(universe), slot));
	}

	/// Channel stride of a `@fixture` reference, 0 for plain universes
	pub fn fixture_len(&self, reference: &str) -> usize {
		return reference
			.strip_prefix('@')
			.map(|f| split_index(f).0)
			.and_then(|f| self.fixtures.get(f))
			.map(Fixture::len)
			.unwrap_or(0);
	}

	/// Forces the next frame to recomposite `universe` from scratch.
	pub fn request_rerender(&mut self, universe: &str) {
		if let Some(universe) = self.universes.get_mut(universe) {
			universe.full_rerender = true;
		}
	}
}

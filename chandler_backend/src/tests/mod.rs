//! Behaviour that spans groups, the board and the compositor.

mod transitions;

use std::sync::Arc;

use uuid::Uuid;

use crate::plugins::board::Board;
use crate::plugins::groups::cue::{Cue, CueValue};
use crate::plugins::groups::GroupConfig;
use crate::plugins::saver::checkpoints::{CheckpointStore, MemoryCheckpointStore};
use crate::plugins::universes::outputs::NullOutput;
use crate::plugins::universes::universe::UniverseConfig;
use crate::plugins::universes::UniverseArena;
use crate::utilities::config::EngineConfig;

pub(crate) fn board() -> Board {
	return board_with_store(Arc::new(MemoryCheckpointStore::default()));
}

pub(crate) fn board_with_store(store: Arc<dyn CheckpointStore>) -> Board {
	return Board::new(&EngineConfig::permissive(), store).with_seed(7);
}

pub(crate) fn arena(universes: &[&str]) -> UniverseArena {
	let mut arena = UniverseArena::new();
	for name in universes {
		arena.add_universe(UniverseConfig::new(name), Box::new(NullOutput)).unwrap();
	}
	return arena;
}

/// `values` are `(universe, channel, value)`
pub(crate) fn cue(name: &str, number: i64, values: &[(&str, &str, CueValue)]) -> Cue {
	let mut cue = Cue::new(name, number).unwrap();
	for (universe, channel, value) in values {
		cue.set_value(universe, channel, Some(value.clone()));
	}
	return cue;
}

/// A group whose first cue is `default`, numbered 1, 2, 3...
pub(crate) fn group(name: &str, mut cues: Vec<Cue>) -> GroupConfig {
	let mut config = GroupConfig::default();
	config.name = String::from(name);
	config.cues.push(Cue::new("default", 1000).unwrap());
	config.cues.append(&mut cues);
	return config;
}

pub(crate) fn add(board: &mut Board, arena: &mut UniverseArena, config: GroupConfig) -> Uuid {
	return board.add_group(config, 1.0, arena).unwrap();
}

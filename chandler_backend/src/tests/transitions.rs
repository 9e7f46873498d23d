use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::{add, arena, board, board_with_store, cue, group};
use crate::plugins::board::sync::{LocalSyncBus, SyncTransport};
use crate::plugins::board::GotoOptions;
use crate::plugins::groups::cue::{CueValue, Rule};
use crate::plugins::groups::{TransitionCause, TransitionError};
use crate::plugins::saver::checkpoints::{CheckpointStore, MemoryCheckpointStore};
use crate::utilities::config::EngineConfig;
use crate::utilities::expressions::Value;

fn history(board: &crate::plugins::board::Board, id: uuid::Uuid) -> Vec<String> {
	return board.group(id).unwrap().cue_history().map(|(name, _)| name.clone()).collect();
}

#[test]
fn non_reentrant_cue_ignores_repeat() {
	let mut board = board();
	let mut arena = arena(&[]);
	let mut still = cue("still", 2000, &[]);
	still.reentrant = false;
	let id = add(&mut board, &mut arena, group("g", vec![still, cue("again", 3000, &[])]));

	assert!(board.goto_cue(id, "still", 100.0, GotoOptions::default(), &mut arena).unwrap());
	assert!(!board.goto_cue(id, "still", 101.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().entered_cue, 100.0);

	// Reentrant cues restart
	board.goto_cue(id, "again", 102.0, GotoOptions::default(), &mut arena).unwrap();
	assert!(board.goto_cue(id, "again", 103.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().entered_cue, 103.0);
}

#[test]
fn goto_starts_inactive_group() {
	let mut board = board();
	let mut arena = arena(&[]);
	let id = add(&mut board, &mut arena, group("g", vec![cue("a", 2000, &[])]));
	assert!(!board.group(id).unwrap().active);

	board.goto_cue(id, "a", 10.0, GotoOptions::default(), &mut arena).unwrap();
	let g = board.group(id).unwrap();
	assert!(g.active);
	assert_eq!(g.cue_name(), "a");
	assert_eq!(history(&board, id), vec!["default", "a"]);
	assert_eq!(board.active_ids(), &[id]);
}

#[test]
fn next_walks_in_order_then_stops() {
	let mut board = board();
	let mut arena = arena(&[]);
	let id = add(&mut board, &mut arena, group("g", vec![cue("A", 2000, &[]), cue("B", 3000, &[])]));
	board.go(id, 1.0, &mut arena).unwrap();
	assert_eq!(board.group(id).unwrap().cue_name(), "default");

	assert!(board.next_cue(id, 2.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().cue_name(), "A");
	assert!(board.next_cue(id, 3.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().cue_name(), "B");
	assert!(!board.next_cue(id, 4.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().cue_name(), "B");
	assert_eq!(board.group(id).unwrap().entered_cue, 3.0);

	assert!(board.prev_cue(id, 5.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(board.group(id).unwrap().cue_name(), "A");
}

#[test]
fn explicit_next_cue_wins() {
	let mut board = board();
	let mut arena = arena(&[]);
	let mut a = cue("A", 2000, &[]);
	a.next_cue = String::from("C");
	let id = add(
		&mut board,
		&mut arena,
		group("g", vec![a, cue("B", 3000, &[]), cue("C", 4000, &[])]),
	);
	board.goto_cue(id, "A", 1.0, GotoOptions::default(), &mut arena).unwrap();
	board.next_cue(id, 2.0, GotoOptions::default(), &mut arena).unwrap();
	assert_eq!(board.group(id).unwrap().cue_name(), "C");
}

#[test]
fn shortcut_moves_owning_group_once() {
	let mut board = board();
	let mut arena = arena(&[]);
	let g1 = add(&mut board, &mut arena, group("one", vec![cue("A", 2000, &[])]));
	let g2 = add(&mut board, &mut arena, group("two", vec![cue("B", 2000, &[])]));

	board.set_cue_shortcut(g1, "A", "42.0").unwrap();
	let targets = board.shortcuts().lookup("42");
	assert_eq!(targets.len(), 1);
	assert_eq!(targets[0].group, g1);
	assert_eq!(targets[0].cue, "A");

	let fired = board
		.trigger_shortcut("42", None, 5.0, TransitionCause::Shortcut, &mut arena)
		.unwrap();
	assert_eq!(fired, 1);
	assert_eq!(board.group(g1).unwrap().cue_name(), "A");
	assert_eq!(history(&board, g1).iter().filter(|n| *n == "A").count(), 1);
	assert!(!board.group(g2).unwrap().active);

	// Excluding the owner does nothing
	let fired = board
		.trigger_shortcut("42", Some(g1), 6.0, TransitionCause::Shortcut, &mut arena)
		.unwrap();
	assert_eq!(fired, 0);
}

#[test]
fn trigger_shortcut_runs_after_the_transition() {
	let mut board = board();
	let mut arena = arena(&[]);
	let mut a = cue("A", 2000, &[]);
	a.trigger_shortcut = String::from("lights");
	let g1 = add(&mut board, &mut arena, group("one", vec![a]));
	let mut b = cue("B", 2000, &[]);
	b.shortcut = String::from("lights");
	let g2 = add(&mut board, &mut arena, group("two", vec![b]));

	board.goto_cue(g1, "A", 1.0, GotoOptions::default(), &mut arena).unwrap();
	assert!(!board.group(g2).unwrap().active);
	board.run_deferred(1.0, &mut arena);
	assert_eq!(board.group(g2).unwrap().cue_name(), "B");
}

#[test]
fn tracking_jump_matches_sequential_play() {
	fn chain() -> Vec<crate::plugins::groups::cue::Cue> {
		let mut x = cue("X", 2000, &[("u1", "1", CueValue::Number(10.0)), ("u1", "2", CueValue::Number(20.0))]);
		x.next_cue = String::from("Y");
		let mut y = cue("Y", 3000, &[("u1", "2", CueValue::Number(30.0)), ("u1", "3", CueValue::Number(40.0))]);
		y.next_cue = String::from("Z");
		let z = cue("Z", 4000, &[("u1", "4", CueValue::Number(50.0))]);
		return vec![x, y, z];
	}

	let mut jumped = board();
	let mut jumped_arena = arena(&["u1"]);
	let a = add(&mut jumped, &mut jumped_arena, group("g", chain()));
	jumped.goto_cue(a, "Z", 1.0, GotoOptions::default(), &mut jumped_arena).unwrap();

	let mut walked = board();
	let mut walked_arena = arena(&["u1"]);
	let b = add(&mut walked, &mut walked_arena, group("g", chain()));
	for (i, name) in ["X", "Y", "Z"].iter().enumerate() {
		walked.goto_cue(b, name, 1.0 + i as f64, GotoOptions::default(), &mut walked_arena).unwrap();
	}

	let jumped_state = jumped.group(a).unwrap().lighting.state().get("u1").cloned().unwrap();
	let walked_state = walked.group(b).unwrap().lighting.state().get("u1").cloned().unwrap();
	assert_eq!(jumped_state, walked_state);
	assert_eq!(&jumped_state.values[1..5], &[10.0, 30.0, 40.0, 50.0]);
	assert_eq!(&jumped_state.alphas[1..5], &[1.0, 1.0, 1.0, 1.0]);
}

#[test]
fn jumps_only_replay_cues_after_the_live_one() {
	let mut x = cue("X", 2000, &[("u1", "1", CueValue::from("=level"))]);
	x.next_cue = String::from("Y");
	let mut y = cue("Y", 3000, &[("u1", "2", CueValue::Number(30.0))]);
	y.next_cue = String::from("Z");
	let z = cue("Z", 4000, &[("u1", "3", CueValue::Number(50.0))]);

	let mut board = board();
	let mut arena = arena(&["u1"]);
	let id = add(&mut board, &mut arena, group("g", vec![x, y, z]));
	board.go(id, 0.5, &mut arena).unwrap();
	board.group_mut(id).unwrap().script.set_var("level", Value::Number(10.0));
	board.goto_cue(id, "X", 1.0, GotoOptions::default(), &mut arena).unwrap();

	// X is already showing: a jump past Y must not evaluate it again
	board.group_mut(id).unwrap().script.set_var("level", Value::Number(99.0));
	board.goto_cue(id, "Z", 2.0, GotoOptions::default(), &mut arena).unwrap();
	let state = board.group(id).unwrap().lighting.state().get("u1").cloned().unwrap();
	assert_eq!(&state.values[1..4], &[10.0, 30.0, 50.0]);
}

#[test]
fn setup_falls_through_to_checkpoint_or_default() {
	let store = Arc::new(MemoryCheckpointStore::default());
	let mut board = board_with_store(store.clone());
	let mut arena = arena(&[]);
	let mut saved = cue("saved", 3000, &[]);
	saved.checkpoint = true;
	let id = add(&mut board, &mut arena, group("g", vec![cue("__setup__", 500, &[]), saved]));

	board.go(id, 10.0, &mut arena).unwrap();
	assert_eq!(board.group(id).unwrap().cue_name(), "default");
	assert_eq!(history(&board, id), vec!["__setup__", "default"]);

	board.goto_cue(id, "saved", 11.0, GotoOptions::default(), &mut arena).unwrap();
	assert_eq!(
		store.get_checkpoint(&id.to_string()).unwrap().map(|(cue, _)| cue),
		Some(String::from("saved"))
	);

	board.stop(id, &mut arena).unwrap();
	board.go(id, 20.0, &mut arena).unwrap();
	assert_eq!(board.group(id).unwrap().cue_name(), "saved");
}

#[test]
fn transitions_are_rate_limited() {
	let config = EngineConfig::default();
	let mut board = crate::plugins::board::Board::new(&config, Arc::new(MemoryCheckpointStore::default()));
	let mut arena = arena(&[]);
	let id = add(&mut board, &mut arena, group("g", vec![cue("a", 2000, &[]), cue("b", 3000, &[])]));
	board.go(id, 1.0, &mut arena).unwrap();

	let mut results = Vec::new();
	for (i, name) in ["a", "b", "a", "b", "a"].iter().enumerate() {
		results.push(board.goto_cue(id, name, 10.0 + i as f64 * 0.01, GotoOptions::default(), &mut arena));
	}
	assert!(results[..4].iter().all(|r| r.is_ok()));
	assert!(matches!(results[4], Err(TransitionError::RateLimited)));

	// A new window accepts transitions again
	assert!(board.goto_cue(id, "a", 20.0, GotoOptions::default(), &mut arena).is_ok());
}

#[test]
fn starting_groups_is_not_rate_limited() {
	let mut board = crate::plugins::board::Board::new(&EngineConfig::default(), Arc::new(MemoryCheckpointStore::default()));
	let mut arena = arena(&[]);
	let mut ids = Vec::new();
	for name in ["a", "b", "c", "d"] {
		let mut config = group(name, vec![cue("on", 2000, &[])]);
		config.active = true;
		ids.push(board.add_group(config, 100.0, &mut arena).unwrap());
	}
	for id in &ids {
		let g = board.group(*id).unwrap();
		assert!(g.active);
		assert_eq!(g.cue_name(), "default");
		assert_eq!(g.entered_cue, 100.0);
	}

	// Each request on a stopped group costs one transition, not three
	let mut stopped = Vec::new();
	for name in ["x", "y", "z"] {
		stopped.push(add(&mut board, &mut arena, group(name, vec![cue("on", 2000, &[])])));
	}
	for (i, id) in stopped.iter().enumerate() {
		let at = 200.0 + i as f64 * 0.01;
		assert!(board.goto_cue(*id, "on", at, GotoOptions::default(), &mut arena).unwrap());
		assert_eq!(board.group(*id).unwrap().entered_cue, at);
	}
}

#[test]
fn rate_limited_request_leaves_group_stopped() {
	let mut board = crate::plugins::board::Board::new(&EngineConfig::default(), Arc::new(MemoryCheckpointStore::default()));
	let mut arena = arena(&[]);
	let busy = add(&mut board, &mut arena, group("busy", vec![cue("a", 2000, &[]), cue("b", 3000, &[])]));
	let idle = add(&mut board, &mut arena, group("idle", vec![cue("on", 2000, &[])]));
	for (i, name) in ["a", "b", "a", "b"].iter().enumerate() {
		board.goto_cue(busy, name, 10.0 + i as f64 * 0.01, GotoOptions::default(), &mut arena).unwrap();
	}

	let result = board.goto_cue(idle, "on", 10.05, GotoOptions::default(), &mut arena);
	assert!(matches!(result, Err(TransitionError::RateLimited)));
	assert!(!board.group(idle).unwrap().active);
	assert!(!board.active_ids().contains(&idle));
}

#[test]
fn rule_redirects_are_bounded() {
	let mut board = board();
	let mut arena = arena(&[]);
	let mut a = cue("A", 2000, &[]);
	a.rules = vec![Rule::new("cue.enter", &[&["goto", "g", "B"]])];
	let mut b = cue("B", 3000, &[]);
	b.rules = vec![Rule::new("cue.enter", &[&["goto", "g", "A"]])];
	let id = add(&mut board, &mut arena, group("g", vec![a, b]));

	assert!(board.goto_cue(id, "A", 1.0, GotoOptions::default(), &mut arena).unwrap());
	assert_eq!(history(&board, id), vec!["default", "A", "B", "A", "B"]);
	assert_eq!(board.group(id).unwrap().cue_name(), "B");

	let deep = GotoOptions::cause(TransitionCause::Script(4));
	assert!(matches!(
		board.goto_cue(id, "A", 2.0, deep, &mut arena),
		Err(TransitionError::TooManyRedirects)
	));
}

#[test]
fn rules_see_kwargs_and_stop_other_groups() {
	let mut board = board();
	let mut arena = arena(&[]);
	let other = add(&mut board, &mut arena, group("other", vec![]));
	board.go(other, 1.0, &mut arena).unwrap();

	let mut a = cue("A", 2000, &[]);
	a.rules = vec![Rule::new("cue.enter", &[&["set", "speed", "=KWARGS.speed"], &["stop", "other"]])];
	let id = add(&mut board, &mut arena, group("g", vec![a]));
	board.goto_cue(id, "A?speed=3", 2.0, GotoOptions::default(), &mut arena).unwrap();

	let g = board.group(id).unwrap();
	assert_eq!(g.cue_name(), "A");
	assert_eq!(g.script.get_var("speed"), Some(crate::utilities::expressions::Value::Number(3.0)));
	assert!(!board.group(other).unwrap().active);
}

#[test]
fn rule_writes_refresh_expression_values() {
	let mut a = cue("A", 2000, &[("u1", "1", CueValue::from("=level"))]);
	a.rules = vec![Rule::new("cue.enter", &[&["set", "level", "=40"]])];
	let mut board = board();
	let mut arena = arena(&["u1"]);
	let id = add(&mut board, &mut arena, group("g", vec![a]));
	board.go(id, 0.5, &mut arena).unwrap();
	board.group_mut(id).unwrap().script.set_var("level", Value::Number(10.0));

	// The rule runs after A's values were computed from the old level
	board.goto_cue(id, "A", 1.0, GotoOptions::default(), &mut arena).unwrap();
	let g = board.group(id).unwrap();
	assert_eq!(g.script.get_var("level"), Some(Value::Number(40.0)));
	assert_eq!(g.lighting.state().get("u1").unwrap().values[1], 40.0);
}

#[test]
fn sync_peers_follow_but_never_echo() {
	let bus: Arc<dyn SyncTransport> = Arc::new(LocalSyncBus::default());
	let mut receiver = bus.subscribe();

	let mut leader = board().with_sync(Arc::clone(&bus));
	let mut leader_arena = arena(&[]);
	let mut config = group("g", vec![cue("A", 2000, &[])]);
	config.sync_group = String::from("stage");
	let l = add(&mut leader, &mut leader_arena, config.clone());

	let mut follower = board().with_sync(Arc::clone(&bus));
	let mut follower_arena = arena(&[]);
	config.id = uuid::Uuid::new_v4();
	let f = add(&mut follower, &mut follower_arena, config);
	follower.go(f, 1.0, &mut follower_arena).unwrap();

	leader.goto_cue(l, "A", 100.0, GotoOptions::default(), &mut leader_arena).unwrap();
	let envelope = loop {
		let envelope = receiver.try_recv().unwrap();
		if envelope.message.cue == "A" {
			break envelope;
		}
	};
	assert_eq!(envelope.topic, "stage");
	assert_eq!(envelope.message.sender_session_id, leader.session_id());

	// Our own message is ignored
	leader.handle_sync(&envelope, 100.2, &mut leader_arena);
	assert_eq!(leader.group(l).unwrap().entered_cue, 100.0);

	// Peers clamp the entry time to their own clock
	follower.handle_sync(&envelope, 101.0, &mut follower_arena);
	let g = follower.group(f).unwrap();
	assert_eq!(g.cue_name(), "A");
	assert_eq!(g.entered_cue, 100.5);
}

#[test]
fn removing_current_cue_moves_on() {
	let mut board = board();
	let mut arena = arena(&[]);
	let id = add(&mut board, &mut arena, group("g", vec![cue("A", 2000, &[]), cue("B", 3000, &[])]));
	board.goto_cue(id, "A", 1.0, GotoOptions::default(), &mut arena).unwrap();

	board.rm_cue(id, "A", 2.0, &mut arena).unwrap();
	let g = board.group(id).unwrap();
	assert!(g.get_cue("A").is_none());
	assert_eq!(g.cue_name(), "B");
}

use chandler_lib::build_board;
use chandler_lib::plugins::board::{BoardInterface, GotoOptions};
use chandler_lib::plugins::groups::cue::{Cue, CueValue};
use chandler_lib::plugins::groups::GroupConfig;
use chandler_lib::plugins::universes::universe::UniverseConfig;
use chandler_lib::utilities::clock;
use chandler_lib::utilities::config::EngineConfig;
use pretty_assertions::assert_eq;

fn engine() -> BoardInterface {
	let board = build_board(&EngineConfig::permissive(), None).unwrap();
	board
		.with_board(|_, arena| {
			let config = UniverseConfig::new("stage");
			let output = config.output.build(&config.name);
			arena.add_universe(config, output).unwrap();
		})
		.unwrap();
	return board;
}

fn show_group() -> GroupConfig {
	let mut wash = Cue::new("wash", 2000).unwrap();
	wash.set_value("stage", "1", Some(CueValue::Number(255.0)));
	wash.set_value("stage", "2", Some(CueValue::from("=64*2")));
	let mut blackout = Cue::new("blackout", 3000).unwrap();
	blackout.set_value("stage", "1", Some(CueValue::Number(0.0)));

	let mut config = GroupConfig::default();
	config.name = String::from("front");
	config.cues = vec![Cue::new("default", 1000).unwrap(), wash, blackout];
	return config;
}

#[test]
fn cues_reach_the_universe() {
	let board = engine();
	board.add_group(show_group()).unwrap();

	assert!(board.goto_cue("front", "wash", GotoOptions::default()).unwrap());
	board.tick(clock::now()).unwrap();
	let values = board.universe_values("stage").unwrap().unwrap();
	assert_eq!(&values[1..3], &[255.0, 128.0]);
	assert_eq!(board.frames_completed(), 1);

	board.next_cue("front", GotoOptions::default()).unwrap();
	board.tick(clock::now()).unwrap();
	let values = board.universe_values("stage").unwrap().unwrap();
	assert_eq!(values[1], 0.0);

	let status = board.group_status().unwrap();
	assert_eq!(status.len(), 1);
	assert_eq!(status[0].cue, "blackout");
	assert!(status[0].active);
}

#[test]
fn unknown_names_are_errors() {
	let board = engine();
	board.add_group(show_group()).unwrap();
	assert!(board.goto_cue("nobody", "wash", GotoOptions::default()).is_err());
	assert!(board.goto_cue("front", "missing", GotoOptions::default()).is_err());
}

#[test]
fn stop_clears_output() {
	let board = engine();
	board.add_group(show_group()).unwrap();
	board.goto_cue("front", "wash", GotoOptions::default()).unwrap();
	board.tick(clock::now()).unwrap();

	board.stop("front").unwrap();
	board.tick(clock::now()).unwrap();
	let values = board.universe_values("stage").unwrap().unwrap();
	assert!(values.iter().all(|v| *v == 0.0));
}

#[test]
fn show_files_round_trip() {
	let dir = tempfile::tempdir().unwrap();
	for file in ["show.json", "show.cbor"] {
		let path = dir.path().join(file);
		let original = engine();
		original.add_group(show_group()).unwrap();
		original.save_show(&path).unwrap();

		let restored = build_board(&EngineConfig::permissive(), None).unwrap();
		restored.load_show(&path).unwrap();
		let names: Vec<String> = restored.group_status().unwrap().into_iter().map(|s| s.name).collect();
		assert_eq!(names, vec![String::from("front")]);

		restored.goto_cue("front", "wash", GotoOptions::default()).unwrap();
		restored.tick(clock::now()).unwrap();
		let values = restored.universe_values("stage").unwrap().unwrap();
		assert_eq!(&values[1..3], &[255.0, 128.0]);
	}
}

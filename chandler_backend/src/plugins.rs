pub mod core;

pub mod board;
pub mod groups;
pub mod media;
pub mod mixer;
pub mod saver;
pub mod scripting;
pub mod universes;

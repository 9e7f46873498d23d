//! Persistence: show files and per-group checkpoints.

pub mod checkpoints;
pub mod show;

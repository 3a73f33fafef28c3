//! Test support for fleet: scripted backends, starters and fixtures.

mod backend;
mod fixtures;
mod starter;

pub use backend::{Op, ScriptedBackend};
pub use fixtures::{fast_config, rows};
pub use starter::{payload_for, ScriptedStarter};

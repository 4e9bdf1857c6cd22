//! gz-core: game-facing interfaces, bundled reference games and configuration.
//!
//! The search core never implements game rules itself. It talks to a
//! [`StateMachine`] (joint moves, legals, terminal test, goals) and receives
//! configuration as plain values from [`config`].

pub mod config;
pub mod game;
pub mod games;

pub use config::{ChooseFn, Config, ConfigError, InferenceConfig, PuctConfig, SelfPlayConfig};
pub use game::{BaseState, JointMove, StateMachine};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Runtime around the search core: batching scheduler, player facade and
//! self-play driver.

pub mod drive;
pub mod player;
pub mod scheduler;
pub mod selfplay;

pub use drive::{drive, DriveStats, PollDriver};
pub use player::{ChosenMove, Player, PlayerError};
pub use scheduler::{ReadyEvent, Scheduler, SchedulerError, SchedulerState, SchedulerStats};
pub use selfplay::{GameEnd, GameOutcome, Sample, SelfPlayError, SelfPlayTask, SelfPlayer};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

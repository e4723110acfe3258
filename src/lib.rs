//! Polling coordinator for iOhouse climate controllers.
//!
//! A [`Coordinator`] owns the HTTP session to one controller, polls its zones
//! on a schedule, merges values the controller has just confirmed over stale
//! polled data, and dispatches commands.
//!
//! ```no_run
//! # async fn run() -> iohouse_climate::Result<()> {
//! use iohouse_climate::{Coordinator, PresetMode};
//!
//! let coordinator = Coordinator::builder("192.168.1.50").api_key("secret").build()?;
//! let poll = coordinator.spawn();
//!
//! coordinator.set_preset("a1", PresetMode::Eco).await;
//! if let Some(zone) = coordinator.zone("a1") {
//!     println!("{}: {:?}", zone.name(), zone.current_temperature());
//! }
//!
//! coordinator.shutdown();
//! poll.join().await;
//! # Ok(())
//! # }
//! ```

mod cache;
mod client;
mod config;
mod coordinator;
mod diff;
mod error;
mod firmware;
mod logger;
pub mod protocol;
mod scheduler;
mod store;
mod types;

pub use config::{CoordinatorConfig, Timing, ZoneSettings};
pub use coordinator::{
    CommandOutcome, Coordinator, CoordinatorBuilder, CoordinatorEvent, ListenerId, PollLoop,
};
pub use error::{Error, Result};
pub use firmware::{FirmwareMonitor, FirmwareOutcome};
pub use logger::MessageLogMode;
pub use scheduler::{Phase, PollMode, SchedulerStatus};
pub use types::*;

//! Per-target dispatch statistics and the JSON API serving them.

mod recorder;
mod server;

pub use recorder::{TargetRecorder, TargetStats};
pub use server::{StatsCollector, StatsServer};

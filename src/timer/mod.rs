pub mod controller;
pub mod state;

pub use controller::{CountdownController, StopwatchController, TimerSnapshot};
pub use state::{format_countdown, format_stopwatch, Lap, TimerMode, TimerState, TimerStatus};

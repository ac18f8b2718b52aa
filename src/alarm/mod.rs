mod engine;
mod model;

pub use engine::{AlarmEngine, AlarmTrigger};
pub use model::{Alarm, NewAlarm, TimeOfDay, WeekdaySet};

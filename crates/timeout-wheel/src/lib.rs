//! In-process timing wheel.
//!
//! A fixed ring of slots is advanced one slot per tick. Each slot holds the
//! tasks whose deadline falls on a tick that maps to it; tasks due several
//! revolutions ahead stay in place until their tick comes round.

pub mod error;
pub mod wheel;

pub use error::{Result, WheelError};
pub use wheel::{TickReport, TimeoutWheel, TimerCallback, WheelConfig};

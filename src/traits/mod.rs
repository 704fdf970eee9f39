//! Hardware boundary traits
//!
//! The motion core never touches pins or timers directly; the host
//! implements these traits over its GPIO, PWM and timer peripherals and
//! passes them into the planner and the stepper tick.

pub mod io;

pub use io::{AuxBus, EndstopBank, Host, MotorBus, StepIo};

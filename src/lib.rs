//! Board-agnostic motion control core for 3D printer, laser and CNC firmware
//!
//! This crate contains the hard real-time half of a motion controller and
//! nothing else:
//!
//! - A look-ahead planner that buffers Cartesian moves as motor-space
//!   blocks with trapezoidal velocity profiles, continually re-planning
//!   junction speeds so every motor stays inside its velocity,
//!   acceleration and jerk envelope.
//! - A stepper executor meant to be driven from a periodic hardware timer
//!   interrupt, which consumes blocks and emits step pulses with a
//!   Bresenham line walk, modulating the timer interval to realize the
//!   planned trapezoid and watching the endstops while it goes.
//!
//! Hardware access goes through the traits in [`traits`]; the host owns
//! pins, timers and interrupt plumbing. G-code parsing, heaters, homing
//! sequences and the rest of a printer live above this crate.

#![no_std]
#![deny(unsafe_code)]

pub mod axis;
pub mod config;
pub mod kinematics;
pub mod planner;
pub mod shared;
pub mod stepper;
pub mod traits;

#[cfg(test)]
mod testio;

pub use axis::{Axis, Motor, Position, Switch, SwitchSet};
pub use config::{EndstopConfig, LaserMode, LaserSettings, MotionConfig, StepperConfig};
pub use kinematics::Kinematics;
pub use planner::{EndstopReport, MotionEvent, Planner};
pub use shared::MotionBus;
pub use stepper::Stepper;
pub use traits::{AuxBus, EndstopBank, Host, MotorBus, StepIo};

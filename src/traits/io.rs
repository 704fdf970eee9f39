//! Motor, endstop and auxiliary output traits

use crate::axis::{Motor, Switch};

/// Step/direction/enable outputs for every motor driver.
///
/// Electrical polarity (inverted step or direction pins, active-low
/// enables) is the implementation's business; the core always speaks in
/// logical terms. `step_start`/`step_end` bracket one step pulse so the
/// implementation can insert a driver-specific inter-edge delay if its
/// hardware needs one.
pub trait MotorBus {
    /// Latch the direction for a motor; `reverse` means negative travel
    fn set_direction(&mut self, motor: Motor, reverse: bool);

    /// Drive the step line active
    fn step_start(&mut self, motor: Motor);

    /// Drive the step line inactive, completing one step
    fn step_end(&mut self, motor: Motor);

    /// Energize a motor driver
    fn enable(&mut self, motor: Motor);

    /// De-energize a motor driver; the motor is free to rotate
    fn disable(&mut self, motor: Motor);
}

/// Debounced-at-the-pin endstop reads.
///
/// Implementations apply wiring polarity and report the logical switch
/// state; the core does its own two-sample debounce on top.
pub trait EndstopBank {
    /// Current logical state of a switch; `true` means pressed
    fn triggered(&self, switch: Switch) -> bool;
}

/// Auxiliary outputs applied by the executor on behalf of queued blocks.
///
/// Machines without a fan or laser keep the default no-op methods.
pub trait AuxBus {
    /// Apply the part-cooling fan PWM captured in the executing block
    fn set_fan(&mut self, pwm: u8) {
        let _ = pwm;
    }

    /// Fire the laser at the given intensity
    fn laser_fire(&mut self, intensity: u8) {
        let _ = intensity;
    }

    /// Stop firing the laser
    fn laser_extinguish(&mut self) {}
}

/// Foreground host services.
///
/// `idle` is called while the planner busy-waits (full buffer, drain);
/// the host should service its event loop there. `wake_stepper` is called
/// after a block is published so hosts that gate the step timer off when
/// idle can re-arm it; hosts that leave the timer free-running keep the
/// default no-op.
pub trait Host {
    fn idle(&mut self);

    fn wake_stepper(&mut self) {}
}

/// Everything the stepper tick needs from the hardware.
pub trait StepIo: MotorBus + EndstopBank + AuxBus {
    /// Timer ticks consumed since the current compare interrupt fired.
    ///
    /// Used to keep the next compare value ahead of the free-running
    /// counter. Hosts whose tick always completes well inside the minimum
    /// interval may keep the default.
    fn ticks_elapsed(&self) -> u16 {
        0
    }
}

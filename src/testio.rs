//! Recording hardware mock shared by the planner and stepper tests

use crate::axis::{Motor, Switch};
use crate::stepper::Stepper;
use crate::traits::{AuxBus, EndstopBank, Host, MotorBus, StepIo};

pub(crate) const MOTOR_SLOTS: usize = 9;

pub(crate) fn motor_index(motor: Motor) -> usize {
    match motor {
        Motor::X => 0,
        Motor::X2 => 1,
        Motor::Y => 2,
        Motor::Z => 3,
        Motor::Z2 => 4,
        Motor::E(tool) => 5 + (tool as usize & 3),
    }
}

/// Records every motor edge, direction latch and endstop read
pub(crate) struct SimIo {
    pub enabled: [bool; MOTOR_SLOTS],
    pub reverse: [bool; MOTOR_SLOTS],
    /// Completed step pulses per motor
    pub steps: [u32; MOTOR_SLOTS],
    high: [bool; MOTOR_SLOTS],
    pub switches: [bool; 16],
    pub fan: u8,
    pub laser_fires: u32,
    pub laser_intensity: u8,
    pub idles: u32,
}

impl SimIo {
    pub fn new() -> Self {
        Self {
            enabled: [false; MOTOR_SLOTS],
            reverse: [false; MOTOR_SLOTS],
            steps: [0; MOTOR_SLOTS],
            high: [false; MOTOR_SLOTS],
            switches: [false; 16],
            fan: 0,
            laser_fires: 0,
            laser_intensity: 0,
            idles: 0,
        }
    }

    pub fn set_switch(&mut self, switch: Switch, pressed: bool) {
        self.switches[switch as usize] = pressed;
    }

    pub fn steps_for(&self, motor: Motor) -> u32 {
        self.steps[motor_index(motor)]
    }
}

impl MotorBus for SimIo {
    fn set_direction(&mut self, motor: Motor, reverse: bool) {
        self.reverse[motor_index(motor)] = reverse;
    }

    fn step_start(&mut self, motor: Motor) {
        self.high[motor_index(motor)] = true;
    }

    fn step_end(&mut self, motor: Motor) {
        let index = motor_index(motor);
        if self.high[index] {
            self.high[index] = false;
            self.steps[index] += 1;
        }
    }

    fn enable(&mut self, motor: Motor) {
        self.enabled[motor_index(motor)] = true;
    }

    fn disable(&mut self, motor: Motor) {
        self.enabled[motor_index(motor)] = false;
    }
}

impl EndstopBank for SimIo {
    fn triggered(&self, switch: Switch) -> bool {
        self.switches[switch as usize]
    }
}

impl AuxBus for SimIo {
    fn set_fan(&mut self, pwm: u8) {
        self.fan = pwm;
    }

    fn laser_fire(&mut self, intensity: u8) {
        self.laser_fires += 1;
        self.laser_intensity = intensity;
    }
}

impl Host for SimIo {
    fn idle(&mut self) {
        self.idles += 1;
    }
}

impl StepIo for SimIo {}

/// Fire the tick until the queue drains or the firing limit runs out.
/// Returns the number of firings.
pub(crate) fn run_until_idle(stepper: &mut Stepper, io: &mut SimIo, max_ticks: u32) -> u32 {
    let mut ticks = 0;
    while !stepper.is_idle() {
        let _ = stepper.tick(io);
        ticks += 1;
        assert!(ticks < max_ticks, "stepper failed to drain in {max_ticks} ticks");
    }
    ticks
}

//! Endstop monitoring for the executor
//!
//! Runs inside the stepper tick while a block executes. Every firing
//! samples the switches along the block's direction of travel; a switch
//! counts as triggered only when the current and the previous sample both
//! read active (two-sample debounce). A trigger captures the motor
//! position, latches a hit bit for the foreground and ends the block.
//!
//! On core machines the head can move in X while the motors disagree, so
//! the checks key off the head-frame direction bits and the trigger
//! position is recovered from the coupled motor pair.

use crate::axis::{Axis, Switch, DIR_X, DIR_X_HEAD, DIR_Y, DIR_Y_HEAD, DIR_Z, DIR_Z_HEAD};
use crate::config::{EndstopConfig, StepperConfig};
use crate::kinematics::Kinematics;
use crate::planner::block::Block;
use crate::shared::MotionBus;
use crate::traits::EndstopBank;

/// Direction bit for each motor slot
const SLOT_BITS: [u8; 3] = [DIR_X, DIR_Y, DIR_Z];

/// Two-sample endstop debouncer and trigger latch
pub(crate) struct EndstopMonitor {
    /// Switch samples from the previous firing
    old_bits: u16,
}

impl EndstopMonitor {
    pub(crate) const fn new() -> Self {
        Self { old_bits: 0 }
    }

    /// Previous-firing sample of a switch, used for dual-Z step gating
    fn was_active(&self, switch: Switch) -> bool {
        self.old_bits & switch.bit() != 0
    }

    /// May the two Z motors step right now?
    ///
    /// Outside homing both always step. While homing with dual Z
    /// endstops, each motor stops at its own switch (or while explicitly
    /// locked) until its twin catches up.
    pub(crate) fn z_motor_gates(
        &self,
        bus: &MotionBus,
        cfg: &EndstopConfig,
        direction: i8,
    ) -> (bool, bool) {
        if !cfg.z_dual_endstops || !bus.homing() {
            return (true, true);
        }
        let (z_locked, z2_locked) = bus.z_locks();
        let (z_stop, z2_stop) = if cfg.z_home_dir > 0 {
            (
                self.was_active(Switch::ZMax) && direction > 0,
                self.was_active(Switch::Z2Max) && direction > 0,
            )
        } else {
            (
                self.was_active(Switch::ZMin) && direction < 0,
                self.was_active(Switch::Z2Min) && direction < 0,
            )
        };
        (!z_stop && !z_locked, !z2_stop && !z2_locked)
    }

    /// Sample and evaluate every relevant endstop for the executing block.
    ///
    /// Returns `true` when the block must terminate immediately.
    pub(crate) fn check(
        &mut self,
        io: &impl EndstopBank,
        bus: &MotionBus,
        cfg: &StepperConfig,
        block: &Block,
    ) -> bool {
        let mut current: u16 = 0;
        let mut finish = false;
        let kinematics = cfg.kinematics;
        let dir = block.direction_bits;

        // X: on core machines the head moves in X unless the move is a
        // pure second-axis move (equal step counts, opposing directions).
        let (head_moves_x, x_negative) = match kinematics.core_pair() {
            Some((a, b)) => (
                block.steps[a] != block.steps[b]
                    || dir.is_reverse(SLOT_BITS[a]) == dir.is_reverse(SLOT_BITS[b]),
                dir.is_reverse(DIR_X_HEAD),
            ),
            None => (true, dir.is_reverse(DIR_X)),
        };
        if head_moves_x {
            let switch = if x_negative { Switch::XMin } else { Switch::XMax };
            // With two carriages only the one homing in this direction
            // consults its switch.
            let carriage_gate = match cfg.dual_carriage {
                Some(dc) => {
                    let carriage = usize::from(block.active_tool != 0);
                    dc.home_dir[carriage] == if x_negative { -1 } else { 1 }
                }
                None => true,
            };
            if carriage_gate
                && self.simple_endstop(io, bus, cfg, block, &mut current, switch, Axis::X, 0)
            {
                finish = true;
            }
        }

        // Y: only CoreXY/CoreYX couple Y into the pair
        let (head_moves_y, y_negative) = match kinematics {
            Kinematics::CoreXy | Kinematics::CoreYx => (
                block.steps[0] != block.steps[1]
                    || dir.is_reverse(DIR_X) != dir.is_reverse(DIR_Y),
                dir.is_reverse(DIR_Y_HEAD),
            ),
            _ => (true, dir.is_reverse(DIR_Y)),
        };
        if head_moves_y {
            let switch = if y_negative { Switch::YMin } else { Switch::YMax };
            if self.simple_endstop(io, bus, cfg, block, &mut current, switch, Axis::Y, 1) {
                finish = true;
            }
        }

        // Z: CoreXZ/CoreZX couple Z; dual-Z homing watches both switches
        let (head_moves_z, z_negative) = match kinematics {
            Kinematics::CoreXz | Kinematics::CoreZx => (
                block.steps[0] != block.steps[2]
                    || dir.is_reverse(DIR_X) != dir.is_reverse(DIR_Z),
                dir.is_reverse(DIR_Z_HEAD),
            ),
            _ => (true, dir.is_reverse(DIR_Z)),
        };
        if head_moves_z {
            if z_negative {
                if cfg.endstops.z_dual_endstops {
                    if self.dual_z_endstop(
                        io,
                        bus,
                        cfg,
                        block,
                        &mut current,
                        Switch::ZMin,
                        Switch::Z2Min,
                    ) {
                        finish = true;
                    }
                } else if self.simple_endstop(
                    io,
                    bus,
                    cfg,
                    block,
                    &mut current,
                    Switch::ZMin,
                    Axis::Z,
                    2,
                ) {
                    finish = true;
                }

                // The probe rides along on -Z moves
                if self.simple_endstop(
                    io,
                    bus,
                    cfg,
                    block,
                    &mut current,
                    Switch::ZProbe,
                    Axis::Z,
                    2,
                ) {
                    finish = true;
                }
            } else if cfg.endstops.z_dual_endstops {
                if self.dual_z_endstop(
                    io,
                    bus,
                    cfg,
                    block,
                    &mut current,
                    Switch::ZMax,
                    Switch::Z2Max,
                ) {
                    finish = true;
                }
            } else if self.simple_endstop(
                io,
                bus,
                cfg,
                block,
                &mut current,
                Switch::ZMax,
                Axis::Z,
                2,
            ) {
                finish = true;
            }
        }

        self.old_bits = current;
        finish
    }

    /// Sample one switch and fire it if this and the previous sample agree
    /// and the block moves its axis.
    #[allow(clippy::too_many_arguments)]
    fn simple_endstop(
        &self,
        io: &impl EndstopBank,
        bus: &MotionBus,
        cfg: &StepperConfig,
        block: &Block,
        current: &mut u16,
        switch: Switch,
        axis: Axis,
        slot: usize,
    ) -> bool {
        if !cfg.endstops.installed.contains(switch) {
            return false;
        }
        if io.triggered(switch) {
            *current |= switch.bit();
        }
        if *current & self.old_bits & switch.bit() != 0 && block.steps[slot] > 0 {
            self.capture_trigger(bus, cfg.kinematics, axis);
            bus.latch_endstop_hit(switch);
            return true;
        }
        false
    }

    /// Dual-Z pair: either switch stops the block, except while homing,
    /// where the block runs on (with per-motor gating) until both have
    /// fired.
    #[allow(clippy::too_many_arguments)]
    fn dual_z_endstop(
        &self,
        io: &impl EndstopBank,
        bus: &MotionBus,
        cfg: &StepperConfig,
        block: &Block,
        current: &mut u16,
        z_switch: Switch,
        z2_switch: Switch,
    ) -> bool {
        let installed = cfg.endstops.installed;
        if !installed.contains(z_switch) {
            return false;
        }
        if io.triggered(z_switch) {
            *current |= z_switch.bit();
        }
        if installed.contains(z2_switch) {
            if io.triggered(z2_switch) {
                *current |= z2_switch.bit();
            }
        } else if *current & z_switch.bit() != 0 {
            // Single switch serves both motors
            *current |= z2_switch.bit();
        }

        let z_hit = *current & self.old_bits & z_switch.bit() != 0;
        let z2_hit = *current & self.old_bits & z2_switch.bit() != 0;
        if (z_hit || z2_hit) && block.steps[2] > 0 {
            bus.set_trigger_steps(Axis::Z.index(), bus.step_count(2));
            bus.latch_endstop_hit(z_switch);
            // While homing the motors are gated individually; the block
            // only ends once both switches have fired.
            if !bus.homing() || (z_hit && z2_hit) {
                return true;
            }
        }
        false
    }

    /// Record the head position of `axis` at the moment of trigger,
    /// recovering it from the motor pair on core machines
    fn capture_trigger(&self, bus: &MotionBus, kinematics: Kinematics, axis: Axis) {
        let position = match kinematics.core_pair() {
            Some((first, second)) => {
                let core_axes = match kinematics {
                    Kinematics::CoreXy | Kinematics::CoreYx => [Axis::X, Axis::Y],
                    _ => [Axis::X, Axis::Z],
                };
                if core_axes.contains(&axis) {
                    kinematics.combine_core(
                        axis,
                        bus.step_count(first) as f32,
                        bus.step_count(second) as f32,
                    ) as i32
                } else {
                    bus.step_count(axis.index())
                }
            }
            None => bus.step_count(axis.index()),
        };
        bus.set_trigger_steps(axis.index(), position);
    }
}

//! State shared between the planner context and the stepper interrupt
//!
//! Everything in here is either a single machine word written by exactly
//! one side, or is only read as a coherent set inside a critical section
//! that masks the stepper interrupt. The block ring carries its own
//! producer/consumer protocol; see [`crate::planner::queue`].

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU16, AtomicU32, Ordering};

use crate::axis::{Switch, MAX_TOOLS, NUM_AXES};
use crate::planner::queue::BlockQueue;

/// Shared context for one motion core instance.
///
/// Lives wherever the host can hand both sides a reference, typically a
/// `static`. The planner owns the producer half, the stepper tick owns the
/// consumer half.
pub struct MotionBus {
    /// Ring of planned blocks
    pub queue: BlockQueue,
    /// Live motor positions in steps, written only by the stepper tick
    count_position: [AtomicI32; NUM_AXES],
    /// Latched endstop hits, one bit per [`Switch`]
    endstop_hits: AtomicU16,
    /// Motor positions captured at the moment each axis endstop fired
    endstop_trigsteps: [AtomicI32; 3],
    /// Remaining quick-stop drain firings
    cleaning_counter: AtomicU16,
    /// Endstop checking enabled
    endstops_enabled: AtomicBool,
    /// A homing move is in progress (alters dual-Z endstop handling)
    homing: AtomicBool,
    /// Hold the first Z motor while its twin finishes homing
    z_lock: AtomicBool,
    /// Hold the second Z motor while its twin finishes homing
    z2_lock: AtomicBool,
    /// Both X carriages mirror every move
    x_duplication: AtomicBool,
    /// Step rate the tick had to clamp, zero when none
    flagged_step_rate: AtomicU32,
    /// Pending extruder steps per tool, shared with the advance tick
    e_steps: [AtomicI32; MAX_TOOLS],
}

impl MotionBus {
    pub const fn new() -> Self {
        Self {
            queue: BlockQueue::new(),
            count_position: [const { AtomicI32::new(0) }; NUM_AXES],
            endstop_hits: AtomicU16::new(0),
            endstop_trigsteps: [const { AtomicI32::new(0) }; 3],
            cleaning_counter: AtomicU16::new(0),
            endstops_enabled: AtomicBool::new(true),
            homing: AtomicBool::new(false),
            z_lock: AtomicBool::new(false),
            z2_lock: AtomicBool::new(false),
            x_duplication: AtomicBool::new(false),
            flagged_step_rate: AtomicU32::new(0),
            e_steps: [const { AtomicI32::new(0) }; MAX_TOOLS],
        }
    }

    /// Coherent snapshot of all motor positions
    pub fn position_snapshot(&self) -> [i32; NUM_AXES] {
        critical_section::with(|_| {
            let mut out = [0i32; NUM_AXES];
            for (slot, pos) in out.iter_mut().zip(self.count_position.iter()) {
                *slot = pos.load(Ordering::Relaxed);
            }
            out
        })
    }

    /// Rewrite all motor positions, masking the stepper interrupt
    pub fn set_position(&self, steps: [i32; NUM_AXES]) {
        critical_section::with(|_| {
            for (pos, value) in self.count_position.iter().zip(steps) {
                pos.store(value, Ordering::Relaxed);
            }
        });
    }

    /// Rewrite the extruder motor position only
    pub fn set_e_position(&self, steps: i32) {
        critical_section::with(|_| {
            self.count_position[NUM_AXES - 1].store(steps, Ordering::Relaxed);
        });
    }

    pub(crate) fn step_count(&self, slot: usize) -> i32 {
        self.count_position[slot].load(Ordering::Relaxed)
    }

    pub(crate) fn bump_step_count(&self, slot: usize, dir: i8) {
        let pos = &self.count_position[slot];
        pos.store(
            pos.load(Ordering::Relaxed) + dir as i32,
            Ordering::Relaxed,
        );
    }

    /// Latched endstop hit bits; nonzero means at least one hit pending
    pub fn endstop_hits(&self) -> u16 {
        self.endstop_hits.load(Ordering::Relaxed)
    }

    /// Clear the endstop hit latch after the report has been consumed
    pub fn clear_endstop_hits(&self) {
        self.endstop_hits.store(0, Ordering::Relaxed);
    }

    pub(crate) fn latch_endstop_hit(&self, switch: Switch) {
        let hits = &self.endstop_hits;
        hits.store(hits.load(Ordering::Relaxed) | switch.bit(), Ordering::Relaxed);
    }

    pub(crate) fn set_trigger_steps(&self, axis_slot: usize, steps: i32) {
        self.endstop_trigsteps[axis_slot].store(steps, Ordering::Relaxed);
    }

    /// Motor position captured when the given axis endstop fired
    pub fn trigger_steps(&self, axis_slot: usize) -> i32 {
        critical_section::with(|_| self.endstop_trigsteps[axis_slot].load(Ordering::Relaxed))
    }

    pub(crate) fn load_cleaning_counter(&self, firings: u16) {
        self.cleaning_counter.store(firings, Ordering::Relaxed);
    }

    pub(crate) fn cleaning_counter(&self) -> u16 {
        self.cleaning_counter.load(Ordering::Relaxed)
    }

    pub(crate) fn decrement_cleaning_counter(&self) {
        let counter = &self.cleaning_counter;
        let now = counter.load(Ordering::Relaxed);
        counter.store(now.saturating_sub(1), Ordering::Relaxed);
    }

    pub fn endstops_enabled(&self) -> bool {
        self.endstops_enabled.load(Ordering::Relaxed)
    }

    pub fn set_endstops_enabled(&self, enabled: bool) {
        self.endstops_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn homing(&self) -> bool {
        self.homing.load(Ordering::Relaxed)
    }

    pub fn set_homing(&self, homing: bool) {
        self.homing.store(homing, Ordering::Relaxed);
    }

    pub fn z_locks(&self) -> (bool, bool) {
        (
            self.z_lock.load(Ordering::Relaxed),
            self.z2_lock.load(Ordering::Relaxed),
        )
    }

    pub fn lock_z_motor(&self, locked: bool) {
        self.z_lock.store(locked, Ordering::Relaxed);
    }

    pub fn lock_z2_motor(&self, locked: bool) {
        self.z2_lock.store(locked, Ordering::Relaxed);
    }

    pub fn x_duplication(&self) -> bool {
        self.x_duplication.load(Ordering::Relaxed)
    }

    pub fn set_x_duplication(&self, on: bool) {
        self.x_duplication.store(on, Ordering::Relaxed);
    }

    pub(crate) fn flag_step_rate(&self, rate: u32) {
        self.flagged_step_rate.store(rate, Ordering::Relaxed);
    }

    /// Take the latched too-high step rate, if the tick reported one
    pub fn take_flagged_step_rate(&self) -> Option<u32> {
        let rate = self.flagged_step_rate.load(Ordering::Relaxed);
        if rate == 0 {
            None
        } else {
            self.flagged_step_rate.store(0, Ordering::Relaxed);
            Some(rate)
        }
    }

    pub(crate) fn add_e_steps(&self, tool: usize, delta: i32) {
        let pending = &self.e_steps[tool];
        pending.store(pending.load(Ordering::Relaxed) + delta, Ordering::Relaxed);
    }

    pub(crate) fn e_steps(&self, tool: usize) -> i32 {
        self.e_steps[tool].load(Ordering::Relaxed)
    }

    pub(crate) fn take_e_step(&self, tool: usize) -> i8 {
        let pending = &self.e_steps[tool];
        let now = pending.load(Ordering::Relaxed);
        if now > 0 {
            pending.store(now - 1, Ordering::Relaxed);
            1
        } else if now < 0 {
            pending.store(now + 1, Ordering::Relaxed);
            -1
        } else {
            0
        }
    }
}

impl Default for MotionBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::axis::Switch;

    #[test]
    fn test_position_snapshot_roundtrip() {
        let bus = MotionBus::new();
        bus.set_position([100, -50, 7, 0]);
        assert_eq!(bus.position_snapshot(), [100, -50, 7, 0]);
        bus.set_e_position(42);
        assert_eq!(bus.position_snapshot(), [100, -50, 7, 42]);
    }

    #[test]
    fn test_endstop_latch_accumulates() {
        let bus = MotionBus::new();
        bus.latch_endstop_hit(Switch::XMin);
        bus.latch_endstop_hit(Switch::ZMin);
        assert_eq!(bus.endstop_hits(), Switch::XMin.bit() | Switch::ZMin.bit());
        bus.clear_endstop_hits();
        assert_eq!(bus.endstop_hits(), 0);
    }

    #[test]
    fn test_e_step_drain() {
        let bus = MotionBus::new();
        bus.add_e_steps(1, 2);
        bus.add_e_steps(1, -5);
        assert_eq!(bus.e_steps(1), -3);
        assert_eq!(bus.take_e_step(1), -1);
        assert_eq!(bus.take_e_step(1), -1);
        assert_eq!(bus.take_e_step(1), -1);
        assert_eq!(bus.take_e_step(1), 0);
    }

    #[test]
    fn test_flagged_rate_is_one_shot() {
        let bus = MotionBus::new();
        assert_eq!(bus.take_flagged_step_rate(), None);
        bus.flag_step_rate(50_000);
        assert_eq!(bus.take_flagged_step_rate(), Some(50_000));
        assert_eq!(bus.take_flagged_step_rate(), None);
    }
}

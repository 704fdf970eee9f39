//! The block: one queued move, sized in motor steps
//!
//! A block carries everything the stepper tick needs to execute the move
//! plus the planner-side speeds the look-ahead passes keep refining until
//! the block reaches the front of the queue.

use crate::axis::{DirectionBits, NUM_AXES};
use crate::config::LaserMode;

/// One queued move with its trapezoid profile.
///
/// Field ownership follows the ring protocol: step counts, directions and
/// peripheral captures are written once before the block is published; the
/// planner-side speeds belong to the look-ahead passes; the trapezoid
/// fields are only rewritten through a critical-section commit that checks
/// `busy` first.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Block {
    /// Unsigned step counts per motor slot
    pub steps: [u32; NUM_AXES],
    /// Bresenham master count: `max(steps)`, plus laser pulses if larger
    pub step_event_count: u32,
    /// Per-motor (and head pseudo-axis) direction bits, set = negative
    pub direction_bits: DirectionBits,
    /// Tool this move is attributed to
    pub active_tool: u8,
    /// Driver index for dual-carriage step routing
    pub active_driver: u8,
    /// Part-cooling fan PWM captured at enqueue time
    pub fan_speed: u8,
    /// Laser firing mode captured at enqueue time
    pub laser_mode: LaserMode,
    /// Laser intensity captured at enqueue time
    pub laser_intensity: u8,
    /// Laser pulses to fire across the block in pulsed mode
    pub laser_steps: u32,

    /// Euclidean path length in head space, mm
    pub millimeters: f32,
    /// Cruise speed, mm/s; always > 0 for a published block
    pub nominal_speed: f32,
    /// Cruise rate, steps/s
    pub nominal_rate: u32,
    /// Acceleration, mm/s²
    pub acceleration: f32,
    /// Acceleration, steps/s²
    pub acceleration_st: u32,
    /// Acceleration pre-scaled for the tick's 24.8 fixed-point integrator
    pub acceleration_rate: u32,

    /// Junction speed the look-ahead currently assigns, mm/s
    pub entry_speed: f32,
    /// Junction speed ceiling from the jerk limits, mm/s
    pub max_entry_speed: f32,

    /// Step index where acceleration ends
    pub accelerate_until: u32,
    /// Step index where deceleration begins
    pub decelerate_after: u32,
    /// Rate at the first step, steps/s
    pub initial_rate: u32,
    /// Rate at the last step, steps/s
    pub final_rate: u32,

    /// Advance pressure term at cruise (8.8 fixed point)
    pub advance: u32,
    /// Advance pressure term at the block entry (8.8 fixed point)
    pub initial_advance: u32,
    /// Advance pressure term at the block exit (8.8 fixed point)
    pub final_advance: u32,
    /// Advance slope per accelerated step
    pub advance_rate: u32,

    /// Block can reach nominal speed and still stop within its length;
    /// look-ahead may skip it
    pub nominal_length: bool,
    /// Trapezoid parameters are stale and need recomputation
    pub recalculate: bool,
    /// The stepper tick is executing this block; trapezoid commits must
    /// skip it
    pub busy: bool,
}

impl Block {
    pub const EMPTY: Block = Block {
        steps: [0; NUM_AXES],
        step_event_count: 0,
        direction_bits: DirectionBits(0),
        active_tool: 0,
        active_driver: 0,
        fan_speed: 0,
        laser_mode: LaserMode::Off,
        laser_intensity: 0,
        laser_steps: 0,
        millimeters: 0.0,
        nominal_speed: 0.0,
        nominal_rate: 0,
        acceleration: 0.0,
        acceleration_st: 0,
        acceleration_rate: 0,
        entry_speed: 0.0,
        max_entry_speed: 0.0,
        accelerate_until: 0,
        decelerate_after: 0,
        initial_rate: 0,
        final_rate: 0,
        advance: 0,
        initial_advance: 0,
        final_advance: 0,
        advance_rate: 0,
        nominal_length: false,
        recalculate: false,
        busy: false,
    };
}

impl Default for Block {
    fn default() -> Self {
        Self::EMPTY
    }
}

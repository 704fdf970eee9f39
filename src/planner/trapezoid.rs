//! Trapezoid profile mathematics
//!
//! All rates are in steps/s and accelerations in steps/s² unless a name
//! says otherwise. The derivations are the classic constant-acceleration
//! kinematics:
//!
//! - distance to change rate v0 -> v1 at acceleration a:
//!   `d = (v1² - v0²) / 2a`
//! - speed after distance d from v0: `v = sqrt(v0² + 2ad)`
//! - switchover point from +a to -a inside a segment of length d when no
//!   cruise plateau fits: `di = (2ad - v0² + v1²) / 4a`

use libm::{ceilf, floorf, sqrtf};

use super::block::Block;

/// Floor for the first and last step rate of any block; below this the
/// timer interval would overflow.
pub(crate) const MIN_STEP_RATE: u32 = 120;

/// Distance in steps needed to change rate `initial` -> `target` at
/// constant `acceleration`
pub(crate) fn accel_distance(initial: f32, target: f32, acceleration: f32) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (target * target - initial * initial) / (2.0 * acceleration)
}

/// Step index at which to flip from acceleration to deceleration so a
/// block of `distance` steps enters at `initial` and leaves at `final_`
/// without ever cruising
pub(crate) fn intersection_distance(
    initial: f32,
    final_: f32,
    acceleration: f32,
    distance: f32,
) -> f32 {
    if acceleration == 0.0 {
        return 0.0;
    }
    (2.0 * acceleration * distance - initial * initial + final_ * final_)
        / (4.0 * acceleration)
}

/// Largest speed at which a move may begin and still reach
/// `target_velocity` within `distance`, given `acceleration` (pass a
/// negative value for deceleration). Speeds in mm/s, distance in mm.
pub(crate) fn max_allowable_speed(acceleration: f32, target_velocity: f32, distance: f32) -> f32 {
    sqrtf(target_velocity * target_velocity - 2.0 * acceleration * distance)
}

/// A computed trapezoid, ready to commit into a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct Trapezoid {
    pub accelerate_until: u32,
    pub decelerate_after: u32,
    pub initial_rate: u32,
    pub final_rate: u32,
    pub initial_advance: u32,
    pub final_advance: u32,
}

/// Compute trapezoid parameters for a block so its entry and exit speeds
/// match the given fractions of nominal speed.
///
/// Pure computation; committing the result into a shared block goes
/// through the ring's masked commit.
pub(crate) fn plan_trapezoid(block: &Block, entry_factor: f32, exit_factor: f32) -> Trapezoid {
    let mut initial_rate = ceilf(block.nominal_rate as f32 * entry_factor) as u32;
    let mut final_rate = ceilf(block.nominal_rate as f32 * exit_factor) as u32;

    // Below this the step timer interval overflows
    initial_rate = initial_rate.max(MIN_STEP_RATE);
    final_rate = final_rate.max(MIN_STEP_RATE);

    let acceleration = block.acceleration_st as f32;
    let mut accelerate_steps = ceilf(accel_distance(
        initial_rate as f32,
        block.nominal_rate as f32,
        acceleration,
    )) as i32;
    let decelerate_steps = floorf(accel_distance(
        block.nominal_rate as f32,
        final_rate as f32,
        -acceleration,
    )) as i32;

    let mut plateau_steps = block.step_event_count as i32 - accelerate_steps - decelerate_steps;

    // No room to cruise: find where acceleration has to hand over to
    // deceleration so the exit rate is still met exactly.
    if plateau_steps < 0 {
        accelerate_steps = ceilf(intersection_distance(
            initial_rate as f32,
            final_rate as f32,
            acceleration,
            block.step_event_count as f32,
        )) as i32;
        // Numerical round-off can push the crossover just outside the block
        accelerate_steps = accelerate_steps.clamp(0, block.step_event_count as i32);
        plateau_steps = 0;
    }

    Trapezoid {
        accelerate_until: accelerate_steps as u32,
        decelerate_after: (accelerate_steps + plateau_steps) as u32,
        initial_rate,
        final_rate,
        initial_advance: (block.advance as f32 * entry_factor * entry_factor) as u32,
        final_advance: (block.advance as f32 * exit_factor * exit_factor) as u32,
    }
}

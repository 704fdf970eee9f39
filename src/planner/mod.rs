//! Look-ahead motion planner
//!
//! Buffers Cartesian moves as motor-space blocks and keeps re-planning
//! junction speeds across the whole queue so that every speed change fits
//! inside the acceleration envelope and no junction exceeds the jerk
//! limits. The planner runs in the cooperative foreground; the stepper
//! interrupt consumes blocks behind its back and the two meet only at the
//! ring indices and the masked trapezoid commits.

pub mod block;
pub mod queue;
pub(crate) mod trapezoid;

use libm::{fabsf, roundf, sqrtf};

use crate::axis::{
    Axis, DirectionBits, Position, Switch, DIR_X, DIR_Y, MAX_TOOLS, NUM_AXES,
};
use crate::config::{LaserMode, LaserSettings, MotionConfig};
use crate::kinematics::Kinematics;
use crate::shared::MotionBus;
use crate::stepper::timing::STEP_TIMER_HZ;
use crate::traits::{AuxBus, Host, MotorBus};
use crate::Motor;

use block::Block;
use queue::{BlockQueue, BLOCK_BUFFER_SIZE};
use trapezoid::{accel_distance, max_allowable_speed, plan_trapezoid};

/// Speed the last queued block always plans to decelerate to, so motion
/// can stop if no further block arrives. mm/s.
pub(crate) const MIN_PLANNER_SPEED: f32 = 0.05;

/// Moves at or below this many step events are dropped unless the laser
/// needs the block for pulse synchronization
const DROP_SEGMENTS: u32 = 5;

/// Buffer lengths of moves before an untouched extruder is powered down
const TOOL_IDLE_MOVES: u8 = (BLOCK_BUFFER_SIZE * 2) as u8;

/// Window slot count for the XY direction-flip frequency limit
const SEGMENT_WINDOW: usize = 3;

/// Diagnostics the foreground should poll and surface to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MotionEvent {
    /// E dropped from a move because the tool was not ready
    ColdExtrude { tool: u8 },
    /// E dropped from a move longer than the configured maximum
    LongExtrude { tool: u8 },
    /// The executor clamped a step rate above the timer's safe range
    StepRateClamped { rate: u32 },
}

/// Latched endstop hits, converted to axis positions
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndstopReport {
    /// Triggered switches and the axis position in mm where each fired
    pub hits: heapless::Vec<(Switch, f32), 6>,
    /// The hit aborted motion: the queue was flushed and the machine
    /// position must be re-established before the next move
    pub aborted: bool,
}

/// The look-ahead planner; the producer half of the motion core.
pub struct Planner<'a> {
    bus: &'a MotionBus,
    cfg: MotionConfig,
    /// Last commanded position in motor steps
    position: [i32; NUM_AXES],
    /// Per-slot speeds of the previous move, for junction jerk
    previous_speed: [f32; NUM_AXES],
    previous_nominal_speed: f32,
    last_tool: usize,
    /// Host-reported readiness (temperature) per tool
    tool_ready: [bool; MAX_TOOLS],
    /// Moves left before each idle extruder is powered down
    tool_idle_countdown: [u8; MAX_TOOLS],
    fan_speed: u8,
    laser: LaserSettings,
    /// Direction bits of the previous move, for the XY frequency limit
    old_direction_bits: DirectionBits,
    /// Accumulated same-direction segment times in µs, newest first
    axis_segment_time_us: [[i32; SEGMENT_WINDOW]; 2],
    abort_on_endstop_hit: bool,
    correction: Option<fn(&mut Position)>,
    events: heapless::Deque<MotionEvent, 8>,
}

impl<'a> Planner<'a> {
    pub fn new(bus: &'a MotionBus, cfg: MotionConfig) -> Self {
        Self {
            bus,
            cfg,
            position: [0; NUM_AXES],
            previous_speed: [0.0; NUM_AXES],
            previous_nominal_speed: 0.0,
            last_tool: 0,
            tool_ready: [true; MAX_TOOLS],
            tool_idle_countdown: [0; MAX_TOOLS],
            fan_speed: 0,
            laser: LaserSettings::default(),
            old_direction_bits: DirectionBits::default(),
            axis_segment_time_us: [[i32::MAX / 2, 0, 0]; 2],
            abort_on_endstop_hit: false,
            correction: None,
            events: heapless::Deque::new(),
        }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.cfg
    }

    /// Mutable access to the limits. If steps-per-mm change, call
    /// [`Planner::set_position`] afterwards to re-anchor the step
    /// position.
    pub fn config_mut(&mut self) -> &mut MotionConfig {
        &mut self.cfg
    }

    /// Fan PWM to capture into subsequently queued blocks
    pub fn set_fan_speed(&mut self, pwm: u8) {
        self.fan_speed = pwm;
    }

    /// Laser state to capture into subsequently queued blocks
    pub fn set_laser(&mut self, laser: LaserSettings) {
        self.laser = laser;
    }

    /// Mark a tool ready/not-ready for extrusion (temperature policy)
    pub fn set_tool_ready(&mut self, tool: u8, ready: bool) {
        self.tool_ready[tool as usize % MAX_TOOLS] = ready;
    }

    /// Abort the job (flush the queue) when a non-probe endstop fires
    pub fn set_abort_on_endstop_hit(&mut self, abort: bool) {
        self.abort_on_endstop_hit = abort;
    }

    /// Install a position correction applied to every target before
    /// planning (bed-level matrix, wobble or hysteresis compensation)
    pub fn set_position_correction(&mut self, correction: Option<fn(&mut Position)>) {
        self.correction = correction;
    }

    /// Append a linear move to the plan and re-optimize the queue.
    ///
    /// Blocks (yielding through [`Host::idle`]) while the ring is full.
    /// Returns `false` when the move was dropped as too short to step.
    pub fn buffer_line(
        &mut self,
        target: Position,
        feed_rate_mm_s: f32,
        tool: u8,
        driver: u8,
        io: &mut (impl MotorBus + Host),
    ) -> bool {
        let mut target = target;
        if let Some(correct) = self.correction {
            correct(&mut target);
        }
        let tool = (tool as usize).min(MAX_TOOLS - 1);

        // A full buffer means we are well ahead of the machine; rest here
        // until the interrupt frees a slot.
        while self.bus.queue.is_full() {
            io.idle();
        }

        let target_steps = [
            roundf(target.x * self.cfg.steps_per_mm[0]) as i32,
            roundf(target.y * self.cfg.steps_per_mm[1]) as i32,
            roundf(target.z * self.cfg.steps_per_mm[2]) as i32,
            roundf(target.e * self.cfg.e_steps_per_mm[tool]) as i32,
        ];

        // A tool with different E resolution invalidates the cached E step
        // position; rescale it before taking the delta.
        if tool != self.last_tool
            && self.cfg.e_steps_per_mm[tool] != self.cfg.e_steps_per_mm[self.last_tool]
        {
            let factor = self.cfg.e_steps_per_mm[tool] / self.cfg.e_steps_per_mm[self.last_tool];
            self.position[3] = roundf(self.position[3] as f32 * factor) as i32;
        }
        self.last_tool = tool;

        let dx = target_steps[0] - self.position[0];
        let dy = target_steps[1] - self.position[1];
        let dz = target_steps[2] - self.position[2];
        let mut de = target_steps[3] - self.position[3];

        if de != 0 {
            if self.cfg.prevent_cold_extrude && !self.tool_ready[tool] {
                // Behave as if the extrusion happened so the position
                // stays consistent, but only move the other axes.
                self.position[3] = target_steps[3];
                de = 0;
                let _ = self.events.push_back(MotionEvent::ColdExtrude { tool: tool as u8 });
                #[cfg(feature = "defmt")]
                defmt::warn!("cold extrusion prevented on T{=usize}", tool);
            }
            if de != 0
                && de.unsigned_abs() as f32
                    > self.cfg.e_steps_per_mm[tool] * self.cfg.max_extrude_length_mm
            {
                self.position[3] = target_steps[3];
                de = 0;
                let _ = self.events.push_back(MotionEvent::LongExtrude { tool: tool as u8 });
                #[cfg(feature = "defmt")]
                defmt::warn!("over-long extrusion prevented on T{=usize}", tool);
            }
        }

        let cartesian = [dx, dy, dz, de];
        let motor = self.cfg.kinematics.motor_deltas(cartesian);

        let mut block = Block::EMPTY;
        block.active_tool = tool as u8;
        block.active_driver = driver;

        let e_scale = self.cfg.volumetric_multiplier[tool] * self.cfg.flow_multiplier[tool];
        block.steps = [
            motor[0].unsigned_abs(),
            motor[1].unsigned_abs(),
            motor[2].unsigned_abs(),
            (motor[3].unsigned_abs() as f32 * e_scale) as u32,
        ];
        block.step_event_count = *block.steps.iter().max().unwrap_or(&0);

        // Nothing to step. Laser moves stay queued regardless so pulse
        // trains remain synchronized with motion.
        if block.step_event_count <= DROP_SEGMENTS && self.laser.mode == LaserMode::Off {
            return false;
        }

        block.fan_speed = self.fan_speed;
        block.laser_mode = self.laser.mode;
        block.laser_intensity = self.laser.intensity;
        block.direction_bits = self.cfg.kinematics.direction_bits(cartesian, motor);

        self.power_moving_motors(&block, io);

        let feed_rate = if block.steps[3] != 0 {
            feed_rate_mm_s.max(self.cfg.min_feedrate_mm_s)
        } else {
            feed_rate_mm_s.max(self.cfg.min_travel_feedrate_mm_s)
        };

        // Path length lives in head space; on core machines the motor
        // millimeters differ and feed the per-motor speed clamps instead.
        let spm = &self.cfg.steps_per_mm;
        let head_mm = [
            dx as f32 / spm[0],
            dy as f32 / spm[1],
            dz as f32 / spm[2],
        ];
        let mut motor_mm = [head_mm[0], head_mm[1], head_mm[2], 0.0];
        match self.cfg.kinematics {
            Kinematics::Cartesian => {}
            Kinematics::CoreXy | Kinematics::CoreYx => {
                motor_mm[0] = motor[0] as f32 / spm[0];
                motor_mm[1] = motor[1] as f32 / spm[1];
            }
            Kinematics::CoreXz | Kinematics::CoreZx => {
                motor_mm[0] = motor[0] as f32 / spm[0];
                motor_mm[2] = motor[2] as f32 / spm[2];
            }
        }
        motor_mm[3] = (de as f32 / self.cfg.e_steps_per_mm[tool]) * e_scale;

        block.millimeters = if block.steps[0] <= DROP_SEGMENTS
            && block.steps[1] <= DROP_SEGMENTS
            && block.steps[2] <= DROP_SEGMENTS
        {
            fabsf(motor_mm[3])
        } else {
            sqrtf(
                head_mm[0] * head_mm[0] + head_mm[1] * head_mm[1] + head_mm[2] * head_mm[2],
            )
        };
        if block.millimeters <= 0.0 {
            return false;
        }

        // The laser pulse train rides the Bresenham master count
        if self.laser.mode == LaserMode::Pulsed {
            block.laser_steps = (block.millimeters * self.laser.pulses_per_mm) as u32;
            block.step_event_count = block.step_event_count.max(block.laser_steps);
        }

        let inverse_mm = 1.0 / block.millimeters;
        let mut inverse_second = feed_rate * inverse_mm;

        let moves_queued = self.bus.queue.len();

        // Slow down as the buffer drains instead of stuttering at corners
        // waiting for a refill.
        let mut segment_time_us = roundf(1_000_000.0 / inverse_second) as i32;
        if self.cfg.slowdown
            && moves_queued > 1
            && moves_queued < BLOCK_BUFFER_SIZE / 2
            && (segment_time_us as u32) < self.cfg.min_segment_time_us
        {
            let shortfall = self.cfg.min_segment_time_us as i32 - segment_time_us;
            inverse_second =
                1_000_000.0 / (segment_time_us + 2 * shortfall / moves_queued as i32) as f32;
            segment_time_us = roundf(1_000_000.0 / inverse_second) as i32;
        }

        block.nominal_speed = block.millimeters * inverse_second;
        block.nominal_rate = libm::ceilf(block.step_event_count as f32 * inverse_second) as u32;

        // Clamp so no single motor exceeds its speed limit
        let mut current_speed = [0.0f32; NUM_AXES];
        let mut speed_factor = 1.0f32;
        for (slot, axis) in Axis::ALL.iter().enumerate() {
            current_speed[slot] = motor_mm[slot] * inverse_second;
            let speed = fabsf(current_speed[slot]);
            let limit = self.cfg.axis_max_feedrate(*axis, tool as u8);
            if speed > limit {
                speed_factor = speed_factor.min(limit / speed);
            }
        }

        if self.cfg.xy_frequency_limit_hz.is_some() {
            speed_factor = self.xy_frequency_factor(&block, segment_time_us, speed_factor);
        }

        if speed_factor < 1.0 {
            for speed in current_speed.iter_mut() {
                *speed *= speed_factor;
            }
            block.nominal_speed *= speed_factor;
            block.nominal_rate = (block.nominal_rate as f32 * speed_factor) as u32;
        }

        // Acceleration choice: travel, retract or printing profile, then
        // clamped so no motor exceeds its own ceiling.
        let steps_per_mm = block.step_event_count as f32 * inverse_mm;
        let profile_accel = if block.steps[0] == 0 && block.steps[1] == 0 && block.steps[2] == 0 {
            self.cfg.retract_acceleration_mm_s2[tool]
        } else if block.steps[3] == 0 {
            self.cfg.travel_acceleration_mm_s2
        } else {
            self.cfg.acceleration_mm_s2
        };
        let mut acc_st = libm::ceilf(profile_accel * steps_per_mm) as u32;
        for (slot, axis) in Axis::ALL.iter().enumerate() {
            if block.steps[slot] == 0 {
                continue;
            }
            let limit = self.cfg.axis_max_acceleration_steps(*axis, tool as u8);
            if acc_st as f32 * block.steps[slot] as f32 / block.step_event_count as f32 > limit {
                acc_st = limit as u32;
            }
        }
        block.acceleration_st = acc_st;
        block.acceleration = acc_st as f32 / steps_per_mm;
        block.acceleration_rate = ((acc_st as u64 * (1u64 << 24)) / STEP_TIMER_HZ as u64) as u32;

        // Jerk-limited junction speed. The safe fallback is half the
        // smallest applicable jerk, reachable from any previous state.
        let mut vmax_junction = self.cfg.max_xy_jerk_mm_s / 2.0;
        let half_z_jerk = self.cfg.max_z_jerk_mm_s / 2.0;
        let half_e_jerk = self.cfg.max_e_jerk_mm_s[tool] / 2.0;
        if fabsf(current_speed[2]) > half_z_jerk {
            vmax_junction = vmax_junction.min(half_z_jerk);
        }
        if fabsf(current_speed[3]) > half_e_jerk {
            vmax_junction = vmax_junction.min(half_e_jerk);
        }
        vmax_junction = vmax_junction.min(block.nominal_speed);
        let safe_speed = vmax_junction;

        if moves_queued > 0 && self.previous_nominal_speed > 0.0001 {
            let dsx = current_speed[0] - self.previous_speed[0];
            let dsy = current_speed[1] - self.previous_speed[1];
            let dsz = fabsf(current_speed[2] - self.previous_speed[2]);
            let dse = fabsf(current_speed[3] - self.previous_speed[3]);
            let xy_jerk = sqrtf(dsx * dsx + dsy * dsy);
            let mut factor = 1.0f32;
            vmax_junction = block.nominal_speed;
            if xy_jerk > self.cfg.max_xy_jerk_mm_s {
                factor = self.cfg.max_xy_jerk_mm_s / xy_jerk;
            }
            if dsz > self.cfg.max_z_jerk_mm_s {
                factor = factor.min(self.cfg.max_z_jerk_mm_s / dsz);
            }
            if dse > self.cfg.max_e_jerk_mm_s[tool] {
                factor = factor.min(self.cfg.max_e_jerk_mm_s[tool] / dse);
            }
            vmax_junction = self.previous_nominal_speed.min(vmax_junction * factor);
        }
        block.max_entry_speed = vmax_junction;

        let v_allowable =
            max_allowable_speed(-block.acceleration, MIN_PLANNER_SPEED, block.millimeters);
        block.entry_speed = vmax_junction.min(v_allowable);
        // A block that can decelerate from nominal to rest inside its own
        // length always reaches its junction speeds; look-ahead may skip it.
        block.nominal_length = block.nominal_speed <= v_allowable;
        block.recalculate = true;

        self.previous_speed = current_speed;
        self.previous_nominal_speed = block.nominal_speed;

        if let Some(advance) = self.cfg.advance {
            let has_carriage_motion =
                block.steps[0] != 0 || block.steps[1] != 0 || block.steps[2] != 0;
            if block.steps[3] == 0 || !has_carriage_motion {
                block.advance = 0;
                block.advance_rate = 0;
            } else {
                let accel_steps = accel_distance(
                    0.0,
                    block.nominal_rate as f32,
                    block.acceleration_st as f32,
                );
                let e_speed = current_speed[3];
                let lead = advance.steps_per_cubic_mm
                    * advance.k
                    * e_speed
                    * e_speed
                    * advance.extrusion_area_mm2
                    * advance.extrusion_area_mm2
                    * 256.0;
                block.advance = lead as u32;
                block.advance_rate = if accel_steps > 0.0 {
                    (lead / accel_steps) as u32
                } else {
                    0
                };
            }
        }

        // First trapezoid for the unpublished block: exit at the safe
        // speed so the plan is always stoppable as queued.
        let trapezoid = plan_trapezoid(
            &block,
            block.entry_speed / block.nominal_speed,
            safe_speed / block.nominal_speed,
        );
        block.accelerate_until = trapezoid.accelerate_until;
        block.decelerate_after = trapezoid.decelerate_after;
        block.initial_rate = trapezoid.initial_rate;
        block.final_rate = trapezoid.final_rate;
        block.initial_advance = trapezoid.initial_advance;
        block.final_advance = trapezoid.final_advance;

        let published = self.bus.queue.push(block);
        debug_assert!(published, "ring slot vanished between wait and push");

        self.position = target_steps;

        self.recalculate();
        io.wake_stepper();
        true
    }

    /// Energize every motor this block moves, and manage the idle-tool
    /// power-down countdown.
    fn power_moving_motors(&mut self, block: &Block, io: &mut impl MotorBus) {
        match self.cfg.kinematics {
            Kinematics::CoreXy | Kinematics::CoreYx => {
                if block.steps[0] != 0 || block.steps[1] != 0 {
                    io.enable(Motor::X);
                    io.enable(Motor::Y);
                }
                if block.steps[2] != 0 {
                    io.enable(Motor::Z);
                }
            }
            Kinematics::CoreXz | Kinematics::CoreZx => {
                if block.steps[0] != 0 || block.steps[2] != 0 {
                    io.enable(Motor::X);
                    io.enable(Motor::Z);
                }
                if block.steps[1] != 0 {
                    io.enable(Motor::Y);
                }
            }
            Kinematics::Cartesian => {
                if block.steps[0] != 0 {
                    io.enable(Motor::X);
                }
                if block.steps[1] != 0 {
                    io.enable(Motor::Y);
                }
                if block.steps[2] != 0 {
                    io.enable(Motor::Z);
                }
            }
        }

        if block.steps[3] != 0 {
            let tool = block.active_tool as usize;
            if self.cfg.disable_inactive_tools {
                for countdown in self.tool_idle_countdown.iter_mut() {
                    *countdown = countdown.saturating_sub(1);
                }
                io.enable(Motor::E(tool as u8));
                self.tool_idle_countdown[tool] = TOOL_IDLE_MOVES;
                for other in 0..MAX_TOOLS {
                    if other != tool && self.tool_idle_countdown[other] == 0 {
                        io.disable(Motor::E(other as u8));
                    }
                }
            } else {
                io.enable(Motor::E(tool as u8));
            }
        }
    }

    /// Additional speed factor that keeps XY direction flips below the
    /// configured frequency, using a 3-deep window of segment times per
    /// axis.
    fn xy_frequency_factor(
        &mut self,
        block: &Block,
        segment_time_us: i32,
        speed_factor: f32,
    ) -> f32 {
        let Some(limit_hz) = self.cfg.xy_frequency_limit_hz else {
            return speed_factor;
        };
        let max_freq_time_us = 1_000_000.0 / limit_hz;

        let direction_change = block.direction_bits.0 ^ self.old_direction_bits.0;
        self.old_direction_bits = block.direction_bits;
        let segment_time = roundf(segment_time_us as f32 / speed_factor) as i32;

        for (slot, bit) in [(0usize, DIR_X), (1usize, DIR_Y)] {
            let window = &mut self.axis_segment_time_us[slot];
            if direction_change & (1 << bit) != 0 {
                window[2] = window[1];
                window[1] = window[0];
                window[0] = 0;
            }
            window[0] = window[0].saturating_add(segment_time);
        }

        let max_x = self.axis_segment_time_us[0]
            .iter()
            .copied()
            .max()
            .unwrap_or(0);
        let max_y = self.axis_segment_time_us[1]
            .iter()
            .copied()
            .max()
            .unwrap_or(0);
        let min_xy = max_x.min(max_y);
        if (min_xy as f32) < max_freq_time_us {
            speed_factor.min(speed_factor * min_xy as f32 / max_freq_time_us)
        } else {
            speed_factor
        }
    }

    /// Re-plan junction speeds across the whole queue, then recompute the
    /// trapezoids whose junctions changed.
    fn recalculate(&mut self) {
        self.reverse_pass();
        self.forward_pass();
        self.recalculate_trapezoids();
    }

    /// Walk the plan newest-to-oldest, lowering entry speeds so each block
    /// can still decelerate to its successor's entry speed.
    fn reverse_pass(&mut self) {
        let queue = &self.bus.queue;
        let head = queue.head();
        let tail = queue.tail();
        if head.wrapping_sub(tail) & (BLOCK_BUFFER_SIZE - 1) <= 3 {
            return;
        }

        let mut index = BlockQueue::back_index(head, 3);
        let mut window: [Option<usize>; 3] = [None, None, None];
        while index != tail {
            index = BlockQueue::prev_index(index);
            window[2] = window[1];
            window[1] = window[0];
            window[0] = Some(index);
            self.reverse_kernel(window[1], window[2]);
        }
    }

    fn reverse_kernel(&self, current: Option<usize>, next: Option<usize>) {
        let (Some(current), Some(next)) = (current, next) else {
            // The newest block was initialized during ingress and is
            // always recalculated; nothing to do without a successor.
            return;
        };
        let queue = &self.bus.queue;
        let next_entry = queue.with_plan_block(next, |b| b.entry_speed);
        queue.with_plan_block(current, |cur| {
            if cur.entry_speed != cur.max_entry_speed {
                // A nominal-length block always reaches its junction
                // speed; otherwise cap by what deceleration allows.
                let entry = if !cur.nominal_length && cur.max_entry_speed > next_entry {
                    cur.max_entry_speed
                        .min(max_allowable_speed(-cur.acceleration, next_entry, cur.millimeters))
                } else {
                    cur.max_entry_speed
                };
                if entry != cur.entry_speed {
                    cur.entry_speed = entry;
                    cur.recalculate = true;
                }
            }
        });
    }

    /// Walk the plan oldest-to-newest, lowering entry speeds the previous
    /// block cannot accelerate up to.
    fn forward_pass(&mut self) {
        let queue = &self.bus.queue;
        let head = queue.head();
        let tail = queue.tail();

        let mut window: [Option<usize>; 3] = [None, None, None];
        let mut index = tail;
        while index != head {
            window[0] = window[1];
            window[1] = window[2];
            window[2] = Some(index);
            self.forward_kernel(window[0], window[1]);
            index = BlockQueue::next_index(index);
        }
        self.forward_kernel(window[1], window[2]);
    }

    fn forward_kernel(&self, previous: Option<usize>, current: Option<usize>) {
        let (Some(previous), Some(current)) = (previous, current) else {
            return;
        };
        let queue = &self.bus.queue;
        let (prev_nominal_length, prev_entry, prev_accel, prev_mm) = queue
            .with_plan_block(previous, |b| {
                (b.nominal_length, b.entry_speed, b.acceleration, b.millimeters)
            });
        if prev_nominal_length {
            return;
        }
        queue.with_plan_block(current, |cur| {
            if prev_entry < cur.entry_speed {
                let entry = cur
                    .entry_speed
                    .min(max_allowable_speed(-prev_accel, prev_entry, prev_mm));
                if entry != cur.entry_speed {
                    cur.entry_speed = entry;
                    cur.recalculate = true;
                }
            }
        });
    }

    /// Recompute trapezoids for every block whose junction speeds moved.
    /// The newest block always exits at `MIN_PLANNER_SPEED` and is always
    /// recomputed.
    fn recalculate_trapezoids(&mut self) {
        let queue = &self.bus.queue;
        let head = queue.head();
        let tail = queue.tail();

        let mut current: Option<usize> = None;
        let mut index = tail;
        while index != head {
            let next = index;
            if let Some(cur) = current {
                let (cur_recalc, cur_entry, cur_nominal) =
                    queue.with_plan_block(cur, |b| (b.recalculate, b.entry_speed, b.nominal_speed));
                let (next_recalc, next_entry) =
                    queue.with_plan_block(next, |b| (b.recalculate, b.entry_speed));
                if cur_recalc || next_recalc {
                    let trapezoid = queue.with_plan_block(cur, |b| {
                        plan_trapezoid(b, cur_entry / cur_nominal, next_entry / cur_nominal)
                    });
                    queue.commit_trapezoid(cur, &trapezoid);
                    // Clear only the current flag so the next pair still
                    // sees its own pending recalculation.
                    queue.with_plan_block(cur, |b| b.recalculate = false);
                }
            }
            current = Some(next);
            index = BlockQueue::next_index(index);
        }

        if let Some(last) = current {
            let trapezoid = queue.with_plan_block(last, |b| {
                plan_trapezoid(
                    b,
                    b.entry_speed / b.nominal_speed,
                    MIN_PLANNER_SPEED / b.nominal_speed,
                )
            });
            queue.commit_trapezoid(last, &trapezoid);
            queue.with_plan_block(last, |b| b.recalculate = false);
        }
    }

    /// Rewrite the planner and executor positions in one critical section
    /// and reset the junction state; motion is assumed to restart from
    /// rest.
    pub fn set_position(&mut self, position: Position) {
        let mut position = position;
        if let Some(correct) = self.correction {
            correct(&mut position);
        }
        self.position = [
            roundf(position.x * self.cfg.steps_per_mm[0]) as i32,
            roundf(position.y * self.cfg.steps_per_mm[1]) as i32,
            roundf(position.z * self.cfg.steps_per_mm[2]) as i32,
            roundf(position.e * self.cfg.e_steps_per_mm[self.last_tool]) as i32,
        ];
        let motor = self.cfg.kinematics.motor_deltas(self.position);
        self.bus.set_position(motor);
        self.previous_nominal_speed = 0.0;
        self.previous_speed = [0.0; NUM_AXES];
    }

    /// Rewrite the extruder position only
    pub fn set_e_position(&mut self, e_mm: f32) {
        self.position[3] = roundf(e_mm * self.cfg.e_steps_per_mm[self.last_tool]) as i32;
        self.bus.set_e_position(self.position[3]);
    }

    /// Last commanded position in mm, from the planner's own step counts
    pub fn logical_position(&self) -> Position {
        Position {
            x: self.position[0] as f32 / self.cfg.steps_per_mm[0],
            y: self.position[1] as f32 / self.cfg.steps_per_mm[1],
            z: self.position[2] as f32 / self.cfg.steps_per_mm[2],
            e: self.position[3] as f32 / self.cfg.e_steps_per_mm[self.last_tool],
        }
    }

    /// Live axis position in mm from the executor's step counters,
    /// combining the coupled motors on core machines
    pub fn live_axis_position_mm(&self, axis: Axis) -> f32 {
        let steps_per_mm = self
            .cfg
            .axis_steps_per_mm(axis, self.last_tool as u8);
        let counts = self.bus.position_snapshot();
        if let Some((first, second)) = self.cfg.kinematics.core_pair() {
            let combined_axes = match self.cfg.kinematics {
                Kinematics::CoreXy | Kinematics::CoreYx => [Axis::X, Axis::Y],
                _ => [Axis::X, Axis::Z],
            };
            if combined_axes.contains(&axis) {
                let head = self.cfg.kinematics.combine_core(
                    axis,
                    counts[first] as f32,
                    counts[second] as f32,
                );
                return head / steps_per_mm;
            }
        }
        counts[axis.index()] as f32 / steps_per_mm
    }

    /// Block the caller until every queued step has been executed
    pub fn synchronize(&self, io: &mut impl Host) {
        while !self.bus.queue.is_empty() {
            io.idle();
        }
    }

    /// Flush the queue without finishing in-flight motion. The executor
    /// drains its cleaning counter at a safe rate; the machine position is
    /// unknown afterwards and must be re-established.
    pub fn quick_stop(&self) {
        self.bus
            .load_cleaning_counter(crate::stepper::CLEANING_BUFFER_FIRINGS);
        self.bus.queue.clear();
    }

    /// Wait for motion to finish, then power every motor down
    pub fn finish_and_disable(&mut self, io: &mut (impl MotorBus + Host)) {
        self.synchronize(io);
        for motor in [Motor::X, Motor::X2, Motor::Y, Motor::Z, Motor::Z2] {
            io.disable(motor);
        }
        for tool in 0..MAX_TOOLS {
            io.disable(Motor::E(tool as u8));
        }
    }

    /// Enable or disable endstop checking in the executor
    pub fn enable_endstops(&self, enabled: bool) {
        self.bus.set_endstops_enabled(enabled);
    }

    /// Scan the queue, power down configured idle axes and apply the
    /// executing block's fan speed. Meant to be called from the host's
    /// periodic housekeeping.
    pub fn check_axes_activity(&self, io: &mut (impl MotorBus + AuxBus)) {
        let queue = &self.bus.queue;
        let mut active = [false; NUM_AXES];
        let mut tail_fan_speed = self.fan_speed;

        let head = queue.head();
        let tail = queue.tail();
        if tail != head {
            tail_fan_speed = queue.with_plan_block(tail, |b| b.fan_speed);
            let mut index = tail;
            while index != head {
                let steps = queue.with_plan_block(index, |b| b.steps);
                for (slot, moved) in active.iter_mut().enumerate() {
                    *moved |= steps[slot] != 0;
                }
                index = BlockQueue::next_index(index);
            }
        }

        let motors = [Motor::X, Motor::Y, Motor::Z];
        for slot in 0..3 {
            if self.cfg.disable_idle_axes[slot] && !active[slot] {
                io.disable(motors[slot]);
            }
        }
        if self.cfg.disable_idle_e && !active[3] {
            for tool in 0..MAX_TOOLS {
                io.disable(Motor::E(tool as u8));
            }
        }

        io.set_fan(tail_fan_speed);
    }

    /// Pop the next queued diagnostic, including step-rate clamps latched
    /// by the executor
    pub fn next_event(&mut self) -> Option<MotionEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }
        self.bus
            .take_flagged_step_rate()
            .map(|rate| MotionEvent::StepRateClamped { rate })
    }

    /// Consume latched endstop hits.
    ///
    /// Returns the triggered switches with the axis position at the
    /// trigger; when abort-on-hit is set and a non-probe switch fired, the
    /// queue is flushed and `aborted` is set so the caller can stop the
    /// job and mark the position unknown.
    pub fn endstop_report(&mut self) -> Option<EndstopReport> {
        let hits = self.bus.endstop_hits();
        if hits == 0 {
            return None;
        }

        let mut report = EndstopReport::default();
        for switch in [
            Switch::XMin,
            Switch::XMax,
            Switch::YMin,
            Switch::YMax,
            Switch::ZMin,
            Switch::ZMax,
            Switch::ZProbe,
        ] {
            if hits & switch.bit() != 0 {
                let axis = switch.axis();
                let steps = self.bus.trigger_steps(axis.index());
                let mm = steps as f32 / self.cfg.axis_steps_per_mm(axis, self.last_tool as u8);
                let _ = report.hits.push((switch, mm));
                #[cfg(feature = "defmt")]
                defmt::debug!("endstop hit: {} at {=f32} mm", switch, mm);
            }
        }

        if self.abort_on_endstop_hit && hits & !Switch::ZProbe.bit() != 0 {
            self.quick_stop();
            report.aborted = true;
            #[cfg(feature = "defmt")]
            defmt::warn!("endstop hit aborted the job");
        }

        self.bus.clear_endstop_hits();
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::trapezoid::MIN_STEP_RATE;
    use super::*;
    use crate::axis::Motor;
    use crate::testio::{motor_index, SimIo};

    fn test_cfg() -> MotionConfig {
        MotionConfig {
            slowdown: false,
            ..MotionConfig::default()
        }
    }

    fn collect_blocks(bus: &MotionBus) -> ([Block; BLOCK_BUFFER_SIZE], usize) {
        let mut blocks = [Block::EMPTY; BLOCK_BUFFER_SIZE];
        let mut count = 0;
        let head = bus.queue.head();
        let mut index = bus.queue.tail();
        while index != head {
            blocks[count] = bus.queue.with_plan_block(index, |b| *b);
            count += 1;
            index = BlockQueue::next_index(index);
        }
        (blocks, count)
    }

    fn assert_queue_invariants(bus: &MotionBus) {
        let (blocks, count) = collect_blocks(bus);
        for b in &blocks[..count] {
            assert!(b.nominal_speed > 0.0);
            assert!(b.accelerate_until <= b.decelerate_after);
            assert!(b.decelerate_after <= b.step_event_count);
            assert!(b.initial_rate >= MIN_STEP_RATE);
            assert!(b.final_rate >= MIN_STEP_RATE);
            assert!(b.initial_rate <= b.nominal_rate.max(MIN_STEP_RATE));
            assert!(b.final_rate <= b.nominal_rate.max(MIN_STEP_RATE));
            assert!(b.entry_speed <= b.max_entry_speed + 1e-3);
            assert!(b.max_entry_speed <= b.nominal_speed + 1e-3);
        }
        // Reachability between neighbors: each entry speed must be
        // attainable from the previous block's entry within its length.
        for pair in blocks[..count].windows(2) {
            let (prev, cur) = (&pair[0], &pair[1]);
            let reachable = sqrtf(
                prev.entry_speed * prev.entry_speed
                    + 2.0 * prev.acceleration * prev.millimeters,
            );
            assert!(
                cur.entry_speed <= reachable + 1e-2,
                "entry {} unreachable from {} over {} mm",
                cur.entry_speed,
                prev.entry_speed,
                prev.millimeters,
            );
        }
    }

    #[test]
    fn test_single_move_plans_expected_block() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        assert!(planner.buffer_line(Position::new(10.0, 0.0, 0.0, 0.0), 60.0, 0, 0, &mut io));
        assert_eq!(bus.queue.len(), 1);

        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(count, 1);
        let b = &blocks[0];
        assert_eq!(b.steps, [800, 0, 0, 0]);
        assert_eq!(b.step_event_count, 800);
        assert_eq!(b.nominal_rate, 4800);
        assert!((b.nominal_speed - 60.0).abs() < 1e-3);
        assert!((b.millimeters - 10.0).abs() < 1e-4);
        // Long enough to stop from cruise within its own length
        assert!(b.nominal_length);
        // A first move starts from rest: the junction ceiling is the safe
        // half-jerk speed.
        assert!((b.max_entry_speed - 5.0).abs() < 1e-3);
        assert!((b.entry_speed - 5.0).abs() < 1e-3);
        // 4800 steps/s scaled by the 5/60 entry factor, ceiling rounded
        assert!((400..=401).contains(&b.initial_rate));
        // The newest block always plans to exit at MIN_PLANNER_SPEED
        assert_eq!(b.final_rate, MIN_STEP_RATE);
        assert!(io.enabled[motor_index(Motor::X)]);
        // The ring had room: the producer never had to yield
        assert_eq!(io.idles, 0);
        assert_queue_invariants(&bus);
    }

    #[test]
    fn test_corner_is_jerk_limited() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        planner.buffer_line(Position::new(10.0, 0.0, 0.0, 0.0), 60.0, 0, 0, &mut io);
        planner.buffer_line(Position::new(10.0, 10.0, 0.0, 0.0), 60.0, 0, 0, &mut io);

        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(count, 2);
        let (a, b) = (&blocks[0], &blocks[1]);

        // 90° corner at 60 mm/s: jerk would be 84.85 mm/s, so the junction
        // is scaled to 60 * 10 / 84.85 = 7.07 mm/s.
        assert!((b.max_entry_speed - 7.071).abs() < 0.01);
        assert!((b.entry_speed - 7.071).abs() < 0.01);
        // The first block now decelerates to the junction speed
        assert!((565..=567).contains(&a.final_rate));

        // Junction jerk stays inside the configured bound
        let jerk = sqrtf(2.0) * b.entry_speed;
        assert!(jerk <= planner.config().max_xy_jerk_mm_s + 1e-3);
        assert_queue_invariants(&bus);
    }

    #[test]
    fn test_short_segment_is_dropped() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        // 0.05 mm at 80 steps/mm is 4 steps: below the drop threshold
        assert!(!planner.buffer_line(Position::new(0.05, 0.0, 0.0, 0.0), 60.0, 0, 0, &mut io));
        assert!(bus.queue.is_empty());
    }

    #[test]
    fn test_cold_extrude_drops_e_component() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.prevent_cold_extrude = true;
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        planner.set_tool_ready(0, false);
        assert!(planner.buffer_line(Position::new(10.0, 0.0, 0.0, 5.0), 30.0, 0, 0, &mut io));

        let (blocks, _) = collect_blocks(&bus);
        assert_eq!(blocks[0].steps[3], 0, "E must be dropped");
        assert_eq!(blocks[0].steps[0], 800, "XY still moves");
        assert_eq!(planner.next_event(), Some(MotionEvent::ColdExtrude { tool: 0 }));

        // The planner position advanced as if the extrusion happened, so
        // a later hot move does not re-extrude the dropped length.
        planner.set_tool_ready(0, true);
        planner.buffer_line(Position::new(20.0, 0.0, 0.0, 5.0), 30.0, 0, 0, &mut io);
        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(blocks[count - 1].steps[3], 0);
    }

    #[test]
    fn test_long_extrude_drops_e_component() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.max_extrude_length_mm = 100.0;
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        assert!(planner.buffer_line(Position::new(10.0, 0.0, 0.0, 500.0), 30.0, 0, 0, &mut io));
        let (blocks, _) = collect_blocks(&bus);
        assert_eq!(blocks[0].steps[3], 0);
        assert_eq!(planner.next_event(), Some(MotionEvent::LongExtrude { tool: 0 }));
    }

    #[test]
    fn test_acceleration_profile_selection() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        // Pure retract
        planner.buffer_line(Position::new(0.0, 0.0, 0.0, -2.0), 25.0, 0, 0, &mut io);
        // Travel
        planner.buffer_line(Position::new(10.0, 0.0, 0.0, -2.0), 100.0, 0, 0, &mut io);
        // Printing
        planner.buffer_line(Position::new(20.0, 0.0, 0.0, 1.0), 40.0, 0, 0, &mut io);

        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(count, 3);
        assert!((blocks[0].acceleration - 3000.0).abs() < 1.0);
        assert!((blocks[1].acceleration - 1500.0).abs() < 1.0);
        assert!((blocks[2].acceleration - 1000.0).abs() < 1.0);
        assert_queue_invariants(&bus);
    }

    #[test]
    fn test_axis_speed_clamp() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        // Z tops out at 5 mm/s no matter the requested feed
        planner.buffer_line(Position::new(0.0, 0.0, 5.0, 0.0), 60.0, 0, 0, &mut io);
        let (blocks, _) = collect_blocks(&bus);
        assert!((blocks[0].nominal_speed - 5.0).abs() < 0.01);

        // The per-axis velocity bound holds: mm per axis over block
        // duration never exceeds the axis limit.
        let duration = blocks[0].millimeters / blocks[0].nominal_speed;
        assert!(5.0 / duration <= planner.config().max_feedrate_mm_s[2] + 1e-3);
    }

    #[test]
    fn test_corexy_uses_head_frame_length() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.kinematics = Kinematics::CoreXy;
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        planner.buffer_line(Position::new(10.0, 10.0, 0.0, 0.0), 60.0, 0, 0, &mut io);
        let (blocks, _) = collect_blocks(&bus);
        // Diagonal head motion drives only motor A, but the path length is
        // the head-space diagonal.
        assert_eq!(blocks[0].steps, [1600, 0, 0, 0]);
        assert_eq!(blocks[0].step_event_count, 1600);
        assert!((blocks[0].millimeters - 14.1421).abs() < 0.001);
        // Both belt motors power up together
        assert!(io.enabled[motor_index(Motor::X)]);
        assert!(io.enabled[motor_index(Motor::Y)]);
    }

    #[test]
    fn test_lookahead_chain_and_idempotence() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        let corners = [
            (10.0, 0.0),
            (10.0, 10.0),
            (0.0, 10.0),
            (0.0, 20.0),
            (10.0, 20.0),
            (10.0, 30.0),
        ];
        for (x, y) in corners {
            planner.buffer_line(Position::new(x, y, 0.0, 0.0), 80.0, 0, 0, &mut io);
        }
        assert_queue_invariants(&bus);

        // Re-planning an already-optimal buffer must not change anything
        let before = collect_blocks(&bus);
        planner.recalculate();
        let after = collect_blocks(&bus);
        assert_eq!(before.1, after.1);
        for (b, a) in before.0[..before.1].iter().zip(&after.0[..after.1]) {
            assert_eq!(b, a);
        }
        let (blocks, count) = collect_blocks(&bus);
        for b in &blocks[..count] {
            assert!(!b.recalculate);
        }
    }

    #[test]
    fn test_forward_pass_limits_ramp_after_short_block() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();

        // Long, very short, long: the middle block cannot carry the full
        // junction speed, and the final block's entry must respect what
        // 0.3 mm of acceleration allows.
        planner.buffer_line(Position::new(20.0, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);
        planner.buffer_line(Position::new(20.3, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);
        planner.buffer_line(Position::new(40.0, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);

        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(count, 3);
        let short = &blocks[1];
        let last = &blocks[2];
        assert!(!short.nominal_length);
        assert!((short.entry_speed - 24.495).abs() < 0.05);
        assert!((last.entry_speed - 34.64).abs() < 0.05);
        assert_queue_invariants(&bus);
    }

    #[test]
    fn test_buffer_full_blocks_until_consumer_drains() {
        struct DrainIo<'b> {
            bus: &'b MotionBus,
            drained: u32,
        }
        impl MotorBus for DrainIo<'_> {
            fn set_direction(&mut self, _: Motor, _: bool) {}
            fn step_start(&mut self, _: Motor) {}
            fn step_end(&mut self, _: Motor) {}
            fn enable(&mut self, _: Motor) {}
            fn disable(&mut self, _: Motor) {}
        }
        impl Host for DrainIo<'_> {
            fn idle(&mut self) {
                self.bus.queue.discard_current();
                self.drained += 1;
            }
        }

        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = DrainIo {
            bus: &bus,
            drained: 0,
        };

        for i in 1..BLOCK_BUFFER_SIZE {
            assert!(planner.buffer_line(
                Position::new(i as f32, 0.0, 0.0, 0.0),
                60.0,
                0,
                0,
                &mut io
            ));
        }
        assert!(bus.queue.is_full());

        // One more move has to wait for the consumer
        assert!(planner.buffer_line(
            Position::new(BLOCK_BUFFER_SIZE as f32, 0.0, 0.0, 0.0),
            60.0,
            0,
            0,
            &mut io
        ));
        assert!(io.drained > 0);
        assert!(!bus.queue.is_full());
    }

    #[test]
    fn test_set_position_anchors_both_sides() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());

        planner.set_position(Position::new(5.0, 5.0, 1.0, 2.0));
        let logical = planner.logical_position();
        assert!((logical.x - 5.0).abs() < 1e-4);
        assert!((logical.e - 2.0).abs() < 1e-4);
        assert_eq!(bus.position_snapshot(), [400, 400, 400, 200]);

        // The next move starts from rest again
        let mut io = SimIo::new();
        planner.buffer_line(Position::new(15.0, 5.0, 1.0, 2.0), 60.0, 0, 0, &mut io);
        let (blocks, _) = collect_blocks(&bus);
        assert!((blocks[0].max_entry_speed - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_live_position_combines_core_motors() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.kinematics = Kinematics::CoreXy;
        let planner = Planner::new(&bus, cfg);

        // Motor A at 1600, motor B at 0: head sits at (10, 10)
        bus.set_position([1600, 0, 0, 0]);
        assert!((planner.live_axis_position_mm(Axis::X) - 10.0).abs() < 1e-4);
        assert!((planner.live_axis_position_mm(Axis::Y) - 10.0).abs() < 1e-4);
    }

    #[test]
    fn test_endstop_report_and_abort() {
        let bus = MotionBus::new();
        let mut planner = Planner::new(&bus, test_cfg());
        let mut io = SimIo::new();
        planner.set_abort_on_endstop_hit(true);

        planner.buffer_line(Position::new(10.0, 0.0, 0.0, 0.0), 60.0, 0, 0, &mut io);
        bus.set_trigger_steps(0, 160);
        bus.latch_endstop_hit(Switch::XMin);

        let report = planner.endstop_report().unwrap();
        assert_eq!(report.hits.len(), 1);
        let (switch, mm) = report.hits[0];
        assert_eq!(switch, Switch::XMin);
        assert!((mm - 2.0).abs() < 1e-4);
        assert!(report.aborted);
        assert!(bus.queue.is_empty());
        assert_eq!(bus.endstop_hits(), 0);
        assert!(bus.cleaning_counter() > 0);

        // Probe hits never abort
        let mut planner2 = Planner::new(&bus, test_cfg());
        planner2.set_abort_on_endstop_hit(true);
        bus.load_cleaning_counter(0);
        bus.latch_endstop_hit(Switch::ZProbe);
        let report = planner2.endstop_report().unwrap();
        assert!(!report.aborted);
    }

    #[test]
    fn test_slowdown_stretches_draining_buffer() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.slowdown = true;
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        // 1 mm at 100 mm/s is a 10 ms segment, half the minimum segment
        // time; with two moves queued the third is stretched to 20 ms.
        planner.buffer_line(Position::new(1.0, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);
        planner.buffer_line(Position::new(2.0, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);
        planner.buffer_line(Position::new(3.0, 0.0, 0.0, 0.0), 100.0, 0, 0, &mut io);

        let (blocks, count) = collect_blocks(&bus);
        assert_eq!(count, 3);
        assert!((blocks[0].nominal_speed - 100.0).abs() < 0.5);
        assert!((blocks[2].nominal_speed - 50.0).abs() < 1.0);
    }

    #[test]
    fn test_xy_frequency_limit_slows_zigzag() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.xy_frequency_limit_hz = Some(100.0);
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        // 0.1 mm zigzag at 60 mm/s flips direction every 1.7 ms, far above
        // the 100 Hz cap; later segments must be slowed.
        for i in 0..6 {
            let x = if i % 2 == 0 { 0.1 } else { 0.0 };
            planner.buffer_line(Position::new(x, 0.0, 0.0, 0.0), 60.0, 0, 0, &mut io);
        }
        let (blocks, count) = collect_blocks(&bus);
        assert!((blocks[0].nominal_speed - 60.0).abs() < 0.5);
        assert!(
            blocks[count - 1].nominal_speed < 30.0,
            "zigzag not slowed: {}",
            blocks[count - 1].nominal_speed
        );
    }

    #[test]
    fn test_check_axes_activity_disables_idle_axes_and_sets_fan() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.disable_idle_axes = [true, true, true];
        cfg.disable_idle_e = true;
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();
        for slot in io.enabled.iter_mut() {
            *slot = true;
        }

        planner.set_fan_speed(128);
        planner.check_axes_activity(&mut io);
        assert_eq!(io.fan, 128);
        assert!(!io.enabled[motor_index(Motor::X)]);
        assert!(!io.enabled[motor_index(Motor::Z)]);
        assert!(!io.enabled[motor_index(Motor::E(0))]);

        // With a Z move queued, Z stays powered
        for slot in io.enabled.iter_mut() {
            *slot = true;
        }
        planner.buffer_line(Position::new(0.0, 0.0, 2.0, 0.0), 5.0, 0, 0, &mut io);
        planner.check_axes_activity(&mut io);
        assert!(io.enabled[motor_index(Motor::Z)]);
        assert!(!io.enabled[motor_index(Motor::Y)]);
    }

    #[test]
    fn test_tool_change_rescales_e_position() {
        let bus = MotionBus::new();
        let mut cfg = test_cfg();
        cfg.e_steps_per_mm = [100.0, 200.0, 100.0, 100.0];
        let mut planner = Planner::new(&bus, cfg);
        let mut io = SimIo::new();

        planner.set_position(Position::new(0.0, 0.0, 0.0, 10.0));
        // Switching to a tool with doubled resolution doubles the cached
        // step position, so the first T1 move extrudes only the delta.
        planner.buffer_line(Position::new(10.0, 0.0, 0.0, 11.0), 30.0, 1, 0, &mut io);
        let (blocks, _) = collect_blocks(&bus);
        assert_eq!(blocks[0].steps[3], 200);
    }
}

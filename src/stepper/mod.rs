//! Stepper executor
//!
//! The consumer half of the motion core, designed to be driven from a
//! periodic compare-timer interrupt. Every call to [`Stepper::tick`] is
//! one firing: it pops the oldest block when idle, emits up to
//! `step_loops` Bresenham step events, walks the endstops, advances the
//! fixed-point trapezoid integrator and returns the interval (in 2 MHz
//! ticks) until the next firing.
//!
//! The tick never allocates, never takes a float and never blocks; all it
//! shares with the foreground is the block ring and the word-sized
//! counters on the [`MotionBus`].

pub(crate) mod endstops;
pub(crate) mod timing;

pub use timing::STEP_TIMER_HZ;

use crate::axis::{Axis, DirectionBits, DIR_E, MAX_TOOLS, NUM_AXES};
use crate::config::{LaserMode, StepperConfig};
use crate::shared::MotionBus;
use crate::traits::StepIo;
use crate::Motor;

use endstops::EndstopMonitor;
use timing::calc_timer;

/// Interval while nothing is queued (1 kHz poll)
const IDLE_INTERVAL: u16 = 2000;

/// Interval between quick-stop drain firings
const CLEANING_INTERVAL: u16 = 200;

/// Firings the cleaning counter holds the executor down after a quick stop
pub(crate) const CLEANING_BUFFER_FIRINGS: u16 = 5000;

/// Minimum distance the next compare point stays ahead of the counter
const TIMER_HEADROOM: u16 = 16;

/// Extra E steps the advance tick may emit per firing and tool
const ADVANCE_STEPS_PER_TICK: usize = 4;

/// The stepper executor; the consumer half of the motion core.
pub struct Stepper<'a> {
    bus: &'a MotionBus,
    cfg: StepperConfig,
    /// A block is mid-execution
    active: bool,
    /// Direction outputs have been driven at least once
    dirs_applied: bool,
    /// Direction bits currently latched on the outputs
    out_bits: DirectionBits,
    /// Bresenham error accumulators, seeded at -count/2
    counters: [i32; NUM_AXES],
    laser_counter: i32,
    step_events_completed: u32,
    /// Rate reached by the acceleration integrator, steps/s
    acc_step_rate: u32,
    /// Accumulated timer ticks while accelerating
    acceleration_time: u32,
    /// Accumulated timer ticks while decelerating
    deceleration_time: u32,
    step_loops: u8,
    step_loops_nominal: u8,
    /// Interval at nominal rate, cached at block start
    interval_nominal: u16,
    /// Last latched travel direction per motor slot
    count_direction: [i8; NUM_AXES],
    current_tool: u8,
    current_driver: u8,
    /// Advance pressure term, 8.8 fixed point
    advance: i32,
    old_advance: i32,
    final_advance: i32,
    endstops: EndstopMonitor,
}

impl<'a> Stepper<'a> {
    pub fn new(bus: &'a MotionBus, cfg: StepperConfig) -> Self {
        Self {
            bus,
            cfg,
            active: false,
            dirs_applied: false,
            out_bits: DirectionBits::default(),
            counters: [0; NUM_AXES],
            laser_counter: 0,
            step_events_completed: 0,
            acc_step_rate: 0,
            acceleration_time: 0,
            deceleration_time: 0,
            step_loops: 1,
            step_loops_nominal: 1,
            interval_nominal: IDLE_INTERVAL,
            count_direction: [1; NUM_AXES],
            current_tool: 0,
            current_driver: 0,
            advance: 0,
            old_advance: 0,
            final_advance: 0,
            endstops: EndstopMonitor::new(),
        }
    }

    /// True when no block is executing and nothing is queued
    pub fn is_idle(&self) -> bool {
        !self.active && self.bus.queue.is_empty()
    }

    /// One timer firing. Returns the interval in timer ticks until the
    /// next firing; the host programs its compare register with it.
    pub fn tick(&mut self, io: &mut impl StepIo) -> u16 {
        let bus = self.bus;

        // Quick stop: burn the queue down at a safe rate and do nothing
        // else until the cleaning counter drains.
        if bus.cleaning_counter() > 0 {
            self.active = false;
            bus.queue.discard_current();
            bus.decrement_cleaning_counter();
            return CLEANING_INTERVAL;
        }

        if !self.active {
            let picked = bus.queue.with_current(|block| {
                block.busy = true;
                self.begin_block_fields(block)
            });
            match picked {
                Some((direction_bits, tool, driver)) => {
                    self.current_tool = tool;
                    self.current_driver = driver;
                    if direction_bits != self.out_bits || !self.dirs_applied {
                        self.out_bits = direction_bits;
                        self.apply_directions(io);
                    }
                    self.active = true;
                }
                None => return IDLE_INTERVAL,
            }
        }

        let mut interval = IDLE_INTERVAL;
        let mut finished = false;
        bus.queue.with_current(|block| {
            if bus.endstops_enabled() && self.endstops.check(io, bus, &self.cfg, block) {
                self.step_events_completed = block.step_event_count;
            }

            if block.laser_mode == LaserMode::Continuous {
                io.laser_fire(block.laser_intensity);
            }

            for _ in 0..self.step_loops {
                if self.step_events_completed >= block.step_event_count {
                    break;
                }
                self.step_event(block, io);
                self.step_events_completed += 1;
            }

            interval = self.next_interval(block);
            finished = self.step_events_completed >= block.step_event_count;
        });

        if finished {
            self.active = false;
            bus.queue.discard_current();
        }

        // Never program a compare point the counter has already passed
        interval.max(io.ticks_elapsed().saturating_add(TIMER_HEADROOM))
    }

    /// Load the trapezoid generator from a fresh block. Returns the data
    /// the caller needs outside the ring access.
    fn begin_block_fields(&mut self, block: &crate::planner::block::Block) -> (DirectionBits, u8, u8) {
        self.deceleration_time = 0;

        let nominal = calc_timer(block.nominal_rate);
        self.interval_nominal = nominal.interval;
        self.step_loops_nominal = nominal.step_loops;

        self.acc_step_rate = block.initial_rate;
        let initial = calc_timer(self.acc_step_rate);
        self.step_loops = initial.step_loops;
        self.acceleration_time = initial.interval as u32;

        let seed = -((block.step_event_count >> 1) as i32);
        self.counters = [seed; NUM_AXES];
        self.laser_counter = seed;
        self.step_events_completed = 0;

        if self.cfg.advance_enabled {
            self.advance = block.initial_advance as i32;
            self.final_advance = block.final_advance as i32;
            let tool = block.active_tool as usize;
            self.bus
                .add_e_steps(tool, (self.advance >> 8) - self.old_advance);
            self.old_advance = self.advance >> 8;
        }

        (block.direction_bits, block.active_tool, block.active_driver)
    }

    /// Drive the direction outputs to match `out_bits` and latch the
    /// count directions
    fn apply_directions(&mut self, io: &mut impl StepIo) {
        for (slot, bit) in [(0usize, crate::axis::DIR_X), (1, crate::axis::DIR_Y), (2, crate::axis::DIR_Z)]
        {
            let reverse = self.out_bits.is_reverse(bit);
            match slot {
                0 => match self.cfg.dual_carriage {
                    Some(_) if !self.bus.x_duplication() => {
                        let motor = if self.current_driver != 0 {
                            Motor::X2
                        } else {
                            Motor::X
                        };
                        io.set_direction(motor, reverse);
                    }
                    Some(_) => {
                        io.set_direction(Motor::X, reverse);
                        io.set_direction(Motor::X2, reverse);
                    }
                    None => io.set_direction(Motor::X, reverse),
                },
                1 => io.set_direction(Motor::Y, reverse),
                _ => {
                    io.set_direction(Motor::Z, reverse);
                    if self.cfg.z_dual_stepper {
                        io.set_direction(Motor::Z2, reverse);
                    }
                }
            }
            self.count_direction[slot] = if reverse { -1 } else { 1 };
        }

        let e_reverse = self.out_bits.is_reverse(DIR_E);
        if !self.cfg.advance_enabled {
            io.set_direction(Motor::E(self.current_tool), e_reverse);
        }
        self.count_direction[3] = if e_reverse { -1 } else { 1 };
        self.dirs_applied = true;
    }

    /// One Bresenham step event across all motor slots
    fn step_event(&mut self, block: &crate::planner::block::Block, io: &mut impl StepIo) {
        let mut stepping = [false; NUM_AXES];
        for slot in 0..NUM_AXES {
            self.counters[slot] += block.steps[slot] as i32;
            if self.counters[slot] > 0 {
                stepping[slot] = true;
            }
        }

        // Advance mode queues E steps for the fast extruder tick instead
        // of pulsing in line.
        if self.cfg.advance_enabled && stepping[3] {
            self.counters[3] -= block.step_event_count as i32;
            self.bus
                .add_e_steps(block.active_tool as usize, self.count_direction[3] as i32);
            stepping[3] = false;
        }

        // Dual-Z homing may hold one motor while its twin finishes
        let (z_gate, z2_gate) = if stepping[2] && self.cfg.z_dual_stepper {
            self.endstops
                .z_motor_gates(self.bus, &self.cfg.endstops, self.count_direction[2])
        } else {
            (true, true)
        };

        for slot in 0..NUM_AXES {
            if stepping[slot] {
                self.for_each_slot_motor(slot, z_gate, z2_gate, |motor, io| io.step_start(motor), io);
            }
        }
        for slot in 0..NUM_AXES {
            if stepping[slot] {
                self.counters[slot] -= block.step_event_count as i32;
                self.bus.bump_step_count(slot, self.count_direction[slot]);
                self.for_each_slot_motor(slot, z_gate, z2_gate, |motor, io| io.step_end(motor), io);
            }
        }

        if block.laser_mode == LaserMode::Pulsed {
            self.laser_counter += block.laser_steps as i32;
            if self.laser_counter > 0 {
                io.laser_fire(block.laser_intensity);
                self.laser_counter -= block.step_event_count as i32;
            }
        }
    }

    /// Apply `f` to every physical motor behind a slot, honoring dual
    /// carriage routing and dual-Z gating
    fn for_each_slot_motor<IO: StepIo>(
        &self,
        slot: usize,
        z_gate: bool,
        z2_gate: bool,
        mut f: impl FnMut(Motor, &mut IO),
        io: &mut IO,
    ) {
        match slot {
            0 => match self.cfg.dual_carriage {
                Some(_) if !self.bus.x_duplication() => {
                    let motor = if self.current_driver != 0 {
                        Motor::X2
                    } else {
                        Motor::X
                    };
                    f(motor, io);
                }
                Some(_) => {
                    f(Motor::X, io);
                    f(Motor::X2, io);
                }
                None => f(Motor::X, io),
            },
            1 => f(Motor::Y, io),
            2 => {
                if z_gate {
                    f(Motor::Z, io);
                }
                if self.cfg.z_dual_stepper && z2_gate {
                    f(Motor::Z2, io);
                }
            }
            _ => f(Motor::E(self.current_tool), io),
        }
    }

    /// Next timer interval from the trapezoid phase, advancing the
    /// fixed-point rate integrator
    fn next_interval(&mut self, block: &crate::planner::block::Block) -> u16 {
        if self.step_events_completed <= block.accelerate_until {
            // rate = initial + acceleration * elapsed, in 24.8 fixed point
            let gain = ((self.acceleration_time as u64 * block.acceleration_rate as u64) >> 24)
                as u32;
            self.acc_step_rate = (block.initial_rate + gain).min(block.nominal_rate);

            let timing = calc_timer(self.acc_step_rate);
            self.step_loops = timing.step_loops;
            self.acceleration_time += timing.interval as u32;
            if let Some(rate) = timing.clamped_rate {
                self.bus.flag_step_rate(rate);
            }

            if self.cfg.advance_enabled && block.advance_rate != 0 {
                self.advance += block.advance_rate as i32 * self.step_loops as i32;
                self.bus.add_e_steps(
                    block.active_tool as usize,
                    (self.advance >> 8) - self.old_advance,
                );
                self.old_advance = self.advance >> 8;
            }

            timing.interval
        } else if self.step_events_completed > block.decelerate_after {
            let drop = ((self.deceleration_time as u64 * block.acceleration_rate as u64) >> 24)
                as u32;
            let rate = if drop <= self.acc_step_rate {
                (self.acc_step_rate - drop).max(block.final_rate)
            } else {
                block.final_rate
            };

            let timing = calc_timer(rate);
            self.step_loops = timing.step_loops;
            self.deceleration_time += timing.interval as u32;
            if let Some(rate) = timing.clamped_rate {
                self.bus.flag_step_rate(rate);
            }

            if self.cfg.advance_enabled && block.advance_rate != 0 {
                self.advance =
                    (self.advance - block.advance_rate as i32 * self.step_loops as i32)
                        .max(self.final_advance);
                self.bus.add_e_steps(
                    block.active_tool as usize,
                    (self.advance >> 8) - self.old_advance,
                );
                self.old_advance = self.advance >> 8;
            }

            timing.interval
        } else {
            // Cruise: restore the nominal batching in case we just came
            // off the ramp
            self.step_loops = self.step_loops_nominal;
            self.interval_nominal
        }
    }

    /// Emit pending advance E steps, a few per tool per call.
    ///
    /// Meant to be driven from a fast (~10 kHz) interrupt that shares the
    /// executor's priority; it must never run concurrently with
    /// [`Stepper::tick`].
    pub fn advance_tick(&mut self, io: &mut impl StepIo) {
        for _ in 0..ADVANCE_STEPS_PER_TICK {
            let mut any = false;
            for tool in 0..MAX_TOOLS {
                let step = self.bus.take_e_step(tool);
                if step != 0 {
                    let motor = Motor::E(tool as u8);
                    io.set_direction(motor, step < 0);
                    io.step_start(motor);
                    io.step_end(motor);
                    any = true;
                }
            }
            if !any {
                break;
            }
        }
    }

    /// Nudge one axis by a single step without touching the plan or the
    /// live position.
    ///
    /// Must only be called from an interrupt context that cannot preempt
    /// or be preempted by [`Stepper::tick`]. The direction outputs are
    /// restored before returning, so an executing block is unaffected.
    pub fn babystep(&mut self, io: &mut impl StepIo, axis: Axis, positive: bool) {
        let (motors, bit): (&[Motor], u8) = match axis {
            Axis::X => {
                if self.cfg.dual_carriage.is_some() {
                    (&[Motor::X, Motor::X2], crate::axis::DIR_X)
                } else {
                    (&[Motor::X], crate::axis::DIR_X)
                }
            }
            Axis::Y => (&[Motor::Y], crate::axis::DIR_Y),
            Axis::Z => {
                if self.cfg.z_dual_stepper {
                    (&[Motor::Z, Motor::Z2], crate::axis::DIR_Z)
                } else {
                    (&[Motor::Z], crate::axis::DIR_Z)
                }
            }
            // The extruder has no notion of a babystep
            Axis::E => return,
        };

        let restore = self.out_bits.is_reverse(bit);
        for &motor in motors {
            io.enable(motor);
            io.set_direction(motor, !positive);
        }
        for &motor in motors {
            io.step_start(motor);
        }
        for &motor in motors {
            io.step_end(motor);
        }
        for &motor in motors {
            io.set_direction(motor, restore);
        }
    }
}

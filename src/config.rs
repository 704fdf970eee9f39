//! Motion configuration types
//!
//! Configuration is handed to the core in memory by upper layers before
//! motion starts and is treated as read-mostly afterwards. Nothing here is
//! persisted by this crate.

use crate::axis::{Axis, SwitchSet, MAX_TOOLS};
use crate::kinematics::Kinematics;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Planner-side limits and policies
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MotionConfig {
    /// Machine kinematics
    pub kinematics: Kinematics,
    /// Steps per millimeter for X/Y/Z (A/B/C motors on core machines)
    pub steps_per_mm: [f32; 3],
    /// Steps per millimeter of filament, per tool
    pub e_steps_per_mm: [f32; MAX_TOOLS],
    /// Maximum axis speeds in mm/s for X/Y/Z
    pub max_feedrate_mm_s: [f32; 3],
    /// Maximum extruder speed in mm/s, per tool
    pub e_max_feedrate_mm_s: [f32; MAX_TOOLS],
    /// Per-axis acceleration ceilings in mm/s² for X/Y/Z
    pub max_acceleration_mm_s2: [f32; 3],
    /// Per-tool extruder acceleration ceilings in mm/s²
    pub e_max_acceleration_mm_s2: [f32; MAX_TOOLS],
    /// Default acceleration for printing moves, mm/s²
    pub acceleration_mm_s2: f32,
    /// Acceleration for travel (no extrusion) moves, mm/s²
    pub travel_acceleration_mm_s2: f32,
    /// Acceleration for extruder-only moves, per tool, mm/s²
    pub retract_acceleration_mm_s2: [f32; MAX_TOOLS],
    /// Largest instantaneous XY speed change, mm/s
    pub max_xy_jerk_mm_s: f32,
    /// Largest instantaneous Z speed change, mm/s
    pub max_z_jerk_mm_s: f32,
    /// Largest instantaneous E speed change, per tool, mm/s
    pub max_e_jerk_mm_s: [f32; MAX_TOOLS],
    /// Floor for printing-move feed rates, mm/s
    pub min_feedrate_mm_s: f32,
    /// Floor for travel-move feed rates, mm/s
    pub min_travel_feedrate_mm_s: f32,
    /// Minimum segment time in µs, enforced when the buffer is draining
    pub min_segment_time_us: u32,
    /// Volumetric extrusion scale factor, per tool
    pub volumetric_multiplier: [f32; MAX_TOOLS],
    /// Flow percentage scale factor, per tool (1.0 = 100%)
    pub flow_multiplier: [f32; MAX_TOOLS],
    /// Stretch segment times toward `min_segment_time_us` when the buffer
    /// is less than half full
    pub slowdown: bool,
    /// Cap on XY direction-flip frequency in Hz, if limited
    pub xy_frequency_limit_hz: Option<f32>,
    /// Drop E from moves whose tool the host has not marked ready
    pub prevent_cold_extrude: bool,
    /// Longest single extrusion in mm before the E component is dropped
    pub max_extrude_length_mm: f32,
    /// Disable these axes when no queued block moves them
    pub disable_idle_axes: [bool; 3],
    /// Disable every extruder when no queued block extrudes
    pub disable_idle_e: bool,
    /// Disable extruder motors that have not moved for two buffer lengths
    pub disable_inactive_tools: bool,
    /// Extruder pressure compensation ("advance"), if fitted
    pub advance: Option<AdvanceConfig>,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            kinematics: Kinematics::Cartesian,
            steps_per_mm: [80.0, 80.0, 400.0],
            e_steps_per_mm: [100.0; MAX_TOOLS],
            max_feedrate_mm_s: [300.0, 300.0, 5.0],
            e_max_feedrate_mm_s: [25.0; MAX_TOOLS],
            max_acceleration_mm_s2: [3000.0, 3000.0, 100.0],
            e_max_acceleration_mm_s2: [10_000.0; MAX_TOOLS],
            acceleration_mm_s2: 1000.0,
            travel_acceleration_mm_s2: 1500.0,
            retract_acceleration_mm_s2: [3000.0; MAX_TOOLS],
            max_xy_jerk_mm_s: 10.0,
            max_z_jerk_mm_s: 0.4,
            max_e_jerk_mm_s: [5.0; MAX_TOOLS],
            min_feedrate_mm_s: 0.0,
            min_travel_feedrate_mm_s: 0.0,
            min_segment_time_us: 20_000,
            volumetric_multiplier: [1.0; MAX_TOOLS],
            flow_multiplier: [1.0; MAX_TOOLS],
            slowdown: true,
            xy_frequency_limit_hz: None,
            prevent_cold_extrude: false,
            max_extrude_length_mm: 400.0,
            disable_idle_axes: [false, false, false],
            disable_idle_e: false,
            disable_inactive_tools: false,
            advance: None,
        }
    }
}

impl MotionConfig {
    /// Steps per millimeter for an axis, E resolved through the tool
    pub fn axis_steps_per_mm(&self, axis: Axis, tool: u8) -> f32 {
        match axis {
            Axis::E => self.e_steps_per_mm[tool as usize],
            other => self.steps_per_mm[other.index()],
        }
    }

    /// Maximum feed rate for an axis, E resolved through the tool
    pub fn axis_max_feedrate(&self, axis: Axis, tool: u8) -> f32 {
        match axis {
            Axis::E => self.e_max_feedrate_mm_s[tool as usize],
            other => self.max_feedrate_mm_s[other.index()],
        }
    }

    /// Per-axis acceleration ceiling in steps/s²
    pub fn axis_max_acceleration_steps(&self, axis: Axis, tool: u8) -> f32 {
        match axis {
            Axis::E => {
                self.e_max_acceleration_mm_s2[tool as usize] * self.e_steps_per_mm[tool as usize]
            }
            other => self.max_acceleration_mm_s2[other.index()] * self.steps_per_mm[other.index()],
        }
    }
}

/// Extruder advance pressure-compensation parameters
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AdvanceConfig {
    /// Dimensionless advance gain
    pub k: f32,
    /// Extruder steps per cubic millimeter of filament
    pub steps_per_cubic_mm: f32,
    /// Extrusion cross-section area in mm²
    pub extrusion_area_mm2: f32,
}

/// Executor-side configuration
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StepperConfig {
    /// Machine kinematics; must match the planner's
    pub kinematics: Kinematics,
    /// Endstop wiring and policy
    pub endstops: EndstopConfig,
    /// Second X carriage fitted (step/dir routed by block driver index)
    pub dual_carriage: Option<DualCarriage>,
    /// Second Z motor fitted and driven in lockstep
    pub z_dual_stepper: bool,
    /// Route E steps through the shared advance counters
    pub advance_enabled: bool,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            kinematics: Kinematics::Cartesian,
            endstops: EndstopConfig::default(),
            dual_carriage: None,
            z_dual_stepper: false,
            advance_enabled: false,
        }
    }
}

/// Endstop wiring and homing policy
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EndstopConfig {
    /// Switches actually wired on this machine
    pub installed: SwitchSet,
    /// Treat Z and Z2 endstops independently while homing
    pub z_dual_endstops: bool,
    /// Homing direction for Z, -1 toward min, +1 toward max
    pub z_home_dir: i8,
}

impl Default for EndstopConfig {
    fn default() -> Self {
        Self {
            installed: SwitchSet::min_only(),
            z_dual_endstops: false,
            z_home_dir: -1,
        }
    }
}

/// Dual X carriage geometry
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DualCarriage {
    /// Homing direction per carriage, -1 toward min, +1 toward max
    pub home_dir: [i8; 2],
}

/// Laser firing mode captured into each block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LaserMode {
    /// Laser off; zero-length blocks are dropped
    #[default]
    Off,
    /// Fire continuously while the block executes
    Continuous,
    /// Fire once per pulse step, synchronized with motion
    Pulsed,
}

/// Live laser state, captured at enqueue time
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LaserSettings {
    pub mode: LaserMode,
    /// Firing intensity, 0-255
    pub intensity: u8,
    /// Pulses per millimeter of travel in pulsed mode
    pub pulses_per_mm: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_lookup_resolves_tool() {
        let mut cfg = MotionConfig::default();
        cfg.e_steps_per_mm[2] = 420.0;
        assert_eq!(cfg.axis_steps_per_mm(Axis::E, 2), 420.0);
        assert_eq!(cfg.axis_steps_per_mm(Axis::X, 2), 80.0);
    }

    #[test]
    fn test_acceleration_ceiling_in_steps() {
        let cfg = MotionConfig::default();
        // 100 mm/s² * 400 steps/mm
        assert_eq!(cfg.axis_max_acceleration_steps(Axis::Z, 0), 40_000.0);
    }
}

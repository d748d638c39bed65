// SHAREFLOW TUNING CONSTANTS
// PURE-RUST MODULE: NO I/O, NO LOCKS
// SHARED BETWEEN THE LIBRARY CORE, THE BINARY (cli/), AND THE TESTS

// MONITOR CADENCE
// THE MONITOR RUNS ONCE PER PERIOD AND NEVER TWICE WITHIN THE MINIMUM INTERVAL
// (EXCEPT AFTER A CONFIGURATION CHANGE, WHICH FORCES A CYCLE).

pub const MONITOR_PERIOD_NS: u64       = 1_000_000_000;  // 1S
pub const MONITOR_MIN_INTERVAL_NS: u64 = 100_000_000;    // 100MS FLOOR

// DEMAND ESTIMATION
// A FOLD HAPPENS WHEN RUN + SLEEP CROSSES THE RECALC INTERVAL.
// CLASS SIGNAL IS ONE ORDER OF MAGNITUDE SMOOTHER THAN ANY SINGLE TASK.

pub const TASK_DEMAND_INTERVAL_NS: u64  = 100_000_000;   // 100MS
pub const CLASS_DEMAND_INTERVAL_NS: u64 = 1_000_000_000; // 1S

// LOCAL WEIGHTS
// WEIGHT_MAX CORRESPONDS TO A FULL SHARE_SCALE ENTITLEMENT.

pub const WEIGHT_SHIFT: u32       = 10;
pub const WEIGHT_MAX: u32         = 1 << WEIGHT_SHIFT;
pub const SKEWED_WEIGHT_MIN: u32  = 3;    // NEVER ROUND A CLASS BELOW THIS
pub const SKEWED_SHARE_SHIFT: u32 = 3;    // FLOOR = weight_for(meshare / 8)
pub const BOOST_WEIGHT: u32       = 16;   // FIRST TASK INTO AN EMPTY QUEUE

// VIRTUAL TIME -> CLASS PRIORITY
// ONE PRIORITY STEP PER 2^VT_SCALE_BITS UNITS OF VIRTUAL TIME.
// AT WEIGHT_MAX THAT IS ~1MS OF CPU.

pub const VT_SCALE_BITS: u32      = 10;
pub const URGENCY_SCALE_BITS: u32 = 0;

// TASK PRIORITIES (LOWER = MORE URGENT)

pub const MAX_PRIO: u32 = 140;
pub const DEFAULT_PRIO: u32 = 120;

// SAVINGS
// IDLE TIME BANKED PER LOCAL QUEUE, CAPPED AT A SMALL MULTIPLE OF THE WINDOW.
// DECAYS BY 1/8 EVERY REBALANCE.

pub const SAVINGS_WINDOW_NS: u64    = 100_000_000;  // 100MS
pub const SAVINGS_WINDOW_MULT: u64  = 4;
pub const SAVINGS_DECAY_SHIFT: u32  = 3;

// LOAD
// A TASK'S PRESSURE IS ITS DEMAND IN SHARE UNITS. QUEUES WITH RUNNABLE TASKS
// ALWAYS REPORT AT LEAST LOAD_FLOOR.

pub const LOAD_FLOOR: u64 = 1;

// BASE SCHEDULER TIMESLICE (SIMULATION DRIVER)

pub const DEFAULT_SLICE_NS: u64 = 5_000_000;  // 5MS

// CONTROLLER CONFIGURATION

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControllerConfig {
    pub nr_cpus: usize,
    pub monitor_period_ns: u64,
    pub monitor_min_interval_ns: u64,
    pub task_demand_interval_ns: u64,
    pub class_demand_interval_ns: u64,
    pub boost_weight: u32,
    pub savings_cap_ns: u64,
    pub slice_ns: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            monitor_period_ns: MONITOR_PERIOD_NS,
            monitor_min_interval_ns: MONITOR_MIN_INTERVAL_NS,
            task_demand_interval_ns: TASK_DEMAND_INTERVAL_NS,
            class_demand_interval_ns: CLASS_DEMAND_INTERVAL_NS,
            boost_weight: BOOST_WEIGHT,
            savings_cap_ns: SAVINGS_WINDOW_NS * SAVINGS_WINDOW_MULT,
            slice_ns: DEFAULT_SLICE_NS,
        }
    }
}

impl ControllerConfig {
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus: nr_cpus.max(1),
            ..Self::default()
        }
    }
}

// SHARE -> WEIGHT (ROUNDS TOWARD ZERO)

pub fn weight_for(share: u32) -> u32 {
    ((share as u64 * WEIGHT_MAX as u64) >> crate::share::SHARE_SHIFT) as u32
}

// STARVATION FLOOR FOR A CLASS WHOSE OWN EFFECTIVE SHARE IS `meshare`

pub fn skewed_weight(meshare: u32) -> u32 {
    weight_for(meshare >> SKEWED_SHARE_SHIFT).max(SKEWED_WEIGHT_MIN)
}

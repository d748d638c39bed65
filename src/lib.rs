// SHAREFLOW -- HIERARCHICAL CPU BANDWIDTH CONTROL
// PROPORTIONAL-SHARE POLICY LAYER ABOVE A BASE TASK SCHEDULER
//
// PURE LIBRARY CORE: NO I/O OUTSIDE logger AND event.
// THE BINARY (main.rs, cli/) DRIVES IT WITH A SYNTHETIC BASE SCHEDULER.

pub mod accountant;
pub mod balancer;
pub mod class;
pub mod classqueue;
pub mod controller;
pub mod cpu;
pub mod demand;
pub mod error;
pub mod event;
pub mod logger;
pub mod monitor;
pub mod runqueue;
pub mod share;
pub mod surplus;
pub mod tuning;

pub use class::{ClassId, ClassKind, ClassStat};
pub use controller::{ClassStatSnapshot, CpuController, DestroyOutcome, QueueView};
pub use cpu::Disposition;
pub use demand::DemandEvent;
pub use error::{ControllerError, InvalidShareError, TreeError};
pub use monitor::{CycleOutcome, CycleReport, SkipReason};
pub use runqueue::{QueueState, Task, TaskId};
pub use share::{Share, ShareUpdate, Shares, SHARE_SCALE};
pub use tuning::ControllerConfig;

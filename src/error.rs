// SHAREFLOW ERROR TAXONOMY
// CONFIGURATION ERRORS ARE RETURNED TO THE CALLER. STRUCTURAL RACES ARE
// HANDLED LOCALLY BY THE MONITOR (RETAIN LAST GOOD VALUES). NOTHING HERE IS
// FATAL TO THE RUNNING SCHEDULER.

use thiserror::Error;

use crate::class::ClassId;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidShareError {
    #[error("share value {value} outside [0, SHARE_SCALE]")]
    OutOfRange { value: u32 },

    #[error("guarantee {requested} exceeds available parent pool {available}")]
    GuaranteeExceedsPool { requested: u32, available: u32 },

    #[error("limit {requested} exceeds parent max_limit {max_limit}")]
    LimitExceedsParent { requested: u32, max_limit: u32 },

    #[error("limit {limit} below guarantee {guarantee}")]
    LimitBelowGuarantee { limit: u32, guarantee: u32 },

    #[error("total_guarantee {total} below guarantee already handed to children ({allocated})")]
    TotalBelowAllocated { total: u32, allocated: u32 },

    #[error("max_limit {max_limit} below largest child limit {cur_max_limit}")]
    MaxLimitBelowChildren { max_limit: u32, cur_max_limit: u32 },

    #[error("the root class has no parent pool to draw a guarantee from")]
    RootHasNoParentPool,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TreeError {
    #[error("unknown or stale class {0}")]
    UnknownClass(ClassId),

    #[error("class {0} vanished during tree walk")]
    StructuralRace(ClassId),

    #[error("the root class cannot be destroyed")]
    RootImmutable,

    #[error("class {0} still has children")]
    HasChildren(ClassId),

    #[error("class {0} is being destroyed")]
    Destroying(ClassId),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ControllerError {
    #[error(transparent)]
    Share(#[from] InvalidShareError),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

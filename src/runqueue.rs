// SHAREFLOW LOCAL RUN QUEUE
// ONE PER CLASS PER CPU. TWO PRIORITY ARRAYS (ACTIVE / EXPIRED) THAT SWAP ROLES
// WHEN ACTIVE RUNS DRY, PLUS THE CLASS'S LOCAL VIRTUAL TIME AND WEIGHTS.
//
// CROSS-CLASS PRIORITY:
//   (local_virtual_time >> VT_SCALE_BITS) + (top_priority >> URGENCY_SCALE_BITS)
// LOWER DISPATCHES FIRST.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::class::ClassId;
use crate::classqueue::CqKey;
use crate::demand::ClassDemand;
use crate::tuning::{MAX_PRIO, URGENCY_SCALE_BITS, VT_SCALE_BITS, WEIGHT_MAX};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

// WHAT THE BASE SCHEDULER KNOWS ABOUT A TASK
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Task {
    pub id: TaskId,
    pub class: ClassId,
    pub cpu: usize,
    pub prio: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueState {
    Empty,
    Active,
    ExpiredPendingSwap,
}

// TASKS BUCKETED BY PRIORITY, FIFO WITHIN A BUCKET
#[derive(Default)]
pub struct PrioArray {
    queues: BTreeMap<u32, VecDeque<TaskId>>,
    nr: usize,
}

impl PrioArray {
    pub fn len(&self) -> usize {
        self.nr
    }

    pub fn is_empty(&self) -> bool {
        self.nr == 0
    }

    pub fn top_prio(&self) -> Option<u32> {
        self.queues.keys().next().copied()
    }

    pub fn push(&mut self, task: TaskId, prio: u32) {
        self.queues.entry(prio.min(MAX_PRIO - 1)).or_default().push_back(task);
        self.nr += 1;
    }

    pub fn pop(&mut self) -> Option<(TaskId, u32)> {
        let mut entry = self.queues.first_entry()?;
        let prio = *entry.key();
        let task = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        let task = task?;
        self.nr -= 1;
        Some((task, prio))
    }

    pub fn remove(&mut self, task: TaskId, prio: u32) -> bool {
        let prio = prio.min(MAX_PRIO - 1);
        let Some(q) = self.queues.get_mut(&prio) else {
            return false;
        };
        let Some(pos) = q.iter().position(|&t| t == task) else {
            return false;
        };
        q.remove(pos);
        if q.is_empty() {
            self.queues.remove(&prio);
        }
        self.nr -= 1;
        true
    }
}

pub struct LocalRunQueue {
    class: ClassId,
    arrays: [PrioArray; 2],
    active: usize,
    expired_timestamp: u64,
    pub(crate) top_priority: u32,
    pub(crate) local_virtual_time: u64,
    pub(crate) local_weight: u32,
    pub(crate) over_weight: u32,
    pub(crate) skewed_weight: u32,
    pub(crate) skewed: bool,
    pub(crate) savings: u64,
    pub(crate) load: u64,
    pub(crate) uncounted_ns: u64,
    pub(crate) demand: Arc<ClassDemand>,
    // WHEN THE QUEUE LAST WENT EMPTY. 0 = NOT IDLE.
    pub(crate) idle_since: u64,
    pub(crate) running: bool,
    // CLASS IS BEING DESTROYED: NO NEW TASKS
    pub(crate) closing: bool,
    pub(crate) cq_key: Option<CqKey>,
}

impl LocalRunQueue {
    pub fn new(class: ClassId, demand: Arc<ClassDemand>, now_ns: u64) -> Self {
        Self {
            class,
            arrays: [PrioArray::default(), PrioArray::default()],
            active: 0,
            expired_timestamp: 0,
            top_priority: MAX_PRIO,
            local_virtual_time: 0,
            local_weight: 1,
            over_weight: 0,
            skewed_weight: 0,
            skewed: false,
            savings: 0,
            load: 0,
            uncounted_ns: 0,
            demand,
            idle_since: now_ns.max(1),
            running: false,
            closing: false,
            cq_key: None,
        }
    }

    pub fn class(&self) -> ClassId {
        self.class
    }

    pub fn state(&self) -> QueueState {
        if !self.arrays[self.active].is_empty() || self.running {
            QueueState::Active
        } else if !self.arrays[self.active ^ 1].is_empty() {
            QueueState::ExpiredPendingSwap
        } else {
            QueueState::Empty
        }
    }

    pub fn nr_queued(&self) -> usize {
        self.arrays[0].len() + self.arrays[1].len()
    }

    pub fn nr_running(&self) -> usize {
        self.nr_queued() + self.running as usize
    }

    pub fn is_empty(&self) -> bool {
        self.nr_running() == 0
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn local_virtual_time(&self) -> u64 {
        self.local_virtual_time
    }

    pub fn local_weight(&self) -> u32 {
        self.local_weight
    }

    pub fn over_weight(&self) -> u32 {
        self.over_weight
    }

    pub fn skewed_weight(&self) -> u32 {
        self.skewed_weight
    }

    pub fn is_skewed(&self) -> bool {
        self.skewed
    }

    pub fn savings(&self) -> u64 {
        self.savings
    }

    pub fn load(&self) -> u64 {
        self.load
    }

    pub fn top_priority(&self) -> u32 {
        self.top_priority
    }

    pub fn expired_timestamp(&self) -> u64 {
        self.expired_timestamp
    }

    pub fn priority(&self) -> u64 {
        (self.local_virtual_time >> VT_SCALE_BITS) + (self.top_priority >> URGENCY_SCALE_BITS) as u64
    }

    pub fn push(&mut self, task: TaskId, prio: u32, expired: bool, now_ns: u64) {
        let idx = if expired { self.active ^ 1 } else { self.active };
        if expired && self.arrays[idx].is_empty() {
            self.expired_timestamp = now_ns;
        }
        self.arrays[idx].push(task, prio);
        self.refresh_top();
    }

    // NEXT TASK FROM ACTIVE. SWAPS ARRAYS FIRST IF ACTIVE RAN DRY.
    pub fn pop_next(&mut self) -> Option<(TaskId, u32)> {
        if self.arrays[self.active].is_empty() && !self.arrays[self.active ^ 1].is_empty() {
            self.active ^= 1;
            self.expired_timestamp = 0;
        }
        let next = self.arrays[self.active].pop();
        self.refresh_top();
        next
    }

    pub fn remove(&mut self, task: TaskId, prio: u32) -> bool {
        let found = self.arrays[self.active].remove(task, prio) || self.arrays[self.active ^ 1].remove(task, prio);
        if found {
            self.refresh_top();
        }
        found
    }

    // CHARGE `ran_ns` OF CPU: VIRTUAL TIME MOVES BY ran / weight
    pub fn advance(&mut self, ran_ns: u64) {
        let weight = self.local_weight.clamp(1, WEIGHT_MAX) as u64;
        self.local_virtual_time = self.local_virtual_time.saturating_add(ran_ns / weight);
        self.uncounted_ns = self.uncounted_ns.saturating_add(ran_ns);
    }

    // LIFT (NEVER LOWER) VIRTUAL TIME TO A CPU-WIDE FLOOR
    pub fn lift_virtual_time(&mut self, floor: u64) {
        self.local_virtual_time = self.local_virtual_time.max(floor);
    }

    fn refresh_top(&mut self) {
        self.top_priority = self.arrays[self.active]
            .top_prio()
            .or_else(|| self.arrays[self.active ^ 1].top_prio())
            .unwrap_or(MAX_PRIO);
    }
}

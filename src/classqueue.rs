// SHAREFLOW CLASS QUEUE
// PER-CPU ORDERING OF LOCAL RUN QUEUES THAT HAVE TASKS WAITING.
// KEYED BY (PRIORITY, SEQUENCE): EQUAL PRIORITIES ROUND-ROBIN, BECAUSE A
// REQUEUED ENTRY ALWAYS TAKES A FRESH SEQUENCE NUMBER.

use std::collections::BTreeSet;

use crate::class::ClassId;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CqKey {
    prio: u64,
    seq: u64,
}

impl CqKey {
    pub fn prio(self) -> u64 {
        self.prio
    }
}

#[derive(Default)]
pub struct ClassQueue {
    set: BTreeSet<(CqKey, ClassId)>,
    seq: u64,
}

impl ClassQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn insert(&mut self, class: ClassId, prio: u64) -> CqKey {
        let key = CqKey { prio, seq: self.seq };
        self.seq = self.seq.wrapping_add(1);
        self.set.insert((key, class));
        key
    }

    pub fn remove(&mut self, key: CqKey, class: ClassId) -> bool {
        self.set.remove(&(key, class))
    }

    // MOVE AN ENTRY TO A NEW PRIORITY, BEHIND ANY EQUALS
    pub fn update(&mut self, key: CqKey, class: ClassId, prio: u64) -> CqKey {
        self.set.remove(&(key, class));
        self.insert(class, prio)
    }

    pub fn head(&self) -> Option<(CqKey, ClassId)> {
        self.set.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(CqKey, ClassId)> {
        self.set.iter()
    }
}

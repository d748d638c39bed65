// SHAREFLOW CLASS TREE
// ARENA OF CPU CLASSES INDEXED BY GENERATIONAL IDS.
//
// THE PARENT OWNS ITS CHILDREN THROUGH THE CHILD LIST; A CHILD ONLY KNOWS ITS
// PARENT'S ID. A FREED SLOT BUMPS ITS GENERATION, SO A STALE ID NEVER
// RESOLVES TO THE CLASS THAT LATER REUSES THE SLOT.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::demand::ClassDemand;
use crate::error::TreeError;
use crate::share::{Share, Shares};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClassId {
    index: u32,
    generation: u32,
}

impl ClassId {
    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClassKind {
    Root,
    Child { parent: ClassId },
}

// DERIVED PER-CLASS STATE. WRITTEN ONLY BY THE MONITOR'S TREE WALK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassStat {
    // EFFECTIVE GUARANTEE / HARD LIMIT OF THE WHOLE SUBTREE
    pub egrt: Share,
    pub ehl: Share,
    // SAME, FOR THE CLASS'S OWN TASKS WHEN COMPETING WITH ITS CHILDREN
    pub megrt: Share,
    pub mehl: Share,
    // GRANTED EFFECTIVE SHARE (SUBTREE / OWN TASKS)
    pub eshare: u32,
    pub meshare: u32,
    pub self_demand: u32,
    pub max_demand: u32,
    pub has_savings: bool,
    // SCRATCH FOR ONE REDISTRIBUTION PASS
    pub demand_per_share: u64,
    // SURPLUS RECEIVED IN THE LAST CYCLE
    pub granted: u32,
}

impl Default for ClassStat {
    fn default() -> Self {
        Self {
            egrt: Share::ZERO,
            ehl: Share::ZERO,
            megrt: Share::ZERO,
            mehl: Share::ZERO,
            eshare: 1,
            meshare: 1,
            self_demand: 0,
            max_demand: 0,
            has_savings: false,
            demand_per_share: 0,
            granted: 0,
        }
    }
}

// STAGED COPY OF EVERY CLASS'S STAT FOR ONE MONITOR CYCLE. THE CYCLE WORKS
// ON THE COPY; READERS SEE THE LAST COMMITTED VALUES UNTIL commit().
#[derive(Clone, Debug, Default)]
pub struct StatTable {
    entries: Vec<Option<(ClassId, ClassStat)>>,
}

impl StatTable {
    pub fn snapshot(tree: &ClassTree) -> Self {
        let mut entries: Vec<Option<(ClassId, ClassStat)>> = Vec::new();
        for class in tree.iter() {
            let idx = class.id.index();
            if entries.len() <= idx {
                entries.resize(idx + 1, None);
            }
            entries[idx] = Some((class.id, class.stat()));
        }
        Self { entries }
    }

    pub fn get(&self, id: ClassId) -> Result<&ClassStat, TreeError> {
        self.entries
            .get(id.index())
            .and_then(Option::as_ref)
            .filter(|(c, _)| *c == id)
            .map(|(_, s)| s)
            .ok_or(TreeError::StructuralRace(id))
    }

    pub fn get_mut(&mut self, id: ClassId) -> Result<&mut ClassStat, TreeError> {
        self.entries
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .filter(|(c, _)| *c == id)
            .map(|(_, s)| s)
            .ok_or(TreeError::StructuralRace(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &ClassStat)> {
        self.entries.iter().filter_map(|e| e.as_ref().map(|(id, s)| (*id, s)))
    }

    // PUBLISH EVERY STAGED STAT. CLASSES FREED SINCE THE SNAPSHOT ARE SKIPPED.
    pub fn commit(&self, tree: &ClassTree) {
        for (id, stat) in self.iter() {
            if let Some(class) = tree.get(id) {
                *class.stat.lock() = *stat;
            }
        }
    }
}

pub struct CpuClass {
    id: ClassId,
    name: String,
    kind: ClassKind,
    pub(crate) shares: Shares,
    pub(crate) stat: spin::Mutex<ClassStat>,
    pub(crate) children: Vec<ClassId>,
    pub(crate) demand: Arc<ClassDemand>,
    pub(crate) total_ns: AtomicU64,
    pub(crate) destroying: bool,
}

impl CpuClass {
    pub fn id(&self) -> ClassId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ClassKind {
        self.kind
    }

    pub fn parent(&self) -> Option<ClassId> {
        match self.kind {
            ClassKind::Root => None,
            ClassKind::Child { parent } => Some(parent),
        }
    }

    pub fn is_root(&self) -> bool {
        self.kind == ClassKind::Root
    }

    pub fn shares(&self) -> Shares {
        self.shares
    }

    pub fn stat(&self) -> ClassStat {
        *self.stat.lock()
    }

    pub fn children(&self) -> &[ClassId] {
        &self.children
    }

    pub fn demand(&self) -> &Arc<ClassDemand> {
        &self.demand
    }

    pub fn total_ns(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }

    pub fn is_destroying(&self) -> bool {
        self.destroying
    }
}

struct Slot {
    generation: u32,
    class: Option<CpuClass>,
}

pub struct ClassTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    root: ClassId,
    nr_cpus: usize,
    demand_interval_ns: u64,
}

impl ClassTree {
    pub fn new(nr_cpus: usize, demand_interval_ns: u64, now_ns: u64) -> Self {
        let mut tree = Self {
            slots: Vec::new(),
            free: Vec::new(),
            root: ClassId { index: 0, generation: 0 },
            nr_cpus: nr_cpus.max(1),
            demand_interval_ns,
        };
        tree.root = tree.alloc("root", ClassKind::Root, Shares::root(), now_ns);
        tree
    }

    pub fn root(&self) -> ClassId {
        self.root
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn get(&self, id: ClassId) -> Option<&CpuClass> {
        self.slots
            .get(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.class.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ClassId) -> Option<&mut CpuClass> {
        self.slots
            .get_mut(id.index())
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.class.as_mut())
    }

    pub fn lookup(&self, id: ClassId) -> Result<&CpuClass, TreeError> {
        self.get(id).ok_or(TreeError::UnknownClass(id))
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.class.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // EVERY LIVE CLASS, INCLUDING ONES DETACHED AND WAITING TO DRAIN
    pub fn iter(&self) -> impl Iterator<Item = &CpuClass> {
        self.slots.iter().filter_map(|s| s.class.as_ref())
    }

    pub fn find_by_name(&self, name: &str) -> Option<ClassId> {
        self.iter().find(|c| c.name == name && !c.destroying).map(|c| c.id)
    }

    // ATTACHED CLASSES, PARENTS BEFORE CHILDREN, CHILDREN IN CREATION ORDER.
    // STOPS AT THE FIRST CHILD ID THAT NO LONGER RESOLVES.
    pub fn preorder(&self) -> Result<Vec<ClassId>, TreeError> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let class = self.get(id).ok_or(TreeError::StructuralRace(id))?;
            order.push(id);
            stack.extend(class.children.iter().rev().copied());
        }
        Ok(order)
    }

    pub(crate) fn insert_child(&mut self, parent: ClassId, name: &str, shares: Shares, now_ns: u64) -> Result<ClassId, TreeError> {
        let p = self.lookup(parent)?;
        if p.destroying {
            return Err(TreeError::Destroying(parent));
        }
        let id = self.alloc(name, ClassKind::Child { parent }, shares, now_ns);
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        Ok(id)
    }

    // UNLINK FROM THE PARENT'S CHILD LIST. THE SLOT STAYS LIVE UNTIL free().
    pub(crate) fn detach(&mut self, id: ClassId) {
        let parent = self.get(id).and_then(|c| c.parent());
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.retain(|&c| c != id);
        }
        if let Some(c) = self.get_mut(id) {
            c.destroying = true;
        }
    }

    pub(crate) fn free(&mut self, id: ClassId) -> Option<CpuClass> {
        let slot = self.slots.get_mut(id.index()).filter(|s| s.generation == id.generation)?;
        let class = slot.class.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(class)
    }

    fn alloc(&mut self, name: &str, kind: ClassKind, shares: Shares, now_ns: u64) -> ClassId {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot { generation: 0, class: None });
                (self.slots.len() - 1) as u32
            }
        };
        let generation = self.slots[index as usize].generation;
        let id = ClassId { index, generation };
        self.slots[index as usize].class = Some(CpuClass {
            id,
            name: name.to_string(),
            kind,
            shares,
            stat: spin::Mutex::new(ClassStat::default()),
            children: Vec::new(),
            demand: Arc::new(ClassDemand::new(self.nr_cpus, self.demand_interval_ns, now_ns)),
            total_ns: AtomicU64::new(0),
            destroying: false,
        });
        id
    }

    #[cfg(test)]
    pub(crate) fn corrupt_child_list(&mut self, parent: ClassId, bogus: ClassId) {
        if let Some(p) = self.get_mut(parent) {
            p.children.push(bogus);
        }
    }
}

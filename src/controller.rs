// SHAREFLOW CPU CONTROLLER
// THE SCHEDULER CONTEXT: OWNS THE CLASS ARENA, THE PER-CPU RUN QUEUES, THE
// MONITOR AND ITS EVENT LOG. NO GLOBAL STATE.
//
// LOCK ORDER (OUTERMOST FIRST):
//   tree (RwLock) -> monitor guard -> cpu queue
// class stat, zombies AND events ARE LEAF LOCKS, NEVER HELD ACROSS ANOTHER
// ACQUISITION.
//
// CONFIGURATION CHANGES TAKE THE TREE FOR WRITE AND FINISH A FORCED MONITOR
// CYCLE BEFORE RELEASING IT. HOT-PATH CALLS TOUCH ONE CPU QUEUE ONLY.

use log::{debug, info, warn};

use crate::accountant::{children_max_limit, release_class};
use crate::class::{ClassId, ClassStat, ClassTree};
use crate::cpu::{CpuRunQueue, Disposition};
use crate::demand::DemandEvent;
use crate::error::{ControllerError, TreeError};
use crate::event::EventLog;
use crate::monitor::{CycleOutcome, Monitor};
use crate::runqueue::{QueueState, Task, TaskId};
use crate::share::{self, ShareUpdate, Shares};
use crate::tuning::ControllerConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    // TASKS STILL QUEUED SOMEWHERE: FREED BY A LATER MONITOR CYCLE
    Deferred,
}

// READ-ONLY VIEW OF ONE LOCAL RUN QUEUE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueView {
    pub class: ClassId,
    pub cpu: usize,
    pub state: QueueState,
    pub priority: u64,
    pub local_virtual_time: u64,
    pub local_weight: u32,
    pub over_weight: u32,
    pub skewed: bool,
    pub savings: u64,
    pub load: u64,
    pub nr_running: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassStatSnapshot {
    pub id: ClassId,
    pub name: String,
    pub parent: Option<ClassId>,
    pub shares: Shares,
    pub stat: ClassStat,
    pub total_ns: u64,
    pub cpus: Vec<QueueView>,
}

impl ClassStatSnapshot {
    pub fn nr_running(&self) -> usize {
        self.cpus.iter().map(|q| q.nr_running).sum()
    }

    pub fn savings(&self) -> u64 {
        self.cpus.iter().map(|q| q.savings).sum()
    }
}

pub struct CpuController {
    config: ControllerConfig,
    tree: spin::RwLock<ClassTree>,
    cpus: Vec<spin::Mutex<CpuRunQueue>>,
    monitor: Monitor,
    zombies: spin::Mutex<Vec<ClassId>>,
    events: spin::Mutex<EventLog>,
}

impl CpuController {
    pub fn new(config: ControllerConfig, now_ns: u64) -> Self {
        let config = ControllerConfig { nr_cpus: config.nr_cpus.max(1), ..config };
        let tree = ClassTree::new(config.nr_cpus, config.class_demand_interval_ns, now_ns);
        let root = tree.root();
        let cpus = (0..config.nr_cpus)
            .map(|cpu| {
                let mut rq = CpuRunQueue::new(cpu, root, &config);
                if let Some(r) = tree.get(root) {
                    rq.attach(root, r.demand().clone(), now_ns);
                }
                spin::Mutex::new(rq)
            })
            .collect();
        let ctl = Self {
            config,
            tree: spin::RwLock::new(tree),
            cpus,
            monitor: Monitor::new(config.monitor_min_interval_ns, config.boost_weight),
            zombies: spin::Mutex::new(Vec::new()),
            events: spin::Mutex::new(EventLog::new()),
        };
        {
            let tree = ctl.tree.read();
            ctl.record(ctl.monitor.run(&tree, &ctl.cpus, now_ns, true));
        }
        ctl
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn root(&self) -> ClassId {
        self.tree.read().root()
    }

    pub fn class_by_name(&self, name: &str) -> Option<ClassId> {
        self.tree.read().find_by_name(name)
    }

    pub fn events(&self) -> spin::MutexGuard<'_, EventLog> {
        self.events.lock()
    }

    pub fn monitor_cycles(&self) -> u64 {
        self.monitor.cycles()
    }

    // === CONFIGURATION ===

    pub fn create_class(
        &self,
        parent: ClassId,
        name: &str,
        update: Option<ShareUpdate>,
        now_ns: u64,
    ) -> Result<ClassId, ControllerError> {
        let mut tree = self.tree.write();
        let p = tree.lookup(parent)?;
        if p.is_destroying() {
            return Err(TreeError::Destroying(parent).into());
        }
        let p_shares = p.shares;
        let shares = match update {
            Some(u) => share::validate(&u, &Shares::child_default(), Some(&p_shares))?,
            None => Shares::child_default(),
        };

        let id = tree.insert_child(parent, name, shares, now_ns)?;
        let cur_max = children_max_limit(&tree, parent, None);
        if let Some(p) = tree.get_mut(parent) {
            p.shares.child_guarantee_changed(share::Share::ZERO, shares.my_guarantee);
            p.shares.cur_max_limit = cur_max;
        }
        if let Some(c) = tree.get(id) {
            for rq in &self.cpus {
                rq.lock().attach(id, c.demand().clone(), now_ns);
            }
        }

        info!("class {} ({}) created under {}, guarantee {} limit {}",
            name, id, parent, shares.my_guarantee, shares.my_limit);
        self.record(self.monitor.run(&tree, &self.cpus, now_ns, true));
        Ok(id)
    }

    pub fn destroy_class(&self, id: ClassId, now_ns: u64) -> Result<DestroyOutcome, ControllerError> {
        let mut tree = self.tree.write();
        let class = tree.lookup(id)?;
        if class.is_root() {
            return Err(TreeError::RootImmutable.into());
        }
        if class.is_destroying() {
            return Err(TreeError::Destroying(id).into());
        }
        if !class.children().is_empty() {
            return Err(TreeError::HasChildren(id).into());
        }

        release_class(&mut tree, id)?;
        tree.detach(id);
        for rq in &self.cpus {
            rq.lock().close(id);
        }

        let outcome = if self.try_reap(&mut tree, id) {
            info!("class {} destroyed", id);
            DestroyOutcome::Destroyed
        } else {
            info!("class {} still has runnable tasks, destruction deferred", id);
            self.zombies.lock().push(id);
            DestroyOutcome::Deferred
        };
        self.record(self.monitor.run(&tree, &self.cpus, now_ns, true));
        Ok(outcome)
    }

    pub fn set_shares(&self, id: ClassId, update: ShareUpdate, now_ns: u64) -> Result<(), ControllerError> {
        let mut tree = self.tree.write();
        let class = tree.lookup(id)?;
        if class.is_destroying() {
            return Err(TreeError::Destroying(id).into());
        }
        let cur = class.shares;
        let parent = class.parent();
        let p_shares = match parent {
            Some(p) => Some(tree.lookup(p)?.shares),
            None => None,
        };

        let next = share::validate(&update, &cur, p_shares.as_ref())?;
        if let Some(c) = tree.get_mut(id) {
            c.shares = next;
        }
        if let Some(p) = parent {
            let cur_max = children_max_limit(&tree, p, None);
            if let Some(pc) = tree.get_mut(p) {
                pc.shares.child_guarantee_changed(cur.my_guarantee, next.my_guarantee);
                pc.shares.cur_max_limit = cur_max;
            }
        }

        debug!("class {} shares now guarantee {} limit {} total {} max {}",
            id, next.my_guarantee, next.my_limit, next.total_guarantee, next.max_limit);
        self.record(self.monitor.run(&tree, &self.cpus, now_ns, true));
        Ok(())
    }

    pub fn get_shares(&self, id: ClassId) -> Result<Shares, TreeError> {
        Ok(self.tree.read().lookup(id)?.shares())
    }

    pub fn get_stats(&self, id: ClassId) -> Result<ClassStatSnapshot, TreeError> {
        let tree = self.tree.read();
        let class = tree.lookup(id)?;
        let stat = class.stat();
        let cpus = self.cpus.iter().filter_map(|rq| view(&rq.lock(), id)).collect();
        Ok(ClassStatSnapshot {
            id,
            name: class.name().to_string(),
            parent: class.parent(),
            shares: class.shares(),
            stat,
            total_ns: class.total_ns(),
            cpus,
        })
    }

    // === BASE SCHEDULER HOT PATH ===

    pub fn enqueue_task(&self, task: Task, now_ns: u64) {
        if let Some(rq) = self.cpus.get(task.cpu) {
            rq.lock().enqueue(task, now_ns);
        }
    }

    pub fn dequeue_task(&self, cpu: usize, id: TaskId, now_ns: u64) -> Option<Task> {
        self.cpus.get(cpu)?.lock().dequeue(id, now_ns)
    }

    pub fn pick_next(&self, cpu: usize, now_ns: u64) -> Option<Task> {
        self.cpus.get(cpu)?.lock().pick_next(now_ns)
    }

    pub fn put_prev(&self, cpu: usize, id: TaskId, ran_ns: u64, disposition: Disposition, now_ns: u64) -> bool {
        match self.cpus.get(cpu) {
            Some(rq) => rq.lock().put_prev(id, ran_ns, disposition, now_ns),
            None => false,
        }
    }

    pub fn change_class(&self, cpu: usize, id: TaskId, class: ClassId, now_ns: u64) -> Option<Task> {
        self.cpus.get(cpu)?.lock().change_class(id, class, now_ns)
    }

    pub fn on_schedule_event(&self, cpu: usize, class: ClassId, event: DemandEvent, now_ns: u64) {
        if let Some(rq) = self.cpus.get(cpu) {
            rq.lock().demand_event(class, event, now_ns);
        }
    }

    // FOLD OPEN SLEEP SPANS ON ONE CPU WITHOUT WAITING FOR THE MONITOR
    pub fn check_sleep(&self, cpu: usize, now_ns: u64) {
        if let Some(rq) = self.cpus.get(cpu) {
            rq.lock().check_sleep(now_ns);
        }
    }

    pub fn lookup_queue(&self, class: ClassId, cpu: usize) -> Option<QueueView> {
        view(&self.cpus.get(cpu)?.lock(), class)
    }

    // THE QUEUE pick_next WOULD SERVE
    pub fn next_queue(&self, cpu: usize) -> Option<QueueView> {
        let rq = self.cpus.get(cpu)?.lock();
        let (_, class) = rq.classqueue().head()?;
        view(&rq, class)
    }

    // === MONITOR ===

    pub fn run_monitor(&self, now_ns: u64) -> CycleOutcome {
        if !self.zombies.lock().is_empty() {
            self.reap_zombies();
        }
        let tree = self.tree.read();
        let outcome = self.monitor.run(&tree, &self.cpus, now_ns, false);
        self.record(outcome);
        outcome
    }

    fn reap_zombies(&self) {
        let mut tree = self.tree.write();
        let pending: Vec<ClassId> = std::mem::take(&mut *self.zombies.lock());
        let mut still = Vec::new();
        for id in pending {
            if self.try_reap(&mut tree, id) {
                info!("class {} drained and destroyed", id);
            } else {
                still.push(id);
            }
        }
        self.zombies.lock().extend(still);
    }

    // FREE THE CLASS IF EVERY CPU REPORTS ITS QUEUE EMPTY
    fn try_reap(&self, tree: &mut ClassTree, id: ClassId) -> bool {
        if !self.cpus.iter().all(|rq| rq.lock().is_class_idle(id)) {
            return false;
        }
        for rq in &self.cpus {
            rq.lock().detach(id);
        }
        tree.free(id).is_some()
    }

    fn record(&self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Completed(report) => self.events.lock().snapshot(&report),
            CycleOutcome::Aborted(e) => warn!("monitor: {}", e),
            CycleOutcome::Skipped(_) => {}
        }
    }

    // === DIAGNOSTICS ===

    pub fn report(&self) -> String {
        let tree = self.tree.read();
        let mut out = String::new();
        out.push_str(&format!("{:<24} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>7} {:>7} {:>10}\n",
            "CLASS", "GRT", "LIM", "EGRT", "EHL", "ESHARE", "MESHARE", "DEMAND", "MAXDEM", "CPU_MS"));
        out.push_str(&"-".repeat(96));
        out.push('\n');

        let mut stack: Vec<(ClassId, usize)> = vec![(tree.root(), 0)];
        while let Some((id, depth)) = stack.pop() {
            let Some(c) = tree.get(id) else {
                continue;
            };
            let s = c.stat();
            let label = format!("{}{}", "  ".repeat(depth), c.name());
            out.push_str(&format!("{:<24} {:>6} {:>6} {:>6} {:>6} {:>7} {:>7} {:>7} {:>7} {:>10}\n",
                label, c.shares.my_guarantee, c.shares.my_limit, s.egrt, s.ehl,
                s.eshare, s.meshare, s.self_demand, s.max_demand, c.total_ns() / 1_000_000));
            stack.extend(c.children().iter().rev().map(|&k| (k, depth + 1)));
        }

        let zombies = self.zombies.lock().len();
        if zombies > 0 {
            out.push_str(&format!("({} class(es) draining)\n", zombies));
        }
        out
    }
}

fn view(rq: &CpuRunQueue, class: ClassId) -> Option<QueueView> {
    let q = rq.lrq(class)?;
    Some(QueueView {
        class,
        cpu: rq.cpu(),
        state: q.state(),
        priority: q.priority(),
        local_virtual_time: q.local_virtual_time(),
        local_weight: q.local_weight(),
        over_weight: q.over_weight(),
        skewed: q.is_skewed(),
        savings: q.savings(),
        load: q.load(),
        nr_running: q.nr_running(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InvalidShareError;
    use crate::share::{Share, SHARE_SCALE};

    const MS: u64 = 1_000_000;

    fn ctl(nr_cpus: usize) -> CpuController {
        CpuController::new(ControllerConfig::with_cpus(nr_cpus), 1)
    }

    fn task(id: u64, class: ClassId, cpu: usize) -> Task {
        Task { id: TaskId(id), class, cpu, prio: 120 }
    }

    #[test]
    fn new_runs_initial_cycle() {
        let c = ctl(2);
        assert_eq!(c.monitor_cycles(), 1);
        assert_eq!(c.events().len(), 1);
        let root = c.get_stats(c.root()).unwrap();
        assert_eq!(root.stat.egrt, Share::FULL);
        assert_eq!(root.cpus.len(), 2);
    }

    #[test]
    fn create_moves_parent_pool() {
        let c = ctl(1);
        let root = c.root();
        let a = c
            .create_class(root, "a", Some(ShareUpdate::guarantee_limit(Share::new(2000), Share::new(4000))), 10)
            .unwrap();
        let rs = c.get_shares(root).unwrap();
        assert_eq!(rs.unused_guarantee, Share::new(SHARE_SCALE - 2000));
        assert_eq!(rs.cur_max_limit, Share::new(4000));
        assert_eq!(c.get_stats(a).unwrap().stat.egrt, Share::new(2000));
        assert_eq!(c.class_by_name("a"), Some(a));
    }

    #[test]
    fn create_rejects_bad_shares_atomically() {
        let c = ctl(1);
        let root = c.root();
        let err = c
            .create_class(root, "a", Some(ShareUpdate::guarantee_limit(Share::new(5000), Share::new(4000))), 10)
            .unwrap_err();
        assert!(matches!(err, ControllerError::Share(InvalidShareError::LimitBelowGuarantee { .. })));
        assert_eq!(c.class_by_name("a"), None);
        assert_eq!(c.get_shares(root).unwrap().unused_guarantee, Share::FULL);
    }

    #[test]
    fn set_shares_commits_and_recomputes() {
        let c = ctl(1);
        let root = c.root();
        let a = c.create_class(root, "a", None, 10).unwrap();
        assert_eq!(c.get_stats(a).unwrap().stat.egrt, Share::ZERO);

        c.set_shares(a, ShareUpdate::guarantee_limit(Share::new(3000), Share::FULL), 20).unwrap();
        assert_eq!(c.get_stats(a).unwrap().stat.egrt, Share::new(3000));
        assert_eq!(c.get_shares(root).unwrap().unused_guarantee, Share::new(SHARE_SCALE - 3000));

        let b = c.create_class(root, "b", None, 30).unwrap();
        let err = c
            .set_shares(b, ShareUpdate { my_guarantee: Some(Share::new(SHARE_SCALE - 2999)), ..Default::default() }, 40)
            .unwrap_err();
        assert!(matches!(err, ControllerError::Share(InvalidShareError::GuaranteeExceedsPool { .. })));
        assert_eq!(c.get_shares(b).unwrap().my_guarantee, Share::ZERO);
    }

    #[test]
    fn destroy_idle_class_frees_immediately() {
        let c = ctl(1);
        let root = c.root();
        let a = c
            .create_class(root, "a", Some(ShareUpdate::guarantee_limit(Share::new(1000), Share::FULL)), 10)
            .unwrap();
        assert_eq!(c.destroy_class(a, 20), Ok(DestroyOutcome::Destroyed));
        assert_eq!(c.get_shares(root).unwrap().unused_guarantee, Share::FULL);
        assert_eq!(c.get_stats(a).unwrap_err(), TreeError::UnknownClass(a));
    }

    #[test]
    fn destroy_busy_class_is_deferred() {
        let c = ctl(1);
        let root = c.root();
        let a = c.create_class(root, "a", None, 10).unwrap();
        c.enqueue_task(task(1, a, 0), 20);
        assert_eq!(c.destroy_class(a, 30), Ok(DestroyOutcome::Deferred));
        assert_eq!(c.destroy_class(a, 31), Err(ControllerError::Tree(TreeError::Destroying(a))));
        assert!(c.report().contains("draining"));

        // NEW ARRIVALS GO TO THE ROOT
        c.enqueue_task(task(2, a, 0), 40);
        assert_eq!(c.lookup_queue(root, 0).unwrap().nr_running, 1);

        c.dequeue_task(0, TaskId(1), 50);
        c.run_monitor(2_000 * MS);
        assert!(c.get_stats(a).is_err());
    }

    #[test]
    fn destroy_guards() {
        let c = ctl(1);
        let root = c.root();
        let a = c.create_class(root, "a", None, 10).unwrap();
        c.create_class(a, "a1", None, 10).unwrap();
        assert_eq!(c.destroy_class(root, 20), Err(ControllerError::Tree(TreeError::RootImmutable)));
        assert_eq!(c.destroy_class(a, 20), Err(ControllerError::Tree(TreeError::HasChildren(a))));
    }

    #[test]
    fn hot_path_round_trip() {
        let c = ctl(2);
        let root = c.root();
        let a = c.create_class(root, "a", None, 10).unwrap();
        c.enqueue_task(task(1, a, 1), 20);
        assert!(c.pick_next(0, 20).is_none());
        let t = c.pick_next(1, 20).unwrap();
        assert_eq!(t.class, a);
        assert!(c.put_prev(1, t.id, 3 * MS, Disposition::Expired, 25));
        assert_eq!(c.next_queue(1).unwrap().class, a);
        assert_eq!(c.lookup_queue(a, 1).unwrap().state, QueueState::ExpiredPendingSwap);
        assert!(c.pick_next(9, 30).is_none());
    }

    #[test]
    fn change_class_through_controller() {
        let c = ctl(1);
        let root = c.root();
        let a = c.create_class(root, "a", None, 10).unwrap();
        let b = c.create_class(root, "b", None, 10).unwrap();
        c.enqueue_task(task(1, a, 0), 20);
        assert_eq!(c.change_class(0, TaskId(1), b, 30).unwrap().class, b);
        assert_eq!(c.get_stats(b).unwrap().nr_running(), 1);
        assert_eq!(c.get_stats(a).unwrap().nr_running(), 0);
    }

    #[test]
    fn report_lists_tree() {
        let c = ctl(1);
        let root = c.root();
        let a = c.create_class(root, "alpha", None, 10).unwrap();
        c.create_class(a, "beta", None, 10).unwrap();
        let text = c.report();
        assert!(text.contains("root"));
        assert!(text.contains("  alpha"));
        assert!(text.contains("    beta"));
    }
}

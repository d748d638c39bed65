// SHAREFLOW PER-CPU RUN QUEUE
// EVERYTHING ONE CPU'S HOT PATH TOUCHES: ONE LOCAL RUN QUEUE PER CLASS, THE
// CLASS QUEUE ORDERING THEM, AND THE TASKS ASSIGNED TO THIS CPU.
//
// PROTOCOL WITH THE BASE SCHEDULER:
//   enqueue     TASK BECAME RUNNABLE ON THIS CPU
//   pick_next   CHOOSE AND START THE NEXT TASK
//   put_prev    THE RUNNING TASK STOPPED (REQUEUE / EXPIRED / SLEEP)
//   dequeue     TASK LEFT THIS CPU FOR GOOD (EXIT OR MIGRATION)
//
// NOTHING HERE WALKS THE CLASS TREE OR READS ANOTHER CPU.

use std::collections::HashMap;
use std::sync::Arc;

use crate::class::ClassId;
use crate::classqueue::ClassQueue;
use crate::demand::{ClassDemand, DemandEvent, DemandStat};
use crate::runqueue::{LocalRunQueue, Task, TaskId};
use crate::tuning::{ControllerConfig, LOAD_FLOOR};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Disposition {
    // PREEMPTED WITH SLICE LEFT: BACK INTO ACTIVE
    Requeue,
    // SLICE EXHAUSTED: INTO EXPIRED
    Expired,
    // BLOCKED: STAYS ASSIGNED TO THIS CPU BUT NOT RUNNABLE
    Sleep,
}

struct TaskEntry {
    task: Task,
    demand: DemandStat,
    runnable: bool,
}

pub struct CpuRunQueue {
    cpu: usize,
    root: ClassId,
    lrqs: Vec<Option<LocalRunQueue>>,
    classqueue: ClassQueue,
    tasks: HashMap<TaskId, TaskEntry>,
    current: Option<TaskId>,
    // NO RUNNABLE QUEUE ON THIS CPU HAS A VIRTUAL TIME BELOW THIS
    min_vt: u64,
    boost_weight: u32,
    savings_cap_ns: u64,
    task_demand_interval_ns: u64,
}

impl CpuRunQueue {
    pub fn new(cpu: usize, root: ClassId, config: &ControllerConfig) -> Self {
        Self {
            cpu,
            root,
            lrqs: Vec::new(),
            classqueue: ClassQueue::new(),
            tasks: HashMap::new(),
            current: None,
            min_vt: 0,
            boost_weight: config.boost_weight.max(1),
            savings_cap_ns: config.savings_cap_ns,
            task_demand_interval_ns: config.task_demand_interval_ns,
        }
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub fn min_virtual_time(&self) -> u64 {
        self.min_vt
    }

    pub fn classqueue(&self) -> &ClassQueue {
        &self.classqueue
    }

    pub fn lrq(&self, class: ClassId) -> Option<&LocalRunQueue> {
        self.lrqs
            .get(class.index())
            .and_then(Option::as_ref)
            .filter(|q| q.class() == class)
    }

    pub(crate) fn lrq_mut(&mut self, class: ClassId) -> Option<&mut LocalRunQueue> {
        self.lrqs
            .get_mut(class.index())
            .and_then(Option::as_mut)
            .filter(|q| q.class() == class)
    }

    pub fn lrqs(&self) -> impl Iterator<Item = &LocalRunQueue> {
        self.lrqs.iter().filter_map(Option::as_ref)
    }

    pub(crate) fn lrqs_mut(&mut self) -> impl Iterator<Item = &mut LocalRunQueue> {
        self.lrqs.iter_mut().filter_map(Option::as_mut)
    }

    pub fn current(&self) -> Option<Task> {
        self.current.and_then(|id| self.task(id))
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.tasks.get(&id).map(|e| e.task)
    }

    pub fn task_demand(&self, id: TaskId) -> Option<u32> {
        self.tasks.get(&id).map(|e| e.demand.cpu_demand())
    }

    pub fn nr_running(&self) -> usize {
        self.lrqs().map(LocalRunQueue::nr_running).sum()
    }

    pub(crate) fn attach(&mut self, class: ClassId, demand: Arc<ClassDemand>, now_ns: u64) {
        let idx = class.index();
        if self.lrqs.len() <= idx {
            self.lrqs.resize_with(idx + 1, || None);
        }
        self.lrqs[idx] = Some(LocalRunQueue::new(class, demand, now_ns));
    }

    // DROP A CLASS'S QUEUE ONCE IT HOLDS NO RUNNABLE TASK. SLEEPING TASKS
    // STILL POINTING AT IT ARE HANDED TO THE ROOT. RETURNS FALSE WHILE BUSY.
    pub(crate) fn detach(&mut self, class: ClassId) -> bool {
        match self.lrq(class) {
            Some(q) if !q.is_empty() => return false,
            Some(_) => {}
            None => return true,
        }
        for entry in self.tasks.values_mut() {
            if entry.task.class == class {
                entry.task.class = self.root;
            }
        }
        self.lrqs[class.index()] = None;
        true
    }

    pub fn is_class_idle(&self, class: ClassId) -> bool {
        self.lrq(class).map_or(true, LocalRunQueue::is_empty)
    }

    // STOP ACCEPTING TASKS FOR A CLASS THAT IS GOING AWAY
    pub(crate) fn close(&mut self, class: ClassId) {
        if let Some(q) = self.lrq_mut(class) {
            q.closing = true;
        }
    }

    // CLASS IDS THAT ARE NOT (OR NO LONGER) KNOWN FALL BACK TO THE ROOT
    fn resolve(&self, class: ClassId) -> ClassId {
        match self.lrq(class) {
            Some(q) if !q.closing => class,
            _ => self.root,
        }
    }

    pub fn enqueue(&mut self, task: Task, now_ns: u64) {
        let class = self.resolve(task.class);
        let task = Task { class, cpu: self.cpu, ..task };
        let interval = self.task_demand_interval_ns;
        let entry = self.tasks.entry(task.id).or_insert_with(|| TaskEntry {
            task,
            demand: DemandStat::new(interval, now_ns),
            runnable: false,
        });
        if entry.runnable {
            return;
        }
        entry.runnable = true;
        entry.task = task;
        entry.demand.event(DemandEvent::EnterRun, now_ns);

        self.wake_class(class, now_ns);
        if let Some(q) = self.lrq_mut(class) {
            q.push(task.id, task.prio, false, now_ns);
        }
        self.settle(class, now_ns);
    }

    pub fn dequeue(&mut self, id: TaskId, now_ns: u64) -> Option<Task> {
        let entry = self.tasks.remove(&id)?;
        let task = entry.task;
        if entry.runnable {
            self.unlink(task, now_ns);
        }
        Some(task)
    }

    pub fn pick_next(&mut self, now_ns: u64) -> Option<Task> {
        if let Some(prev) = self.current {
            self.put_prev(prev, 0, Disposition::Requeue, now_ns);
        }
        let (_, class) = self.classqueue.head()?;
        let (id, _) = self.lrq_mut(class)?.pop_next()?;
        if let Some(q) = self.lrq_mut(class) {
            q.running = true;
        }
        self.current = Some(id);
        self.settle(class, now_ns);
        self.task(id)
    }

    pub fn put_prev(&mut self, id: TaskId, ran_ns: u64, disposition: Disposition, now_ns: u64) -> bool {
        if self.current != Some(id) {
            return false;
        }
        self.current = None;
        let cpu = self.cpu;
        let Some(entry) = self.tasks.get_mut(&id) else {
            return false;
        };
        entry.demand.event(DemandEvent::Ran(ran_ns), now_ns);
        if disposition == Disposition::Sleep {
            entry.runnable = false;
            entry.demand.event(DemandEvent::EnterSleep, now_ns);
        }
        let task = entry.task;

        if let Some(q) = self.lrq_mut(task.class) {
            q.running = false;
            q.advance(ran_ns);
            if let Some(d) = q.demand.cpu(cpu) {
                d.event(DemandEvent::Ran(ran_ns), now_ns);
            }
            match disposition {
                Disposition::Requeue => q.push(id, task.prio, false, now_ns),
                Disposition::Expired => q.push(id, task.prio, true, now_ns),
                Disposition::Sleep => {}
            }
        }
        self.settle(task.class, now_ns);
        true
    }

    // MOVE A TASK TO ANOTHER CLASS'S QUEUE ON THIS CPU
    pub fn change_class(&mut self, id: TaskId, class: ClassId, now_ns: u64) -> Option<Task> {
        let class = self.resolve(class);
        let old = self.tasks.get(&id)?.task;
        if old.class == class {
            return Some(old);
        }
        let runnable = self.tasks.get(&id).is_some_and(|e| e.runnable);
        let running = self.current == Some(id);
        if runnable {
            self.unlink(old, now_ns);
        }
        let task = Task { class, ..old };
        if let Some(e) = self.tasks.get_mut(&id) {
            e.task = task;
        }
        if runnable {
            self.wake_class(class, now_ns);
            if let Some(q) = self.lrq_mut(class) {
                if running {
                    q.running = true;
                } else {
                    q.push(id, task.prio, false, now_ns);
                }
            }
            if running {
                self.current = Some(id);
            }
            self.settle(class, now_ns);
        }
        Some(task)
    }

    // RAW DEMAND EVENT FOR A CLASS ON THIS CPU
    pub fn demand_event(&self, class: ClassId, ev: DemandEvent, now_ns: u64) {
        let class = self.resolve(class);
        if let Some(d) = self.lrq(class).and_then(|q| q.demand.cpu(self.cpu)) {
            d.event(ev, now_ns);
        }
    }

    // FOLD OPEN SLEEP SPANS OF EVERY CLASS ON THIS CPU
    pub(crate) fn check_sleep(&self, now_ns: u64) {
        for q in self.lrqs() {
            if let Some(d) = q.demand.cpu(self.cpu) {
                d.check_sleep(now_ns);
            }
        }
    }

    // LOAD = SUM OF RUNNABLE TASK DEMAND, AT LEAST LOAD_FLOOR WHEN NON-EMPTY
    pub(crate) fn refresh_loads(&mut self) {
        let mut loads: Vec<u64> = vec![0; self.lrqs.len()];
        for e in self.tasks.values().filter(|e| e.runnable) {
            if let Some(l) = loads.get_mut(e.task.class.index()) {
                *l += e.demand.cpu_demand() as u64;
            }
        }
        for (q, load) in self.lrqs.iter_mut().zip(loads) {
            if let Some(q) = q {
                q.load = if q.is_empty() { 0 } else { load.max(LOAD_FLOOR) };
            }
        }
    }

    // REMOVE A RUNNABLE TASK FROM ITS QUEUE (OR FROM THE CPU IF RUNNING)
    fn unlink(&mut self, task: Task, now_ns: u64) {
        let running = self.current == Some(task.id);
        if running {
            self.current = None;
        }
        if let Some(q) = self.lrq_mut(task.class) {
            if running {
                q.running = false;
            } else {
                q.remove(task.id, task.prio);
            }
        }
        self.settle(task.class, now_ns);
    }

    // EMPTY -> ACTIVE: NO HEAD START FROM IDLING, BUT BANK THE IDLE TIME
    fn wake_class(&mut self, class: ClassId, now_ns: u64) {
        if !self.lrq(class).is_some_and(LocalRunQueue::is_empty) {
            return;
        }
        let floor = self.runnable_min_vt(class).unwrap_or(self.min_vt);
        self.min_vt = self.min_vt.max(floor);
        let (cpu, boost, cap) = (self.cpu, self.boost_weight, self.savings_cap_ns);
        if let Some(q) = self.lrq_mut(class) {
            q.lift_virtual_time(floor);
            q.local_weight = q.local_weight.max(boost);
            if q.idle_since != 0 {
                q.savings = q.savings.saturating_add(now_ns.saturating_sub(q.idle_since)).min(cap);
                q.idle_since = 0;
            }
            if let Some(d) = q.demand.cpu(cpu) {
                d.event(DemandEvent::EnterRun, now_ns);
            }
        }
    }

    // SYNC A QUEUE'S CLASS-QUEUE ENTRY WITH ITS CONTENTS
    fn settle(&mut self, class: ClassId, now_ns: u64) {
        let cpu = self.cpu;
        let Some(q) = self.lrqs.get_mut(class.index()).and_then(Option::as_mut).filter(|q| q.class() == class) else {
            return;
        };
        let old = q.cq_key.take();
        if let Some(key) = old {
            self.classqueue.remove(key, class);
        }
        if q.nr_queued() > 0 {
            q.cq_key = Some(self.classqueue.insert(class, q.priority()));
            return;
        }
        if !q.is_empty() || q.idle_since != 0 {
            return;
        }
        // ACTIVE -> EMPTY
        q.idle_since = now_ns.max(1);
        if let Some(d) = q.demand.cpu(cpu) {
            d.event(DemandEvent::EnterSleep, now_ns);
        }
        let vt = q.local_virtual_time;
        let floor = self.runnable_min_vt(class).unwrap_or(vt);
        self.min_vt = self.min_vt.max(floor);
    }

    fn runnable_min_vt(&self, except: ClassId) -> Option<u64> {
        self.lrqs()
            .filter(|q| q.class() != except && !q.is_empty())
            .map(LocalRunQueue::local_virtual_time)
            .min()
    }
}

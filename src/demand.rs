// SHAREFLOW DEMAND TRACKING
// SMOOTHED RUN/(RUN+SLEEP) RATIO PER CLASS PER CPU, IN SHARE UNITS.
//
// WRITERS ARE THE OWNING CPU'S HOT PATH (UNDER THAT CPU'S QUEUE LOCK) AND THE
// MONITOR'S check_sleep (UNDER THE SAME LOCK). READERS ON OTHER CPUS ONLY LOAD
// cpu_demand, SO RELAXED ATOMICS ARE ENOUGH: A ONE-TICK-STALE VALUE IS FINE.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::share::{Share, SHARE_SCALE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DemandEvent {
    // RESET AND START IN THE SLEEP STATE
    Init,
    // FIRST RUNNABLE TASK ARRIVED: CLOSE THE SLEEP SPAN
    EnterRun,
    // LAST RUNNABLE TASK LEFT: OPEN A SLEEP SPAN
    EnterSleep,
    // A TASK WAS DESCHEDULED AFTER RUNNING FOR THIS MANY NS
    Ran(u64),
}

pub struct DemandStat {
    run_ns: AtomicU64,
    total_ns: AtomicU64,
    // START OF THE CURRENT SLEEP SPAN. 0 = NOT SLEEPING.
    last_sleep: AtomicU64,
    cpu_demand: AtomicU64,
    recalc_interval_ns: u64,
}

impl DemandStat {
    pub fn new(recalc_interval_ns: u64, now_ns: u64) -> Self {
        let stat = Self {
            run_ns: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            last_sleep: AtomicU64::new(0),
            cpu_demand: AtomicU64::new(0),
            recalc_interval_ns: recalc_interval_ns.max(1),
        };
        stat.event(DemandEvent::Init, now_ns);
        stat
    }

    pub fn recalc_interval_ns(&self) -> u64 {
        self.recalc_interval_ns
    }

    pub fn cpu_demand(&self) -> u32 {
        self.cpu_demand.load(Ordering::Relaxed) as u32
    }

    pub fn is_sleeping(&self) -> bool {
        self.last_sleep.load(Ordering::Relaxed) != 0
    }

    pub fn event(&self, ev: DemandEvent, now_ns: u64) {
        match ev {
            DemandEvent::Init => {
                self.run_ns.store(0, Ordering::Relaxed);
                self.total_ns.store(0, Ordering::Relaxed);
                self.cpu_demand.store(0, Ordering::Relaxed);
                self.last_sleep.store(now_ns.max(1), Ordering::Relaxed);
            }
            DemandEvent::EnterRun => {
                let since = self.last_sleep.swap(0, Ordering::Relaxed);
                if since != 0 {
                    self.accumulate(false, now_ns.saturating_sub(since));
                }
            }
            DemandEvent::EnterSleep => {
                self.last_sleep.store(now_ns.max(1), Ordering::Relaxed);
            }
            DemandEvent::Ran(ns) => self.accumulate(true, ns),
        }
    }

    // FOLD AN OPEN SLEEP SPAN SO A LONG-IDLE QUEUE DOES NOT KEEP A STALE DEMAND
    pub fn check_sleep(&self, now_ns: u64) {
        let since = self.last_sleep.load(Ordering::Relaxed);
        if since == 0 || now_ns <= since {
            return;
        }
        self.last_sleep.store(now_ns, Ordering::Relaxed);
        self.accumulate(false, now_ns - since);
    }

    fn accumulate(&self, running: bool, len: u64) {
        let total = self.total_ns.load(Ordering::Relaxed).saturating_add(len);
        let mut run = self.run_ns.load(Ordering::Relaxed);
        if running {
            run = run.saturating_add(len);
        }

        if total < self.recalc_interval_ns {
            self.total_ns.store(total, Ordering::Relaxed);
            self.run_ns.store(run, Ordering::Relaxed);
            return;
        }

        // cpu_demand = (cpu_demand + run / total) / 2, IN SHARE UNITS
        let ratio = (run.min(total) as u128 * SHARE_SCALE as u128 / total as u128) as u64;
        let prev = self.cpu_demand.load(Ordering::Relaxed);
        let next = ((prev + ratio) >> 1).min(SHARE_SCALE as u64 - 1);
        self.cpu_demand.store(next, Ordering::Relaxed);
        self.total_ns.store(0, Ordering::Relaxed);
        self.run_ns.store(0, Ordering::Relaxed);
    }
}

// ONE DemandStat PER CPU FOR ONE CLASS
pub struct ClassDemand {
    cpus: Vec<DemandStat>,
}

impl ClassDemand {
    pub fn new(nr_cpus: usize, recalc_interval_ns: u64, now_ns: u64) -> Self {
        Self {
            cpus: (0..nr_cpus.max(1))
                .map(|_| DemandStat::new(recalc_interval_ns, now_ns))
                .collect(),
        }
    }

    pub fn cpu(&self, cpu: usize) -> Option<&DemandStat> {
        self.cpus.get(cpu)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    // CLASS'S OWN DEMAND (DESCENDANTS EXCLUDED): MEAN OVER ALL CPUS
    pub fn self_demand(&self) -> u32 {
        let sum: u64 = self.cpus.iter().map(|d| d.cpu_demand() as u64).sum();
        (sum / self.cpus.len() as u64) as u32
    }
}

// CLIP A DEMAND FIGURE TO THE CLASS'S EFFECTIVE HARD LIMIT
pub fn max_demand(demand: u32, ehl: Share) -> u32 {
    demand.min(ehl.or_full())
}

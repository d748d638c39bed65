// SHAREFLOW MONITOR
// ONE CONTROL CYCLE:
//   1. recompute_effectives     TOP-DOWN egrt / ehl
//   2. PER CPU: check_sleep, refresh_loads, SAVINGS SAMPLE
//   3. update_max_demand        BOTTOM-UP DEMAND FOLD
//   4. redistribute             SURPLUS, ROOT DOWN
//   5. PER CPU: rebalance       LOCAL WEIGHTS, SAVINGS DEBIT + DECAY
//   6. commit                   PUBLISH THE STAGED STATS
//
// STEPS 1-4 WORK ON A StatTable. A READER NEVER SEES A CLASS RESET TO ITS
// BASELINE HALFWAY THROUGH A CYCLE, AND AN ABORTED CYCLE PUBLISHES NOTHING.
//
// THE CALLER HOLDS THE TREE (READ FOR PERIODIC CYCLES, WRITE FOR FORCED ONES).
// A CYCLE THAT FINDS THE GUARD TAKEN IS SKIPPED, NOT QUEUED. A CYCLE INSIDE
// THE MINIMUM INTERVAL IS SKIPPED UNLESS FORCED BY A CONFIGURATION CHANGE.

use log::{debug, warn};

use crate::accountant::recompute_effectives;
use crate::balancer::{rebalance, BalanceTable};
use crate::class::{ClassTree, StatTable};
use crate::cpu::CpuRunQueue;
use crate::error::TreeError;
use crate::surplus::{redistribute, update_max_demand};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    // ANOTHER CYCLE IS RUNNING
    Busy,
    // INSIDE THE MINIMUM INTERVAL
    TooSoon,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub now_ns: u64,
    pub classes: usize,
    pub parents: usize,
    pub total_surplus: u64,
    pub granted: u64,
    pub root_eshare: u32,
    pub busy_queues: usize,
    pub skewed_queues: usize,
    pub folded_ns: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    Aborted(TreeError),
}

impl CycleOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, CycleOutcome::Completed(_))
    }
}

#[derive(Default)]
struct MonitorState {
    last_run_ns: Option<u64>,
    cycles: u64,
}

pub struct Monitor {
    state: spin::Mutex<MonitorState>,
    min_interval_ns: u64,
    boost_weight: u32,
}

impl Monitor {
    pub fn new(min_interval_ns: u64, boost_weight: u32) -> Self {
        Self {
            state: spin::Mutex::new(MonitorState::default()),
            min_interval_ns,
            boost_weight,
        }
    }

    pub fn cycles(&self) -> u64 {
        self.state.lock().cycles
    }

    pub fn last_run_ns(&self) -> Option<u64> {
        self.state.lock().last_run_ns
    }

    pub fn run(&self, tree: &ClassTree, cpus: &[spin::Mutex<CpuRunQueue>], now_ns: u64, force: bool) -> CycleOutcome {
        let Some(mut state) = self.state.try_lock() else {
            debug!("monitor busy, cycle skipped");
            return CycleOutcome::Skipped(SkipReason::Busy);
        };

        if !force {
            if let Some(last) = state.last_run_ns {
                if now_ns.saturating_sub(last) < self.min_interval_ns {
                    return CycleOutcome::Skipped(SkipReason::TooSoon);
                }
            }
        }

        match self.cycle(tree, cpus, now_ns) {
            Ok(report) => {
                state.last_run_ns = Some(now_ns);
                state.cycles += 1;
                debug!(
                    "monitor cycle {}: {} classes, surplus {} granted {}, {} skewed",
                    state.cycles, report.classes, report.total_surplus, report.granted, report.skewed_queues
                );
                CycleOutcome::Completed(report)
            }
            Err(e) => {
                warn!("monitor cycle aborted, keeping last effective shares: {}", e);
                CycleOutcome::Aborted(e)
            }
        }
    }

    fn cycle(&self, tree: &ClassTree, cpus: &[spin::Mutex<CpuRunQueue>], now_ns: u64) -> Result<CycleReport, TreeError> {
        let mut report = CycleReport { now_ns, ..CycleReport::default() };
        let mut stats = StatTable::snapshot(tree);
        report.classes = recompute_effectives(tree, &mut stats)?;

        // SAVINGS BANKED SINCE THE LAST CYCLE, SUMMED OVER CPUS
        let mut savings: Vec<u64> = Vec::new();
        for rq in cpus {
            let mut rq = rq.lock();
            rq.check_sleep(now_ns);
            rq.refresh_loads();
            for q in rq.lrqs() {
                let idx = q.class().index();
                if savings.len() <= idx {
                    savings.resize(idx + 1, 0);
                }
                savings[idx] += q.savings();
            }
        }
        for class in tree.iter() {
            let banked = savings.get(class.id().index()).copied().unwrap_or(0);
            stats.get_mut(class.id())?.has_savings = banked > 0;
        }

        update_max_demand(tree, &mut stats)?;
        let plan = redistribute(tree, &mut stats, tree.root())?;
        report.parents = plan.nodes;
        report.total_surplus = plan.total_surplus;
        report.granted = plan.granted;
        report.root_eshare = stats.get(tree.root())?.eshare;

        let mut table = BalanceTable::snapshot(&stats, self.boost_weight);
        for rq in cpus {
            table.add_pressure(&rq.lock());
        }
        for rq in cpus {
            let out = rebalance(tree, &table, &mut rq.lock(), &plan.debits);
            report.busy_queues += out.busy;
            report.skewed_queues += out.skewed;
            report.folded_ns += out.folded_ns;
        }
        stats.commit(tree);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::{ControllerConfig, BOOST_WEIGHT, MONITOR_MIN_INTERVAL_NS};

    const MS: u64 = 1_000_000;

    fn setup() -> (ClassTree, Vec<spin::Mutex<CpuRunQueue>>) {
        let tree = ClassTree::new(1, 1_000 * MS, 1);
        let root = tree.root();
        let mut rq = CpuRunQueue::new(0, root, &ControllerConfig::default());
        rq.attach(root, tree.lookup(root).unwrap().demand().clone(), 1);
        (tree, vec![spin::Mutex::new(rq)])
    }

    #[test]
    fn completes_and_records_time() {
        let (tree, cpus) = setup();
        let m = Monitor::new(MONITOR_MIN_INTERVAL_NS, BOOST_WEIGHT);
        let out = m.run(&tree, &cpus, 1_000 * MS, false);
        assert!(out.is_completed());
        assert_eq!(m.last_run_ns(), Some(1_000 * MS));
        assert_eq!(m.cycles(), 1);
    }

    #[test]
    fn too_soon_is_skipped() {
        let (tree, cpus) = setup();
        let m = Monitor::new(100 * MS, BOOST_WEIGHT);
        assert!(m.run(&tree, &cpus, 1_000 * MS, false).is_completed());
        assert_eq!(m.run(&tree, &cpus, 1_050 * MS, false), CycleOutcome::Skipped(SkipReason::TooSoon));
        assert_eq!(m.cycles(), 1);
        assert!(m.run(&tree, &cpus, 1_100 * MS, false).is_completed());
    }

    #[test]
    fn forced_cycle_ignores_interval() {
        let (tree, cpus) = setup();
        let m = Monitor::new(100 * MS, BOOST_WEIGHT);
        m.run(&tree, &cpus, 1_000 * MS, false);
        assert!(m.run(&tree, &cpus, 1_001 * MS, true).is_completed());
    }

    #[test]
    fn busy_guard_skips() {
        let (tree, cpus) = setup();
        let m = Monitor::new(100 * MS, BOOST_WEIGHT);
        let held = m.state.lock();
        assert_eq!(m.run(&tree, &cpus, 1_000 * MS, true), CycleOutcome::Skipped(SkipReason::Busy));
        drop(held);
        assert!(m.run(&tree, &cpus, 1_000 * MS, true).is_completed());
    }
}

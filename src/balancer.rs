// SHAREFLOW LOCAL WEIGHT BALANCER
// TURNS EACH CLASS'S EFFECTIVE SHARE INTO A PER-CPU SCHEDULING WEIGHT.
//
//   local_weight = weight_for(meshare) * load_here / load_everywhere
//
// CLAMPED TO [1, WEIGHT_MAX] AND NEVER BELOW THE SKEWED FLOOR. A CLASS SPREADS
// ITS ENTITLEMENT OVER THE CPUS IT HAS WORK ON, IN PROPORTION TO THE WORK.
//
// SHARES COME FROM THE CYCLE'S StatTable, NOT THE CLASS LOCKS, SO rebalance
// NEVER TAKES A CLASS LOCK WHILE HOLDING A CPU LOCK.

use std::sync::atomic::Ordering;

use crate::class::{ClassId, ClassTree, StatTable};
use crate::cpu::CpuRunQueue;
use crate::surplus::Debit;
use crate::tuning::{skewed_weight, weight_for, SAVINGS_DECAY_SHIFT, WEIGHT_MAX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BalanceEntry {
    pub class: ClassId,
    pub meshare: u32,
    pub megrt: u32,
    // SUM OF THE CLASS'S LOAD OVER ALL CPUS
    pub pressure: u64,
}

#[derive(Clone, Debug, Default)]
pub struct BalanceTable {
    entries: Vec<Option<BalanceEntry>>,
    boost_weight: u32,
}

impl BalanceTable {
    pub fn snapshot(stats: &StatTable, boost_weight: u32) -> Self {
        let mut entries: Vec<Option<BalanceEntry>> = Vec::new();
        for (class, stat) in stats.iter() {
            let idx = class.index();
            if entries.len() <= idx {
                entries.resize(idx + 1, None);
            }
            entries[idx] = Some(BalanceEntry {
                class,
                meshare: stat.meshare,
                megrt: stat.megrt.or_zero(),
                pressure: 0,
            });
        }
        Self { entries, boost_weight: boost_weight.max(1) }
    }

    pub fn get(&self, class: ClassId) -> Option<&BalanceEntry> {
        self.entries
            .get(class.index())
            .and_then(Option::as_ref)
            .filter(|e| e.class == class)
    }

    // ACCUMULATE ONE CPU'S LOADS. CALL refresh_loads ON THAT CPU FIRST.
    pub fn add_pressure(&mut self, rq: &CpuRunQueue) {
        for q in rq.lrqs() {
            if let Some(e) = self.entries.get_mut(q.class().index()).and_then(Option::as_mut) {
                if e.class == q.class() {
                    e.pressure += q.load();
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BalanceOutcome {
    pub busy: usize,
    pub skewed: usize,
    pub folded_ns: u64,
}

pub fn rebalance(tree: &ClassTree, table: &BalanceTable, rq: &mut CpuRunQueue, debits: &[Debit]) -> BalanceOutcome {
    let mut out = BalanceOutcome::default();

    for q in rq.lrqs_mut() {
        let Some(entry) = table.get(q.class()) else {
            continue;
        };

        // CPU TIME SINCE THE LAST CYCLE
        if q.uncounted_ns > 0 {
            if let Some(class) = tree.get(q.class()) {
                class.total_ns.fetch_add(q.uncounted_ns, Ordering::Relaxed);
            }
            out.folded_ns += q.uncounted_ns;
            q.uncounted_ns = 0;
        }

        if let Some(d) = debits.iter().find(|d| d.class == q.class()) {
            if d.keep_den > 0 {
                q.savings = (q.savings as u128 * d.keep_num as u128 / d.keep_den as u128) as u64;
            }
        }
        q.savings -= q.savings >> SAVINGS_DECAY_SHIFT;

        let full = weight_for(entry.meshare);
        q.over_weight = full.saturating_sub(weight_for(entry.megrt));
        q.skewed_weight = skewed_weight(entry.meshare);

        if q.is_empty() {
            // FIRST TASK BACK MUST NOT INHERIT A STALE LOW WEIGHT
            q.local_weight = table.boost_weight;
            q.skewed = false;
            continue;
        }
        out.busy += 1;

        let mut weight = if entry.pressure == 0 {
            full as u64
        } else {
            q.load() * full as u64 / entry.pressure
        };
        weight = weight.clamp(1, WEIGHT_MAX as u64);

        q.skewed = weight < q.skewed_weight as u64;
        if q.skewed {
            weight = q.skewed_weight as u64;
            out.skewed += 1;
        }
        q.local_weight = (weight as u32).min(WEIGHT_MAX);
    }
    out
}

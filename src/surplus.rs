// SHAREFLOW SURPLUS ALLOCATION
// BOTTOM-UP DEMAND FOLD, THEN TOP-DOWN REDISTRIBUTION OF UNUSED GUARANTEE.
//
// PER PARENT:
//   total_surplus = (p.eshare - p.egrt)                  SURPLUS HANDED DOWN
//                 + max(0, p.megrt - p.self_max_demand)  PARENT'S OWN IDLE PART
//                 + SUM max(0, c.egrt - c.max_demand)    IDLE CHILDREN
//
// CANDIDATES: THE PARENT'S OWN TASKS, THEN EVERY CHILD STILL WANTING MORE, IN
// CHILD-LIST ORDER. FOUR PASSES (SAVINGS x SOFT LIMIT), EACH A PROPORTIONAL
// WATER-FILL WEIGHTED BY GUARANTEE, CANDIDATES ORDERED BY NEED PER SHARE.
// WHATEVER NO CANDIDATE CAN TAKE GOES TO THE PARENT'S OWN TASKS, UP TO mehl.

use log::debug;

use crate::class::{ClassId, ClassTree, StatTable};
use crate::demand;
use crate::error::TreeError;
use crate::share::SHARE_SCALE;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Pass {
    // HAS SAVINGS, STAYS UNDER THE SOFT LIMIT
    SavingsSoft,
    // HAS SAVINGS, UP TO THE HARD LIMIT
    Savings,
    // ANYONE, STAYS UNDER THE SOFT LIMIT
    Soft,
    // ANYONE, UP TO THE HARD LIMIT
    Any,
}

pub const PASSES: [Pass; 4] = [Pass::SavingsSoft, Pass::Savings, Pass::Soft, Pass::Any];

impl Pass {
    fn needs_savings(self) -> bool {
        matches!(self, Pass::SavingsSoft | Pass::Savings)
    }

    fn soft(self) -> bool {
        matches!(self, Pass::SavingsSoft | Pass::Soft)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    // max_demand - eshare AT THE START OF THE PASSES
    pub need: u32,
    // ROOM BELOW THE SOFT LIMIT AT THE START OF THE PASSES
    pub soft_room: u32,
    // GUARANTEE, AT LEAST 1
    pub weight: u32,
    pub has_savings: bool,
    pub granted: u32,
}

impl Candidate {
    pub fn new(need: u32, soft_room: u32, weight: u32, has_savings: bool) -> Self {
        Self {
            need,
            soft_room: soft_room.min(need),
            weight: weight.max(1),
            has_savings,
            granted: 0,
        }
    }

    fn room(&self, pass: Pass) -> u32 {
        let ceiling = if pass.soft() { self.soft_room } else { self.need };
        ceiling.saturating_sub(self.granted)
    }

    pub fn demand_per_share(&self) -> u64 {
        self.need.saturating_sub(self.granted) as u64 * SHARE_SCALE as u64 / self.weight as u64
    }
}

// HAND OUT `surplus` ACROSS THE PASSES. RETURNS WHAT IS LEFT.
pub fn distribute(mut surplus: u32, candidates: &mut [Candidate]) -> u32 {
    for pass in PASSES {
        if surplus == 0 {
            break;
        }
        surplus = fill(pass, surplus, candidates);
    }
    surplus
}

fn fill(pass: Pass, mut surplus: u32, candidates: &mut [Candidate]) -> u32 {
    let mut active: Vec<usize> = (0..candidates.len())
        .filter(|&i| {
            let c = &candidates[i];
            (!pass.needs_savings() || c.has_savings) && c.room(pass) > 0
        })
        .collect();
    // STABLE: EQUAL NEED PER SHARE KEEPS INSERTION ORDER
    active.sort_by_key(|&i| candidates[i].demand_per_share());

    while surplus > 0 && !active.is_empty() {
        let total_weight: u64 = active.iter().map(|&i| candidates[i].weight as u64).sum();
        let round = surplus as u64;
        let mut handed = 0u64;
        let mut still: Vec<usize> = Vec::with_capacity(active.len());

        for &i in &active {
            let c = &mut candidates[i];
            let slice = round * c.weight as u64 / total_weight;
            let room = c.room(pass) as u64;
            let give = slice.min(room).min(round - handed);
            c.granted += give as u32;
            handed += give;
            if c.room(pass) > 0 {
                still.push(i);
            }
        }

        if handed == 0 {
            // ROUNDING LEFT LESS THAN ONE UNIT PER CANDIDATE: LOWEST NEED FIRST
            let i = active[0];
            let c = &mut candidates[i];
            let give = (c.room(pass) as u64).min(round);
            c.granted += give as u32;
            handed = give;
            if c.room(pass) == 0 {
                still.retain(|&j| j != i);
            }
        }

        surplus -= handed as u32;
        active = still;
    }
    surplus
}

// A DONOR'S SAVINGS SHRINK BY donated / egrt: KEEP savings * keep_num / keep_den
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Debit {
    pub class: ClassId,
    pub keep_num: u32,
    pub keep_den: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeOutcome {
    pub total_surplus: u32,
    pub granted: u32,
    // LEFTOVER CREDITED TO THE PARENT'S meshare
    pub absorbed: u32,
    pub debits: Vec<Debit>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Redistribution {
    pub nodes: usize,
    pub total_surplus: u64,
    pub granted: u64,
    pub absorbed: u64,
    pub debits: Vec<Debit>,
}

// BOTTOM-UP: self_demand FROM THE PER-CPU ESTIMATORS,
// max_demand = min(ehl, self_demand + SUM children.max_demand)
pub fn update_max_demand(tree: &ClassTree, stats: &mut StatTable) -> Result<(), TreeError> {
    let order = tree.preorder()?;
    for &id in order.iter().rev() {
        let class = tree.get(id).ok_or(TreeError::StructuralRace(id))?;
        let self_demand = class.demand.self_demand();
        let mut sum = self_demand as u64;
        for &c in class.children() {
            sum += stats.get(c)?.max_demand as u64;
        }
        let stat = stats.get_mut(id)?;
        stat.self_demand = self_demand;
        stat.max_demand = demand::max_demand(sum.min(u32::MAX as u64) as u32, stat.ehl);
    }
    Ok(())
}

// REDISTRIBUTE UNDER `parent`, THEN RECURSE INTO CHILDREN THAT HAVE CHILDREN
pub fn redistribute(tree: &ClassTree, stats: &mut StatTable, parent: ClassId) -> Result<Redistribution, TreeError> {
    let mut out = Redistribution::default();
    let mut stack = vec![parent];
    while let Some(id) = stack.pop() {
        let class = tree.get(id).ok_or(TreeError::StructuralRace(id))?;
        if class.children().is_empty() {
            // A LEAF'S OWN TASKS GET THE WHOLE SHARE
            let stat = stats.get_mut(id)?;
            stat.meshare = stat.eshare;
            continue;
        }
        let node = redistribute_node(tree, stats, id)?;
        out.nodes += 1;
        out.total_surplus += node.total_surplus as u64;
        out.granted += node.granted as u64;
        out.absorbed += node.absorbed as u64;
        out.debits.extend(node.debits);
        stack.extend(class.children().iter().rev().copied());
    }
    Ok(out)
}

// ONE PARENT AND ITS DIRECT CHILDREN
pub fn redistribute_node(tree: &ClassTree, stats: &mut StatTable, parent: ClassId) -> Result<NodeOutcome, TreeError> {
    let p = tree.get(parent).ok_or(TreeError::StructuralRace(parent))?;
    let p_stat = *stats.get(parent)?;

    let p_self_max = demand::max_demand(p_stat.self_demand, p_stat.mehl);
    let p_megrt = p_stat.megrt.or_zero();
    let mut total = p_stat.eshare.saturating_sub(p_stat.egrt.or_zero()) as u64;
    total += p_megrt.saturating_sub(p_self_max) as u64;

    let mut ids: Vec<Option<ClassId>> = vec![None];
    let mut candidates: Vec<Candidate> = Vec::new();
    let mut donors: Vec<(ClassId, u32, u32)> = Vec::new();

    // THE PARENT'S OWN TASKS COMPETE FOR ITS UNUSED GUARANTEE
    candidates.push(Candidate::new(
        p_self_max.saturating_sub(p_stat.meshare),
        soft_ceiling(p_megrt, p_stat.mehl.or_full()).saturating_sub(p_stat.meshare),
        p.shares.unused_guarantee.or_zero(),
        p_stat.has_savings,
    ));

    for &cid in p.children() {
        let c = tree.get(cid).ok_or(TreeError::StructuralRace(cid))?;
        let s = stats.get(cid)?;
        let egrt = s.egrt.or_zero();
        if egrt > s.max_demand {
            total += (egrt - s.max_demand) as u64;
            donors.push((cid, s.max_demand, egrt));
        }
        if s.max_demand > s.eshare {
            ids.push(Some(cid));
            candidates.push(Candidate::new(
                s.max_demand - s.eshare,
                soft_ceiling(egrt, s.ehl.or_full()).saturating_sub(s.eshare),
                c.shares.my_guarantee.or_zero(),
                s.has_savings,
            ));
        }
    }

    let total_surplus = total.min(u32::MAX as u64) as u32;
    let mut out = NodeOutcome { total_surplus, ..NodeOutcome::default() };
    if total_surplus == 0 {
        return Ok(out);
    }

    let left = distribute(total_surplus, &mut candidates);
    out.granted = total_surplus - left;

    {
        let stat = stats.get_mut(parent)?;
        let own = stat.meshare.saturating_add(candidates[0].granted);
        out.absorbed = left.min(stat.mehl.or_full().saturating_sub(own));
        stat.meshare = own + out.absorbed;
        stat.granted = candidates[0].granted;
    }
    for (cand, id) in candidates.iter().zip(&ids).skip(1) {
        let Some(id) = id else { continue };
        let stat = stats.get_mut(*id)?;
        stat.eshare = stat.eshare.saturating_add(cand.granted);
        stat.granted = cand.granted;
        stat.demand_per_share = cand.demand_per_share();
    }

    if out.granted > 0 {
        out.debits = donors
            .into_iter()
            .map(|(class, keep_num, keep_den)| Debit { class, keep_num, keep_den })
            .collect();
    }

    debug!(
        "surplus under {}: total {} granted {} to {} candidates, {} kept",
        parent,
        total_surplus,
        out.granted,
        candidates.iter().filter(|c| c.granted > 0).count(),
        out.absorbed
    );
    Ok(out)
}

// MIDPOINT BETWEEN GUARANTEE AND HARD LIMIT
pub fn soft_ceiling(egrt: u32, ehl: u32) -> u32 {
    egrt + ehl.saturating_sub(egrt) / 2
}

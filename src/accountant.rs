// SHAREFLOW SHARE ACCOUNTANT
// TOP-DOWN PROPAGATION OF EFFECTIVE GUARANTEES AND HARD LIMITS.
//
//   ROOT:   egrt = SHARE_SCALE          ehl = SHARE_SCALE * my_limit / max_limit
//   CHILD:  egrt = p.egrt * my_guarantee / p.total_guarantee
//           ehl  = p.ehl  * my_limit     / p.max_limit
//   SELF:   megrt = egrt * unused_guarantee / total_guarantee, mehl = ehl
//
// DON'T-CARE PROPAGATES WITHOUT DIVIDING. THE WALK WRITES INTO THE CYCLE'S
// StatTable; THE MONITOR PUBLISHES IT ONLY IF THE WHOLE CYCLE RESOLVED.

use log::warn;

use crate::class::{ClassId, ClassStat, ClassTree, StatTable};
use crate::error::TreeError;
use crate::share::{Share, Shares};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Effective {
    pub egrt: Share,
    pub ehl: Share,
    pub megrt: Share,
    pub mehl: Share,
}

impl Effective {
    pub fn of(stat: &ClassStat) -> Self {
        Self { egrt: stat.egrt, ehl: stat.ehl, megrt: stat.megrt, mehl: stat.mehl }
    }

    pub fn root(shares: &Shares) -> Self {
        let egrt = Share::FULL;
        let ehl = Share::FULL.scale(shares.my_limit, shares.max_limit);
        Self::with_self(egrt, ehl, shares)
    }

    pub fn child(parent: &Effective, parent_shares: &Shares, shares: &Shares) -> Self {
        let egrt = parent.egrt.scale(shares.my_guarantee, parent_shares.total_guarantee);
        let ehl = parent.ehl.scale(shares.my_limit, parent_shares.max_limit);
        Self::with_self(egrt, ehl, shares)
    }

    fn with_self(egrt: Share, ehl: Share, shares: &Shares) -> Self {
        Self {
            egrt,
            ehl,
            megrt: egrt.scale(shares.unused_guarantee, shares.total_guarantee),
            mehl: ehl,
        }
    }

    // STARTING POINT FOR SURPLUS: EVERY CLASS HOLDS ITS GUARANTEE, NEVER 0
    pub fn baseline_eshare(&self) -> u32 {
        self.egrt.or_zero().min(self.ehl.or_full()).max(1)
    }

    pub fn baseline_meshare(&self) -> u32 {
        self.megrt.or_zero().min(self.mehl.or_full()).max(1)
    }
}

// RECOMPUTE egrt/ehl/megrt/mehl FOR EVERY ATTACHED CLASS AND RESET eshare/meshare
// TO THEIR BASELINES. A STRUCTURAL RACE ABORTS THE WALK.
pub fn recompute_effectives(tree: &ClassTree, stats: &mut StatTable) -> Result<usize, TreeError> {
    let order = tree.preorder()?;

    for &id in &order {
        let class = tree.get(id).ok_or(TreeError::StructuralRace(id))?;
        let eff = match class.parent() {
            None => Effective::root(&class.shares),
            Some(pid) => {
                let parent = tree.get(pid).ok_or(TreeError::StructuralRace(pid))?;
                // PREORDER: THE PARENT IS ALREADY DONE
                let p_eff = Effective::of(stats.get(pid)?);
                Effective::child(&p_eff, &parent.shares, &class.shares)
            }
        };
        let stat = stats.get_mut(id)?;
        stat.egrt = eff.egrt;
        stat.ehl = eff.ehl;
        stat.megrt = eff.megrt;
        stat.mehl = eff.mehl;
        stat.eshare = eff.baseline_eshare();
        stat.meshare = eff.baseline_meshare();
        stat.granted = 0;
    }
    Ok(order.len())
}

// LARGEST my_limit AMONG THE CHILDREN OF `parent`, IGNORING `except`
pub(crate) fn children_max_limit(tree: &ClassTree, parent: ClassId, except: Option<ClassId>) -> Share {
    let Some(p) = tree.get(parent) else {
        return Share::ZERO;
    };
    let max = p
        .children()
        .iter()
        .filter(|&&c| Some(c) != except)
        .filter_map(|&c| tree.get(c))
        .map(|c| c.shares.my_limit.or_zero())
        .max()
        .unwrap_or(0);
    Share::new(max)
}

// HAND A DEPARTING CLASS'S GUARANTEE BACK TO ITS PARENT'S POOL
pub fn release_class(tree: &mut ClassTree, id: ClassId) -> Result<(), TreeError> {
    let class = tree.lookup(id)?;
    let parent = class.parent().ok_or(TreeError::RootImmutable)?;
    let guarantee = class.shares.my_guarantee;
    let cur_max = children_max_limit(tree, parent, Some(id));

    let Some(p) = tree.get_mut(parent) else {
        warn!("release of {}: parent {} already gone", id, parent);
        return Err(TreeError::StructuralRace(parent));
    };
    p.shares.child_guarantee_changed(guarantee, Share::ZERO);
    p.shares.cur_max_limit = cur_max;
    Ok(())
}

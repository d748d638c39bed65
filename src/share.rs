// SHAREFLOW SHARE ARITHMETIC
// FIXED-POINT RELATIVE SHARES, DON'T-CARE SENTINEL, SHARE CONFIG VALIDATION
//
// EVERY SHARE IS A UNITLESS INTEGER IN [0, SHARE_SCALE]. SHARE_SCALE IS ONE
// CPU-EQUIVALENT OF THE WHOLE MACHINE. EVERY DIVISION ROUNDS TOWARD ZERO;
// DOWNSTREAM CONSUMERS DEPEND ON THE EXACT INTEGER RESULTS.

use std::fmt;

use crate::error::InvalidShareError;

pub const SHARE_SHIFT: u32 = 13;
pub const SHARE_SCALE: u32 = 1 << SHARE_SHIFT;

// DEFAULTS FOR A FRESHLY CREATED CLASS (FULL POOL, NO GUARANTEE OF ITS OWN)
pub const DFLT_TOTAL_GUARANTEE: u32 = SHARE_SCALE;
pub const DFLT_MAX_LIMIT: u32 = SHARE_SCALE;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Share(u32);

impl Share {
    pub const ZERO: Share = Share(0);
    pub const FULL: Share = Share(SHARE_SCALE);
    pub const DONT_CARE: Share = Share(u32::MAX);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    // CONVERT A PERCENTAGE OF THE FULL SCALE. 30 -> 2457.
    pub const fn from_pct(pct: u32) -> Self {
        Self((SHARE_SCALE as u64 * pct as u64 / 100) as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_dont_care(self) -> bool {
        self.0 == u32::MAX
    }

    pub fn in_range(self) -> bool {
        self.is_dont_care() || self.0 <= SHARE_SCALE
    }

    // DON'T-CARE RESOLVES TO "NOTHING GUARANTEED"
    pub fn or_zero(self) -> u32 {
        if self.is_dont_care() { 0 } else { self.0 }
    }

    // DON'T-CARE RESOLVES TO "UNLIMITED"
    pub fn or_full(self) -> u32 {
        if self.is_dont_care() { SHARE_SCALE } else { self.0.min(SHARE_SCALE) }
    }

    // floor(self * num / den). DON'T-CARE IN ANY OPERAND PROPAGATES WITHOUT
    // DIVIDING. A ZERO DENOMINATOR YIELDS ZERO.
    pub fn scale(self, num: Share, den: Share) -> Share {
        if self.is_dont_care() || num.is_dont_care() || den.is_dont_care() {
            return Share::DONT_CARE;
        }
        if den.0 == 0 {
            return Share::ZERO;
        }
        Share((self.0 as u64 * num.0 as u64 / den.0 as u64) as u32)
    }
}

impl fmt::Debug for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dont_care() {
            write!(f, "Share(DONT_CARE)")
        } else {
            write!(f, "Share({})", self.0)
        }
    }
}

impl fmt::Display for Share {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dont_care() {
            write!(f, "-")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// CONFIGURED SHARES OF ONE CLASS.
// my_* ARE RELATIVE TO THE PARENT'S POOL. total_guarantee/max_limit DEFINE THE
// POOL THIS CLASS HANDS OUT TO ITS CHILDREN. allocated_guarantee,
// unused_guarantee AND cur_max_limit ARE DERIVED BOOKKEEPING, NEVER SET
// DIRECTLY. allocated_guarantee STAYS CONCRETE EVEN WHILE THE POOL IS DON'T-CARE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shares {
    pub my_guarantee: Share,
    pub my_limit: Share,
    pub total_guarantee: Share,
    pub max_limit: Share,
    pub allocated_guarantee: Share,
    pub unused_guarantee: Share,
    pub cur_max_limit: Share,
}

impl Shares {
    pub fn root() -> Self {
        Self {
            my_guarantee: Share::FULL,
            my_limit: Share::new(DFLT_MAX_LIMIT),
            total_guarantee: Share::new(DFLT_TOTAL_GUARANTEE),
            max_limit: Share::new(DFLT_MAX_LIMIT),
            allocated_guarantee: Share::ZERO,
            unused_guarantee: Share::new(DFLT_TOTAL_GUARANTEE),
            cur_max_limit: Share::ZERO,
        }
    }

    pub fn child_default() -> Self {
        Self {
            my_guarantee: Share::ZERO,
            ..Self::root()
        }
    }

    // GUARANTEE STILL FREE TO HAND OUT. A DON'T-CARE POOL COUNTS AS FULL SCALE.
    pub fn headroom(&self) -> u32 {
        self.total_guarantee.or_full().saturating_sub(self.allocated_guarantee.raw())
    }

    // A CHILD'S GUARANTEE MOVED FROM `old` TO `new`: ADJUST THE POOL
    pub fn child_guarantee_changed(&mut self, old: Share, new: Share) {
        let allocated = self.allocated_guarantee.raw() as i64 + new.or_zero() as i64 - old.or_zero() as i64;
        self.allocated_guarantee = Share::new(allocated.clamp(0, u32::MAX as i64 - 1) as u32);
        self.unused_guarantee = unused_of(self.total_guarantee, self.allocated_guarantee);
    }
}

fn unused_of(total: Share, allocated: Share) -> Share {
    if total.is_dont_care() {
        Share::DONT_CARE
    } else {
        Share::new(total.raw().saturating_sub(allocated.raw()))
    }
}

// A REQUESTED CHANGE. None KEEPS THE CURRENT VALUE.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShareUpdate {
    pub my_guarantee: Option<Share>,
    pub my_limit: Option<Share>,
    pub total_guarantee: Option<Share>,
    pub max_limit: Option<Share>,
}

impl ShareUpdate {
    pub fn guarantee_limit(guarantee: Share, limit: Share) -> Self {
        Self {
            my_guarantee: Some(guarantee),
            my_limit: Some(limit),
            ..Self::default()
        }
    }
}

// VALIDATE AN UPDATE AGAINST THE CLASS'S CURRENT SHARES AND ITS PARENT'S POOL.
// RETURNS THE SHARES TO COMMIT; NOTHING IS MUTATED ON ERROR.
pub fn validate(
    update: &ShareUpdate,
    cur: &Shares,
    parent: Option<&Shares>,
) -> Result<Shares, InvalidShareError> {
    for value in [update.my_guarantee, update.my_limit, update.total_guarantee, update.max_limit]
        .into_iter()
        .flatten()
    {
        if !value.in_range() {
            return Err(InvalidShareError::OutOfRange { value: value.raw() });
        }
    }

    let mut next = *cur;

    if update.my_guarantee.is_some() || update.my_limit.is_some() {
        let Some(par) = parent else {
            // THE ROOT OWNS THE WHOLE MACHINE. ONLY ITS LIMIT RATIO MAY MOVE.
            if update.my_guarantee.is_some() {
                return Err(InvalidShareError::RootHasNoParentPool);
            }
            if let Some(l) = update.my_limit {
                next.my_limit = l;
            }
            return finish_pool(update, cur, next).and_then(check_root_limit);
        };

        if let Some(g) = update.my_guarantee {
            if !g.is_dont_care() {
                let available = par.headroom() as u64 + cur.my_guarantee.or_zero() as u64;
                if g.raw() as u64 > available {
                    return Err(InvalidShareError::GuaranteeExceedsPool {
                        requested: g.raw(),
                        available: available.min(u32::MAX as u64) as u32,
                    });
                }
            }
            next.my_guarantee = g;
        }

        if let Some(l) = update.my_limit {
            if !l.is_dont_care() && !par.max_limit.is_dont_care() && l.raw() > par.max_limit.raw() {
                return Err(InvalidShareError::LimitExceedsParent {
                    requested: l.raw(),
                    max_limit: par.max_limit.raw(),
                });
            }
            next.my_limit = l;
        }

        if !next.my_limit.is_dont_care()
            && !next.my_guarantee.is_dont_care()
            && next.my_limit.raw() < next.my_guarantee.raw()
        {
            return Err(InvalidShareError::LimitBelowGuarantee {
                limit: next.my_limit.raw(),
                guarantee: next.my_guarantee.raw(),
            });
        }
    }

    let next = finish_pool(update, cur, next)?;
    match parent {
        Some(_) => Ok(next),
        None => check_root_limit(next),
    }
}

// THE ROOT'S LIMIT IS RELATIVE TO ITS OWN max_limit: ehl NEVER EXCEEDS FULL SCALE
fn check_root_limit(next: Shares) -> Result<Shares, InvalidShareError> {
    if !next.my_limit.is_dont_care() && !next.max_limit.is_dont_care() && next.my_limit.raw() > next.max_limit.raw() {
        return Err(InvalidShareError::LimitExceedsParent {
            requested: next.my_limit.raw(),
            max_limit: next.max_limit.raw(),
        });
    }
    Ok(next)
}

// total_guarantee / max_limit: THE POOL THIS CLASS HANDS TO ITS CHILDREN
fn finish_pool(update: &ShareUpdate, cur: &Shares, mut next: Shares) -> Result<Shares, InvalidShareError> {
    if let Some(total) = update.total_guarantee {
        let allocated = cur.allocated_guarantee.raw();
        if !total.is_dont_care() && total.raw() < allocated {
            return Err(InvalidShareError::TotalBelowAllocated { total: total.raw(), allocated });
        }
        next.total_guarantee = total;
        next.unused_guarantee = unused_of(total, cur.allocated_guarantee);
    }

    if let Some(max) = update.max_limit {
        if !max.is_dont_care() && max.raw() < cur.cur_max_limit.or_zero() {
            return Err(InvalidShareError::MaxLimitBelowChildren {
                max_limit: max.raw(),
                cur_max_limit: cur.cur_max_limit.or_zero(),
            });
        }
        next.max_limit = max;
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_rounds_toward_zero() {
        // 8192 * 30 / 100 = 2457.6 -> 2457
        assert_eq!(Share::FULL.scale(Share::new(30), Share::new(100)), Share::new(2457));
        assert_eq!(Share::FULL.scale(Share::new(2458), Share::FULL), Share::new(2458));
    }

    #[test]
    fn scale_propagates_dont_care() {
        assert!(Share::FULL.scale(Share::DONT_CARE, Share::FULL).is_dont_care());
        assert!(Share::DONT_CARE.scale(Share::new(1), Share::new(2)).is_dont_care());
        assert!(Share::FULL.scale(Share::new(1), Share::DONT_CARE).is_dont_care());
    }

    #[test]
    fn scale_zero_denominator() {
        assert_eq!(Share::FULL.scale(Share::new(5), Share::ZERO), Share::ZERO);
    }

    #[test]
    fn resolve_dont_care() {
        assert_eq!(Share::DONT_CARE.or_zero(), 0);
        assert_eq!(Share::DONT_CARE.or_full(), SHARE_SCALE);
        assert_eq!(Share::new(100).or_full(), 100);
    }

    #[test]
    fn pct_conversion() {
        assert_eq!(Share::from_pct(30).raw(), 2457);
        assert_eq!(Share::from_pct(100).raw(), SHARE_SCALE);
    }

    #[test]
    fn guarantee_within_pool_accepted() {
        let parent = Shares::root();
        let cur = Shares::child_default();
        let next = validate(
            &ShareUpdate::guarantee_limit(Share::new(2458), Share::FULL),
            &cur,
            Some(&parent),
        )
        .unwrap();
        assert_eq!(next.my_guarantee, Share::new(2458));
        assert_eq!(next.my_limit, Share::FULL);
    }

    #[test]
    fn guarantee_beyond_pool_rejected() {
        let mut parent = Shares::root();
        parent.child_guarantee_changed(Share::ZERO, Share::new(SHARE_SCALE - 1500));
        parent.child_guarantee_changed(Share::ZERO, Share::new(500));
        let mut cur = Shares::child_default();
        cur.my_guarantee = Share::new(500);
        // 1000 UNUSED + 500 ALREADY HELD = 1500 AVAILABLE
        let ok = validate(
            &ShareUpdate { my_guarantee: Some(Share::new(1500)), ..Default::default() },
            &cur,
            Some(&parent),
        );
        assert!(ok.is_ok());
        let err = validate(
            &ShareUpdate { my_guarantee: Some(Share::new(1501)), ..Default::default() },
            &cur,
            Some(&parent),
        )
        .unwrap_err();
        assert_eq!(err, InvalidShareError::GuaranteeExceedsPool { requested: 1501, available: 1500 });
    }

    #[test]
    fn limit_below_guarantee_rejected() {
        let parent = Shares::root();
        let cur = Shares::child_default();
        let err = validate(
            &ShareUpdate::guarantee_limit(Share::new(4000), Share::new(3000)),
            &cur,
            Some(&parent),
        )
        .unwrap_err();
        assert!(matches!(err, InvalidShareError::LimitBelowGuarantee { .. }));
    }

    #[test]
    fn limit_above_parent_max_rejected() {
        let mut parent = Shares::root();
        parent.max_limit = Share::new(4096);
        let err = validate(
            &ShareUpdate { my_limit: Some(Share::new(5000)), ..Default::default() },
            &Shares::child_default(),
            Some(&parent),
        )
        .unwrap_err();
        assert!(matches!(err, InvalidShareError::LimitExceedsParent { .. }));
    }

    #[test]
    fn out_of_range_rejected() {
        let err = validate(
            &ShareUpdate { my_guarantee: Some(Share::new(SHARE_SCALE + 1)), ..Default::default() },
            &Shares::child_default(),
            Some(&Shares::root()),
        )
        .unwrap_err();
        assert_eq!(err, InvalidShareError::OutOfRange { value: SHARE_SCALE + 1 });
    }

    #[test]
    fn root_guarantee_change_rejected() {
        let err = validate(
            &ShareUpdate { my_guarantee: Some(Share::new(10)), ..Default::default() },
            &Shares::root(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, InvalidShareError::RootHasNoParentPool);
    }

    #[test]
    fn total_guarantee_keeps_allocated_part() {
        let mut cur = Shares::root();
        cur.child_guarantee_changed(Share::ZERO, Share::new(3000));
        let err = validate(
            &ShareUpdate { total_guarantee: Some(Share::new(2999)), ..Default::default() },
            &cur,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InvalidShareError::TotalBelowAllocated { .. }));

        let next = validate(
            &ShareUpdate { total_guarantee: Some(Share::new(4000)), ..Default::default() },
            &cur,
            None,
        )
        .unwrap();
        assert_eq!(next.unused_guarantee, Share::new(1000));
    }

    #[test]
    fn max_limit_below_children_rejected() {
        let mut cur = Shares::root();
        cur.cur_max_limit = Share::new(6000);
        let err = validate(
            &ShareUpdate { max_limit: Some(Share::new(5000)), ..Default::default() },
            &cur,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InvalidShareError::MaxLimitBelowChildren { .. }));
    }

    #[test]
    fn child_guarantee_changed_moves_pool() {
        let mut parent = Shares::root();
        parent.child_guarantee_changed(Share::ZERO, Share::new(2458));
        assert_eq!(parent.unused_guarantee, Share::new(SHARE_SCALE - 2458));
        parent.child_guarantee_changed(Share::new(2458), Share::ZERO);
        assert_eq!(parent.unused_guarantee, Share::new(SHARE_SCALE));
        assert_eq!(parent.allocated_guarantee, Share::ZERO);
    }

    #[test]
    fn dont_care_pool_remembers_allocation() {
        let mut cur = Shares::root();
        cur.child_guarantee_changed(Share::ZERO, Share::new(6000));

        let dc = validate(&ShareUpdate { total_guarantee: Some(Share::DONT_CARE), ..Default::default() }, &cur, None)
            .unwrap();
        assert!(dc.unused_guarantee.is_dont_care());
        assert_eq!(dc.allocated_guarantee, Share::new(6000));

        // BACK TO A CONCRETE POOL: THE 6000 ALREADY HANDED OUT STILL COUNTS
        let back = validate(&ShareUpdate { total_guarantee: Some(Share::FULL), ..Default::default() }, &dc, None)
            .unwrap();
        assert_eq!(back.unused_guarantee, Share::new(SHARE_SCALE - 6000));
        let err = validate(&ShareUpdate { total_guarantee: Some(Share::new(5999)), ..Default::default() }, &dc, None)
            .unwrap_err();
        assert_eq!(err, InvalidShareError::TotalBelowAllocated { total: 5999, allocated: 6000 });
    }

    #[test]
    fn dont_care_pool_still_bounds_new_guarantees() {
        let mut parent = Shares::root();
        parent.total_guarantee = Share::DONT_CARE;
        parent.child_guarantee_changed(Share::ZERO, Share::new(6000));
        let err = validate(
            &ShareUpdate::guarantee_limit(Share::new(6000), Share::FULL),
            &Shares::child_default(),
            Some(&parent),
        )
        .unwrap_err();
        assert_eq!(err, InvalidShareError::GuaranteeExceedsPool { requested: 6000, available: SHARE_SCALE - 6000 });
    }

    #[test]
    fn root_limit_bounded_by_own_max() {
        let err = validate(
            &ShareUpdate { max_limit: Some(Share::new(4096)), ..Default::default() },
            &Shares::root(),
            None,
        )
        .unwrap_err();
        assert_eq!(err, InvalidShareError::LimitExceedsParent { requested: SHARE_SCALE, max_limit: 4096 });

        let ok = validate(
            &ShareUpdate { my_limit: Some(Share::new(4096)), max_limit: Some(Share::new(4096)), ..Default::default() },
            &Shares::root(),
            None,
        )
        .unwrap();
        assert_eq!(ok.max_limit, Share::new(4096));

        let err = validate(
            &ShareUpdate { my_limit: Some(Share::new(5000)), ..Default::default() },
            &ok,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, InvalidShareError::LimitExceedsParent { .. }));
    }
}

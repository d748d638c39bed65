// SHAREFLOW SURPLUS DISTRIBUTION TESTS
// PASS ORDER, WATER-FILL, MULTI-LEVEL HAND-DOWN
//
// distribute() IS PURE. THE TREE CASES RUN THROUGH CpuController.

use shareflow::surplus::{distribute, soft_ceiling, Candidate, Pass, PASSES};
use shareflow::tuning::DEFAULT_PRIO;
use shareflow::{
    ClassId, ControllerConfig, CpuController, Disposition, Share, ShareUpdate, Task, TaskId,
    SHARE_SCALE,
};

const MS: u64 = 1_000_000;
const SEC: u64 = 1_000 * MS;

// === PASS ORDER ===

#[test]
fn passes_run_savings_then_soft_then_any() {
    assert_eq!(PASSES, [Pass::SavingsSoft, Pass::Savings, Pass::Soft, Pass::Any]);
}

#[test]
fn savings_holder_served_before_others() {
    // A HAS SAVINGS, B DOES NOT. 600 TO HAND OUT.
    let mut c = [
        Candidate::new(1000, 400, 1, true),
        Candidate::new(1000, 400, 1, false),
    ];
    assert_eq!(distribute(600, &mut c), 0);
    // A: 400 IN SAVINGS-SOFT, 200 MORE IN SAVINGS. NOTHING REACHES B.
    assert_eq!(c[0].granted, 600);
    assert_eq!(c[1].granted, 0);

    // ENOUGH FOR BOTH: B ONLY GETS WHAT A LEAVES
    let mut c = [
        Candidate::new(500, 400, 1, true),
        Candidate::new(1000, 400, 1, false),
    ];
    assert_eq!(distribute(800, &mut c), 0);
    assert_eq!(c[0].granted, 500);
    assert_eq!(c[1].granted, 300);
}

#[test]
fn hard_pass_only_after_everyone_hits_soft() {
    let mut c = [
        Candidate::new(1000, 100, 1, false),
        Candidate::new(1000, 100, 1, false),
    ];
    assert_eq!(distribute(1000, &mut c), 0);
    assert_eq!(c[0].granted, 500);
    assert_eq!(c[1].granted, 500);
}

#[test]
fn leftover_when_everyone_satisfied() {
    let mut c = [Candidate::new(30, 30, 2, false), Candidate::new(20, 10, 1, true)];
    assert_eq!(distribute(100, &mut c), 50);
    assert_eq!(c[0].granted, 30);
    assert_eq!(c[1].granted, 20);
}

#[test]
fn weight_floor_is_one() {
    let c = Candidate::new(10, 10, 0, false);
    assert_eq!(c.weight, 1);
    assert_eq!(c.demand_per_share(), 10 * SHARE_SCALE as u64);
}

#[test]
fn soft_room_never_exceeds_need() {
    let c = Candidate::new(10, 500, 1, false);
    assert_eq!(c.soft_room, 10);
}

#[test]
fn soft_ceiling_between_guarantee_and_limit() {
    assert_eq!(soft_ceiling(0, SHARE_SCALE), SHARE_SCALE / 2);
    assert_eq!(soft_ceiling(2457, 2457), 2457);
    assert_eq!(soft_ceiling(1000, 2001), 1500);
}

// === TREE REDISTRIBUTION ===

fn saturate(ctl: &CpuController, from: u64, to: u64) {
    let mut now = from;
    while now < to {
        if let Some(t) = ctl.pick_next(0, now) {
            ctl.put_prev(0, t.id, 5 * MS, Disposition::Expired, now + 5 * MS);
        }
        now += 5 * MS;
        if now % SEC == 0 {
            ctl.run_monitor(now);
        }
    }
}

fn class(ctl: &CpuController, parent: ClassId, name: &str, g: u32) -> ClassId {
    ctl.create_class(parent, name, Some(ShareUpdate::guarantee_limit(Share::from_pct(g), Share::FULL)), 10)
        .unwrap()
}

#[test]
fn surplus_hands_down_two_levels() {
    let ctl = CpuController::new(ControllerConfig::with_cpus(1), 1);
    let p = class(&ctl, ctl.root(), "p", 60);
    let p1 = class(&ctl, p, "p1", 50);
    let p2 = class(&ctl, p, "p2", 50);
    assert_eq!(ctl.get_stats(p).unwrap().stat.egrt, Share::new(4915));
    assert_eq!(ctl.get_stats(p1).unwrap().stat.egrt, Share::new(2457));

    ctl.enqueue_task(Task { id: TaskId(1), class: p2, cpu: 0, prio: DEFAULT_PRIO }, 20);
    saturate(&ctl, 100 * MS, 15 * SEC);

    let ps = ctl.get_stats(p).unwrap().stat;
    let p1s = ctl.get_stats(p1).unwrap().stat;
    let p2s = ctl.get_stats(p2).unwrap().stat;
    // ROOT'S UNALLOCATED GUARANTEE FLOWS TO p, THEN p1'S IDLE HALF TO p2
    assert!(ps.eshare > 4915 + 3000, "p eshare {}", ps.eshare);
    assert_eq!(p1s.eshare, 2457);
    assert!(p2s.eshare > 2457 + 5000, "p2 eshare {}", p2s.eshare);
    assert!(p2s.eshare <= ps.eshare);
    assert!(p2s.granted > 0);
}

#[test]
fn no_demand_means_no_movement() {
    let ctl = CpuController::new(ControllerConfig::with_cpus(2), 1);
    let a = class(&ctl, ctl.root(), "a", 30);
    let b = class(&ctl, ctl.root(), "b", 20);
    let before = (ctl.get_stats(a).unwrap().stat, ctl.get_stats(b).unwrap().stat);
    assert!(ctl.run_monitor(SEC).is_completed());
    assert!(ctl.run_monitor(2 * SEC).is_completed());
    let after = (ctl.get_stats(a).unwrap().stat, ctl.get_stats(b).unwrap().stat);
    assert_eq!(before.0.eshare, after.0.eshare);
    assert_eq!(before.1.eshare, after.1.eshare);
    assert_eq!(after.0.eshare, 2457);
    assert_eq!(after.1.eshare, 1638);
}

#[test]
fn unclaimed_surplus_stays_with_parent() {
    let ctl = CpuController::new(ControllerConfig::with_cpus(1), 1);
    let root = ctl.root();
    let x = ctl
        .create_class(root, "x", Some(ShareUpdate::guarantee_limit(Share::from_pct(30), Share::from_pct(40))), 10)
        .unwrap();
    ctl.enqueue_task(Task { id: TaskId(1), class: x, cpu: 0, prio: DEFAULT_PRIO }, 20);
    saturate(&ctl, 100 * MS, 10 * SEC);

    let xs = ctl.get_stats(x).unwrap().stat;
    let rs = ctl.get_stats(root).unwrap().stat;
    // x STOPS AT ITS 40% LIMIT: 819 OF THE ROOT'S 5735 IDLE
    assert_eq!(xs.eshare, 3276);
    assert_eq!(xs.granted, 819);
    // THE REST GOES BACK TO THE ROOT'S OWN TASKS, CAPPED AT FULL SCALE
    assert_eq!(rs.megrt, Share::new(5735));
    assert_eq!(rs.meshare, SHARE_SCALE);
}

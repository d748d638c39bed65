// SHAREFLOW SIMULATION DRIVER
// SYNTHETIC BASE SCHEDULER: ONE WORKER THREAD PER CPU, STEPPED IN LOCKSTEP ON
// A SIMULATED CLOCK. EVERY TICK EACH WORKER WAKES ITS DUE SLEEPERS, PICKS THE
// NEXT TASK THROUGH THE CONTROLLER AND RUNS IT FOR ONE SLICE.
// THE MAIN THREAD OWNS THE CLOCK AND DRIVES THE MONITOR ONCE PER PERIOD.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Barrier;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info};

use shareflow::tuning::DEFAULT_PRIO;
use shareflow::{ClassId, CpuController, CycleOutcome, Disposition, Task, TaskId};

use super::{build_classes, ClassSpec};

#[derive(Clone, Copy, Debug)]
pub struct SimConfig {
    pub duration_ns: u64,
    pub period_ns: u64,
    pub slice_ns: u64,
    // SLEEP ONE SLICE OF WALL TIME PER TICK
    pub realtime: bool,
    pub verbose: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassUsage {
    pub name: String,
    pub id: ClassId,
    pub total_ns: u64,
    pub eshare: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SimSummary {
    pub elapsed_ns: u64,
    pub ticks: u64,
    pub cycles: u64,
    pub classes: Vec<ClassUsage>,
}

#[cfg(test)]
impl SimSummary {
    fn usage(&self, name: &str) -> Option<&ClassUsage> {
        self.classes.iter().find(|c| c.name == name)
    }
}

// ONE SYNTHETIC TASK: RUNS ONE SLICE, THEN SLEEPS LONG ENOUGH TO HOLD ITS DUTY CYCLE
#[derive(Clone, Copy, Debug)]
struct SimTask {
    task: Task,
    load_pct: u32,
    sleep_until: Option<u64>,
}

impl SimTask {
    fn sleep_ns(&self, slice_ns: u64) -> u64 {
        let load = self.load_pct.max(1) as u64;
        slice_ns * (100 - load.min(100)) / load
    }
}

struct Worker {
    cpu: usize,
    tasks: HashMap<TaskId, SimTask>,
}

impl Worker {
    fn step(&mut self, ctl: &CpuController, now: u64, slice_ns: u64) {
        for t in self.tasks.values_mut() {
            if t.sleep_until.is_some_and(|w| w <= now) {
                t.sleep_until = None;
                ctl.enqueue_task(t.task, now);
            }
        }

        let Some(picked) = ctl.pick_next(self.cpu, now) else {
            return;
        };
        let end = now + slice_ns;
        let disposition = match self.tasks.get_mut(&picked.id) {
            Some(t) if t.load_pct < 100 => {
                t.sleep_until = Some(end + t.sleep_ns(slice_ns));
                Disposition::Sleep
            }
            _ => Disposition::Expired,
        };
        ctl.put_prev(self.cpu, picked.id, slice_ns, disposition, end);
    }
}

fn spawn_tasks(ctl: &CpuController, specs: &[ClassSpec], now: u64) -> Result<Vec<Worker>> {
    let mut workers: Vec<Worker> = (0..ctl.nr_cpus())
        .map(|cpu| Worker { cpu, tasks: HashMap::new() })
        .collect();
    let mut next_id = 1u64;
    for spec in specs.iter().filter(|s| s.load_pct > 0) {
        let class = ctl
            .class_by_name(&spec.name)
            .ok_or_else(|| anyhow!("CLASS '{}' VANISHED", spec.name))?;
        for w in workers.iter_mut() {
            let task = Task { id: TaskId(next_id), class, cpu: w.cpu, prio: DEFAULT_PRIO };
            next_id += 1;
            ctl.enqueue_task(task, now);
            w.tasks.insert(task.id, SimTask { task, load_pct: spec.load_pct, sleep_until: None });
        }
    }
    Ok(workers)
}

fn usage(ctl: &CpuController, specs: &[ClassSpec]) -> Vec<ClassUsage> {
    std::iter::once("root")
        .chain(specs.iter().map(|s| s.name.as_str()))
        .filter_map(|name| {
            let id = ctl.class_by_name(name)?;
            let st = ctl.get_stats(id).ok()?;
            Some(ClassUsage { name: name.to_string(), id, total_ns: st.total_ns, eshare: st.stat.eshare })
        })
        .collect()
}

fn print_cycle(ctl: &CpuController, specs: &[ClassSpec], now: u64, prev: &mut HashMap<ClassId, u64>, window_ns: u64) {
    let capacity = window_ns.saturating_mul(ctl.nr_cpus() as u64).max(1);
    print!("t={:<7.1}", now as f64 / 1_000_000_000.0);
    for u in usage(ctl, specs) {
        let before = prev.insert(u.id, u.total_ns).unwrap_or(0);
        let pct = u.total_ns.saturating_sub(before) as f64 / capacity as f64 * 100.0;
        print!(" {}: esh={:<5} cpu={:<5.1}%", u.name, u.eshare, pct);
    }
    println!();
}

// RUN THE SIMULATION UNTIL duration_ns OF SIMULATED TIME OR SHUTDOWN
pub fn simulate(
    ctl: &CpuController,
    specs: &[ClassSpec],
    sim: &SimConfig,
    shutdown: &AtomicBool,
) -> Result<SimSummary> {
    let start = 1u64;
    build_classes(ctl, specs, start)?;
    let mut workers = spawn_tasks(ctl, specs, start)?;
    info!("{} classes, {} synthetic tasks on {} cpus",
        specs.len(), workers.iter().map(|w| w.tasks.len()).sum::<usize>(), ctl.nr_cpus());

    let slice_ns = sim.slice_ns.max(1);
    let clock = AtomicU64::new(start);
    let done = AtomicBool::new(false);
    let barrier = Barrier::new(workers.len() + 1);
    let mut ticks = 0u64;
    let mut cycles = 0u64;

    std::thread::scope(|s| {
        for w in workers.iter_mut() {
            let (clock, done, barrier) = (&clock, &done, &barrier);
            s.spawn(move || loop {
                barrier.wait();
                if done.load(Ordering::Acquire) {
                    break;
                }
                w.step(ctl, clock.load(Ordering::Acquire), slice_ns);
                barrier.wait();
            });
        }

        let mut next_monitor = start + sim.period_ns;
        let mut prev = HashMap::new();
        let mut last_print = start;
        loop {
            let now = clock.load(Ordering::Acquire);
            if shutdown.load(Ordering::Relaxed) || now - start >= sim.duration_ns {
                done.store(true, Ordering::Release);
                barrier.wait();
                break;
            }
            barrier.wait();
            barrier.wait();
            ticks += 1;
            let now = clock.fetch_add(slice_ns, Ordering::AcqRel) + slice_ns;

            if now >= next_monitor {
                next_monitor = now + sim.period_ns;
                match ctl.run_monitor(now) {
                    CycleOutcome::Completed(_) => {
                        cycles += 1;
                        if sim.verbose {
                            print_cycle(ctl, specs, now, &mut prev, now - last_print);
                            last_print = now;
                        }
                    }
                    other => debug!("monitor at {}ns: {:?}", now, other),
                }
            }
            if sim.realtime {
                std::thread::sleep(Duration::from_nanos(slice_ns));
            }
        }
    });

    Ok(SimSummary {
        elapsed_ns: clock.load(Ordering::Acquire) - start,
        ticks,
        cycles,
        classes: usage(ctl, specs),
    })
}

pub fn run_sim(ctl: &CpuController, specs: &[ClassSpec], sim: &SimConfig, shutdown: &AtomicBool) -> Result<()> {
    println!("SHAREFLOW SIMULATION");
    println!("  CPUS:     {}", ctl.nr_cpus());
    println!("  CLASSES:  {}", specs.len());
    println!("  SLICE:    {}us", sim.slice_ns / 1000);
    println!("  PERIOD:   {}ms", sim.period_ns / 1_000_000);
    println!();

    let summary = simulate(ctl, specs, sim, shutdown)?;

    let capacity = summary.elapsed_ns.saturating_mul(ctl.nr_cpus() as u64).max(1);
    println!("\n{:<16} {:>8} {:>12} {:>8}", "CLASS", "ESHARE", "CPU_MS", "CPU%");
    println!("{}", "-".repeat(48));
    for c in &summary.classes {
        println!("{:<16} {:>8} {:>12} {:>7.1}%",
            c.name, c.eshare, c.total_ns / 1_000_000, c.total_ns as f64 / capacity as f64 * 100.0);
    }
    println!("\nSIMULATED: {:.1}s  TICKS: {}  MONITOR CYCLES: {}",
        summary.elapsed_ns as f64 / 1_000_000_000.0, summary.ticks, summary.cycles);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shareflow::ControllerConfig;

    const MS: u64 = 1_000_000;

    fn sim(duration_ms: u64) -> SimConfig {
        SimConfig {
            duration_ns: duration_ms * MS,
            period_ns: 200 * MS,
            slice_ns: 5 * MS,
            realtime: false,
            verbose: false,
        }
    }

    fn specs(list: &[&str]) -> Vec<ClassSpec> {
        list.iter().map(|s| ClassSpec::parse(s).unwrap()).collect()
    }

    #[test]
    fn duty_cycle_sleep_length() {
        let ctl = CpuController::new(ControllerConfig::with_cpus(1), 0);
        let t = SimTask {
            task: Task { id: TaskId(1), class: ctl.root(), cpu: 0, prio: DEFAULT_PRIO },
            load_pct: 25,
            sleep_until: None,
        };
        assert_eq!(t.sleep_ns(4 * MS), 12 * MS);
        let full = SimTask { load_pct: 100, ..t };
        assert_eq!(full.sleep_ns(4 * MS), 0);
    }

    #[test]
    fn busy_class_consumes_cpu() {
        let ctl = CpuController::new(ControllerConfig::with_cpus(2), 0);
        let shutdown = AtomicBool::new(false);
        let s = simulate(&ctl, &specs(&["busy=root:50:100:100", "idle=root:20:100"]), &sim(2_000), &shutdown)
            .unwrap();
        assert_eq!(s.ticks, 400);
        assert!(s.cycles >= 5);
        assert!(s.usage("busy").unwrap().total_ns > 0);
        assert_eq!(s.usage("idle").unwrap().total_ns, 0);
        // NEVER MORE CPU THAN THE MACHINE HAS
        let total: u64 = s.classes.iter().map(|c| c.total_ns).sum();
        assert!(total <= s.elapsed_ns * 2);
    }

    #[test]
    fn shutdown_stops_immediately() {
        let ctl = CpuController::new(ControllerConfig::with_cpus(1), 0);
        let shutdown = AtomicBool::new(true);
        let s = simulate(&ctl, &specs(&["a=root:10:100:50"]), &sim(1_000), &shutdown).unwrap();
        assert_eq!(s.ticks, 0);
        assert_eq!(s.elapsed_ns, 0);
    }

    #[test]
    fn bad_class_aborts_before_running() {
        let ctl = CpuController::new(ControllerConfig::with_cpus(1), 0);
        let shutdown = AtomicBool::new(false);
        assert!(simulate(&ctl, &specs(&["a=ghost:10:100:50"]), &sim(100), &shutdown).is_err());
        assert_eq!(ctl.monitor_cycles(), 1);
    }
}

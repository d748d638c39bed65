// SHAREFLOW EVENT LOG
// RECORDS ONE SNAPSHOT PER COMPLETED MONITOR CYCLE
// PRE-ALLOCATED RING BUFFER. NO HEAP ALLOCATION WHILE RECORDING.
// WRAPS AROUND AT CAPACITY -- OLDEST ENTRIES OVERWRITTEN.

use crate::monitor::CycleReport;

const MAX_SNAPSHOTS: usize = 4096;

#[derive(Clone, Copy, Default)]
pub struct Snapshot {
    pub ts_ns:         u64,
    pub classes:       usize,
    pub total_surplus: u64,
    pub granted:       u64,
    pub root_eshare:   u32,
    pub busy:          usize,
    pub skewed:        usize,
    pub cpu_ns:        u64,
}

pub struct EventLog {
    snapshots: Vec<Snapshot>,
    head:      usize,
    len:       usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            snapshots: vec![Snapshot::default(); MAX_SNAPSHOTS],
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // RECORD ONE CYCLE. OVERWRITES OLDEST ENTRY WHEN FULL.
    pub fn snapshot(&mut self, report: &CycleReport) {
        self.snapshots[self.head] = Snapshot {
            ts_ns: report.now_ns,
            classes: report.classes,
            total_surplus: report.total_surplus,
            granted: report.granted,
            root_eshare: report.root_eshare,
            busy: report.busy_queues,
            skewed: report.skewed_queues,
            cpu_ns: report.folded_ns,
        };
        self.head = (self.head + 1) % MAX_SNAPSHOTS;
        if self.len < MAX_SNAPSHOTS {
            self.len += 1;
        }
    }

    pub fn last(&self) -> Option<&Snapshot> {
        if self.len == 0 {
            return None;
        }
        Some(&self.snapshots[(self.head + MAX_SNAPSHOTS - 1) % MAX_SNAPSHOTS])
    }

    // ITERATE SNAPSHOTS IN CHRONOLOGICAL ORDER
    pub fn iter_chronological(&self) -> impl Iterator<Item = &Snapshot> {
        let start = if self.len < MAX_SNAPSHOTS { 0 } else { self.head };
        (0..self.len).map(move |i| {
            &self.snapshots[(start + i) % MAX_SNAPSHOTS]
        })
    }

    // DUMP THE TIME SERIES AFTER EXECUTION
    pub fn dump(&self) {
        let mut iter = self.iter_chronological();
        let Some(first) = iter.next() else {
            return;
        };
        let base_ts = first.ts_ns;

        println!("\n{:<10} {:<8} {:<10} {:<10} {:<10} {:<8} {:<8} {:<12}",
            "TIME_S", "CLASSES", "SURPLUS", "GRANTED", "ROOT_ESH", "BUSY", "SKEWED", "CPU_MS");
        println!("{}", "-".repeat(82));

        for s in std::iter::once(first).chain(iter) {
            let elapsed_s = s.ts_ns.saturating_sub(base_ts) as f64 / 1_000_000_000.0;
            println!("{:<10.1} {:<8} {:<10} {:<10} {:<10} {:<8} {:<8} {:<12}",
                elapsed_s, s.classes, s.total_surplus, s.granted,
                s.root_eshare, s.busy, s.skewed, s.cpu_ns / 1_000_000);
        }

        if self.len == MAX_SNAPSHOTS {
            println!("\n(RING BUFFER WRAPPED -- SHOWING MOST RECENT {} SNAPSHOTS)", MAX_SNAPSHOTS);
        }
        println!("TOTAL SNAPSHOTS: {}", self.len);
    }

    // SUMMARY STATISTICS
    pub fn summary(&self) {
        if self.len < 2 {
            return;
        }

        let snapshots: Vec<&Snapshot> = self.iter_chronological().collect();
        let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) else {
            return;
        };

        let total_granted: u64 = snapshots.iter().map(|s| s.granted).sum();
        let total_surplus: u64 = snapshots.iter().map(|s| s.total_surplus).sum();
        let total_cpu_ns: u64 = snapshots.iter().map(|s| s.cpu_ns).sum();
        let skewed_cycles = snapshots.iter().filter(|s| s.skewed > 0).count();
        let peak_classes = snapshots.iter().map(|s| s.classes).max().unwrap_or(0);

        let elapsed_s = last.ts_ns.saturating_sub(first.ts_ns) as f64 / 1_000_000_000.0;

        println!("\n{}", "=".repeat(50));
        println!("SHAREFLOW SUMMARY");
        println!("{}", "=".repeat(50));
        println!("  MONITOR CYCLES:    {}", self.len);
        println!("  PEAK CLASSES:      {}", peak_classes);
        println!("  SURPLUS OFFERED:   {}", total_surplus);
        println!("  SURPLUS GRANTED:   {}", total_granted);
        if total_surplus > 0 {
            let pct = total_granted as f64 / total_surplus as f64 * 100.0;
            println!("  GRANT RATE:        {:.1}%", pct);
        }
        println!("  SKEWED CYCLES:     {}", skewed_cycles);
        println!("  CPU ACCOUNTED:     {:.1}s", total_cpu_ns as f64 / 1_000_000_000.0);
        println!("  ELAPSED:           {:.1}s", elapsed_s);
    }
}

pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
}

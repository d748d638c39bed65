// SHAREFLOW CONSOLE LOGGING
// TIMESTAMPED [HH:MM:SS] [LEVEL] FORMAT, BACKEND FOR THE log FACADE

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

pub fn timestamp() -> String {
    unsafe {
        let mut t: libc::time_t = 0;
        libc::time(&mut t);
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&t, &mut tm);
        format!("[{:02}:{:02}:{:02}]", tm.tm_hour, tm.tm_min, tm.tm_sec)
    }
}

pub fn format_line(level: Level, msg: &str) -> String {
    let tag = format!("[{}]", level);
    format!("{} {:<8} {}", timestamp(), tag, msg)
}

pub struct ConsoleLogger {
    level: LevelFilter,
}

impl ConsoleLogger {
    pub const fn new(level: LevelFilter) -> Self {
        Self { level }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format_line(record.level(), &record.args().to_string());
        if record.level() <= Level::Warn {
            eprintln!("{}", line);
        } else {
            println!("{}", line);
        }
    }

    fn flush(&self) {}
}

static INFO_LOGGER: ConsoleLogger = ConsoleLogger::new(LevelFilter::Info);
static DEBUG_LOGGER: ConsoleLogger = ConsoleLogger::new(LevelFilter::Debug);

// INSTALL ONCE PER PROCESS
pub fn init(verbose: bool) -> Result<(), SetLoggerError> {
    let (logger, level) = if verbose {
        (&DEBUG_LOGGER, LevelFilter::Debug)
    } else {
        (&INFO_LOGGER, LevelFilter::Info)
    };
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(())
}

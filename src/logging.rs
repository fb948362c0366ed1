//! `log` backend for the netscript sandbox.
//!
//! There is no stdout in game, so records are buffered and the daemon drains
//! them into the script log once per tick.

use std::cell::RefCell;

use log::{
    Level,
    LevelFilter,
    Log,
    Metadata,
    Record,
};

const MAX_BUFFERED: usize = 512;

thread_local! {
    static BUFFER: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

struct BufferLogger;

static LOGGER: BufferLogger = BufferLogger;

impl Log for BufferLogger {
    fn enabled(
        &self,
        metadata: &Metadata,
    ) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(
        &self,
        record: &Record,
    ) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let line = format!("{: <5} {}", tag, record.args());

        BUFFER.with(|buffer| {
            let mut buffer = buffer.borrow_mut();

            // drop the oldest lines if nobody is draining
            if MAX_BUFFERED <= buffer.len() {
                buffer.remove(0);
            }

            buffer.push(line);
        });
    }

    fn flush(&self) {}
}

/// Installs the logger. Calling this more than once only updates the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}

/// Takes every buffered line, oldest first.
pub fn drain() -> Vec<String> {
    BUFFER.with(|buffer| std::mem::take(&mut *buffer.borrow_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order() {
        init(LevelFilter::Debug);
        drain();

        log::info!("first");
        log::warn!("second");

        let lines = drain();
        assert_eq!(lines, vec!["INFO  first", "WARN  second"]);
        assert!(drain().is_empty());
    }
}

//! Named counters reported through the log at a sampled rate.

use std::sync::atomic::{AtomicUsize, Ordering};

const DEFAULT_LOG_RATE: usize = 100;

pub struct Counter {
    pub name: &'static str,
    /// total accumulated value
    pub counts: AtomicUsize,
    pub times: AtomicUsize,
    pub lograte: usize,
}

impl Counter {
    pub const fn new(name: &'static str, lograte: usize) -> Self {
        Counter {
            name,
            counts: AtomicUsize::new(0),
            times: AtomicUsize::new(0),
            lograte: if lograte == 0 { DEFAULT_LOG_RATE } else { lograte },
        }
    }

    pub fn inc(&self, level: log::Level, events: usize) {
        let counts = self.counts.fetch_add(events, Ordering::Relaxed);
        let times = self.times.fetch_add(1, Ordering::Relaxed);
        if times % self.lograte == 0 && times > 0 && log::log_enabled!(level) {
            log::log!(
                level,
                "COUNTER:{{\"name\": \"{}\", \"counts\": {}, \"samples\": {}, \"events\": {}}}",
                self.name,
                counts + events,
                times,
                events,
            );
        }
    }
}

#[macro_export]
macro_rules! inc_new_counter {
    ($name:expr, $count:expr, $level:expr, $lograte:expr) => {{
        static INC_NEW_COUNTER: $crate::Counter = $crate::Counter::new($name, $lograte);
        INC_NEW_COUNTER.inc($level, $count);
    }};
}

#[macro_export]
macro_rules! inc_new_counter_info {
    ($name:expr, $count:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Info, 0)
    };
    ($name:expr, $count:expr, $lograte:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Info, $lograte)
    };
}

#[macro_export]
macro_rules! inc_new_counter_debug {
    ($name:expr, $count:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Debug, 0)
    };
    ($name:expr, $count:expr, $lograte:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Debug, $lograte)
    };
}

#[macro_export]
macro_rules! inc_new_counter_error {
    ($name:expr, $count:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Error, 1)
    };
    ($name:expr, $count:expr, $lograte:expr) => {
        $crate::inc_new_counter!($name, $count, log::Level::Error, $lograte)
    };
}

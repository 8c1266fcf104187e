use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;

pub const DAY_FORMAT: &str = "%Y-%m-%d";

/// Wall-clock milliseconds that never go backwards within the process.
pub fn now_unix_ms() -> i64 {
    static LAST_UNIX_MS: AtomicI64 = AtomicI64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;

    let mut prev = LAST_UNIX_MS.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev);
        match LAST_UNIX_MS.compare_exchange_weak(prev, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}

/// Device-local calendar day.
pub fn local_today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub fn format_day(day: NaiveDate) -> String {
    day.format(DAY_FORMAT).to_string()
}

//! Fixed-window rate limiter keyed by wall-clock Unix second.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default)]
struct Window {
    sec: i64,
    count: i64,
}

/// Allows up to `limit` events per Unix-second window. A zero or negative
/// limit means unlimited. Windows follow the wall clock on purpose: the
/// counter resets on the second boundary, not `limit` per sliding second.
#[derive(Debug)]
pub struct FixedWindowRateLimiter {
    limit: i64,
    window: Mutex<Window>,
}

impl FixedWindowRateLimiter {
    pub fn new(limit: i64) -> Self {
        FixedWindowRateLimiter {
            limit,
            window: Mutex::new(Window::default()),
        }
    }

    pub fn allow(&self, now: SystemTime) -> bool {
        if self.limit <= 0 {
            return true;
        }

        let sec = unix_seconds(now);
        let mut w = self.window.lock().expect("rate limiter lock");

        if w.count == 0 || w.sec != sec {
            w.sec = sec;
            w.count = 1;
            return true;
        }
        if w.count >= self.limit {
            return false;
        }
        w.count += 1;
        true
    }
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

//! Sleep future backed by browser timers

use gloo_timers::future::TimeoutFuture;

/// Resolve after `millis` milliseconds.
pub fn sleep_ms(millis: u32) -> TimeoutFuture {
    TimeoutFuture::new(millis)
}

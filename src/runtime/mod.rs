//! Browser timer plumbing
//!
//! Every network await in the client carries a deadline; this module owns the
//! sleep future and the deadline-race helper the rest of the crate uses.

mod sleep;

pub use sleep::sleep_ms;

use crate::error::{Result, TorError};
use futures::future::{Future, FutureExt};

/// Spawn a fire-and-forget task on the browser microtask queue.
///
/// Off-wasm (the host-side test harness) tasks are queued instead and only
/// run when a test drives them explicitly.
pub fn spawn(fut: impl Future<Output = ()> + 'static) {
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_futures::spawn_local(fut);

    #[cfg(not(target_arch = "wasm32"))]
    host_tasks::push(Box::pin(fut));
}

#[cfg(not(target_arch = "wasm32"))]
pub mod host_tasks {
    use futures::future::LocalBoxFuture;
    use std::cell::RefCell;

    thread_local! {
        static QUEUE: RefCell<Vec<LocalBoxFuture<'static, ()>>> = RefCell::new(Vec::new());
    }

    pub fn push(fut: LocalBoxFuture<'static, ()>) {
        QUEUE.with(|q| q.borrow_mut().push(fut));
    }

    /// Run every queued task to completion. Panics if a task never resolves,
    /// so only drive tasks that are known to finish.
    pub fn drain() {
        loop {
            let next = QUEUE.with(|q| q.borrow_mut().pop());
            match next {
                Some(task) => futures::executor::block_on(task),
                None => break,
            }
        }
    }

    pub fn clear() {
        QUEUE.with(|q| q.borrow_mut().clear());
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    web_time::SystemTime::now()
        .duration_since(web_time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Race a future against a deadline.
///
/// On expiry the future is dropped (cancelling any partially built state it
/// owns) and `Timeout { op }` is returned.
pub async fn with_deadline<F, T>(op: &str, timeout_ms: u32, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    futures::select_biased! {
        result = fut.fuse() => result,
        _ = sleep_ms(timeout_ms).fuse() => Err(TorError::timeout(op)),
    }
}

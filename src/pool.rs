//! Generic buffered resource pool
//!
//! Keeps `target_size` resources pre-built in the background so acquisition
//! is usually a queue pop. An empty acquire races `min_in_flight` factory
//! invocations: the first success goes to the caller, stragglers that
//! succeed are buffered (briefly overshooting the target is fine), failures
//! are dropped. Maintenance retries factory failures with exponential
//! backoff; the acquire path never backs off.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use futures::channel::{mpsc, oneshot};
use futures::future::{select_all, LocalBoxFuture};
use futures::StreamExt;

use crate::error::{Result, TorError};
use crate::runtime;

/// Factory producing one resource per invocation.
pub type Factory<R> = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<R>>>;

/// Synchronous disposer for buffered resources.
pub type Disposer<R> = Rc<dyn Fn(&R)>;

const BACKOFF_INITIAL_MS: f64 = 5_000.0;
const BACKOFF_MULTIPLIER: f64 = 1.1;
const BACKOFF_CAP_MS: f64 = 60_000.0;

/// Observable pool lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    ResourceCreated,
    ResourceAcquired,
    ResourceDisposed,
    TargetSizeReached,
    CreationFailed,
}

/// Counters kept since pool creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub created: u64,
    pub acquired: u64,
    pub disposed: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Nominal number of buffered resources maintenance keeps ready
    pub target_size: usize,
    /// Parallel factory invocations raced by an empty acquire
    pub min_in_flight: usize,
}

struct PoolShared<R> {
    config: PoolConfig,
    factory: Factory<R>,
    disposer: Disposer<R>,
    buffered: RefCell<VecDeque<R>>,
    in_flight: Cell<usize>,
    disposed: Cell<bool>,
    listeners: RefCell<Vec<Box<dyn Fn(PoolEvent)>>>,
    ready_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    full_waiters: RefCell<Vec<oneshot::Sender<()>>>,
    demand: RefCell<Option<mpsc::UnboundedSender<()>>>,
    stats: RefCell<PoolStats>,
}

impl<R> PoolShared<R> {
    fn emit(&self, event: PoolEvent) {
        for listener in self.listeners.borrow().iter() {
            listener(event);
        }
    }

    fn buffered_len(&self) -> usize {
        self.buffered.borrow().len()
    }

    fn needs_more(&self) -> bool {
        self.buffered_len() + self.in_flight.get() < self.config.target_size
    }

    /// Buffer a freshly built resource and wake waiters.
    fn push_buffered(&self, resource: R) {
        if self.disposed.get() {
            (self.disposer)(&resource);
            self.stats.borrow_mut().disposed += 1;
            self.emit(PoolEvent::ResourceDisposed);
            return;
        }

        self.buffered.borrow_mut().push_back(resource);
        self.stats.borrow_mut().created += 1;
        self.emit(PoolEvent::ResourceCreated);

        for waiter in self.ready_waiters.borrow_mut().drain(..) {
            let _ = waiter.send(());
        }
        if self.buffered_len() >= self.config.target_size {
            self.emit(PoolEvent::TargetSizeReached);
            for waiter in self.full_waiters.borrow_mut().drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    /// Nudge maintenance after the buffer shrank.
    fn signal_demand(&self) {
        if let Some(tx) = self.demand.borrow().as_ref() {
            let _ = tx.unbounded_send(());
        }
    }
}

/// A pool of pre-built resources.
pub struct ResourcePool<R: 'static> {
    shared: Rc<PoolShared<R>>,
}

impl<R: 'static> ResourcePool<R> {
    pub fn new(config: PoolConfig, factory: Factory<R>, disposer: Disposer<R>) -> Self {
        let shared = Rc::new(PoolShared {
            config,
            factory,
            disposer,
            buffered: RefCell::new(VecDeque::new()),
            in_flight: Cell::new(0),
            disposed: Cell::new(false),
            listeners: RefCell::new(Vec::new()),
            ready_waiters: RefCell::new(Vec::new()),
            full_waiters: RefCell::new(Vec::new()),
            demand: RefCell::new(None),
            stats: RefCell::new(PoolStats::default()),
        });

        if config.target_size > 0 {
            let (demand_tx, demand_rx) = mpsc::unbounded();
            *shared.demand.borrow_mut() = Some(demand_tx);
            spawn_maintenance(Rc::clone(&shared), demand_rx);
        }

        Self { shared }
    }

    pub fn on_event(&self, listener: impl Fn(PoolEvent) + 'static) {
        self.shared.listeners.borrow_mut().push(Box::new(listener));
    }

    pub fn stats(&self) -> PoolStats {
        *self.shared.stats.borrow()
    }

    pub fn buffered(&self) -> usize {
        self.shared.buffered_len()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.get()
    }

    /// Take a resource: pop the oldest buffered one, or race
    /// `min_in_flight` factory invocations when the buffer is empty.
    pub async fn acquire(&self) -> Result<R> {
        let shared = &self.shared;
        if shared.disposed.get() {
            return Err(TorError::Closed);
        }

        if let Some(resource) = shared.buffered.borrow_mut().pop_front() {
            shared.stats.borrow_mut().acquired += 1;
            shared.emit(PoolEvent::ResourceAcquired);
            shared.signal_demand();
            return Ok(resource);
        }

        let race_width = shared.config.min_in_flight.max(1);
        log::debug!("pool empty, racing {} factory calls", race_width);

        let mut contenders: Vec<LocalBoxFuture<'static, Result<R>>> =
            (0..race_width).map(|_| (shared.factory)()).collect();
        shared.in_flight.set(shared.in_flight.get() + race_width);

        loop {
            let (result, _index, remaining) = select_all(contenders).await;
            shared.in_flight.set(shared.in_flight.get() - 1);

            match result {
                Ok(resource) => {
                    // Stragglers keep running; their successes are buffered
                    // (possibly beyond target), their failures dropped.
                    for straggler in remaining {
                        let shared = Rc::clone(shared);
                        runtime::spawn(async move {
                            let result = straggler.await;
                            shared.in_flight.set(shared.in_flight.get() - 1);
                            match result {
                                Ok(resource) => shared.push_buffered(resource),
                                Err(e) => {
                                    log::debug!("raced factory call failed late: {}", e);
                                }
                            }
                        });
                    }
                    shared.stats.borrow_mut().acquired += 1;
                    shared.emit(PoolEvent::ResourceAcquired);
                    return Ok(resource);
                }
                Err(e) if remaining.is_empty() => {
                    shared.stats.borrow_mut().failures += 1;
                    shared.emit(PoolEvent::CreationFailed);
                    return Err(e);
                }
                Err(e) => {
                    log::debug!("raced factory call failed: {}", e);
                    contenders = remaining;
                }
            }
        }
    }

    /// Resolves once at least one resource is buffered.
    pub async fn wait_for_ready(&self) -> Result<()> {
        self.wait_until(1).await
    }

    /// Resolves once the buffer holds `target_size` resources.
    pub async fn wait_for_full(&self) -> Result<()> {
        self.wait_until(self.shared.config.target_size).await
    }

    async fn wait_until(&self, count: usize) -> Result<()> {
        loop {
            if self.shared.disposed.get() {
                return Err(TorError::Closed);
            }
            if self.shared.buffered_len() >= count {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            if count >= self.shared.config.target_size.max(1) {
                self.shared.full_waiters.borrow_mut().push(tx);
            } else {
                self.shared.ready_waiters.borrow_mut().push(tx);
            }
            if rx.await.is_err() {
                return Err(TorError::Closed);
            }
        }
    }

    /// Dispose every buffered resource and stop maintenance. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.replace(true) {
            return;
        }
        log::debug!("disposing pool ({} buffered)", self.shared.buffered_len());
        self.shared.demand.borrow_mut().take();

        for resource in self.shared.buffered.borrow_mut().drain(..) {
            (self.shared.disposer)(&resource);
            self.shared.stats.borrow_mut().disposed += 1;
            self.shared.emit(PoolEvent::ResourceDisposed);
        }
        self.shared.ready_waiters.borrow_mut().clear();
        self.shared.full_waiters.borrow_mut().clear();
    }

    #[cfg(test)]
    fn seed(&self, resource: R) {
        self.shared.push_buffered(resource);
    }
}

/// Background refill: build while below target, then sleep on the demand
/// channel. Factory failures back off exponentially (5 s × 1.1, capped at
/// 60 s) and any success resets the backoff.
fn spawn_maintenance<R: 'static>(
    shared: Rc<PoolShared<R>>,
    mut demand: mpsc::UnboundedReceiver<()>,
) {
    runtime::spawn(async move {
        let mut backoff_ms = BACKOFF_INITIAL_MS;

        loop {
            if shared.disposed.get() {
                break;
            }

            while !shared.disposed.get() && shared.needs_more() {
                shared.in_flight.set(shared.in_flight.get() + 1);
                let result = (shared.factory)().await;
                shared.in_flight.set(shared.in_flight.get() - 1);

                match result {
                    Ok(resource) => {
                        backoff_ms = BACKOFF_INITIAL_MS;
                        shared.push_buffered(resource);
                    }
                    Err(e) => {
                        shared.stats.borrow_mut().failures += 1;
                        shared.emit(PoolEvent::CreationFailed);
                        log::warn!(
                            "pool refill failed ({}), backing off {}ms",
                            e,
                            backoff_ms as u32
                        );
                        runtime::sleep_ms(backoff_ms as u32).await;
                        backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(BACKOFF_CAP_MS);
                    }
                }
            }

            if demand.next().await.is_none() {
                break;
            }
        }
        log::debug!("pool maintenance task exiting");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::future::FutureExt;

    fn counting_factory(
        results: Rc<RefCell<VecDeque<Result<u32>>>>,
        calls: Rc<Cell<usize>>,
    ) -> Factory<u32> {
        Rc::new(move || {
            calls.set(calls.get() + 1);
            let next = results
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(TorError::Closed));
            async move { next }.boxed_local()
        })
    }

    fn no_maintenance_pool(
        results: Vec<Result<u32>>,
        min_in_flight: usize,
    ) -> (ResourcePool<u32>, Rc<Cell<usize>>, Rc<Cell<usize>>) {
        let calls = Rc::new(Cell::new(0));
        let disposals = Rc::new(Cell::new(0));
        let disposals_clone = Rc::clone(&disposals);

        let pool = ResourcePool::new(
            PoolConfig {
                target_size: 0,
                min_in_flight,
            },
            counting_factory(Rc::new(RefCell::new(results.into())), Rc::clone(&calls)),
            Rc::new(move |_| disposals_clone.set(disposals_clone.get() + 1)),
        );
        (pool, calls, disposals)
    }

    #[test]
    fn buffered_resources_are_fifo() {
        let (pool, _, _) = no_maintenance_pool(vec![], 1);
        pool.seed(1);
        pool.seed(2);
        pool.seed(3);

        block_on(async {
            assert_eq!(pool.acquire().await.unwrap(), 1);
            assert_eq!(pool.acquire().await.unwrap(), 2);
            assert_eq!(pool.acquire().await.unwrap(), 3);
        });
        runtime::host_tasks::clear();
    }

    #[test]
    fn empty_acquire_races_min_in_flight() {
        let (pool, calls, _) = no_maintenance_pool(vec![Ok(10), Ok(11)], 2);

        let first = block_on(pool.acquire()).unwrap();
        assert_eq!(first, 10);
        assert_eq!(calls.get(), 2);

        // The straggler finishes in the background and lands in the buffer.
        runtime::host_tasks::drain();
        assert_eq!(pool.buffered(), 1);
        assert_eq!(block_on(pool.acquire()).unwrap(), 11);
        runtime::host_tasks::clear();
    }

    #[test]
    fn race_failures_fall_through_to_success() {
        let (pool, calls, _) = no_maintenance_pool(vec![Err(TorError::KdfKeyHash), Ok(7)], 2);

        assert_eq!(block_on(pool.acquire()).unwrap(), 7);
        assert_eq!(calls.get(), 2);
        runtime::host_tasks::clear();
    }

    #[test]
    fn all_race_failures_surface_last_error() {
        let (pool, _, _) = no_maintenance_pool(
            vec![Err(TorError::KdfKeyHash), Err(TorError::KeynetExitNotFound)],
            2,
        );

        assert!(block_on(pool.acquire()).is_err());
        runtime::host_tasks::clear();
    }

    #[test]
    fn dispose_drops_buffered_and_rejects_acquire() {
        let (pool, _, disposals) = no_maintenance_pool(vec![], 1);
        pool.seed(1);
        pool.seed(2);

        pool.dispose();
        assert_eq!(disposals.get(), 2);
        assert_eq!(pool.buffered(), 0);
        assert!(matches!(block_on(pool.acquire()), Err(TorError::Closed)));

        // Idempotent
        pool.dispose();
        assert_eq!(disposals.get(), 2);
        runtime::host_tasks::clear();
    }

    #[test]
    fn events_fire_for_lifecycle() {
        let (pool, _, _) = no_maintenance_pool(vec![], 1);
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        pool.on_event(move |e| sink.borrow_mut().push(e));

        pool.seed(1);
        let _ = block_on(pool.acquire()).unwrap();
        pool.dispose();

        let seen = events.borrow();
        assert!(seen.contains(&PoolEvent::ResourceCreated));
        assert!(seen.contains(&PoolEvent::ResourceAcquired));
        runtime::host_tasks::clear();
    }

    #[test]
    fn backoff_schedule_is_capped() {
        let mut backoff: f64 = BACKOFF_INITIAL_MS;
        let mut schedule = Vec::new();
        for _ in 0..60 {
            schedule.push(backoff as u32);
            backoff = (backoff * BACKOFF_MULTIPLIER).min(BACKOFF_CAP_MS);
        }
        assert_eq!(schedule[0], 5_000);
        assert_eq!(schedule[1], 5_500);
        assert_eq!(schedule[2], 6_050);
        assert_eq!(*schedule.last().unwrap(), 60_000);
    }
}

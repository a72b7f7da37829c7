//! Circuit manager: host bindings, lifetimes, and the shared link
//!
//! The manager owns the (lazily connected) TorLink, the circuit pool, and
//! the per-host allocation maps. A host is bound to at most one circuit;
//! concurrent requests for an unbound host coalesce onto a single allocation
//! future. Each in-flight request borrows the circuit (ref-count), so
//! lifetime expiry or link loss never tears a circuit down under a request.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};
use serde::Serialize;

use crate::config::TorClientConfig;
use crate::error::{Result, TorError};
use crate::pool::{PoolConfig, PoolStats, ResourcePool};
use crate::protocol::{Circuit, CircuitBuilder, CircuitId, Directory, KeynetAddress, TorLink};
use crate::runtime;
use crate::storage::Storage;
use crate::transport::BridgeStream;

/// Racing width for empty-pool acquisition.
const POOL_MIN_IN_FLIGHT: usize = 2;

type AllocFuture = Shared<LocalBoxFuture<'static, Result<Rc<Circuit>>>>;
type LinkFuture = Shared<LocalBoxFuture<'static, Result<Rc<TorLink>>>>;

struct CircuitEntry {
    allocated_at_ms: u64,
    expiry_ms: Option<u64>,
    ref_count: u32,
}

/// Snapshot of one host binding, as exposed by the façade.
#[derive(Debug, Clone, Serialize)]
pub struct HostCircuitStatus {
    pub host: String,
    pub status: String,
    pub age_ms: u64,
    pub expiry_ms: Option<u64>,
    pub ref_count: u32,
}

pub struct CircuitManager {
    config: TorClientConfig,
    builder: Rc<CircuitBuilder>,
    pool: ResourcePool<Rc<Circuit>>,
    link: RefCell<Option<Rc<TorLink>>>,
    link_pending: RefCell<Option<LinkFuture>>,
    host_circuits: RefCell<HashMap<String, Rc<Circuit>>>,
    circuit_owners: RefCell<HashMap<CircuitId, String>>,
    circuit_states: RefCell<HashMap<CircuitId, CircuitEntry>>,
    allocations: RefCell<HashMap<String, AllocFuture>>,
    closed: Cell<bool>,
    #[cfg(test)]
    test_factory: RefCell<Option<TestFactory>>,
}

#[cfg(test)]
type TestFactory = Box<dyn Fn() -> LocalBoxFuture<'static, Result<Rc<Circuit>>>>;

impl CircuitManager {
    pub fn new(config: TorClientConfig, storage: Rc<dyn Storage>) -> Rc<Self> {
        Rc::new_cyclic(|weak: &std::rc::Weak<CircuitManager>| {
            let directory = Rc::new(Directory::new(storage));
            let builder = Rc::new(CircuitBuilder::new(
                Rc::clone(&directory),
                config.extend_timeout_ms,
            ));

            let factory_weak = weak.clone();
            let factory: crate::pool::Factory<Rc<Circuit>> = Rc::new(move || {
                let weak = factory_weak.clone();
                async move {
                    let manager = weak.upgrade().ok_or(TorError::Closed)?;
                    let link = manager.ensure_link().await?;
                    let circuit = manager.builder.build(&link, None).await?;
                    Ok(Rc::new(circuit))
                }
                .boxed_local()
            });

            let pool = ResourcePool::new(
                PoolConfig {
                    target_size: config.circuit_buffer,
                    min_in_flight: POOL_MIN_IN_FLIGHT,
                },
                factory,
                Rc::new(|circuit: &Rc<Circuit>| circuit.destroy(0)),
            );

            CircuitManager {
                config,
                builder,
                pool,
                link: RefCell::new(None),
                link_pending: RefCell::new(None),
                host_circuits: RefCell::new(HashMap::new()),
                circuit_owners: RefCell::new(HashMap::new()),
                circuit_states: RefCell::new(HashMap::new()),
                allocations: RefCell::new(HashMap::new()),
                closed: Cell::new(false),
                #[cfg(test)]
                test_factory: RefCell::new(None),
            }
        })
    }

    /// Run `f` with the circuit bound to `host`, allocating one if needed.
    ///
    /// The request holds a borrow on the circuit for the duration of `f`;
    /// the ref-count drops on every exit path, including errors and
    /// cancellation.
    pub async fn use_circuit<T, F, Fut>(self: &Rc<Self>, host: &str, f: F) -> Result<T>
    where
        F: FnOnce(Rc<Circuit>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut f = Some(f);
        loop {
            if self.closed.get() {
                return Err(TorError::Closed);
            }

            // (1) An existing, healthy binding serves the request.
            let existing = self.host_circuits.borrow().get(host).cloned();
            if let Some(circuit) = existing {
                if circuit.is_usable() {
                    let guard = BorrowGuard::acquire(self, &circuit);
                    let callback = f.take().expect("callback consumed once");
                    let result = callback(Rc::clone(&circuit)).await;
                    drop(guard);
                    if result.is_err() {
                        // Unbind so the next request starts fresh.
                        self.clear_circuit(host);
                    }
                    return result;
                }
                log::info!("bound circuit for {} is dead, unbinding", host);
                self.clear_circuit(host);
                continue;
            }

            // (2) Someone is already allocating for this host; wait with them.
            let pending = self.allocations.borrow().get(host).cloned();
            if let Some(task) = pending {
                let _ = task.await;
                continue;
            }

            // (3) Start a fresh allocation and loop back to (1).
            let task = self.spawn_allocation(host);
            task.await?;
        }
    }

    fn spawn_allocation(self: &Rc<Self>, host: &str) -> AllocFuture {
        let manager = Rc::clone(self);
        let host_owned = host.to_string();
        let future = async move {
            let result = manager.allocate(&host_owned).await;
            manager.allocations.borrow_mut().remove(&host_owned);
            if let Err(e) = &result {
                log::warn!("allocation for {} failed: {}", host_owned, e);
            }
            result
        }
        .boxed_local()
        .shared();

        self.allocations
            .borrow_mut()
            .insert(host.to_string(), future.clone());
        future
    }

    /// Allocate and bind a circuit for `host`.
    async fn allocate(self: &Rc<Self>, host: &str) -> Result<Rc<Circuit>> {
        let circuit = self.obtain_circuit(host).await?;

        if self.closed.get() {
            circuit.destroy(0);
            return Err(TorError::Closed);
        }

        let now = runtime::now_ms();
        let expiry_ms = self.config.max_circuit_lifetime_ms.map(|ms| now + ms);
        let id = circuit.id();

        self.host_circuits
            .borrow_mut()
            .insert(host.to_string(), Rc::clone(&circuit));
        self.circuit_owners.borrow_mut().insert(id, host.to_string());
        self.circuit_states.borrow_mut().insert(
            id,
            CircuitEntry {
                allocated_at_ms: now,
                expiry_ms,
                ref_count: 1, // the manager's own reference
            },
        );

        if let Some(lifetime_ms) = self.config.max_circuit_lifetime_ms {
            self.arm_lifetime_timer(host.to_string(), id, lifetime_ms);
        }

        log::info!("circuit {:#010x} bound to {}", id, host);
        Ok(circuit)
    }

    async fn obtain_circuit(self: &Rc<Self>, host: &str) -> Result<Rc<Circuit>> {
        #[cfg(test)]
        {
            let injected = self.test_factory.borrow().as_ref().map(|factory| factory());
            if let Some(future) = injected {
                return future.await;
            }
        }

        if KeynetAddress::is_keynet_host(host) {
            // .keynet circuits are destination-specific; the pool is not
            // consulted.
            let address = KeynetAddress::parse(host)?;
            let link = self.ensure_link().await?;
            return Ok(Rc::new(self.builder.build(&link, Some(&address)).await?));
        }

        // Buffered circuits may have died with a previous link; skip them.
        loop {
            let circuit = self.pool.acquire().await?;
            if circuit.is_usable() {
                return Ok(circuit);
            }
            log::debug!("discarding dead pooled circuit {:#010x}", circuit.id());
            circuit.destroy(0);
        }
    }

    fn arm_lifetime_timer(self: &Rc<Self>, host: String, id: CircuitId, lifetime_ms: u64) {
        let weak = Rc::downgrade(self);
        runtime::spawn(async move {
            runtime::sleep_ms(lifetime_ms.min(u32::MAX as u64) as u32).await;
            if let Some(manager) = weak.upgrade() {
                // Only fire if this exact circuit is still the binding.
                let still_bound = manager
                    .host_circuits
                    .borrow()
                    .get(&host)
                    .map(|c| c.id() == id)
                    .unwrap_or(false);
                if still_bound {
                    log::info!("circuit {:#010x} reached max lifetime", id);
                    manager.clear_circuit(&host);
                }
            }
        });
    }

    /// Unbind `host` and drop the manager's reference to its circuit. The
    /// circuit is disposed once the last borrower returns.
    pub fn clear_circuit(&self, host: &str) {
        let circuit = self.host_circuits.borrow_mut().remove(host);
        if let Some(circuit) = circuit {
            self.circuit_owners.borrow_mut().remove(&circuit.id());
            self.release_ref(&circuit);
        }
    }

    fn release_ref(&self, circuit: &Rc<Circuit>) {
        let id = circuit.id();
        let dispose = {
            let mut states = self.circuit_states.borrow_mut();
            match states.get_mut(&id) {
                Some(entry) => {
                    entry.ref_count = entry.ref_count.saturating_sub(1);
                    entry.ref_count == 0
                }
                None => false,
            }
        };
        if dispose {
            self.circuit_states.borrow_mut().remove(&id);
            self.circuit_owners.borrow_mut().remove(&id);
            log::debug!("disposing circuit {:#010x}", id);
            circuit.destroy(0);
        }
    }

    /// Lazily connect the bridge and run the link handshake. Concurrent
    /// callers share one connection attempt.
    async fn ensure_link(self: &Rc<Self>) -> Result<Rc<TorLink>> {
        if self.closed.get() {
            return Err(TorError::Closed);
        }
        if let Some(link) = self.link.borrow().as_ref() {
            if !link.is_closed() {
                return Ok(Rc::clone(link));
            }
        }

        let pending = self.link_pending.borrow().clone();
        if let Some(task) = pending {
            return task.await;
        }

        let manager = Rc::clone(self);
        let future = async move {
            let result = manager.connect_link().await;
            manager.link_pending.borrow_mut().take();
            result
        }
        .boxed_local()
        .shared();
        *self.link_pending.borrow_mut() = Some(future.clone());
        future.await
    }

    async fn connect_link(self: &Rc<Self>) -> Result<Rc<TorLink>> {
        log::info!("establishing link to {}", self.config.bridge_url);
        let bridge =
            BridgeStream::connect(&self.config.bridge_url, self.config.connection_timeout_ms)
                .await?;
        let link = TorLink::open(bridge, self.config.circuit_timeout_ms).await?;

        // When the link dies, every binding over it is void; the next
        // request reconnects from scratch.
        let weak = Rc::downgrade(self);
        link.on_close(move |error| {
            if let Some(manager) = weak.upgrade() {
                log::warn!("link lost ({}), clearing all host bindings", error);
                manager.handle_link_lost();
            }
        });

        *self.link.borrow_mut() = Some(Rc::clone(&link));
        Ok(link)
    }

    fn handle_link_lost(&self) {
        self.link.borrow_mut().take();
        let hosts: Vec<String> = self.host_circuits.borrow().keys().cloned().collect();
        for host in hosts {
            self.clear_circuit(&host);
        }
    }

    /// Resolves once the pool holds at least one ready circuit.
    pub async fn wait_for_circuit(&self) -> Result<()> {
        self.pool.wait_for_ready().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn buffered_circuits(&self) -> usize {
        self.pool.buffered()
    }

    /// Per-host binding snapshot for the status surface.
    pub fn circuit_status(&self) -> Vec<HostCircuitStatus> {
        let now = runtime::now_ms();
        let states = self.circuit_states.borrow();
        self.host_circuits
            .borrow()
            .iter()
            .map(|(host, circuit)| {
                let entry = states.get(&circuit.id());
                HostCircuitStatus {
                    host: host.clone(),
                    status: format!("{:?}", circuit.state()),
                    age_ms: entry
                        .map(|e| now.saturating_sub(e.allocated_at_ms))
                        .unwrap_or(0),
                    expiry_ms: entry.and_then(|e| e.expiry_ms),
                    ref_count: entry.map(|e| e.ref_count).unwrap_or(0),
                }
            })
            .collect()
    }

    /// Tear everything down. Idempotent; borrowed circuits survive until
    /// their requests complete.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        log::info!("closing circuit manager");

        self.pool.dispose();
        let hosts: Vec<String> = self.host_circuits.borrow().keys().cloned().collect();
        for host in hosts {
            self.clear_circuit(&host);
        }
        self.allocations.borrow_mut().clear();
        self.link_pending.borrow_mut().take();
        if let Some(link) = self.link.borrow_mut().take() {
            link.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }
}

/// RAII borrow of a host-bound circuit for one request.
struct BorrowGuard {
    manager: Rc<CircuitManager>,
    circuit: Rc<Circuit>,
    counted: bool,
}

impl BorrowGuard {
    fn acquire(manager: &Rc<CircuitManager>, circuit: &Rc<Circuit>) -> Self {
        let counted = {
            let mut states = manager.circuit_states.borrow_mut();
            match states.get_mut(&circuit.id()) {
                Some(entry) => {
                    entry.ref_count += 1;
                    true
                }
                None => false,
            }
        };
        Self {
            manager: Rc::clone(manager),
            circuit: Rc::clone(circuit),
            counted,
        }
    }
}

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        if self.counted {
            self.manager.release_ref(&self.circuit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use futures::executor::block_on;
    use std::cell::Cell;

    fn test_manager(lifetime_ms: Option<u64>) -> Rc<CircuitManager> {
        let config = TorClientConfig {
            bridge_url: "wss://bridge.test/ws".into(),
            circuit_buffer: 0,
            max_circuit_lifetime_ms: lifetime_ms,
            ..TorClientConfig::default()
        };
        CircuitManager::new(config, Rc::new(MemoryStorage::new()))
    }

    fn install_factory(manager: &Rc<CircuitManager>, calls: Rc<Cell<usize>>) {
        *manager.test_factory.borrow_mut() = Some(Box::new(move || {
            calls.set(calls.get() + 1);
            async { Ok(Rc::new(Circuit::new_detached_for_tests())) }.boxed_local()
        }));
    }

    #[test]
    fn concurrent_requests_coalesce_into_one_allocation() {
        let manager = test_manager(None);
        let calls = Rc::new(Cell::new(0));
        install_factory(&manager, Rc::clone(&calls));

        let a = manager.use_circuit("example.org", |c| async move {
            Ok::<_, TorError>(c.id())
        });
        let b = manager.use_circuit("example.org", |c| async move {
            Ok::<_, TorError>(c.id())
        });

        let (ra, rb) = block_on(futures::future::join(a, b));
        assert_eq!(ra.unwrap(), rb.unwrap(), "both requests share the circuit");
        assert_eq!(calls.get(), 1, "exactly one allocation ran");
        runtime::host_tasks::clear();
    }

    #[test]
    fn distinct_hosts_allocate_distinct_circuits() {
        let manager = test_manager(None);
        let calls = Rc::new(Cell::new(0));
        install_factory(&manager, Rc::clone(&calls));

        let a = block_on(manager.use_circuit("a.example", |c| async move {
            Ok::<_, TorError>(c.id())
        }))
        .unwrap();
        let b = block_on(manager.use_circuit("b.example", |c| async move {
            Ok::<_, TorError>(c.id())
        }))
        .unwrap();

        assert_ne!(a, b);
        assert_eq!(calls.get(), 2);
        runtime::host_tasks::clear();
    }

    #[test]
    fn refcount_returns_to_manager_reference_after_requests() {
        let manager = test_manager(None);
        install_factory(&manager, Rc::new(Cell::new(0)));

        block_on(manager.use_circuit("host.example", |_| async { Ok::<_, TorError>(()) }))
            .unwrap();

        let states = manager.circuit_states.borrow();
        let entry = states.values().next().expect("binding exists");
        assert_eq!(entry.ref_count, 1, "only the manager's reference remains");
        runtime::host_tasks::clear();
    }

    #[test]
    fn callback_error_unbinds_host_and_decrements() {
        let manager = test_manager(None);
        install_factory(&manager, Rc::new(Cell::new(0)));

        let result = block_on(manager.use_circuit("host.example", |_| async {
            Err::<(), _>(TorError::timeout("request"))
        }));
        assert!(result.is_err());

        // Error path unbinds, and with the manager reference dropped the
        // circuit state is gone entirely.
        assert!(manager.host_circuits.borrow().is_empty());
        assert!(manager.circuit_states.borrow().is_empty());
        assert!(manager.circuit_owners.borrow().is_empty());
        runtime::host_tasks::clear();
    }

    #[test]
    fn clear_during_borrow_defers_disposal() {
        let manager = test_manager(None);
        install_factory(&manager, Rc::new(Cell::new(0)));

        let manager_inner = Rc::clone(&manager);
        let kept: Rc<RefCell<Option<Rc<Circuit>>>> = Rc::new(RefCell::new(None));
        let kept_inner = Rc::clone(&kept);

        block_on(manager.use_circuit("host.example", move |circuit| async move {
            // Expiry fires mid-request.
            manager_inner.clear_circuit("host.example");
            assert!(circuit.is_usable(), "borrowed circuit survives clearing");
            *kept_inner.borrow_mut() = Some(circuit);
            Ok::<_, TorError>(())
        }))
        .unwrap();

        // After the request ended, the last reference was released and the
        // circuit destroyed.
        let circuit = kept.borrow_mut().take().unwrap();
        assert!(!circuit.is_usable());
        assert!(manager.circuit_states.borrow().is_empty());
        runtime::host_tasks::clear();
    }

    #[test]
    fn owner_and_host_maps_stay_consistent() {
        let manager = test_manager(None);
        install_factory(&manager, Rc::new(Cell::new(0)));

        block_on(manager.use_circuit("host.example", |_| async { Ok::<_, TorError>(()) }))
            .unwrap();

        let hosts = manager.host_circuits.borrow();
        let owners = manager.circuit_owners.borrow();
        for (host, circuit) in hosts.iter() {
            assert_eq!(owners.get(&circuit.id()), Some(host));
        }
        for (id, owner) in owners.iter() {
            assert_eq!(hosts.get(owner).map(|c| c.id()), Some(*id));
        }
        runtime::host_tasks::clear();
    }

    #[test]
    fn close_is_idempotent_and_rejects_requests() {
        let manager = test_manager(None);
        install_factory(&manager, Rc::new(Cell::new(0)));

        manager.close();
        manager.close();

        let result = block_on(
            manager.use_circuit("host.example", |_| async { Ok::<_, TorError>(()) }),
        );
        assert!(matches!(result, Err(TorError::Closed)));
        runtime::host_tasks::clear();
    }

    #[test]
    fn status_snapshot_reflects_binding() {
        let manager = test_manager(Some(600_000));
        install_factory(&manager, Rc::new(Cell::new(0)));

        block_on(manager.use_circuit("host.example", |_| async { Ok::<_, TorError>(()) }))
            .unwrap();

        let status = manager.circuit_status();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].host, "host.example");
        assert_eq!(status[0].ref_count, 1);
        assert!(status[0].expiry_ms.is_some());
        runtime::host_tasks::clear();
    }
}

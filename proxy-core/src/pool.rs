//! Backend Pool — the single source of truth for which models are
//! resident, owns admission/eviction and coalesces concurrent acquisitions
//! of the same not-yet-ready model onto one child startup.
//!
//! Mutex discipline: the map lock is only ever held across short,
//! synchronous bookkeeping; it is never held across a `.await` that spawns
//! a child, forwards a request, or waits on readiness. Everything that can
//! block does so after the lock has been dropped.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::{ModelRegistry, ResolveOutcome, ResolvedModel};
use crate::port_allocator::PortAllocator;
use crate::supervisor::{Backend, SpawnOpts};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Ready,
    Draining,
    Dead,
}

enum SlotOutcome {
    Ready(Arc<Backend>),
    Failed(String),
}

struct Slot {
    state: Mutex<Option<SlotOutcome>>,
    ready: Notify,
    started_at: Instant,
}

/// A point-in-time view of one pool entry, used by `/api/status`.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub model: String,
    pub port: u16,
    pub state: BackendState,
    pub in_flight: u32,
    pub last_used_ms: i64,
}

pub struct BackendPool {
    config: Arc<ProxyConfig>,
    registry: Arc<ModelRegistry>,
    port_allocator: Arc<PortAllocator>,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl BackendPool {
    pub fn new(
        config: Arc<ProxyConfig>,
        registry: Arc<ModelRegistry>,
        port_allocator: Arc<PortAllocator>,
    ) -> Self {
        Self {
            config,
            registry,
            port_allocator,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `query` and ensure a healthy backend is resident for it,
    /// admitting/evicting as needed. Concurrent callers resolving to the
    /// same canonical model coalesce onto a single child startup — `opts`
    /// is honored only by whichever caller actually admits the slot; a
    /// caller that joins an already-starting slot gets that slot's backend
    /// regardless of its own `opts`.
    pub async fn acquire(&self, query: &str, opts: &SpawnOpts) -> ProxyResult<Arc<Backend>> {
        let resolved = match self.registry.resolve(query) {
            ResolveOutcome::Exact(m) => m,
            ResolveOutcome::Ambiguous(candidates) => {
                return Err(ProxyError::ModelAmbiguous {
                    query: query.to_string(),
                    candidates,
                })
            }
            ResolveOutcome::NotFound(suggestions) => {
                return Err(ProxyError::ModelNotFound {
                    query: query.to_string(),
                    suggestions,
                })
            }
        };
        let canonical = resolved.id.canonical();

        let deadline = Instant::now() + self.config.admission_wait();
        loop {
            // Fast path: a slot already exists (starting or ready).
            let existing = {
                let slots = self.slots.lock().await;
                slots.get(&canonical).cloned()
            };
            if let Some(slot) = existing {
                return self.await_slot(&canonical, slot).await;
            }

            // Slow path: admit a new slot, evicting if the pool is full.
            match self.try_admit(&canonical, resolved.clone(), opts).await {
                Ok(backend) => return Ok(backend),
                Err(AdmitError::Busy) => {
                    if Instant::now() >= deadline {
                        return Err(ProxyError::PoolBusy {
                            retry_after: Duration::from_secs(5),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(AdmitError::Proxy(e)) => return Err(e),
            }
        }
    }

    async fn await_slot(&self, canonical: &str, slot: Arc<Slot>) -> ProxyResult<Arc<Backend>> {
        loop {
            {
                let guard = slot.state.lock().await;
                match &*guard {
                    Some(SlotOutcome::Ready(backend)) => return Ok(backend.clone()),
                    Some(SlotOutcome::Failed(detail)) => {
                        return Err(ProxyError::StartupFailure {
                            model: canonical.to_string(),
                            detail: detail.clone(),
                        })
                    }
                    None => {}
                }
            }
            slot.ready.notified().await;
        }
    }

    /// Try to insert a fresh `Starting` slot for `canonical`, evicting one
    /// idle backend if the pool is already at `max_models`. Spawns the
    /// backend and publishes the outcome to the slot's waiters.
    ///
    /// The map lock is held continuously from the existence re-check through
    /// the insert of `new_slot` — it is never dropped and re-acquired in
    /// between — so two concurrent callers can never both observe "no slot"
    /// and both insert competing slots for the same `canonical`.
    async fn try_admit(
        &self,
        canonical: &str,
        resolved: ResolvedModel,
        opts: &SpawnOpts,
    ) -> Result<Arc<Backend>, AdmitError> {
        let new_slot = Arc::new(Slot {
            state: Mutex::new(None),
            ready: Notify::new(),
            started_at: Instant::now(),
        });

        let evicted = {
            let mut slots = self.slots.lock().await;
            // Someone else may have inserted the slot between our fast-path
            // check and now; defer to them.
            if let Some(existing) = slots.get(canonical).cloned() {
                drop(slots);
                return self
                    .await_slot(canonical, existing)
                    .await
                    .map_err(AdmitError::Proxy);
            }

            let evicted = if slots.len() >= self.config.max_models {
                match self.pick_eviction_victim(&slots).await {
                    Some(victim_key) => {
                        let victim = slots.remove(&victim_key).expect("victim key came from this map");
                        Some((victim_key, victim))
                    }
                    None => return Err(AdmitError::Busy),
                }
            } else {
                None
            };

            slots.insert(canonical.to_string(), new_slot.clone());
            evicted
        };

        if let Some((victim_key, victim)) = evicted {
            self.evict(&victim_key, victim).await;
        }

        let port = match self.port_allocator.acquire() {
            Ok(p) => p,
            Err(e) => {
                self.publish_failure(canonical, &new_slot, e.to_string()).await;
                return Err(AdmitError::Proxy(e));
            }
        };

        match Backend::start(&self.config, resolved, port, opts).await {
            Ok(backend) => {
                let backend = Arc::new(backend);
                let mut guard = new_slot.state.lock().await;
                *guard = Some(SlotOutcome::Ready(backend.clone()));
                drop(guard);
                new_slot.ready.notify_waiters();
                info!(model = canonical, port, "backend admitted");
                Ok(backend)
            }
            Err(e) => {
                self.port_allocator.release(port);
                let mut slots = self.slots.lock().await;
                slots.remove(canonical);
                drop(slots);
                self.publish_failure(canonical, &new_slot, e.to_string()).await;
                Err(AdmitError::Proxy(e))
            }
        }
    }

    async fn publish_failure(&self, _canonical: &str, slot: &Arc<Slot>, detail: String) {
        let mut guard = slot.state.lock().await;
        *guard = Some(SlotOutcome::Failed(detail));
        drop(guard);
        slot.ready.notify_waiters();
    }

    /// Oldest last-used among currently idle (`in_flight == 0`) ready
    /// backends; ties broken by higher port number. Starting slots are
    /// never eviction candidates.
    async fn pick_eviction_victim(&self, slots: &HashMap<String, Arc<Slot>>) -> Option<String> {
        let mut best: Option<(String, i64, u16)> = None;
        for (key, slot) in slots.iter() {
            let guard = slot.state.lock().await;
            if let Some(SlotOutcome::Ready(backend)) = &*guard {
                if backend.in_flight() > 0 {
                    continue;
                }
                let last_used = backend.last_used_ms();
                let port = backend.port;
                let replace = match &best {
                    None => true,
                    Some((_, best_last_used, best_port)) => {
                        last_used < *best_last_used
                            || (last_used == *best_last_used && port > *best_port)
                    }
                };
                if replace {
                    best = Some((key.clone(), last_used, port));
                }
            }
        }
        best.map(|(key, _, _)| key)
    }

    async fn evict(&self, canonical: &str, slot: Arc<Slot>) {
        let guard = slot.state.lock().await;
        if let Some(SlotOutcome::Ready(backend)) = &*guard {
            let backend = backend.clone();
            drop(guard);
            if let Err(e) = backend.stop(self.config.stop_grace(), false).await {
                warn!(model = canonical, "eviction stop failed: {e}");
            }
            self.port_allocator.release(backend.port);
            info!(model = canonical, "evicted idle backend for admission");
        }
    }

    /// Stop one resident model by canonical id or query string. Refuses
    /// while in-flight requests exist unless `force` is set.
    pub async fn stop(&self, query: &str, force: bool) -> ProxyResult<()> {
        let resolved = match self.registry.resolve(query) {
            ResolveOutcome::Exact(m) => m,
            ResolveOutcome::Ambiguous(candidates) => {
                return Err(ProxyError::ModelAmbiguous {
                    query: query.to_string(),
                    candidates,
                })
            }
            ResolveOutcome::NotFound(_) => {
                return Err(ProxyError::NotResident {
                    model: query.to_string(),
                })
            }
        };
        let canonical = resolved.id.canonical();

        let slot = {
            let mut slots = self.slots.lock().await;
            slots.remove(&canonical)
        };
        let Some(slot) = slot else {
            return Err(ProxyError::NotResident { model: canonical });
        };

        let guard = slot.state.lock().await;
        if let Some(SlotOutcome::Ready(backend)) = &*guard {
            let backend = backend.clone();
            drop(guard);
            backend.stop(self.config.stop_grace(), force).await?;
            self.port_allocator.release(backend.port);
        }
        Ok(())
    }

    /// Stop every resident backend, used during graceful shutdown.
    pub async fn stop_all(&self) {
        let keys: Vec<String> = {
            let slots = self.slots.lock().await;
            slots.keys().cloned().collect()
        };
        for key in keys {
            if let Err(e) = self.stop(&key, true).await {
                warn!(model = key, "stop_all: failed to stop backend: {e}");
            }
        }
    }

    /// Point-in-time view of every resident (or starting) backend.
    pub async fn snapshot(&self) -> Vec<PoolSnapshot> {
        let slots = self.slots.lock().await;
        let mut out = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter() {
            let guard = slot.state.lock().await;
            match &*guard {
                Some(SlotOutcome::Ready(backend)) => out.push(PoolSnapshot {
                    model: key.clone(),
                    port: backend.port,
                    state: BackendState::Ready,
                    in_flight: backend.in_flight(),
                    last_used_ms: backend.last_used_ms(),
                }),
                Some(SlotOutcome::Failed(_)) => out.push(PoolSnapshot {
                    model: key.clone(),
                    port: 0,
                    state: BackendState::Dead,
                    in_flight: 0,
                    last_used_ms: 0,
                }),
                None => out.push(PoolSnapshot {
                    model: key.clone(),
                    port: 0,
                    state: BackendState::Starting,
                    in_flight: 0,
                    last_used_ms: slot.started_at.elapsed().as_millis() as i64,
                }),
            }
        }
        out
    }

    /// Evict every idle backend that has been unused for at least
    /// `idle_timeout`. Driven by the idle reaper background task.
    pub async fn reap_idle(&self, idle_timeout: Duration) {
        let now_ms = now_epoch_ms();
        let idle_ms = idle_timeout.as_millis() as i64;

        let candidates: Vec<(String, Arc<Slot>)> = {
            let slots = self.slots.lock().await;
            slots.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        for (key, slot) in candidates {
            let guard = slot.state.lock().await;
            let should_evict = match &*guard {
                Some(SlotOutcome::Ready(backend)) => {
                    backend.in_flight() == 0 && now_ms - backend.last_used_ms() >= idle_ms
                }
                _ => false,
            };
            drop(guard);
            if should_evict {
                info!(model = key, "idle reaper evicting backend");
                if let Err(e) = self.stop(&key, false).await {
                    warn!(model = key, "idle reaper: stop failed: {e}");
                }
            }
        }
    }
}

enum AdmitError {
    Busy,
    Proxy(ProxyError),
}

fn now_epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

//! Lifecycle of the chain-bound FHE instance.
//!
//! ```text
//! Idle    --(enabled, provider and chain present)--> Loading
//! Loading --(created)--> Ready
//! Loading --(failed)---> Error
//! any     --(chain or provider changed)--> Idle, then Loading again when possible
//! ```
//!
//! The instance is a cache keyed by (chain id, read-only provider). A creation
//! that resolves after its key was replaced is dropped without any state
//! change.

use log::{debug, error, info};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::error::FheError;
use crate::fhe::{FheBackend, FheInstance, NetworkTable};
use crate::wallet::WalletSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FheStatus {
    Idle,
    Loading,
    Ready,
    Error,
}

impl fmt::Display for FheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            FheStatus::Idle => "idle",
            FheStatus::Loading => "loading",
            FheStatus::Ready => "ready",
            FheStatus::Error => "error",
        };
        write!(f, "{status}")
    }
}

/// What the instance should be built for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FheInputs {
    pub provider: Option<String>,
    pub chain_id: Option<u64>,
    pub enabled: bool,
}

impl FheInputs {
    pub fn from_session(session: Option<&WalletSession>, enabled: bool) -> Self {
        match session {
            Some(session) => Self {
                provider: session.readonly_provider.clone(),
                chain_id: Some(session.chain_id),
                enabled,
            },
            None => Self {
                provider: None,
                chain_id: None,
                enabled,
            },
        }
    }

    fn can_start(&self) -> bool {
        self.enabled && self.provider.is_some() && self.chain_id.is_some()
    }

    fn same_key(&self, other: &FheInputs) -> bool {
        self.chain_id == other.chain_id && self.provider == other.provider
    }
}

/// Published instance state. `generation` identifies the key the state was
/// produced for and changes on every invalidation.
#[derive(Clone)]
pub struct FheState {
    pub status: FheStatus,
    pub instance: Option<Arc<dyn FheInstance>>,
    pub error: Option<String>,
    pub chain_id: Option<u64>,
    pub generation: u64,
}

impl FheState {
    fn idle(generation: u64) -> Self {
        Self {
            status: FheStatus::Idle,
            instance: None,
            error: None,
            chain_id: None,
            generation,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == FheStatus::Ready && self.instance.is_some()
    }
}

impl fmt::Debug for FheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FheState")
            .field("status", &self.status)
            .field("instance", &self.instance.as_ref().map(|_| "OK"))
            .field("error", &self.error)
            .field("chain_id", &self.chain_id)
            .field("generation", &self.generation)
            .finish()
    }
}

struct Control {
    inputs: FheInputs,
    generation: u64,
}

pub struct FheInstanceManager {
    backend: Arc<dyn FheBackend>,
    networks: NetworkTable,
    control: Mutex<Control>,
    state: watch::Sender<FheState>,
}

impl FheInstanceManager {
    pub fn new(backend: Arc<dyn FheBackend>, networks: NetworkTable) -> Arc<Self> {
        let (state, _) = watch::channel(FheState::idle(0));
        Arc::new(Self {
            backend,
            networks,
            control: Mutex::new(Control {
                inputs: FheInputs::default(),
                generation: 0,
            }),
            state,
        })
    }

    /// Apply new inputs and return the resulting state. Creation, if started,
    /// continues in the background.
    pub fn update(self: &Arc<Self>, inputs: FheInputs) -> FheState {
        let mut control = self.control.lock();
        let invalidate = !control.inputs.same_key(&inputs) || (control.inputs.enabled && !inputs.enabled);
        if invalidate {
            control.generation += 1;
            info!(
                "[update] FHE instance invalidated (chain {:?} -> {:?})",
                control.inputs.chain_id, inputs.chain_id
            );
            self.state.send_replace(FheState::idle(control.generation));
        }
        control.inputs = inputs;

        let idle = self.state.borrow().status == FheStatus::Idle;
        if idle && control.inputs.can_start() {
            self.start_loading(&control);
        }
        self.current()
    }

    /// Restart creation after a failure. No-op in any other status.
    pub fn retry(self: &Arc<Self>) -> FheState {
        let mut control = self.control.lock();
        let failed = self.state.borrow().status == FheStatus::Error;
        if failed {
            control.generation += 1;
            info!("[retry] Retrying FHE instance creation");
            self.state.send_replace(FheState::idle(control.generation));
            if control.inputs.can_start() {
                self.start_loading(&control);
            }
        }
        self.current()
    }

    pub fn current(&self) -> FheState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FheState> {
        self.state.subscribe()
    }

    /// True if the instance published under `generation` is still the live,
    /// ready one.
    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.state.borrow();
        state.generation == generation && state.is_ready()
    }

    /// Follow the wallet session: every session change becomes an `update`.
    pub fn bind(
        self: &Arc<Self>,
        mut sessions: watch::Receiver<Option<WalletSession>>,
        enabled: bool,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let inputs = FheInputs::from_session(sessions.borrow_and_update().as_ref(), enabled);
                manager.update(inputs);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = sessions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("FHE instance manager unbound from wallet session");
        })
    }

    fn start_loading(self: &Arc<Self>, control: &Control) {
        let Some(chain_id) = control.inputs.chain_id else {
            return;
        };
        let generation = control.generation;
        let provider = control.inputs.provider.clone();
        info!("[start_loading] Creating FHE instance for chain {chain_id}");
        self.state.send_replace(FheState {
            status: FheStatus::Loading,
            instance: None,
            error: None,
            chain_id: Some(chain_id),
            generation,
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let result = match manager.networks.resolve(chain_id, provider.as_deref()) {
                Ok(config) => manager.backend.create_instance(config).await,
                Err(e) => Err(e),
            };
            manager.commit(generation, chain_id, result);
        });
    }

    fn commit(
        &self,
        generation: u64,
        chain_id: u64,
        result: Result<Arc<dyn FheInstance>, FheError>,
    ) {
        let control = self.control.lock();
        if control.generation != generation || control.inputs.chain_id != Some(chain_id) {
            debug!("Discarding FHE instance created for chain {chain_id}: context changed");
            return;
        }

        let next = match result {
            Ok(instance) if instance.chain_id() == chain_id => {
                info!("FHE instance ready for chain {chain_id}");
                FheState {
                    status: FheStatus::Ready,
                    instance: Some(instance),
                    error: None,
                    chain_id: Some(chain_id),
                    generation,
                }
            }
            Ok(instance) => failed(
                generation,
                chain_id,
                format!(
                    "instance bound to chain {} instead of {chain_id}",
                    instance.chain_id()
                ),
            ),
            Err(e) => failed(generation, chain_id, e.to_string()),
        };
        self.state.send_replace(next);
    }
}

fn failed(generation: u64, chain_id: u64, reason: String) -> FheState {
    error!("FHE instance creation failed for chain {chain_id}: {reason}");
    FheState {
        status: FheStatus::Error,
        instance: None,
        error: Some(reason),
        chain_id: Some(chain_id),
        generation,
    }
}

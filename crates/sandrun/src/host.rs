//! # Isolated execution host
//!
//! Owns one isolated context: its channel registry, the installed managers,
//! and the currently loaded guest.
//!
//! ## Loading
//!
//! Every load starts from a clean slate. `reset` is broadcast on every
//! channel, then fresh managers are installed; registering their channels
//! closes the previous load's channels, which abandons any call still
//! waiting on them. Only then is the new guest compiled, checked,
//! instantiated and its `main` awaited.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wasmtime::Linker;
use wasmtime::Module;

use sandrpc::ChannelRegistry;
use sandrpc::Link;
use sandrpc::RESET_EVENT;
use sandrpc::Transport;
use sandrpc::lock;

use crate::context::SandboxCtx;
use crate::guest::GuestCall;
use crate::guest::GuestInstance;
use crate::guest::GuestQueue;
use crate::guest::GuestSlot;
use crate::guest::spawn_runner;
use crate::injector;
use crate::injector::IMPORT_MODULE;
use crate::injector::IMPORTS;
use crate::injector::INJECTOR;
use crate::injector::Injector;
use crate::runtime::Runtime;

/// Export the guest must provide, called with the injector on load.
pub const ENTRY_POINT: &str = "main";

/// Import namespaces exposing ambient authority. Guests importing from them are rejected.
pub const DENIED_IMPORT_MODULES: &[&str] = &["wasi_snapshot_preview1", "wasi_unstable", "wasi", "env"];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Ready,
}

#[derive(Debug)]
pub enum LoadError {
    /// A load is already in progress on this host.
    ConcurrentLoad,
    Compile(wasmtime::Error),
    /// The guest imports from an ambient namespace.
    DeniedImport { module: String, name: String },
    /// The guest imports something the sandbox does not provide.
    UnknownImport { module: String, name: String },
    Instantiate(wasmtime::Error),
    MissingEntryPoint,
    /// The entry point trapped or ran out of fuel.
    EntryPoint(wasmtime::Error),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConcurrentLoad => write!(f, "A load is already in progress"),
            Self::Compile(e) => write!(f, "Compile error: {}", e),
            Self::DeniedImport { module, name } => {
                write!(f, "Denied import '{}::{}'", module, name)
            }
            Self::UnknownImport { module, name } => {
                write!(f, "Unknown import '{}::{}'", module, name)
            }
            Self::Instantiate(e) => write!(f, "Instantiation error: {}", e),
            Self::MissingEntryPoint => write!(f, "Guest does not export '{}'", ENTRY_POINT),
            Self::EntryPoint(e) => write!(f, "Entry point failed: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}

/// Flips the host to `Loading` for its lifetime. Unless committed, the host
/// falls back to `Unloaded` when the guard drops.
struct LoadGuard<'a> {
    state: &'a Mutex<LoadState>,
    outcome: LoadState,
}

impl<'a> LoadGuard<'a> {
    fn begin(state: &'a Mutex<LoadState>) -> Result<Self, LoadError> {
        let mut current = lock(state);
        if *current == LoadState::Loading {
            return Err(LoadError::ConcurrentLoad);
        }
        *current = LoadState::Loading;
        Ok(Self {
            state,
            outcome: LoadState::Unloaded,
        })
    }

    fn commit(mut self) {
        self.outcome = LoadState::Ready;
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        *lock(self.state) = self.outcome;
    }
}

pub struct IsolatedExecutionHost {
    runtime: Runtime,
    registry: ChannelRegistry,
    state: Mutex<LoadState>,
    generation: AtomicU64,
    injector: Mutex<Option<Injector>>,
    guest: GuestSlot,
    calls: mpsc::UnboundedSender<GuestCall>,
    runner: JoinHandle<()>,
    link: Option<Link>,
}

impl IsolatedExecutionHost {
    /// Creates an unlinked host. Must be called from within a tokio runtime.
    pub fn new(runtime: Runtime) -> Self {
        let registry = ChannelRegistry::new();
        let guest: GuestSlot = Arc::new(tokio::sync::Mutex::new(None));
        let (calls, rx) = mpsc::unbounded_channel();
        let runner = spawn_runner(guest.clone(), rx, runtime.config().budget.fuel);

        Self {
            runtime,
            registry,
            state: Mutex::new(LoadState::Unloaded),
            generation: AtomicU64::new(0),
            injector: Mutex::new(None),
            guest,
            calls,
            runner,
            link: None,
        }
    }

    /// Creates a host whose channels are linked to the other side of `transport`.
    pub fn spawn(runtime: Runtime, transport: Arc<dyn Transport>) -> Self {
        let mut host = Self::new(runtime);
        host.link = Some(Link::spawn("isolated", transport, host.registry.clone()));
        host
    }

    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    pub fn state(&self) -> LoadState {
        *lock(&self.state)
    }

    /// Injector of the latest load, or `None` before the first one.
    pub fn injector(&self) -> Option<Injector> {
        lock(&self.injector).clone()
    }

    /// Number of loads started so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Generation of the instantiated guest, or `None` when no guest is live.
    /// Waits for a running guest callback to finish.
    pub async fn live_generation(&self) -> Option<u64> {
        self.guest.lock().await.as_ref().map(|guest| guest.generation)
    }

    /// Loads a guest module, given as WebAssembly text or binary, and runs its
    /// entry point to completion.
    pub async fn load(&self, source: impl AsRef<[u8]>) -> Result<(), LoadError> {
        let loading = LoadGuard::begin(&self.state)?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(generation, "load started");

        self.registry.broadcast(RESET_EVENT, Value::Null);
        let injector = Injector::install(
            &self.registry,
            Some(GuestQueue::new(generation, self.calls.clone())),
        );
        *lock(&self.injector) = Some(injector.clone());

        // waits for a running callback of the previous guest, then drops it
        let mut slot = self.guest.lock().await;
        *slot = None;

        let engine = self.runtime.engine();
        let module = Module::new(engine, source.as_ref()).map_err(LoadError::Compile)?;
        check_imports(&module)?;

        let mut linker = Linker::new(engine);
        injector::link(&mut linker).map_err(LoadError::Instantiate)?;

        let config = self.runtime.config();
        let mut store = wasmtime::Store::new(
            engine,
            SandboxCtx::new(injector, &config.budget, config.call_timeout),
        );
        store.limiter(|ctx| &mut ctx.limits);
        store.set_fuel(config.budget.fuel).map_err(LoadError::Instantiate)?;

        let instance = linker
            .instantiate_async(&mut store, &module)
            .await
            .map_err(LoadError::Instantiate)?;
        let main = instance
            .get_typed_func::<i32, ()>(&mut store, ENTRY_POINT)
            .map_err(|_| LoadError::MissingEntryPoint)?;
        main.call_async(&mut store, INJECTOR)
            .await
            .map_err(LoadError::EntryPoint)?;

        *slot = Some(GuestInstance {
            generation,
            store,
            instance,
        });
        loading.commit();
        tracing::info!(generation, "load finished");
        Ok(())
    }
}

impl Drop for IsolatedExecutionHost {
    fn drop(&mut self) {
        self.runner.abort();
    }
}

fn check_imports(module: &Module) -> Result<(), LoadError> {
    for import in module.imports() {
        let module_name = import.module();
        let name = import.name();

        if DENIED_IMPORT_MODULES.iter().any(|denied| *denied == module_name) {
            tracing::warn!(module = module_name, name, "denied import");
            return Err(LoadError::DeniedImport {
                module: module_name.to_string(),
                name: name.to_string(),
            });
        }

        if module_name != IMPORT_MODULE || !IMPORTS.iter().any(|known| *known == name) {
            return Err(LoadError::UnknownImport {
                module: module_name.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

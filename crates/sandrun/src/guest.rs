//! Guest instance and the runner task executing guest callbacks.
//!
//! Callbacks registered by the guest are not run inline: the event manager
//! queues a [`GuestCall`] and the runner executes it once it holds the guest.
//! The guest lock is held for the whole entry-point run, so callbacks fired
//! during `main` run after it returns.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wasmtime::Instance;
use wasmtime::Store;

use crate::context::SandboxCtx;
use crate::managers::EventCallback;
use crate::managers::Interaction;

/// A queued call to a guest export, tagged with the load that registered it.
#[derive(Debug, Clone)]
pub struct GuestCall {
    pub generation: u64,
    pub export: String,
    pub interaction: Interaction,
}

/// Sender half of the runner queue for one load generation.
#[derive(Clone)]
pub struct GuestQueue {
    generation: u64,
    tx: mpsc::UnboundedSender<GuestCall>,
}

impl GuestQueue {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<GuestCall>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Event callback queuing a call to `export`.
    pub fn callback(&self, export: impl Into<String>) -> EventCallback {
        let queue = self.clone();
        let export = export.into();
        Arc::new(move |interaction| {
            let call = GuestCall {
                generation: queue.generation,
                export: export.clone(),
                interaction: interaction.clone(),
            };
            if queue.tx.send(call).is_err() {
                tracing::debug!(export = %export, "runner gone, guest call dropped");
            }
        })
    }
}

pub(crate) struct GuestInstance {
    pub generation: u64,
    pub store: Store<SandboxCtx>,
    pub instance: Instance,
}

impl GuestInstance {
    /// Runs the `() -> ()` export `name` with a fresh fuel grant.
    pub async fn invoke(&mut self, name: &str, fuel: u64) -> wasmtime::Result<()> {
        self.store.set_fuel(fuel)?;
        let func = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, name)?;
        func.call_async(&mut self.store, ()).await
    }
}

pub(crate) type GuestSlot = Arc<Mutex<Option<GuestInstance>>>;

pub(crate) fn spawn_runner(
    slot: GuestSlot,
    mut calls: mpsc::UnboundedReceiver<GuestCall>,
    fuel: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(call) = calls.recv().await {
            let mut guard = slot.lock().await;
            let Some(guest) = guard.as_mut() else {
                tracing::debug!(export = %call.export, "no guest loaded, call dropped");
                continue;
            };

            if guest.generation != call.generation {
                tracing::debug!(
                    export = %call.export,
                    queued = call.generation,
                    current = guest.generation,
                    "stale guest call discarded"
                );
                continue;
            }

            if let Err(e) = guest.invoke(&call.export, fuel).await {
                tracing::warn!(export = %call.export, error = %e, "guest callback failed");
            }
        }
    })
}

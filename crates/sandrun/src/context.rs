//! Per-store state handed to the guest's host functions.

use std::time::Duration;

use wasmtime::StoreLimits;
use wasmtime::StoreLimitsBuilder;

use sandrpc::ActionDispatcher;
use sandrpc::Manager;

use crate::injector::Injector;
use crate::runtime::Budget;

pub struct SandboxCtx {
    injector: Injector,
    pub(crate) limits: StoreLimits,
    call_timeout: Duration,
}

impl SandboxCtx {
    pub fn new(injector: Injector, budget: &Budget, call_timeout: Duration) -> Self {
        let memory = usize::try_from(budget.memory_bytes).unwrap_or(usize::MAX);
        Self {
            injector,
            limits: StoreLimitsBuilder::new().memory_size(memory).build(),
            call_timeout,
        }
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Dispatcher behind a guest handle, if the handle is valid.
    pub fn dispatcher(&self, handle: i32) -> Option<ActionDispatcher<dyn Manager>> {
        let index = usize::try_from(handle).ok()?;
        self.injector.by_index(index)
    }
}

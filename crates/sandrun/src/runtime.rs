//! # Runtime
//!
//! Owns the wasmtime [`Engine`] shared by every isolated context, and the
//! configuration each context is created with.

use std::time::Duration;

use wasmtime::Engine;

#[derive(Debug)]
pub enum Error {
    Engine(wasmtime::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "Engine error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Resource budget for one guest store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Budget {
    /// Fuel granted to each entry-point run and each guest callback.
    pub fuel: u64,
    /// Upper bound for the guest's linear memory.
    pub memory_bytes: u64,
}

impl Budget {
    pub fn standard() -> Self {
        Self {
            fuel: 1_000_000_000,
            memory_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Default for Budget {
    fn default() -> Self {
        Self::standard()
    }
}

/// Configuration applied to every isolated context.
#[derive(Clone, Debug)]
pub struct SandboxConfig {
    pub budget: Budget,
    /// How long a guest waits on one remote call before it resolves as timed out.
    pub call_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            budget: Budget::standard(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared engine plus per-context configuration. Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    engine: Engine,
    config: SandboxConfig,
}

impl Runtime {
    /// Creates a runtime with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(SandboxConfig::default())
    }

    pub fn with_config(config: SandboxConfig) -> Result<Self> {
        let mut engine_config = wasmtime::Config::new();
        engine_config.async_support(true);
        engine_config.consume_fuel(true);

        let engine = Engine::new(&engine_config).map_err(Error::Engine)?;
        Ok(Self { engine, config })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

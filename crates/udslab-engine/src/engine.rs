//! The diagnostic service engine
//!
//! One `DiagnosticEngine` models one simulated device: it owns the ECU state,
//! the memory region and the dynamic identifier registry, and routes incoming
//! frames through a handler table keyed by service id. All of a request is
//! served under one lock, so read-modify-write sequences (attempt counters,
//! seed issuance) never interleave across connections.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use udslab_proto::{NegativeResponseCode, ServiceRequest, ServiceResponse};

use crate::builtin::BuiltinRecord;
use crate::dynamic::DynamicIdRegistry;
use crate::handlers;
use crate::memory::{MemoryRegion, ProtectedRange};
use crate::security::{EcuState, SecurityPolicy, UnlockStrategy, XorUnlock};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("memory seed at {offset:#06x} ({len} bytes) exceeds capacity {capacity:#06x}")]
    SeedOutOfBounds {
        offset: u64,
        len: usize,
        capacity: usize,
    },
}

/// Initial memory contents, applied before the engine serves anything
#[derive(Debug, Clone)]
pub struct MemorySeed {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Construction-time engine configuration
pub struct EngineConfig {
    pub memory_capacity: usize,
    pub memory_seeds: Vec<MemorySeed>,
    pub read_protected: Vec<ProtectedRange>,
    pub write_protected: Vec<ProtectedRange>,
    pub policy: SecurityPolicy,
    pub strategy: Arc<dyn UnlockStrategy>,
    pub builtins: Vec<BuiltinRecord>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 0x100,
            memory_seeds: Vec::new(),
            read_protected: Vec::new(),
            write_protected: Vec::new(),
            policy: SecurityPolicy::default(),
            strategy: Arc::new(XorUnlock),
            builtins: Vec::new(),
        }
    }
}

/// Everything a service handler may consult or mutate
pub struct EngineInner {
    pub state: EcuState,
    pub memory: MemoryRegion,
    pub dynamic: DynamicIdRegistry,
    pub policy: SecurityPolicy,
    pub strategy: Arc<dyn UnlockStrategy>,
    pub builtins: Vec<BuiltinRecord>,
}

/// A service handler: payload in, complete response out
pub type ServiceHandler = Arc<dyn Fn(&mut EngineInner, &[u8]) -> ServiceResponse + Send + Sync>;

/// One simulated diagnostic device
pub struct DiagnosticEngine {
    inner: Mutex<EngineInner>,
    handlers: HashMap<u8, ServiceHandler>,
}

impl DiagnosticEngine {
    /// Build an engine from its configuration with the default service set.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let mut memory = MemoryRegion::new(config.memory_capacity);
        for seed in &config.memory_seeds {
            memory
                .seed(seed.offset, &seed.data)
                .map_err(|_| EngineError::SeedOutOfBounds {
                    offset: seed.offset,
                    len: seed.data.len(),
                    capacity: config.memory_capacity,
                })?;
        }
        for range in config.read_protected {
            memory.protect_read(range);
        }
        for range in config.write_protected {
            memory.protect_write(range);
        }

        Ok(Self {
            inner: Mutex::new(EngineInner {
                state: EcuState::new(),
                memory,
                dynamic: DynamicIdRegistry::new(),
                policy: config.policy,
                strategy: config.strategy,
                builtins: config.builtins,
            }),
            handlers: handlers::default_handlers(),
        })
    }

    /// Replace or add the handler for a service id.
    ///
    /// This is how device definitions deviate from the default semantics
    /// without a type hierarchy: a capability is a value in the table.
    pub fn override_handler(&mut self, sid: u8, handler: ServiceHandler) {
        self.handlers.insert(sid, handler);
    }

    /// Dispatch one request. Total: any byte sequence in, a well-formed
    /// response out. The whole dispatch runs under the engine lock.
    pub fn handle_request(&self, request: &ServiceRequest) -> ServiceResponse {
        let Some(handler) = self.handlers.get(&request.sid) else {
            debug!(sid = format!("0x{:02X}", request.sid), "Unsupported service");
            return ServiceResponse::negative(
                request.sid,
                NegativeResponseCode::ServiceNotSupported,
            );
        };

        let mut inner = self.inner.lock();
        let response = (handler.as_ref())(&mut inner, &request.payload);
        debug!(
            sid = format!("0x{:02X}", request.sid),
            positive = response.is_positive(),
            "Handled request"
        );
        response
    }
}

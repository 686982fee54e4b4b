//! udslab-node - Instance node
//!
//! Wraps one [`udslab_engine::DiagnosticEngine`] behind the hex/JSON HTTP
//! frame transport, serves it on a unix socket or TCP listener, and
//! announces the instance to the external registry at startup.

mod error;
mod instance;
mod registry;
mod wire;

pub use error::NodeError;
pub use instance::{
    router, BoundInstance, Instance, InstanceConfig, InstanceInfo, ListenerConfig,
};
pub use registry::{register_instance, InstanceRecord};
pub use wire::{FrameError, UdsHttpFrame};

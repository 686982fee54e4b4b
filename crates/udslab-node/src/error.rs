//! Node-level errors
//!
//! Unlike the engine, which answers every input with a protocol response,
//! the node has genuinely fatal failures: a listener it cannot bind or a
//! registry that refuses it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("instance config field `{field}` can not be empty")]
    EmptyField { field: &'static str },

    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("registry registration failed: {0}")]
    Registration(String),

    #[error("registry returned a non-success status code {status}")]
    RegistrationRejected { status: u16 },

    #[error("serve error: {0}")]
    Serve(#[from] std::io::Error),
}

//! Error kinds per spec §7's propagation policy: configuration errors
//! are fatal at startup; transport errors end the affected task (and
//! the session if they hit the command stream or mux session);
//! protocol errors drop the connection; operator errors are strings
//! returned to the CLI/API with no side effects; resource errors abort
//! a single command without killing the session.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] gomet_protocol::ProtocolError),

    #[error("{0}")]
    Operator(String),

    #[error("resource error: {0}")]
    Resource(#[from] std::io::Error),

    #[error("invalid session id")]
    InvalidSessionId,

    #[error("invalid IP or range")]
    InvalidCidr,

    #[error("invalid route")]
    InvalidRoute,
}

pub type Result<T> = std::result::Result<T, Error>;

//! Wire-level types shared between the session layer and the listener.
//!
//! The command stream is plain LF-terminated text: a one-line numeric
//! header, optionally followed by one argument line. Nothing here
//! understands stream multiplexing or TLS — it only knows how to read
//! and write the bytes that ride on top of those streams.

mod header;
mod httpline;
mod sysinfo;

pub use header::{CommandCode, CommandHeader};
pub use httpline::{HttpRequestLine, RequestKind};
pub use sysinfo::SystemInfo;

/// Errors raised while parsing protocol-level text.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed system info line: {0:?}")]
    MalformedSystemInfo(String),
    #[error("unknown command code: {0}")]
    UnknownCommandCode(u32),
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),
    #[error("argument line missing for command {0:?}")]
    MissingArgument(CommandCode),
}

use thiserror::Error;

/// Errors surfaced by the monitor library.
///
/// Store I/O failures are returned to the immediate caller; per-message
/// parse failures stay local to the batch loop that produced them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] etcd_client::Error),

    #[error("malformed key path: {0}")]
    KeyPath(String),

    #[error("malformed {field} field: {value}")]
    Field { field: &'static str, value: String },

    #[error("unknown opcode: {0}")]
    Opcode(String),

    #[error("truncated command: {0}")]
    Truncated(String),

    #[error("invalid mac address: {0}")]
    Mac(String),

    #[error("logical port {0} is not bound to any chassis")]
    UnboundPort(String),

    #[error("key prefix must end with '/': {0}")]
    Prefix(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

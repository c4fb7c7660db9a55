use bp7_core::BpError;
use thiserror::Error;

/// Errors surfaced by node assembly and the routing table.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("service address already attached")]
    InUse,
    #[error("no route to destination node {0}")]
    NoRoute(u64),
    #[error(transparent)]
    Core(#[from] BpError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;

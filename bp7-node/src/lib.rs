//! # bp7-node
//!
//! Assembly of a runnable BP7 node around `bp7-core`: a static routing table
//! with application attach/detach, a UDP convergence-layer adapter, memory-
//! and file-backed offload stores, and the forwarding pass that moves
//! references between interface flows.

pub mod cla;
pub mod error;
pub mod node;
pub mod offload;
pub mod route;

pub use cla::{UdpCla, UdpClaConfig};
pub use error::NodeError;
pub use node::{Node, NodeConfig, SendOptions};
pub use offload::{FileOffload, MemoryOffload};
pub use route::{RouteEntry, RouteTable};

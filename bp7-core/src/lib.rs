//! # bp7-core
//!
//! Core of a Delay/Disruption-Tolerant Networking Bundle Protocol version 7
//! (RFC 9171) node: a pre-allocated block pool every runtime object is carved
//! from, a CBOR codec with per-block CRC integrity, and a storage/custody
//! cache that drives a per-bundle state machine and deferred-ack custody
//! signals (DACS).
//!
//! ## Architecture
//!
//! - **Pool**: fixed-count tagged blocks, reference counting, FIFO sub-queues
//!   with push/pull counters, a red-black tree for secondary indices, and a
//!   job list that drives the main loop.
//! - **Codec**: RFC 9171 primary and canonical block encode/decode with
//!   CRC-16/X.25 and CRC-32/Castagnoli, wrapped in a CBOR indefinite-length
//!   array on the wire.
//! - **Cache**: per-service custody storage with a four-state FSM per bundle
//!   (idle / queue / delete / generate-dacs), time/destination/bundle-id
//!   indices, DACS aggregation, and an offload delegate for bulk bytes.

pub mod cache;
pub mod codec;
pub mod error;
pub mod events;
pub mod pool;
pub mod time;

pub use cache::{CacheState, EntryState};
pub use codec::crc::CrcType;
pub use codec::types::{
    BundleControlFlags, CreationTimestamp, DeliveryPolicy, EndpointId, IpnAddress,
};
pub use error::{BpError, BpResult};
pub use pool::{BlockId, IntfId, Pool, PoolConfig, SharedPool};
pub use time::{ManualMonotonic, MonotonicSource, MonotonicTime, SystemMonotonic, TimeKeeper};

//! # carbon-network
//! The CarbonChain P2P layer: length-framed wire protocol, peer handshake
//! and liveness state machine, headers-first synchronization, and the tokio
//! connection service.

pub mod frame;
pub mod message;
pub mod peer;
pub mod service;
pub mod sync;

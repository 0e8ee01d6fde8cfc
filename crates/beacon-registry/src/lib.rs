//! Client and channel registry for the beacon pub/sub server.
//!
//! One [`Registry`] owns every connected [`Client`] and every channel's
//! subscriber set. All mutations go through its methods, so a multi-threaded
//! caller can guard the whole surface with a single lock or actor.

pub mod client;
pub mod error;
pub mod registry;

pub use client::{Client, ClientCounters, ClientId, FrameBytes, Transport, TransportError};
pub use error::{RegistryError, RegistryResult};
pub use registry::{PublishReport, Registry};

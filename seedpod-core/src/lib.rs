//! SeedPod download synchronization engine.
//! Host-provided transport, storage and peer list; the engine decides which segments to fetch
//! from which peer, verifies them, and serves what it holds.

pub mod attempt;
pub mod bitmap;
pub mod clock;
pub mod config;
pub mod context;
pub mod contracts;
pub mod coordinator;
pub mod engine;
pub mod integrity;
pub mod package;
pub mod peer;
pub mod registry;
pub mod slots;
pub mod state;
pub mod status;
pub mod upload;
pub mod wake;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use context::StatsSnapshot;
pub use contracts::{
    BoxFuture, KnownPeer, PackageStatus, PeerRegistry, SegmentStream, Storage, StorageError,
    Transport, TransportFault, VerifiedWriter,
};
pub use engine::{EngineError, PackageProgress, SyncEngine};
pub use package::{PackageId, PackageSplitInfo, DEFAULT_SEGMENT_LENGTH};
pub use peer::{PeerId, PeerInfo};
pub use registry::RegistryError;
pub use upload::{SegmentServer, ServeError};

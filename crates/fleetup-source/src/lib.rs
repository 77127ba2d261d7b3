//! fleetup-source — where releases come from.
//!
//! [`VersionSource`] answers "what is the current release for this tier?".
//! "No release" is a normal answer, not an error.
//!
//! # Implementations
//!
//! - **`rpc`** — `eth_call` against the version authority contract
//! - **`fixed`** — an in-process release, for tests and pinned deployments

use async_trait::async_trait;

use fleetup_core::{NodeTier, ReleaseInfo};

pub mod abi;
pub mod error;
pub mod fixed;
pub mod rpc;

pub use error::{SourceError, SourceResult};
pub use fixed::FixedSource;
pub use rpc::RpcVersionSource;

/// Read access to published releases.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// The currently published, active release for `tier`, if any.
    async fn current_release(&self, tier: NodeTier) -> SourceResult<Option<ReleaseInfo>>;

    /// Whether the source is reachable at all.
    async fn test_connection(&self) -> bool;
}

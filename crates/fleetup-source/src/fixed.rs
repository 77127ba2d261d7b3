//! In-process version source.

use std::sync::Mutex;

use async_trait::async_trait;

use fleetup_core::{NodeTier, ReleaseInfo};

use crate::VersionSource;
use crate::error::{SourceError, SourceResult};

/// Serves a single release to every tier.
///
/// The release can be swapped at runtime, and the source can be told to
/// fail so callers can exercise their error paths.
#[derive(Debug, Default)]
pub struct FixedSource {
    release: Mutex<Option<ReleaseInfo>>,
    failure: Mutex<Option<String>>,
}

impl FixedSource {
    pub fn new(release: Option<ReleaseInfo>) -> Self {
        Self {
            release: Mutex::new(release),
            failure: Mutex::new(None),
        }
    }

    pub fn set(&self, release: ReleaseInfo) {
        *self.release.lock().unwrap_or_else(|p| p.into_inner()) = Some(release);
    }

    pub fn clear(&self) {
        *self.release.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Make every lookup fail with a transport error until [`Self::recover`].
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = Some(message.to_string());
    }

    pub fn recover(&self) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[async_trait]
impl VersionSource for FixedSource {
    async fn current_release(&self, _tier: NodeTier) -> SourceResult<Option<ReleaseInfo>> {
        if let Some(message) = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(SourceError::Transport(message));
        }
        let release = self.release.lock().unwrap_or_else(|p| p.into_inner()).clone();
        Ok(release.filter(|r| r.active))
    }

    async fn test_connection(&self) -> bool {
        self.failure.lock().unwrap_or_else(|p| p.into_inner()).is_none()
    }
}

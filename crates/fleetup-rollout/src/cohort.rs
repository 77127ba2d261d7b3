//! Cohort assignment — percentile bucketing with time-gated bands.
//!
//! A node's bucket is `keccak256(node_id) mod 100 + 1`, reading the digest
//! as a big-endian unsigned integer. Buckets `1..=canary` form the canary
//! band. The four cohort bands follow, each `cohort_percent` wide, and band
//! `i` opens `i * inter_cohort_delay_secs` after publication.

use sha3::{Digest, Keccak256};
use tracing::debug;

use fleetup_core::{CohortDecision, NodeIdentity, RolloutPolicy};

/// Number of staged cohorts after the canary band.
pub const COHORT_BANDS: u8 = 4;

/// Stable percentile bucket in `1..=100` for a node identifier.
pub fn percentile_bucket(node_id: &str) -> u8 {
    let digest = Keccak256::digest(node_id.as_bytes());
    // (a * 256 + b) mod 100, folded over the big-endian digest.
    let rem = digest
        .iter()
        .fold(0u32, |acc, byte| (acc * 256 + u32::from(*byte)) % 100);
    rem as u8 + 1
}

/// Maps one node onto the bands of any rollout policy.
///
/// The bucket is computed once; [`decide`](Self::decide) and
/// [`time_until_eligible`](Self::time_until_eligible) are pure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CohortAssigner {
    bucket: u8,
}

impl CohortAssigner {
    pub fn new(node_id: &str) -> Self {
        Self {
            bucket: percentile_bucket(node_id),
        }
    }

    pub fn for_identity(identity: &NodeIdentity) -> Self {
        Self::new(identity.node_id())
    }

    pub fn bucket(&self) -> u8 {
        self.bucket
    }

    /// Band this node falls into: `Some(0)` for canary, `Some(1..=4)` for a
    /// cohort, `None` when the bucket lies beyond every band.
    pub fn band(&self, policy: &RolloutPolicy) -> Option<u8> {
        let bucket = u32::from(self.bucket);
        let canary = u32::from(policy.canary_percent);
        if bucket <= canary {
            return Some(0);
        }
        let cohort = u32::from(policy.cohort_percent);
        (1..=COHORT_BANDS).find(|i| canary + u32::from(*i) * cohort >= bucket)
    }

    /// Eligibility at `now` for a release published at `published_at`.
    pub fn decide(&self, policy: &RolloutPolicy, published_at: u64, now: u64) -> CohortDecision {
        let decision = match self.band(policy) {
            Some(0) => CohortDecision::Canary,
            Some(band) if gate_remaining(policy, band, published_at, now) == 0 => {
                CohortDecision::Cohort(band)
            }
            _ => CohortDecision::NotEligible,
        };
        debug!(bucket = self.bucket, %decision, "cohort decision");
        decision
    }

    /// Seconds until this node becomes eligible.
    ///
    /// `Some(0)` when eligible now, `None` when it never will be under
    /// this policy.
    pub fn time_until_eligible(
        &self,
        policy: &RolloutPolicy,
        published_at: u64,
        now: u64,
    ) -> Option<u64> {
        match self.band(policy)? {
            0 => Some(0),
            band => Some(gate_remaining(policy, band, published_at, now)),
        }
    }
}

fn gate_remaining(policy: &RolloutPolicy, band: u8, published_at: u64, now: u64) -> u64 {
    let delay = policy
        .inter_cohort_delay_secs
        .saturating_mul(u64::from(band));
    let elapsed = now.saturating_sub(published_at);
    delay.saturating_sub(elapsed)
}

//! Minimal Solidity ABI codec for the version authority.
//!
//! Only what `getCurrentVersion(uint8)` needs: a function selector, one
//! static argument, and decoding of the returned tuple:
//!
//! ```text
//! (uint256 versionId, string version, string artifactTag,
//!  uint256 publishedAt, bool active,
//!  uint8 canaryPercent, uint8 cohortPercent, uint256 interCohortDelaySeconds)
//! ```
//!
//! The tuple is dynamic, so the return data starts with an offset word
//! pointing at the tuple head. String offsets are relative to that head.

use sha3::{Digest, Keccak256};

use fleetup_core::{ReleaseInfo, RolloutPolicy};

use crate::error::{SourceError, SourceResult};

pub const GET_CURRENT_VERSION: &str = "getCurrentVersion(uint8)";

const WORD: usize = 32;
const TUPLE_WORDS: usize = 8;

/// First four bytes of the Keccak-256 hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let digest = Keccak256::digest(signature.as_bytes());
    [digest[0], digest[1], digest[2], digest[3]]
}

/// `0x`-prefixed calldata for a function taking a single `uint8`.
pub fn encode_u8_call(signature: &str, arg: u8) -> String {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&selector(signature));
    let mut word = [0u8; WORD];
    word[WORD - 1] = arg;
    data.extend_from_slice(&word);
    format!("0x{}", hex::encode(data))
}

/// Decode `0x`-prefixed hex returned by `eth_call`.
pub fn decode_hex(s: &str) -> SourceResult<Vec<u8>> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| SourceError::Decode(format!("invalid hex: {e}")))
}

/// Decode the `getCurrentVersion` return value.
///
/// A zero `versionId`, an inactive release, or empty return data all mean
/// there is no current release.
pub fn decode_release(data: &[u8]) -> SourceResult<Option<ReleaseInfo>> {
    if data.is_empty() {
        return Ok(None);
    }
    let reader = Reader { data };
    let base = reader.offset(0)?;
    if base > data.len() {
        return Err(SourceError::Decode(format!("tuple offset {base} out of bounds")));
    }
    let head = |i: usize| base + i * WORD;
    reader.word(head(TUPLE_WORDS - 1))?;

    if reader.is_zero(head(0))? {
        return Ok(None);
    }

    let version = reader.string(base, head(1))?;
    let artifact_tag = reader.string(base, head(2))?;
    let published_at = reader.u64(head(3))?;
    let active = reader.bool(head(4))?;
    let canary_percent = reader.u8(head(5))?;
    let cohort_percent = reader.u8(head(6))?;
    let inter_cohort_delay_secs = reader.u64(head(7))?;

    if !active {
        return Ok(None);
    }
    if version.is_empty() || artifact_tag.is_empty() {
        return Err(SourceError::Decode("empty version or artifact tag".to_string()));
    }

    Ok(Some(ReleaseInfo {
        version,
        artifact_tag,
        published_at,
        active,
        rollout: RolloutPolicy {
            canary_percent,
            cohort_percent,
            inter_cohort_delay_secs,
        },
    }))
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn word(&self, at: usize) -> SourceResult<&'a [u8]> {
        let end = at
            .checked_add(WORD)
            .ok_or_else(|| SourceError::Decode("offset overflow".to_string()))?;
        self.data
            .get(at..end)
            .ok_or_else(|| SourceError::Decode(format!("truncated data at byte {at}")))
    }

    fn is_zero(&self, at: usize) -> SourceResult<bool> {
        Ok(self.word(at)?.iter().all(|b| *b == 0))
    }

    fn u64(&self, at: usize) -> SourceResult<u64> {
        let word = self.word(at)?;
        if word[..WORD - 8].iter().any(|b| *b != 0) {
            return Err(SourceError::Decode(format!("integer at byte {at} exceeds u64")));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&word[WORD - 8..]);
        Ok(u64::from_be_bytes(bytes))
    }

    fn u8(&self, at: usize) -> SourceResult<u8> {
        let value = self.u64(at)?;
        u8::try_from(value)
            .map_err(|_| SourceError::Decode(format!("integer at byte {at} exceeds u8")))
    }

    fn bool(&self, at: usize) -> SourceResult<bool> {
        match self.u64(at)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SourceError::Decode(format!("invalid bool {other} at byte {at}"))),
        }
    }

    fn offset(&self, at: usize) -> SourceResult<usize> {
        usize::try_from(self.u64(at)?)
            .map_err(|_| SourceError::Decode(format!("offset at byte {at} too large")))
    }

    /// Read a string whose offset (relative to `base`) is stored at `at`.
    fn string(&self, base: usize, at: usize) -> SourceResult<String> {
        let start = base
            .checked_add(self.offset(at)?)
            .ok_or_else(|| SourceError::Decode("offset overflow".to_string()))?;
        let len = self.offset(start)?;
        let body = start + WORD;
        let bytes = body
            .checked_add(len)
            .and_then(|end| self.data.get(body..end))
            .ok_or_else(|| SourceError::Decode(format!("string at byte {start} out of bounds")))?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| SourceError::Decode(format!("string at byte {start} is not utf-8: {e}")))
    }
}

/// Encode a release the way the contract returns it.
#[cfg(test)]
pub(crate) fn encode_release(version_id: u64, release: &ReleaseInfo) -> Vec<u8> {
    fn uint(v: u64) -> [u8; WORD] {
        let mut w = [0u8; WORD];
        w[WORD - 8..].copy_from_slice(&v.to_be_bytes());
        w
    }
    fn string_tail(s: &str) -> Vec<u8> {
        let mut out = uint(s.len() as u64).to_vec();
        out.extend_from_slice(s.as_bytes());
        let pad = (WORD - s.len() % WORD) % WORD;
        out.extend(std::iter::repeat_n(0u8, pad));
        out
    }

    let version_tail = string_tail(&release.version);
    let tag_tail = string_tail(&release.artifact_tag);
    let head_len = (TUPLE_WORDS * WORD) as u64;

    let mut out = uint(WORD as u64).to_vec();
    out.extend_from_slice(&uint(version_id));
    out.extend_from_slice(&uint(head_len));
    out.extend_from_slice(&uint(head_len + version_tail.len() as u64));
    out.extend_from_slice(&uint(release.published_at));
    out.extend_from_slice(&uint(release.active as u64));
    out.extend_from_slice(&uint(release.rollout.canary_percent as u64));
    out.extend_from_slice(&uint(release.rollout.cohort_percent as u64));
    out.extend_from_slice(&uint(release.rollout.inter_cohort_delay_secs));
    out.extend(version_tail);
    out.extend(tag_tail);
    out
}

//! Byte-identity checks between stored workers.

use sworker_ids::WorkerId;

use crate::error::{Result, WorkerError};
use crate::store::WorkerStore;

/// Whether two workers hold byte-identical scripts, judged by content hash.
///
/// Fails with `NotFound` if either record is missing and with
/// `VerificationFailure` if either has no recorded hash yet.
pub async fn is_byte_identical(store: &WorkerStore, a: &WorkerId, b: &WorkerId) -> Result<bool> {
    let (hash_a, hash_b) = store.select_content_hash_pair(a, b).await?;
    let hash_a = hash_a.ok_or_else(|| WorkerError::VerificationFailure(a.clone()))?;
    let hash_b = hash_b.ok_or_else(|| WorkerError::VerificationFailure(b.clone()))?;
    Ok(hash_a == hash_b)
}

//! Capacity eviction ordering shared by the per-user stores.

/// A tracked user as seen by the eviction pass.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub key: String,
    pub last_seen: i64,
    /// Insertion sequence number, breaks `last_seen` ties.
    pub seq: u64,
}

/// Pick the `excess` least recently seen candidates.
///
/// Oldest `last_seen` goes first; exact ties go to the earliest insertion.
pub(crate) fn select_victims(mut candidates: Vec<Candidate>, excess: usize) -> Vec<String> {
    if excess == 0 {
        return Vec::new();
    }
    candidates.sort_unstable_by_key(|c| (c.last_seen, c.seq));
    candidates
        .into_iter()
        .take(excess)
        .map(|c| c.key)
        .collect()
}

use sha2::Digest as _;

use crate::formats::TocChapter;

/// Width of a fingerprint in hex characters.
pub const FINGERPRINT_LEN: usize = 16;

/// Digest of a table of contents, keyed on chapter ids in sequence order.
///
/// Entries are re-sorted by sequence number (ties broken by id) before
/// hashing, so callers may pass them in any order.
pub fn compute<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a str, u32)>,
{
    let mut entries = entries.into_iter().collect::<Vec<_>>();
    entries.sort_by(|(a_id, a_seq), (b_id, b_seq)| a_seq.cmp(b_seq).then_with(|| a_id.cmp(b_id)));
    compute_ids(entries.into_iter().map(|(id, _)| id))
}

/// Digest of chapter ids that are already in canonical order.
pub fn compute_ids<'a, I>(ids: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut hasher = sha2::Sha256::new();
    for id in ids {
        // Length-prefixed so no id can alias a pair of shorter ones.
        hasher.update((id.len() as u64).to_le_bytes());
        hasher.update(id.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..FINGERPRINT_LEN / 2])
}

pub fn compute_for_chapters(chapters: &[TocChapter]) -> String {
    compute(chapters.iter().map(|c| (c.id.as_str(), c.sequence)))
}

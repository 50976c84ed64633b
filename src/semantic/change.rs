use crate::semantic::index::EmbeddingRecord;
use crate::semantic::preprocess::content_hash;

/// Whether a unit needs a fresh embedding.
///
/// True if there is no record yet, the cleaned text hashes differently, or
/// the source was modified after the record was generated.
pub fn needs_regeneration(
    existing: Option<&EmbeddingRecord>,
    cleaned_content: &str,
    source_mtime: i64,
) -> bool {
    match existing {
        None => true,
        Some(record) => {
            record.content_hash != content_hash(cleaned_content)
                || record.last_modified < source_mtime
        }
    }
}

/// Whether the text itself changed, as opposed to only the source mtime.
///
/// A record whose hash still matches can keep its vector and only refresh
/// its metadata.
pub fn content_changed(existing: Option<&EmbeddingRecord>, cleaned_content: &str) -> bool {
    existing.map_or(true, |record| {
        record.content_hash != content_hash(cleaned_content)
    })
}

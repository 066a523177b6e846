//! Deterministic id helpers and name canonicalization (spec §3, §4.4, §4.7).
//!
//! Grounded on `notebook-backend/app/utils/entity_fingerprint.py`: lowercase,
//! strip punctuation, collapse whitespace. Node/edge ids use an 8-hex-digit
//! MD5 prefix, matching the `entity_{md5_8(...)}` / `rel_{md5_8(...)}` forms
//! in spec §3.

use md5::{Digest, Md5};

/// Canonicalizes a name for comparison and for deterministic id derivation:
/// lowercase, strip punctuation, collapse whitespace.
pub fn canonicalize(name: &str) -> String {
    let lowered = name.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_was_space = false;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() || ch.is_whitespace() {
            if ch.is_whitespace() {
                if !last_was_space && !out.is_empty() {
                    out.push(' ');
                }
                last_was_space = true;
            } else {
                out.push(ch);
                last_was_space = false;
            }
        }
        // punctuation is dropped entirely
    }
    out.trim_end().to_string()
}

/// First 8 hex digits of the MD5 digest of `input`.
pub fn md5_8(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let full = format!("{:x}", digest);
    full[..8].to_string()
}

/// First 8 hex digits of the MD5 digest of arbitrary bytes (used for chunk
/// content hashes, spec §3 `Chunk` id format).
pub fn md5_8_bytes(input: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(input);
    let digest = hasher.finalize();
    format!("{:x}", digest)[..8].to_string()
}

/// Deterministic chunk id: `doc{docId}_chunk{index}_{contentHash8}`.
pub fn chunk_id(doc_id: &str, index: usize, content: &str) -> String {
    format!("doc{}_chunk{}_{}", doc_id, index, md5_8_bytes(content.as_bytes()))
}

/// Deterministic entity node id: `entity_{md5_8(lowercase(name)+"_"+type)}`.
pub fn entity_node_id(name: &str, entity_type: &str) -> String {
    let key = format!("{}_{}", canonicalize(name), entity_type.to_lowercase());
    format!("entity_{}", md5_8(&key))
}

/// Deterministic relation edge id: `rel_{md5_8(sourceId+"_"+targetId+"_"+type)}`.
pub fn relation_edge_id(source_id: &str, target_id: &str, relation_type: &str) -> String {
    let key = format!("{}_{}_{}", source_id, target_id, relation_type);
    format!("rel_{}", md5_8(&key))
}

/// Extraction-time entity id: `{chunkId}_entity_{indexInChunk}`.
pub fn extraction_entity_id(chunk_id: &str, index_in_chunk: usize) -> String {
    format!("{}_entity_{}", chunk_id, index_in_chunk)
}

/// Extraction-time relation id: `{chunkId}_rel_{j}`.
pub fn extraction_relation_id(chunk_id: &str, index: usize) -> String {
    format!("{}_rel_{}", chunk_id, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(canonicalize("Apple Inc."), "apple inc");
        assert_eq!(canonicalize("  Apple   Inc.  "), "apple inc");
        assert_eq!(canonicalize("苹果公司"), "苹果公司");
    }

    #[test]
    fn entity_node_id_is_deterministic() {
        let a = entity_node_id("Apple Inc.", "organization");
        let b = entity_node_id("apple inc", "organization");
        assert_eq!(a, b, "canonicalization should make names collide");
        assert!(a.starts_with("entity_"));
        assert_eq!(a.len(), "entity_".len() + 8);
    }

    #[test]
    fn relation_edge_id_is_order_sensitive() {
        let a = relation_edge_id("e1", "e2", "causes");
        let b = relation_edge_id("e2", "e1", "causes");
        assert_ne!(a, b);
    }

    #[test]
    fn chunk_id_is_stable_across_runs() {
        let a = chunk_id("42", 0, "hello world");
        let b = chunk_id("42", 0, "hello world");
        assert_eq!(a, b);
        assert!(a.starts_with("doc42_chunk0_"));
    }
}

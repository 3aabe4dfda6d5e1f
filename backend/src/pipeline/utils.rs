use sha2::{Digest, Sha256};

pub fn compute_hash_id(content: &str, prefix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{}{:x}", prefix, hasher.finalize())
}

/// Slide a `chunk_size`-character window over the text, advancing by
/// `chunk_size - chunk_overlap` each step. The final window may be short.
/// Windows are taken over `char` boundaries, never inside a code point.
///
/// The caller is responsible for validating `chunk_overlap < chunk_size`.
pub fn chunk_by_char_window(content: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let step = chunk_size - chunk_overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());

        if end == chars.len() {
            break;
        }

        start += step;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_id_is_stable_and_prefixed() {
        let a = compute_hash_id("some chunk text", "chunk-");
        let b = compute_hash_id("some chunk text", "chunk-");
        assert_eq!(a, b);
        assert!(a.starts_with("chunk-"));
        assert_ne!(a, compute_hash_id("other text", "chunk-"));
    }

    #[test]
    fn windows_never_split_code_points() {
        let text = "héllo wörld ünïcode".repeat(20);
        for chunk in chunk_by_char_window(&text, 7, 2) {
            assert!(chunk.chars().count() <= 7);
        }
    }
}

//! Reranker request fingerprint
//!
//! Replicas that share a reranking cache key their entries by a 64-bit
//! xxhash over the model, query, and prompts. The concatenation layout is
//! fixed: changing it would silently split the shared cache across
//! versions.

use std::hash::Hasher;

use twox_hash::XxHash64;

/// Compute the cache key for a reranking request.
///
/// Layout: `model "|" "q:" query "|"` followed by, for each prompt,
/// `"p" <index as u16 big-endian> ":" prompt "|"`. The key is the 8-byte
/// big-endian encoding of the resulting xxhash64.
pub fn rerank_cache_key(model: &str, query: &str, prompts: &[String]) -> [u8; 8] {
    let mut h = XxHash64::with_seed(0);

    h.write(model.as_bytes());
    h.write(b"|");

    h.write(b"q:");
    h.write(query.as_bytes());
    h.write(b"|");

    for (i, prompt) in prompts.iter().enumerate() {
        h.write(b"p");
        // Two-byte big-endian index so prompt order matters
        h.write(&[(i >> 8) as u8, i as u8]);
        h.write(b":");
        h.write(prompt.as_bytes());
        h.write(b"|");
    }

    h.finish().to_be_bytes()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn identical_inputs_produce_identical_keys() {
        let a = rerank_cache_key("bge-rerank", "what is rust", &prompts(&["doc1", "doc2"]));
        let b = rerank_cache_key("bge-rerank", "what is rust", &prompts(&["doc1", "doc2"]));
        assert_eq!(a, b);
    }

    #[test]
    fn model_query_and_prompts_all_contribute() {
        let base = rerank_cache_key("m", "q", &prompts(&["a", "b"]));
        assert_ne!(base, rerank_cache_key("m2", "q", &prompts(&["a", "b"])));
        assert_ne!(base, rerank_cache_key("m", "q2", &prompts(&["a", "b"])));
        assert_ne!(base, rerank_cache_key("m", "q", &prompts(&["a", "c"])));
    }

    #[test]
    fn prompt_order_matters() {
        let ab = rerank_cache_key("m", "q", &prompts(&["a", "b"]));
        let ba = rerank_cache_key("m", "q", &prompts(&["b", "a"]));
        assert_ne!(ab, ba);
    }

    #[test]
    fn boundary_ambiguity_is_resolved_by_separators() {
        // Without separators these would concatenate identically
        let one = rerank_cache_key("m", "ab", &prompts(&["c"]));
        let two = rerank_cache_key("m", "a", &prompts(&["bc"]));
        assert_ne!(one, two);
    }

    #[test]
    fn empty_prompt_list_is_valid() {
        let key = rerank_cache_key("m", "q", &[]);
        assert_eq!(key.len(), 8);
    }
}

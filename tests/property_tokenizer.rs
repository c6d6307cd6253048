//! Property-based tests for the BPE and greedy tokenizers
//!
//! These tests use proptest to verify determinism and lossless round trips.

use proptest::prelude::*;
use tessera::{Tokenizer, TokenizerType};

/// Vocabulary with `a`..`z`, a few merges, and all 256 `<0xHH>` byte tokens
fn byte_fallback_tokenizer(tokenizer_type: TokenizerType) -> Tokenizer {
    let mut t = Tokenizer::new(tokenizer_type);
    let mut id = 0u32;
    for byte in 0..=255u8 {
        t.insert(format!("<0x{byte:02X}>"), id, -100.0);
        id += 1;
    }
    for c in 'a'..='z' {
        t.insert(c.to_string(), id, 0.0);
        id += 1;
    }
    for (token, score) in [("ab", 1.0), ("bc", 2.0), ("abc", 3.0), ("th", 1.5), ("the", 2.5)] {
        t.insert(token, id, score);
        id += 1;
    }
    t
}

/// Strategy for lowercase ASCII words
fn ascii_string_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::char::range('a', 'z'), 0..50)
        .prop_map(|chars| chars.into_iter().collect())
}

/// Strategy for strings built from vocabulary pieces
fn vocab_string_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "c", "ab", "bc", "the"]), 1..10)
        .prop_map(|tokens| tokens.join(""))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Encoding is a pure function of the input
    #[test]
    fn test_encode_deterministic(text in ascii_string_strategy()) {
        let t = byte_fallback_tokenizer(TokenizerType::Bpe);
        prop_assert_eq!(t.encode_ids(&text), t.encode_ids(&text));
    }

    /// Vocabulary text decodes back to itself
    #[test]
    fn test_bpe_roundtrip_vocab(text in vocab_string_strategy()) {
        let t = byte_fallback_tokenizer(TokenizerType::Bpe);
        let ids = t.encode_ids(&text);
        prop_assert_eq!(t.decode(&ids).unwrap(), text);
    }

    /// Arbitrary Unicode survives through byte fallback
    ///
    /// `<` is excluded so the input cannot spell a byte token literally.
    #[test]
    fn test_bpe_roundtrip_unicode(text in "[^<]{0,40}") {
        let t = byte_fallback_tokenizer(TokenizerType::Bpe);
        let ids = t.encode_ids(&text);
        prop_assert_eq!(t.decode_bytes(&ids).unwrap(), text.as_bytes().to_vec());
        prop_assert!(ids.len() <= text.len());
    }

    /// Greedy longest match is lossless too
    #[test]
    fn test_normal_roundtrip_unicode(text in "[^<]{0,40}") {
        let t = byte_fallback_tokenizer(TokenizerType::Normal);
        let ids = t.encode_ids(&text);
        prop_assert_eq!(t.decode(&ids).unwrap(), text);
    }

    /// Every emitted id is in the vocabulary
    #[test]
    fn test_encode_ids_valid(text in ascii_string_strategy()) {
        let t = byte_fallback_tokenizer(TokenizerType::Bpe);
        for id in t.encode_ids(&text) {
            prop_assert!(t.get_token(id).is_some());
        }
    }

    /// Per-token decode concatenates to the full decode
    #[test]
    fn test_decode_tokens_concatenate(text in vocab_string_strategy()) {
        let t = byte_fallback_tokenizer(TokenizerType::Bpe);
        let ids = t.encode_ids(&text);
        let pieces: Vec<u8> = t.decode_tokens(&ids).unwrap().concat();
        prop_assert_eq!(pieces, t.decode_bytes(&ids).unwrap());
    }
}

#[test]
fn test_highest_score_merge_wins() {
    let t = byte_fallback_tokenizer(TokenizerType::Bpe);
    let abc = t.get_token_id("abc").unwrap();
    assert_eq!(t.encode_ids("abc"), vec![abc]);
    let the = t.get_token_id("the").unwrap();
    assert_eq!(t.encode_ids("the"), vec![the]);
}

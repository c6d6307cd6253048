//! Tokenizer for text encoding and decoding
//!
//! A trie-backed vocabulary with two encoders:
//! - **BPE**: start from the shortest vocabulary match at every position,
//!   then repeatedly merge the best-scoring adjacent pair
//! - **Normal**: greedy longest-prefix match over the trie
//!
//! Bytes with no vocabulary entry fall back to `<0xHH>` byte tokens when the
//! vocabulary has them, otherwise to the unknown-token id. Decoding turns
//! `<0xHH>` tokens back into raw bytes.
//!
//! ## Example
//!
//! ```
//! use tessera::Tokenizer;
//!
//! let mut tokenizer = Tokenizer::default();
//! for (id, (token, score)) in [("a", 1.0), ("b", 1.0), ("c", 1.0), ("ab", 2.0), ("bc", 2.0)]
//!     .iter()
//!     .enumerate()
//! {
//!     tokenizer.insert(token, id as u32, *score);
//! }
//! let ids = tokenizer.encode_ids("abc");
//! assert_eq!(ids, vec![3, 2]); // "ab" merges before "bc"
//! assert_eq!(tokenizer.decode(&ids).unwrap(), "abc");
//! ```

mod trie;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, TesseraError};
use crate::tensor::Tensor;
use trie::{Trie, ROOT};

/// Encoding algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerType {
    /// Score-driven pair merging
    #[default]
    Bpe,
    /// Greedy longest match
    Normal,
}

impl std::str::FromStr for TokenizerType {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bpe" => Ok(Self::Bpe),
            "normal" => Ok(Self::Normal),
            _ => Err(TesseraError::InvalidConfiguration(format!(
                "Unknown tokenizer type: '{s}'"
            ))),
        }
    }
}

/// Vocabulary plus encoder/decoder
#[derive(Debug, Clone, Default)]
pub struct Tokenizer {
    tokenizer_type: TokenizerType,
    trie: Trie,
    token_to_id: HashMap<Vec<u8>, u32>,
    id_to_token: HashMap<u32, Vec<u8>>,
    id_to_score: HashMap<u32, f32>,
    unk_token_id: u32,
}

/// One span of the input during BPE merging
#[derive(Debug, Clone)]
struct Symbol {
    /// Trie node of the span, `None` for a byte with no vocabulary entry
    node: Option<u32>,
    pos: usize,
    len: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Adjacent pair whose concatenation is a vocabulary entry
#[derive(Debug, Clone, Copy)]
struct MergeCandidate {
    score: f32,
    left: usize,
    right: usize,
    size: usize,
}

/// Merge order: higher score first, then the smaller left index
fn merge_priority(a: &MergeCandidate, b: &MergeCandidate) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| b.left.cmp(&a.left))
}

impl PartialEq for MergeCandidate {
    fn eq(&self, other: &Self) -> bool {
        merge_priority(self, other) == Ordering::Equal
    }
}

impl Eq for MergeCandidate {}

impl PartialOrd for MergeCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        merge_priority(self, other)
    }
}

fn byte_token(byte: u8) -> String {
    format!("<0x{byte:02X}>")
}

/// Raw byte encoded by a `<0xHH>` token
fn parse_byte_token(token: &[u8]) -> Option<u8> {
    let hex = token.strip_prefix(b"<0x")?.strip_suffix(b">")?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(std::str::from_utf8(hex).ok()?, 16).ok()
}

impl Tokenizer {
    /// Empty tokenizer of the given type
    #[must_use]
    pub fn new(tokenizer_type: TokenizerType) -> Self {
        Self {
            tokenizer_type,
            ..Self::default()
        }
    }

    /// Encoding algorithm
    #[must_use]
    pub fn tokenizer_type(&self) -> TokenizerType {
        self.tokenizer_type
    }

    /// Switch the encoding algorithm
    pub fn set_tokenizer_type(&mut self, tokenizer_type: TokenizerType) {
        self.tokenizer_type = tokenizer_type;
    }

    /// Id emitted for input with no vocabulary match
    #[must_use]
    pub fn unk_token_id(&self) -> u32 {
        self.unk_token_id
    }

    /// Set the unknown-token id
    pub fn set_unk_token_id(&mut self, id: u32) {
        self.unk_token_id = id;
    }

    /// Add `(token, id, score)` to the trie and the lookup tables
    ///
    /// Re-inserting an id replaces its previous token.
    pub fn insert(&mut self, token: impl AsRef<[u8]>, id: u32, score: f32) {
        let token = token.as_ref();
        if let Some(old) = self.id_to_token.get(&id) {
            if old.as_slice() != token {
                warn!(
                    id,
                    old = %String::from_utf8_lossy(old),
                    new = %String::from_utf8_lossy(token),
                    "tokenizer id reassigned"
                );
                let old = old.clone();
                self.trie.remove(&old);
                self.token_to_id.remove(&old);
            }
        }
        self.trie.insert(token, id, score);
        self.token_to_id.insert(token.to_vec(), id);
        self.id_to_token.insert(id, token.to_vec());
        self.id_to_score.insert(id, score);
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.trie.clear();
        self.token_to_id.clear();
        self.id_to_token.clear();
        self.id_to_score.clear();
    }

    /// Number of tokens
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    /// Whether the vocabulary is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    /// Id of a token
    #[must_use]
    pub fn get_token_id(&self, token: impl AsRef<[u8]>) -> Option<u32> {
        self.token_to_id.get(token.as_ref()).copied()
    }

    /// Token bytes of an id
    #[must_use]
    pub fn get_token(&self, id: u32) -> Option<&[u8]> {
        self.id_to_token.get(&id).map(Vec::as_slice)
    }

    /// Merge score of an id
    #[must_use]
    pub fn get_score(&self, id: u32) -> Option<f32> {
        self.id_to_score.get(&id).copied()
    }

    /// All `(token, id, score)` entries ordered by id
    #[must_use]
    pub fn entries(&self) -> Vec<(&[u8], u32, f32)> {
        let mut entries: Vec<_> = self
            .id_to_token
            .iter()
            .map(|(&id, token)| {
                let score = self.id_to_score.get(&id).copied().unwrap_or(0.0);
                (token.as_slice(), id, score)
            })
            .collect();
        entries.sort_by_key(|&(_, id, _)| id);
        entries
    }

    /// Encode text into a `[1, n]` tensor of ids
    ///
    /// # Errors
    ///
    /// Only fails if the id tensor cannot be built.
    pub fn encode(&self, text: &str) -> Result<Tensor> {
        let ids: Vec<f32> = self.encode_ids(text).into_iter().map(|id| id as f32).collect();
        Tensor::from_f32(&[1, ids.len()], &ids)
    }

    /// Encode text into token ids
    #[must_use]
    pub fn encode_ids(&self, text: &str) -> Vec<u32> {
        self.encode_bytes(text.as_bytes())
    }

    /// Encode raw bytes into token ids
    #[must_use]
    pub fn encode_bytes(&self, input: &[u8]) -> Vec<u32> {
        match self.tokenizer_type {
            TokenizerType::Bpe => self.encode_bpe(input),
            TokenizerType::Normal => self.encode_greedy(input),
        }
    }

    fn fallback_id(&self, byte: u8) -> u32 {
        self.token_to_id
            .get(byte_token(byte).as_bytes())
            .copied()
            .unwrap_or(self.unk_token_id)
    }

    fn encode_greedy(&self, input: &[u8]) -> Vec<u32> {
        let mut ids = Vec::new();
        let mut i = 0;
        while i < input.len() {
            let mut node = ROOT;
            let mut best = None;
            for (j, &byte) in input[i..].iter().enumerate() {
                let Some(next) = self.trie.child(node, byte) else {
                    break;
                };
                node = next;
                if let Some((id, _)) = self.trie.token(node) {
                    best = Some((id, j + 1));
                }
            }
            match best {
                Some((id, len)) => {
                    ids.push(id);
                    i += len;
                },
                None => {
                    ids.push(self.fallback_id(input[i]));
                    i += 1;
                },
            }
        }
        ids
    }

    /// Shortest vocabulary match starting at `start`
    fn shortest_match(&self, input: &[u8], start: usize) -> Option<(u32, usize)> {
        let mut node = ROOT;
        for (j, &byte) in input[start..].iter().enumerate() {
            node = self.trie.child(node, byte)?;
            if self.trie.token(node).is_some() {
                return Some((node, j + 1));
            }
        }
        None
    }

    fn push_candidate(
        &self,
        symbols: &[Symbol],
        input: &[u8],
        left: Option<usize>,
        right: Option<usize>,
        queue: &mut BinaryHeap<MergeCandidate>,
    ) {
        let (Some(left), Some(right)) = (left, right) else {
            return;
        };
        let (l, r) = (&symbols[left], &symbols[right]);
        let Some(node) = l.node else { return };
        if r.node.is_none() {
            return;
        }
        let merged = self
            .trie
            .walk(node, &input[r.pos..r.pos + r.len])
            .and_then(|n| self.trie.token(n));
        if let Some((_, score)) = merged {
            queue.push(MergeCandidate {
                score,
                left,
                right,
                size: l.len + r.len,
            });
        }
    }

    fn encode_bpe(&self, input: &[u8]) -> Vec<u32> {
        let mut symbols: Vec<Symbol> = Vec::new();
        let mut i = 0;
        while i < input.len() {
            let (node, len) = match self.shortest_match(input, i) {
                Some((node, len)) => (Some(node), len),
                None => (None, 1),
            };
            let index = symbols.len();
            symbols.push(Symbol {
                node,
                pos: i,
                len,
                prev: index.checked_sub(1),
                next: Some(index + 1),
            });
            i += len;
        }
        if let Some(last) = symbols.last_mut() {
            last.next = None;
        }

        // BinaryHeap pops the maximum under `merge_priority`: best score,
        // and on equal scores the leftmost pair.
        let mut queue = BinaryHeap::new();
        for right in 1..symbols.len() {
            self.push_candidate(&symbols, input, Some(right - 1), Some(right), &mut queue);
        }

        while let Some(top) = queue.pop() {
            let (l, r) = (&symbols[top.left], &symbols[top.right]);
            let live = l.len > 0
                && r.len > 0
                && l.next == Some(top.right)
                && l.len + r.len == top.size;
            if !live {
                continue;
            }

            let merged_node = l
                .node
                .and_then(|n| self.trie.walk(n, &input[r.pos..r.pos + r.len]));
            let next = r.next;
            let left = &mut symbols[top.left];
            left.node = merged_node;
            left.len = top.size;
            left.next = next;
            symbols[top.right].len = 0;
            if let Some(n) = next {
                symbols[n].prev = Some(top.left);
            }

            let prev = symbols[top.left].prev;
            self.push_candidate(&symbols, input, prev, Some(top.left), &mut queue);
            self.push_candidate(&symbols, input, Some(top.left), next, &mut queue);
        }

        symbols
            .iter()
            .filter(|s| s.len > 0)
            .map(|s| match s.node.and_then(|n| self.trie.token(n)) {
                Some((id, _)) => id,
                None => self.fallback_id(input[s.pos]),
            })
            .collect()
    }

    fn token_bytes(&self, id: u32) -> Result<&[u8]> {
        self.get_token(id)
            .ok_or_else(|| TesseraError::UnsupportedOperation {
                operation: "decode_token".to_string(),
                reason: format!("Invalid token ID: {id}"),
            })
    }

    /// Decode ids to raw bytes, expanding `<0xHH>` byte tokens
    ///
    /// # Errors
    ///
    /// Returns error if any token ID is invalid
    pub fn decode_bytes(&self, ids: &[u32]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for &id in ids {
            let token = self.token_bytes(id)?;
            match parse_byte_token(token) {
                Some(byte) => out.push(byte),
                None => out.extend_from_slice(token),
            }
        }
        Ok(out)
    }

    /// Decode ids to text
    ///
    /// Invalid UTF-8 (e.g. a truncated multi-byte sequence) is replaced
    /// with U+FFFD.
    ///
    /// # Errors
    ///
    /// Returns error if any token ID is invalid
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.decode_bytes(ids)?).into_owned())
    }

    /// Decode a tensor of ids produced by [`encode`](Self::encode)
    ///
    /// # Errors
    ///
    /// Returns error if the tensor cannot be read or holds an invalid id.
    pub fn decode_tensor(&self, ids: &Tensor) -> Result<String> {
        let ids: Vec<u32> = ids.to_f32_vec()?.into_iter().map(|v| v as u32).collect();
        self.decode(&ids)
    }

    /// Decode each id on its own
    ///
    /// # Errors
    ///
    /// Returns error if any token ID is invalid
    pub fn decode_tokens(&self, ids: &[u32]) -> Result<Vec<Vec<u8>>> {
        ids.iter().map(|&id| self.decode_bytes(&[id])).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer(entries: &[(&str, f32)]) -> Tokenizer {
        let mut t = Tokenizer::default();
        for (id, (token, score)) in entries.iter().enumerate() {
            t.insert(token, id as u32, *score);
        }
        t
    }

    #[test]
    fn test_leftmost_merge_wins_tie() {
        let t = tokenizer(&[
            ("a", 1.0),
            ("b", 1.0),
            ("c", 1.0),
            ("ab", 2.0),
            ("bc", 2.0),
            ("abc", 3.0),
        ]);
        assert_eq!(t.encode_ids("abc"), vec![5]);

        let t = tokenizer(&[("a", 1.0), ("b", 1.0), ("c", 1.0), ("ab", 2.0), ("bc", 2.0)]);
        assert_eq!(t.encode_ids("abc"), vec![3, 2]);
    }

    #[test]
    fn test_higher_score_beats_leftmost() {
        let t = tokenizer(&[("a", 0.0), ("b", 0.0), ("c", 0.0), ("ab", 1.0), ("bc", 5.0)]);
        assert_eq!(t.encode_ids("abc"), vec![0, 4]);
    }

    #[test]
    fn test_merges_chain() {
        let t = tokenizer(&[
            ("h", 0.0),
            ("e", 0.0),
            ("l", 0.0),
            ("o", 0.0),
            ("he", 1.0),
            ("ll", 2.0),
            ("llo", 3.0),
            ("hello", 4.0),
        ]);
        assert_eq!(t.encode_ids("hello"), vec![7]);
        assert_eq!(t.encode_ids("hell"), vec![4, 5]);
    }

    #[test]
    fn test_byte_fallback() {
        let mut t = tokenizer(&[("a", 0.0), ("<0x21>", 0.0), ("<unk>", 0.0)]);
        t.set_unk_token_id(2);
        assert_eq!(t.encode_ids("a!?"), vec![0, 1, 2]);
        assert_eq!(t.decode(&[0, 1]).unwrap(), "a!");
        assert_eq!(t.decode_bytes(&[1]).unwrap(), vec![0x21]);
    }

    #[test]
    fn test_utf8_roundtrip_via_bytes() {
        let mut t = Tokenizer::default();
        for b in 0..=255u8 {
            t.insert(byte_token(b), u32::from(b), 0.0);
        }
        let text = "héllo, 世界";
        let ids = t.encode_ids(text);
        assert_eq!(ids.len(), text.len());
        assert_eq!(t.decode(&ids).unwrap(), text);
    }

    #[test]
    fn test_normal_longest_match() {
        let mut t = tokenizer(&[("a", 0.0), ("ab", 0.0), ("abc", 0.0), ("c", 0.0)]);
        t.set_tokenizer_type(TokenizerType::Normal);
        assert_eq!(t.encode_ids("abcab"), vec![2, 1]);
        assert_eq!(t.encode_ids("ca"), vec![3, 0]);
    }

    #[test]
    fn test_encode_tensor() {
        let t = tokenizer(&[("x", 0.0), ("y", 0.0)]);
        let ids = t.encode("xyx").unwrap();
        assert_eq!(ids.dims(), &[1, 3]);
        assert_eq!(ids.to_f32_vec().unwrap(), vec![0.0, 1.0, 0.0]);
        assert_eq!(t.decode_tensor(&ids).unwrap(), "xyx");

        let empty = t.encode("").unwrap();
        assert_eq!(empty.dims(), &[1, 0]);
    }

    #[test]
    fn test_decode_invalid_id() {
        let t = tokenizer(&[("a", 0.0)]);
        assert!(matches!(
            t.decode(&[0, 7]),
            Err(TesseraError::UnsupportedOperation { .. })
        ));
    }

    #[test]
    fn test_decode_tokens() {
        let t = tokenizer(&[("he", 0.0), ("llo", 0.0), ("<0x0A>", 0.0)]);
        assert_eq!(
            t.decode_tokens(&[0, 1, 2]).unwrap(),
            vec![b"he".to_vec(), b"llo".to_vec(), b"\n".to_vec()]
        );
    }

    #[test]
    fn test_insert_reassigns_id() {
        let mut t = tokenizer(&[("old", 1.0)]);
        t.insert("new", 0, 2.0);
        assert_eq!(t.get_token_id("old"), None);
        assert_eq!(t.get_token(0), Some(&b"new"[..]));
        assert_eq!(t.get_score(0), Some(2.0));
        assert_eq!(t.vocab_size(), 1);
    }

    #[test]
    fn test_clear() {
        let mut t = tokenizer(&[("a", 0.0)]);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.encode_ids("a"), vec![t.unk_token_id()]);
    }

    #[test]
    fn test_entries_sorted_by_id() {
        let mut t = Tokenizer::default();
        t.insert("b", 2, 0.5);
        t.insert("a", 1, 0.25);
        let entries = t.entries();
        assert_eq!(entries[0], (&b"a"[..], 1, 0.25));
        assert_eq!(entries[1], (&b"b"[..], 2, 0.5));
    }

    #[test]
    fn test_parse_byte_token() {
        assert_eq!(parse_byte_token(b"<0xFF>"), Some(0xFF));
        assert_eq!(parse_byte_token(b"<0x0a>"), Some(0x0A));
        assert_eq!(parse_byte_token(b"<0xF>"), None);
        assert_eq!(parse_byte_token(b"0xFF"), None);
        assert_eq!("NORMAL".parse::<TokenizerType>().unwrap(), TokenizerType::Normal);
    }
}

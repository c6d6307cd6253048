//! Arena-backed byte trie
//!
//! Nodes live in one `Vec` and refer to each other by index. Each node keeps
//! its children as a byte-sorted `Vec<(u8, u32)>`, searched with binary search.

/// Index of the root node
pub(crate) const ROOT: u32 = 0;

#[derive(Debug, Clone, Default)]
struct TrieNode {
    children: Vec<(u8, u32)>,
    token: Option<(u32, f32)>,
}

/// Prefix tree from byte strings to `(token id, score)`
#[derive(Debug, Clone)]
pub(crate) struct Trie {
    nodes: Vec<TrieNode>,
}

impl Default for Trie {
    fn default() -> Self {
        Self::new()
    }
}

impl Trie {
    pub(crate) fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
        }
    }

    /// Child of `node` along `byte`
    #[inline]
    pub(crate) fn child(&self, node: u32, byte: u8) -> Option<u32> {
        let children = &self.nodes[node as usize].children;
        children
            .binary_search_by_key(&byte, |&(b, _)| b)
            .ok()
            .map(|i| children[i].1)
    }

    /// Token stored at `node`
    #[inline]
    pub(crate) fn token(&self, node: u32) -> Option<(u32, f32)> {
        self.nodes[node as usize].token
    }

    /// Node reached by walking `bytes` from `node`
    pub(crate) fn walk(&self, node: u32, bytes: &[u8]) -> Option<u32> {
        bytes.iter().try_fold(node, |n, &b| self.child(n, b))
    }

    #[cfg(test)]
    pub(crate) fn get(&self, key: &[u8]) -> Option<(u32, f32)> {
        self.walk(ROOT, key).and_then(|n| self.token(n))
    }

    /// Insert or overwrite `key`
    pub(crate) fn insert(&mut self, key: &[u8], id: u32, score: f32) {
        let mut node = ROOT;
        for &byte in key {
            let children = &self.nodes[node as usize].children;
            node = match children.binary_search_by_key(&byte, |&(b, _)| b) {
                Ok(i) => children[i].1,
                Err(i) => {
                    let next = self.nodes.len() as u32;
                    self.nodes.push(TrieNode::default());
                    self.nodes[node as usize].children.insert(i, (byte, next));
                    next
                },
            };
        }
        self.nodes[node as usize].token = Some((id, score));
    }

    /// Drop the token stored at `key`, keeping the path
    pub(crate) fn remove(&mut self, key: &[u8]) {
        if let Some(node) = self.walk(ROOT, key) {
            self.nodes[node as usize].token = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(TrieNode::default());
    }

    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut trie = Trie::new();
        trie.insert(b"ab", 5, 2.0);
        trie.insert(b"a", 1, 1.0);
        trie.insert(b"ac", 6, 0.5);
        assert_eq!(trie.get(b"a"), Some((1, 1.0)));
        assert_eq!(trie.get(b"ab"), Some((5, 2.0)));
        assert_eq!(trie.get(b"b"), None);
        assert_eq!(trie.node_count(), 4);

        let a = trie.child(ROOT, b'a').unwrap();
        assert_eq!(trie.walk(a, b"c").and_then(|n| trie.token(n)), Some((6, 0.5)));
    }

    #[test]
    fn test_children_stay_sorted() {
        let mut trie = Trie::new();
        for (i, key) in [b"z", b"a", b"m", b"b"].iter().enumerate() {
            trie.insert(*key, i as u32, 0.0);
        }
        let keys: Vec<u8> = trie.nodes[ROOT as usize].children.iter().map(|c| c.0).collect();
        assert_eq!(keys, b"abmz".to_vec());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut trie = Trie::new();
        trie.insert(b"abc", 3, 1.0);
        trie.remove(b"abc");
        assert_eq!(trie.get(b"abc"), None);
        trie.remove(b"missing");
        trie.clear();
        assert_eq!(trie.node_count(), 1);
    }
}

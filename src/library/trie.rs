use crate::library::error::{Error, Result};

/// Longest key accepted, before or after canonicalization. Keys are copied
/// into a stack buffer of this size on every operation.
pub const TRIE_KEY_MAX: usize = 512;

/// In-place key normalization, applied before every operation.
pub type Canonize = fn(&mut [u8]);

/// One nibble level. Children are owned by their parent; the way back up is
/// the descent itself, which is all pruning needs.
struct TrieNode<V> {
    val: Option<V>,
    n: [Option<Box<TrieNode<V>>>; 16],
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            val: None,
            n: std::array::from_fn(|_| None),
        }
    }

    #[inline(always)]
    fn is_garbage(&self) -> bool {
        self.val.is_none() && self.n.iter().all(Option::is_none)
    }
}

/// 16-way prefix tree: every key byte is two levels, high nibble first.
pub struct Trie<V> {
    canonize: Option<Canonize>,
    root: TrieNode<V>,
    nodes: usize,
    len: usize,
}

#[inline(always)]
fn nibbles(key: &[u8]) -> impl Iterator<Item = usize> + '_ {
    key.iter()
        .flat_map(|byte| [(byte >> 4) as usize, (byte & 0xf) as usize])
}

#[inline(always)]
fn nibble_at(key: &[u8], depth: usize) -> usize {
    let byte = key[depth / 2];
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0xf) as usize
    }
}

impl<V> Default for Trie<V> {
    fn default() -> Self {
        Self::new(None)
    }
}

impl<V> Trie<V> {
    pub fn new(canonize: Option<Canonize>) -> Self {
        Self {
            canonize,
            root: TrieNode::new(),
            nodes: 1,
            len: 0,
        }
    }

    /// Number of stored keys.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// Live nodes, root included.
    #[inline(always)]
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    fn canonical<'b>(
        canonize: Option<Canonize>,
        key: &[u8],
        buf: &'b mut [u8; TRIE_KEY_MAX],
    ) -> Result<&'b [u8]> {
        if key.len() > TRIE_KEY_MAX {
            return Err(Error::KeyTooLong {
                len: key.len(),
                max: TRIE_KEY_MAX,
            });
        }
        let buf = &mut buf[..key.len()];
        buf.copy_from_slice(key);
        if let Some(canonize) = canonize {
            canonize(buf);
        }
        Ok(buf)
    }

    fn find(&self, key: &[u8]) -> Result<Option<&TrieNode<V>>> {
        let mut buf = [0u8; TRIE_KEY_MAX];
        let key = Self::canonical(self.canonize, key, &mut buf)?;
        let mut cur = &self.root;
        for nib in nibbles(key) {
            match cur.n[nib].as_deref() {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    fn find_mut(&mut self, key: &[u8]) -> Result<Option<&mut TrieNode<V>>> {
        let mut buf = [0u8; TRIE_KEY_MAX];
        let key = Self::canonical(self.canonize, key, &mut buf)?;
        let mut cur = &mut self.root;
        for nib in nibbles(key) {
            match cur.n[nib].as_deref_mut() {
                Some(next) => cur = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Stores `val` under `key`, returning whatever was there before.
    pub fn insert(&mut self, key: impl AsRef<[u8]>, val: V) -> Result<Option<V>> {
        let mut buf = [0u8; TRIE_KEY_MAX];
        let key = Self::canonical(self.canonize, key.as_ref(), &mut buf)?;
        let mut created = 0;
        let mut cur = &mut self.root;
        for nib in nibbles(key) {
            cur = &mut **cur.n[nib].get_or_insert_with(|| {
                created += 1;
                Box::new(TrieNode::new())
            });
        }
        let prev = cur.val.replace(val);
        self.nodes += created;
        if prev.is_none() {
            self.len += 1;
        }
        Ok(prev)
    }

    pub fn lookup(&self, key: impl AsRef<[u8]>) -> Result<Option<&V>> {
        Ok(self.find(key.as_ref())?.and_then(|node| node.val.as_ref()))
    }

    pub fn lookup_mut(&mut self, key: impl AsRef<[u8]>) -> Result<Option<&mut V>> {
        Ok(self.find_mut(key.as_ref())?.and_then(|node| node.val.as_mut()))
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    /// Removes `key` and prunes every node left with neither a value nor a
    /// child, walking up towards the root.
    pub fn delete(&mut self, key: impl AsRef<[u8]>) -> Result<Option<V>> {
        let mut buf = [0u8; TRIE_KEY_MAX];
        let key = Self::canonical(self.canonize, key.as_ref(), &mut buf)?;
        let mut pruned = 0;
        let val = Self::remove_at(&mut self.root, key, 0, &mut pruned);
        self.nodes -= pruned;
        if val.is_some() {
            self.len -= 1;
        }
        Ok(val)
    }

    fn remove_at(node: &mut TrieNode<V>, key: &[u8], depth: usize, pruned: &mut usize) -> Option<V> {
        if depth == key.len() * 2 {
            return node.val.take();
        }
        let nib = nibble_at(key, depth);
        let child = node.n[nib].as_deref_mut()?;
        let val = Self::remove_at(child, key, depth + 1, pruned)?;
        if child.is_garbage() {
            node.n[nib] = None;
            *pruned += 1;
        }
        Some(val)
    }

    pub fn clear(&mut self) {
        let canonize = self.canonize;
        *self = Self::new(canonize);
    }

    /// Visits every stored key (canonical form) in nibble order.
    pub fn for_each(&self, mut visit: impl FnMut(&[u8], &V)) {
        let mut path: Vec<u8> = Vec::new();
        Self::walk(&self.root, &mut path, &mut visit);
    }

    fn walk(node: &TrieNode<V>, path: &mut Vec<u8>, visit: &mut impl FnMut(&[u8], &V)) {
        if let Some(val) = node.val.as_ref() {
            let key: Vec<u8> = path.chunks(2).map(|pair| (pair[0] << 4) | pair[1]).collect();
            visit(&key, val);
        }
        for (nib, child) in node.n.iter().enumerate() {
            if let Some(child) = child {
                path.push(nib as u8);
                Self::walk(child, path, visit);
                path.pop();
            }
        }
    }
}

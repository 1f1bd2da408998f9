//! The execution witness data model.
//!
//! A witness anchors to one block (the context header), carries the ancestor
//! headers needed for `BLOCKHASH`-style lookups, and the set of state-trie
//! nodes and code blobs touched while executing the block. The exchange
//! layer never interprets the state entries; they are opaque byte strings.

use std::collections::BTreeSet;

use veritas_types::BlockHeader;

/// A self-contained execution witness for one block.
///
/// State entries are kept in an ordered set so the canonical encoding is
/// deterministic: encoding the same witness twice always yields the same
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Witness {
    /// The header of the block this witness proves.
    context: BlockHeader,
    /// Ancestor headers, newest first.
    headers: Vec<BlockHeader>,
    /// State-trie nodes and code blobs, as opaque byte strings.
    state: BTreeSet<Vec<u8>>,
}

impl Witness {
    /// Creates an empty witness anchored to the given context header.
    pub fn new(context: BlockHeader) -> Self {
        Self {
            context,
            headers: Vec::new(),
            state: BTreeSet::new(),
        }
    }

    /// Creates a witness from its parts.
    pub fn from_parts(
        context: BlockHeader,
        headers: Vec<BlockHeader>,
        state: BTreeSet<Vec<u8>>,
    ) -> Self {
        Self {
            context,
            headers,
            state,
        }
    }

    /// Returns the context header.
    pub fn context(&self) -> &BlockHeader {
        &self.context
    }

    /// Returns the ancestor headers.
    pub fn headers(&self) -> &[BlockHeader] {
        &self.headers
    }

    /// Returns the state entry set.
    pub fn state(&self) -> &BTreeSet<Vec<u8>> {
        &self.state
    }

    /// Appends an ancestor header.
    pub fn add_header(&mut self, header: BlockHeader) {
        self.headers.push(header);
    }

    /// Adds state entries to the witness. Duplicates collapse into the set.
    pub fn add_state<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.state.extend(entries);
    }

    /// Number of state entries.
    pub fn state_len(&self) -> usize {
        self.state.len()
    }

    /// Total size of the state entries in bytes.
    pub fn state_size(&self) -> usize {
        self.state.iter().map(|entry| entry.len()).sum()
    }

    /// Whether the state entry set contains the given entry.
    pub fn contains_state(&self, entry: &[u8]) -> bool {
        self.state.contains(entry)
    }

    /// Removes redundant state entries before encoding.
    ///
    /// The only redundancy a producer can introduce without changing the
    /// witness's meaning is the empty string, which proves nothing.
    pub fn optimize(&mut self) {
        self.state.remove(&Vec::new());
    }
}

//! Block header type as carried inside execution witnesses.
//!
//! A witness proves the state reads of one block against the ancestor
//! headers it ships alongside. The exchange layer treats headers as opaque
//! payload; only the RLP encoding and the header hash matter here.

use crate::{Error, Result, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

/// A block header.
///
/// Carries the fields a stateless validator needs to anchor a witness:
/// position in the chain, the parent link, and the state commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block height (0-indexed, genesis is height 0)
    pub height: u64,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Hash of the parent block (NIL for genesis)
    pub parent_hash: H256,
    /// Merkle root of the world state after executing this block
    pub state_root: H256,
    /// Maximum gas allowed in this block
    pub gas_limit: u64,
    /// Total gas used by all transactions in this block
    pub gas_used: u64,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            height: 0,
            timestamp: 0,
            parent_hash: H256::NIL,
            state_root: H256::NIL,
            gas_limit: 30_000_000,
            gas_used: 0,
        }
    }
}

impl BlockHeader {
    /// Creates a new block header at the given position.
    pub fn new(height: u64, parent_hash: H256) -> Self {
        Self {
            height,
            parent_hash,
            ..Default::default()
        }
    }

    /// Computes the hash of this block header.
    ///
    /// The hash is the Keccak256 of the RLP-encoded header.
    pub fn hash(&self) -> H256 {
        H256::keccak256(&self.rlp_encode())
    }

    /// RLP encodes the header.
    pub fn rlp_encode(&self) -> Vec<u8> {
        let mut stream = RlpStream::new();
        self.rlp_append(&mut stream);
        stream.out().to_vec()
    }

    /// Decodes a header from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        Self::decode(&rlp).map_err(Error::RlpDecode)
    }
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.height);
        s.append(&self.timestamp);
        s.append(&self.parent_hash);
        s.append(&self.state_root);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if !rlp.is_list() {
            return Err(DecoderError::RlpExpectedToBeList);
        }
        if rlp.item_count()? != 6 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            height: rlp.val_at(0)?,
            timestamp: rlp.val_at(1)?,
            parent_hash: rlp.val_at(2)?,
            state_root: rlp.val_at(3)?,
            gas_limit: rlp.val_at(4)?,
            gas_used: rlp.val_at(5)?,
        })
    }
}

//! Canonical-chain bookkeeping: the number-to-hash table and the
//! head/safe/finalized pointer triple.
//!
//! All accessors go through this explicit handle rather than free
//! functions; the forkchoice engine is the single writer, serialized by its
//! update permit.

use stele_kv::{
    tables::{CanonicalHeaders, HeaderNumbers, Headers},
    DatabaseError, DbTx, DbTxMut,
};
use stele_primitives::{BlockHash, BlockNumber, Header, B256};

stele_kv::tables! {
    /// The forkchoice pointer triple, keyed by label.
    table ForkchoicePointers<Key = &'static str, Value = BlockHash>;
}

const HEAD: &str = "head";
const SAFE: &str = "safe";
const FINALIZED: &str = "finalized";

/// The head/safe/finalized triple.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForkchoiceState {
    /// Requested canonical head.
    pub head: BlockHash,
    /// Safe block hash; zero when unset.
    pub safe: BlockHash,
    /// Finalized block hash; zero when unset.
    pub finalized: BlockHash,
}

/// Handle over the canonical-chain tables of one transaction.
#[derive(Debug)]
pub struct CanonicalChain<'a, TX> {
    tx: &'a mut TX,
}

impl<'a, TX: DbTxMut> CanonicalChain<'a, TX> {
    /// Wraps a transaction.
    pub fn new(tx: &'a mut TX) -> Self {
        Self { tx }
    }

    /// The canonical hash at `number`.
    pub fn canonical_hash(&self, number: BlockNumber) -> Result<Option<BlockHash>, DatabaseError> {
        self.tx.get::<CanonicalHeaders>(&number)
    }

    /// Whether `hash` is canonical at `number`.
    pub fn is_canonical(&self, hash: BlockHash, number: BlockNumber) -> Result<bool, DatabaseError> {
        Ok(self.canonical_hash(number)? == Some(hash))
    }

    /// The header for `hash`, if known.
    pub fn header(&self, hash: BlockHash) -> Result<Option<Header>, DatabaseError> {
        self.tx.get::<Headers>(&hash)
    }

    /// The block number of `hash`, if known.
    pub fn header_number(&self, hash: BlockHash) -> Result<Option<BlockNumber>, DatabaseError> {
        self.tx.get::<HeaderNumbers>(&hash)
    }

    /// The current head pointer.
    pub fn head(&self) -> Result<Option<BlockHash>, DatabaseError> {
        self.tx.get::<ForkchoicePointers>(&HEAD)
    }

    /// Marks `hash` canonical at `number`.
    pub fn mark_canonical(
        &mut self,
        number: BlockNumber,
        hash: BlockHash,
    ) -> Result<(), DatabaseError> {
        self.tx.put::<CanonicalHeaders>(number, hash)
    }

    /// Removes canonical markers above `number`.
    pub fn truncate_above(&mut self, number: BlockNumber) -> Result<(), DatabaseError> {
        self.tx.delete_range::<CanonicalHeaders>(number + 1..)
    }

    /// Records the pointer triple. Zero safe/finalized hashes leave the
    /// previous pointers in place.
    pub fn write_pointers(&mut self, state: ForkchoiceState) -> Result<(), DatabaseError> {
        self.tx.put::<ForkchoicePointers>(HEAD, state.head)?;
        if state.safe != B256::ZERO {
            self.tx.put::<ForkchoicePointers>(SAFE, state.safe)?;
        }
        if state.finalized != B256::ZERO {
            self.tx.put::<ForkchoicePointers>(FINALIZED, state.finalized)?;
        }
        Ok(())
    }
}

/// Reads the pointer triple from a read-only transaction.
pub fn read_pointers<TX: DbTx>(tx: &TX) -> Result<ForkchoiceState, DatabaseError> {
    Ok(ForkchoiceState {
        head: tx.get::<ForkchoicePointers>(&HEAD)?.unwrap_or_default(),
        safe: tx.get::<ForkchoicePointers>(&SAFE)?.unwrap_or_default(),
        finalized: tx.get::<ForkchoicePointers>(&FINALIZED)?.unwrap_or_default(),
    })
}

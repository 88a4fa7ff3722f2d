use crate::{bloom::Bloom, transaction::Transaction, BlockHash, BlockNumber};
use alloy_primitives::{keccak256, Address, B256};
use alloy_rlp::{Encodable, RlpEncodable};

/// A block header, reduced to the fields the execution and forkchoice
/// machinery consumes.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Header {
    /// Hash of the parent block header.
    pub parent_hash: BlockHash,
    /// Fee recipient.
    pub beneficiary: Address,
    /// Root of the world state after executing this block.
    pub state_root: B256,
    /// Root of the trie of this block's receipts.
    pub receipts_root: B256,
    /// Union of the blooms of all receipts in this block.
    pub logs_bloom: Bloom,
    /// Block height.
    pub number: BlockNumber,
    /// Gas limit for the block.
    pub gas_limit: u64,
    /// Total gas used by all transactions in the block.
    pub gas_used: u64,
    /// Unix timestamp.
    pub timestamp: u64,
}

impl Header {
    /// Computes the header hash. Prefer [`SealedHeader`] to avoid repeated
    /// hashing.
    pub fn hash_slow(&self) -> BlockHash {
        let mut buf = Vec::with_capacity(self.length());
        self.encode(&mut buf);
        keccak256(buf)
    }

    /// Seals the header, memoizing its hash.
    pub fn seal_slow(self) -> SealedHeader {
        let hash = self.hash_slow();
        SealedHeader { header: self, hash }
    }
}

/// A [`Header`] together with its memoized hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SealedHeader {
    /// The sealed header.
    pub header: Header,
    /// The header hash.
    pub hash: BlockHash,
}

impl SealedHeader {
    /// Block height shorthand.
    pub fn number(&self) -> BlockNumber {
        self.header.number
    }
}

impl std::ops::Deref for SealedHeader {
    type Target = Header;

    fn deref(&self) -> &Self::Target {
        &self.header
    }
}

/// A validator withdrawal processed at block finalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Withdrawal {
    /// Monotonic withdrawal index.
    pub index: u64,
    /// Index of the withdrawing validator.
    pub validator_index: u64,
    /// Recipient of the withdrawn amount.
    pub address: Address,
    /// Amount in gwei.
    pub amount_gwei: u64,
}

/// Transactions and withdrawals of a block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockBody {
    /// Transactions in execution order.
    pub transactions: Vec<Transaction>,
    /// Withdrawals applied at finalization.
    pub withdrawals: Vec<Withdrawal>,
}

/// A complete block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Block {
    /// Block header.
    pub header: Header,
    /// Block body.
    pub body: BlockBody,
}

impl Block {
    /// Seals the block, memoizing the header hash.
    pub fn seal_slow(self) -> SealedBlock {
        SealedBlock { header: self.header.seal_slow(), body: self.body }
    }
}

/// A block whose header hash has been computed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SealedBlock {
    /// Sealed header.
    pub header: SealedHeader,
    /// Block body.
    pub body: BlockBody,
}

impl SealedBlock {
    /// The block hash.
    pub fn hash(&self) -> BlockHash {
        self.header.hash
    }

    /// The block height.
    pub fn number(&self) -> BlockNumber {
        self.header.number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_header_hash_matches_slow_path() {
        let header = Header { number: 7, gas_limit: 30_000_000, ..Default::default() };
        let hash = header.hash_slow();
        let sealed = header.seal_slow();
        assert_eq!(sealed.hash, hash);
        assert_eq!(sealed.number(), 7);
    }

    #[test]
    fn distinct_headers_hash_differently() {
        let a = Header { number: 1, ..Default::default() };
        let b = Header { number: 2, ..Default::default() };
        assert_ne!(a.hash_slow(), b.hash_slow());
    }
}

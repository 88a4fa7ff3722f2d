use crate::{
    bloom::{logs_bloom, Bloom},
    log::Log,
    BlockHash, BlockNumber,
};
use alloy_primitives::{Address, B256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};

/// Version discriminant of the current on-disk receipt layout.
///
/// Values below `0xc0` can never collide with the first byte of an RLP list,
/// which is how pre-versioned records are recognized; see
/// [`Receipt::decode_storage`].
pub const RECEIPT_STORAGE_V1: u8 = 0x01;

/// The receipt produced by executing one transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Receipt {
    /// EIP-2718 transaction type; `0` for legacy.
    pub tx_type: u8,
    /// Post-Byzantium status: `true` if the transaction did not revert.
    pub success: bool,
    /// Gas used by this and all preceding transactions in the block.
    pub cumulative_gas_used: u64,
    /// Bloom filter over the receipt's logs.
    pub bloom: Bloom,
    /// Logs emitted by the transaction.
    pub logs: Vec<Log>,
    /// Hash of the originating transaction.
    pub tx_hash: B256,
    /// Address deployed by a creation transaction.
    pub contract_address: Option<Address>,
    /// Gas used by this transaction alone.
    pub gas_used: u64,
    /// Hash of the containing block.
    pub block_hash: BlockHash,
    /// Number of the containing block.
    pub block_number: BlockNumber,
    /// Index of the transaction within the block.
    pub transaction_index: u64,
}

/// Consensus fields of a receipt, the view hashed into the receipts root.
#[derive(RlpEncodable)]
struct ReceiptRlp<'a> {
    success: bool,
    cumulative_gas_used: u64,
    bloom: &'a Bloom,
    logs: &'a Vec<Log>,
}

/// Versioned storage layout. Bloom is recomputed from logs on load, block
/// context is re-derived from the table position.
#[derive(RlpEncodable)]
struct StorageReceiptRlp<'a> {
    tx_type: u8,
    success: bool,
    cumulative_gas_used: u64,
    tx_hash: B256,
    contract_address: Address,
    gas_used: u64,
    logs: &'a Vec<Log>,
}

#[derive(RlpDecodable)]
struct StorageReceiptRlpDecoded {
    tx_type: u8,
    success: bool,
    cumulative_gas_used: u64,
    tx_hash: B256,
    contract_address: Address,
    gas_used: u64,
    logs: Vec<Log>,
}

/// Legacy unversioned storage layout: the bare consensus triple. This is the
/// only pre-versioned format ever written; decoding anything else fails.
#[derive(RlpEncodable, RlpDecodable)]
struct LegacyStorageReceiptRlp {
    success: bool,
    cumulative_gas_used: u64,
    logs: Vec<Log>,
}

/// Failed to decode a stored receipt.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReceiptDecodeError {
    /// The version discriminant is not a known layout.
    #[error("unknown receipt storage version: {0}")]
    UnknownVersion(u8),
    /// The payload is not valid RLP for the indicated layout.
    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),
}

impl Receipt {
    /// Encodes the consensus view of the receipt, prefixed with the
    /// transaction type for non-legacy transactions (EIP-2718).
    ///
    /// This is the encoding hashed into the block's receipts root.
    pub fn encode_consensus(&self, out: &mut Vec<u8>) {
        if self.tx_type != 0 {
            out.push(self.tx_type);
        }
        ReceiptRlp {
            success: self.success,
            cumulative_gas_used: self.cumulative_gas_used,
            bloom: &self.bloom,
            logs: &self.logs,
        }
        .encode(out);
    }

    /// Encodes the storage view: a version discriminant followed by the
    /// current layout.
    pub fn encode_storage(&self, out: &mut Vec<u8>) {
        out.push(RECEIPT_STORAGE_V1);
        StorageReceiptRlp {
            tx_type: self.tx_type,
            success: self.success,
            cumulative_gas_used: self.cumulative_gas_used,
            tx_hash: self.tx_hash,
            contract_address: self.contract_address.unwrap_or_default(),
            gas_used: self.gas_used,
            logs: &self.logs,
        }
        .encode(out);
    }

    /// Decodes a stored receipt, reading the version discriminant first and
    /// falling back to the single legacy (unversioned) layout when the first
    /// byte is an RLP list prefix. Block context is supplied by the caller
    /// from the table position.
    pub fn decode_storage(
        mut buf: &[u8],
        block_hash: BlockHash,
        block_number: BlockNumber,
        transaction_index: u64,
    ) -> Result<Self, ReceiptDecodeError> {
        let version = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        let mut receipt = match version {
            RECEIPT_STORAGE_V1 => {
                buf = &buf[1..];
                let decoded = StorageReceiptRlpDecoded::decode(&mut buf)?;
                Self {
                    tx_type: decoded.tx_type,
                    success: decoded.success,
                    cumulative_gas_used: decoded.cumulative_gas_used,
                    tx_hash: decoded.tx_hash,
                    contract_address: (!decoded.contract_address.is_zero())
                        .then_some(decoded.contract_address),
                    gas_used: decoded.gas_used,
                    logs: decoded.logs,
                    ..Default::default()
                }
            }
            // An RLP list prefix means the record predates versioning.
            version if version >= 0xc0 => {
                let decoded = LegacyStorageReceiptRlp::decode(&mut buf)?;
                Self {
                    success: decoded.success,
                    cumulative_gas_used: decoded.cumulative_gas_used,
                    logs: decoded.logs,
                    ..Default::default()
                }
            }
            unknown => return Err(ReceiptDecodeError::UnknownVersion(unknown)),
        };
        receipt.bloom = logs_bloom(&receipt.logs);
        receipt.block_hash = block_hash;
        receipt.block_number = block_number;
        receipt.transaction_index = transaction_index;
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Bytes;

    fn sample_receipt() -> Receipt {
        let logs = vec![Log::new(
            Address::repeat_byte(0x42),
            vec![B256::repeat_byte(0x01)],
            Bytes::from_static(b"payload"),
        )];
        Receipt {
            tx_type: 2,
            success: true,
            cumulative_gas_used: 51_000,
            bloom: logs_bloom(&logs),
            logs,
            tx_hash: B256::repeat_byte(0xaa),
            contract_address: Some(Address::repeat_byte(0x77)),
            gas_used: 30_000,
            block_hash: B256::repeat_byte(0xbb),
            block_number: 12,
            transaction_index: 1,
        }
    }

    #[test]
    fn storage_roundtrip_versioned() {
        let receipt = sample_receipt();
        let mut buf = Vec::new();
        receipt.encode_storage(&mut buf);
        assert_eq!(buf[0], RECEIPT_STORAGE_V1);

        let decoded = Receipt::decode_storage(
            &buf,
            receipt.block_hash,
            receipt.block_number,
            receipt.transaction_index,
        )
        .unwrap();
        assert_eq!(decoded, receipt);
    }

    #[test]
    fn legacy_records_still_decode() {
        let receipt = sample_receipt();
        // A record written before versioning: the bare consensus triple.
        let mut buf = Vec::new();
        LegacyStorageReceiptRlp {
            success: receipt.success,
            cumulative_gas_used: receipt.cumulative_gas_used,
            logs: receipt.logs.clone(),
        }
        .encode(&mut buf);

        let decoded = Receipt::decode_storage(&buf, B256::ZERO, 12, 1).unwrap();
        assert!(decoded.success);
        assert_eq!(decoded.cumulative_gas_used, receipt.cumulative_gas_used);
        assert_eq!(decoded.logs, receipt.logs);
        // Bloom is recomputed, not stored.
        assert_eq!(decoded.bloom, receipt.bloom);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = Receipt::decode_storage(&[0x7f, 0x00], B256::ZERO, 0, 0).unwrap_err();
        assert_eq!(err, ReceiptDecodeError::UnknownVersion(0x7f));
    }

    #[test]
    fn consensus_encoding_is_typed() {
        let receipt = sample_receipt();
        let mut buf = Vec::new();
        receipt.encode_consensus(&mut buf);
        assert_eq!(buf[0], 2);

        let legacy = Receipt { tx_type: 0, ..receipt };
        let mut buf = Vec::new();
        legacy.encode_consensus(&mut buf);
        // Legacy receipts start straight at the RLP list prefix.
        assert!(buf[0] >= 0xc0);
    }
}

//! Roots of index-keyed tries (transactions, receipts, withdrawals).

use crate::{nibbles::Nibbles, structure::TrieBuilder};
use alloy_primitives::B256;
use alloy_rlp::Encodable;
use stele_primitives::Receipt;

/// Root hash of an ordered list, keyed by the RLP encoding of each item's
/// index. RLP-encoded indices do not sort in index order, so entries are
/// re-sorted by key bytes before being fed to the builder.
pub fn ordered_trie_root_with_encoder<T>(
    items: &[T],
    encode: impl Fn(&T, &mut Vec<u8>),
) -> B256 {
    let mut entries: Vec<(Vec<u8>, Vec<u8>)> = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut key = Vec::new();
            index.encode(&mut key);
            let mut value = Vec::new();
            encode(item, &mut value);
            (key, value)
        })
        .collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));

    let mut builder = TrieBuilder::new();
    for (key, value) in &entries {
        builder.add_leaf(Nibbles::unpack(key), value);
    }
    builder.root()
}

/// Root of the receipts trie for one block.
pub fn calculate_receipts_root(receipts: &[Receipt]) -> B256 {
    ordered_trie_root_with_encoder(receipts, |receipt, buf| receipt.encode_consensus(buf))
}

use alloy_primitives::{b256, B256};

/// Keccak-256 hash of the empty byte string, i.e. the code hash of an
/// account without code.
pub const KECCAK_EMPTY: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// Root hash of an empty trie: `keccak256(rlp(""))`.
pub const EMPTY_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Incarnation assigned to a contract account on first creation. Plain
/// (non-contract) accounts keep incarnation `0`.
pub const FIRST_INCARNATION: u64 = 1;

//! Reference trie-root implementations used to cross-check the builder.

use alloy_primitives::{keccak256, B256, U256};
use hash_db::Hasher;
use plain_hasher::PlainHasher;
use stele_primitives::{Account, TrieAccount};

/// Keccak-256 hasher for the `triehash` reference implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeccakHasher;

impl Hasher for KeccakHasher {
    type Out = B256;
    type StdHasher = PlainHasher;
    const LENGTH: usize = 32;

    fn hash(x: &[u8]) -> Self::Out {
        keccak256(x)
    }
}

/// Reference root over pre-hashed (or arbitrary) keys.
pub fn trie_root_prehashed<I, K, V>(iter: I) -> B256
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<[u8]> + Ord,
    V: AsRef<[u8]>,
{
    triehash::trie_root::<KeccakHasher, _, _, _>(iter)
}

/// Reference storage root over un-hashed slot keys.
pub fn storage_root<I>(storage: I) -> B256
where
    I: IntoIterator<Item = (B256, U256)>,
{
    trie_root_prehashed(
        storage
            .into_iter()
            .filter(|(_, value)| !value.is_zero())
            .map(|(slot, value)| (keccak256(slot), alloy_rlp::encode(value))),
    )
}

/// Reference state root over un-hashed addresses with storage.
pub fn state_root<I, S>(accounts: I) -> B256
where
    I: IntoIterator<Item = (alloy_primitives::Address, (Account, S))>,
    S: IntoIterator<Item = (B256, U256)>,
{
    trie_root_prehashed(accounts.into_iter().map(|(address, (account, storage))| {
        let storage_root = storage_root(storage);
        let account = TrieAccount::from_account_with_root(&account, storage_root);
        (keccak256(address), alloy_rlp::encode(account))
    }))
}

use crate::constants::{EMPTY_ROOT, KECCAK_EMPTY};
use alloy_primitives::{B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

/// An account in the versioned state store.
///
/// `incarnation` distinguishes successive lifetimes of a contract account at
/// the same address: it is bumped whenever contract storage is wiped
/// (self-destruct followed by re-creation), so storage entries recorded under
/// a prior incarnation can never be conflated with the new contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Account {
    /// Number of transactions sent from this account.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Keccak-256 hash of the account code; [`KECCAK_EMPTY`] if none.
    pub code_hash: B256,
    /// Root of the account's storage trie; [`EMPTY_ROOT`] if storage is
    /// empty. The authoritative value is recomputed by the trie, this copy
    /// is a cache of the last committed root.
    pub storage_root: B256,
    /// Lifetime counter for contract storage, see type docs.
    pub incarnation: u64,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            code_hash: KECCAK_EMPTY,
            storage_root: EMPTY_ROOT,
            incarnation: 0,
        }
    }
}

impl Account {
    /// Returns `true` if the account has deployed code.
    pub fn has_code(&self) -> bool {
        self.code_hash != KECCAK_EMPTY
    }

    /// EIP-161 "empty" rule: no code, no storage, zero nonce and balance.
    /// Empty accounts are pruned from state when touched.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 &&
            self.balance.is_zero() &&
            self.code_hash == KECCAK_EMPTY &&
            self.storage_root == EMPTY_ROOT
    }
}

/// The four-field RLP view of an account that is hashed into the account
/// trie: `(nonce, balance, storage_root, code_hash)`.
///
/// Incarnation is a storage-layer concern and is never part of the trie
/// encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TrieAccount {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: B256,
    /// Hash of the account code.
    pub code_hash: B256,
}

impl TrieAccount {
    /// Builds the trie view of `account` with a freshly computed storage
    /// root.
    pub fn from_account_with_root(account: &Account, storage_root: B256) -> Self {
        Self {
            nonce: account.nonce,
            balance: account.balance,
            storage_root,
            code_hash: account.code_hash,
        }
    }
}

impl From<&Account> for TrieAccount {
    fn from(account: &Account) -> Self {
        Self::from_account_with_root(account, account.storage_root)
    }
}

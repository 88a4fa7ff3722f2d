//! State and storage root computation, full and incremental.

use crate::{
    hashed_cursor::{HashedAccountCursor, HashedStorageCursor},
    nibbles::Nibbles,
    prefix_set::{PrefixSet, PrefixSetMut, TriePrefixSets},
    structure::TrieBuilder,
    trie_cursor::{AccountTrieCursor, StorageTrieCursor},
    updates::TrieUpdates,
    walker::TrieWalker,
};
use alloy_primitives::{keccak256, Address, B256};
use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
};
use stele_kv::{
    tables::{AccountChangeSets, HashedAccounts, StorageChangeSets},
    DatabaseError, DbTx,
};
use stele_primitives::{BlockNumber, TrieAccount, EMPTY_ROOT};

/// State root computation failed.
#[derive(Debug, thiserror::Error)]
pub enum StateRootError {
    /// Database error during the walk.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Computes the root of the account trie, walking only the subtries whose
/// prefixes appear in the change sets.
#[derive(Debug)]
pub struct StateRoot<'a, TX> {
    tx: &'a TX,
    prefix_sets: TriePrefixSets,
}

impl<'a, TX: DbTx> StateRoot<'a, TX> {
    /// Creates a calculator that walks the full state.
    pub fn new(tx: &'a TX) -> Self {
        Self { tx, prefix_sets: TriePrefixSets::default() }
    }

    /// Restricts the walk to the given changed prefixes.
    pub fn with_prefix_sets(mut self, prefix_sets: TriePrefixSets) -> Self {
        self.prefix_sets = prefix_sets;
        self
    }

    /// Creates a calculator loaded with the prefixes changed in `range`.
    pub fn incremental_root_calculator(
        tx: &'a TX,
        range: RangeInclusive<BlockNumber>,
    ) -> Result<Self, StateRootError> {
        let prefix_sets = load_prefix_sets(tx, range)?;
        Ok(Self::new(tx).with_prefix_sets(prefix_sets))
    }

    /// Computes the new root after the state changes in `range`.
    pub fn incremental_root(
        tx: &'a TX,
        range: RangeInclusive<BlockNumber>,
    ) -> Result<B256, StateRootError> {
        tracing::debug!(target: "trie::state_root", ?range, "incremental state root");
        Self::incremental_root_calculator(tx, range)?.root()
    }

    /// Like [`incremental_root`](Self::incremental_root), also returning the
    /// stored-trie updates to flush.
    pub fn incremental_root_with_updates(
        tx: &'a TX,
        range: RangeInclusive<BlockNumber>,
    ) -> Result<(B256, TrieUpdates), StateRootError> {
        tracing::debug!(target: "trie::state_root", ?range, "incremental state root with updates");
        Self::incremental_root_calculator(tx, range)?.root_with_updates()
    }

    /// Computes the root.
    pub fn root(self) -> Result<B256, StateRootError> {
        let (root, _) = self.calculate(false)?;
        Ok(root)
    }

    /// Computes the root and the retained stored-trie updates.
    pub fn root_with_updates(self) -> Result<(B256, TrieUpdates), StateRootError> {
        self.calculate(true)
    }

    fn calculate(self, retain_updates: bool) -> Result<(B256, TrieUpdates), StateRootError> {
        tracing::debug!(target: "trie::state_root", retain_updates, "calculating state root");
        let mut trie_updates = TrieUpdates::default();

        // Stored storage tries of destroyed accounts are wiped; their owner
        // no longer appears in the hashed state.
        if retain_updates {
            for hashed_address in &self.prefix_sets.destroyed_accounts {
                trie_updates.schedule_storage_wipe(*hashed_address);
            }
        }

        let mut hashed_account_cursor = HashedAccountCursor::new(self.tx);
        let mut trie_cursor = AccountTrieCursor::new(self.tx);
        let mut walker =
            TrieWalker::new(&mut trie_cursor, self.prefix_sets.account_prefix_set.clone())?
                .with_updates(retain_updates);
        let mut builder = TrieBuilder::new().with_updates(retain_updates);

        while let Some(key) = walker.key() {
            if walker.can_skip_current_node {
                let hash = walker.hash().expect("skippable node has a hash");
                builder.add_branch(key.clone(), hash, walker.children_are_in_trie());
            }

            let Some(seek_key) = walker.next_unprocessed_key() else { break };
            let next_key = walker.advance()?;

            let mut entry = hashed_account_cursor.seek(seek_key)?;
            while let Some((hashed_address, account)) = entry {
                let account_nibbles = Nibbles::unpack(hashed_address);
                if let Some(next) = &next_key {
                    if *next < account_nibbles {
                        break;
                    }
                }

                let storage_prefix_set = self
                    .prefix_sets
                    .storage_prefix_sets
                    .get(&hashed_address)
                    .cloned()
                    .unwrap_or_default();
                let storage_root_calculator =
                    StorageRoot::new_hashed(self.tx, hashed_address)
                        .with_prefix_set(storage_prefix_set);

                let storage_root = if retain_updates {
                    let (root, updates) = storage_root_calculator.root_with_updates()?;
                    trie_updates.extend(updates.into_iter());
                    root
                } else {
                    storage_root_calculator.root()?
                };

                builder.add_account(
                    account_nibbles,
                    TrieAccount::from_account_with_root(&account, storage_root),
                    account.incarnation,
                );

                entry = hashed_account_cursor.next()?;
            }
        }

        let root = builder.root();

        trie_updates.extend(walker.take_updates().into_iter());
        trie_updates.extend_with_account_updates(builder.take_updates());

        Ok((root, trie_updates))
    }
}

/// Storage root computation failed.
#[derive(Debug, thiserror::Error)]
pub enum StorageRootError {
    /// Database error during the walk.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<StorageRootError> for StateRootError {
    fn from(error: StorageRootError) -> Self {
        match error {
            StorageRootError::Database(error) => Self::Database(error),
        }
    }
}

/// Computes the storage root of one account.
#[derive(Debug)]
pub struct StorageRoot<'a, TX> {
    tx: &'a TX,
    hashed_address: B256,
    prefix_set: PrefixSet,
}

impl<'a, TX: DbTx> StorageRoot<'a, TX> {
    /// Creates a calculator for `address`'s storage.
    pub fn new(tx: &'a TX, address: Address) -> Self {
        Self::new_hashed(tx, keccak256(address))
    }

    /// Creates a calculator for a pre-hashed owner address.
    pub fn new_hashed(tx: &'a TX, hashed_address: B256) -> Self {
        Self { tx, hashed_address, prefix_set: PrefixSet::default() }
    }

    /// Restricts the walk to the given changed slot prefixes.
    pub fn with_prefix_set(mut self, prefix_set: PrefixSet) -> Self {
        self.prefix_set = prefix_set;
        self
    }

    /// Computes the storage root.
    pub fn root(&self) -> Result<B256, StorageRootError> {
        let (root, _) = self.calculate(false)?;
        Ok(root)
    }

    /// Computes the storage root and retained updates.
    pub fn root_with_updates(&self) -> Result<(B256, TrieUpdates), StorageRootError> {
        self.calculate(true)
    }

    fn calculate(&self, retain_updates: bool) -> Result<(B256, TrieUpdates), StorageRootError> {
        tracing::trace!(target: "trie::storage_root", hashed_address = ?self.hashed_address, "calculating storage root");

        let mut hashed_storage_cursor = HashedStorageCursor::new(self.tx, self.hashed_address);

        // Short circuit on empty storage.
        if hashed_storage_cursor.is_empty()? {
            let mut updates = TrieUpdates::default();
            updates.schedule_storage_wipe(self.hashed_address);
            return Ok((EMPTY_ROOT, updates));
        }

        let mut trie_cursor = StorageTrieCursor::new(self.tx, self.hashed_address);
        let mut walker = TrieWalker::new(&mut trie_cursor, self.prefix_set.clone())?
            .with_updates(retain_updates);
        let mut builder = TrieBuilder::new().with_updates(retain_updates);

        while let Some(key) = walker.key() {
            if walker.can_skip_current_node {
                let hash = walker.hash().expect("skippable node has a hash");
                builder.add_branch(key.clone(), hash, walker.children_are_in_trie());
            }

            let Some(seek_key) = walker.next_unprocessed_key() else { break };
            let next_key = walker.advance()?;

            let mut entry = hashed_storage_cursor.seek(seek_key)?;
            while let Some((hashed_slot, value)) = entry {
                let slot_nibbles = Nibbles::unpack(hashed_slot);
                if let Some(next) = &next_key {
                    if *next < slot_nibbles {
                        break;
                    }
                }
                builder.add_leaf(slot_nibbles, &alloy_rlp::encode(value));
                entry = hashed_storage_cursor.next()?;
            }
        }

        let root = builder.root();

        let mut trie_updates = TrieUpdates::default();
        trie_updates.extend(walker.take_updates().into_iter());
        trie_updates.extend_with_storage_updates(self.hashed_address, builder.take_updates());

        tracing::trace!(target: "trie::storage_root", ?root, hashed_address = ?self.hashed_address, "calculated storage root");
        Ok((root, trie_updates))
    }
}

/// Collects the account and storage prefixes changed within `range` from the
/// change-set tables, along with accounts destroyed in the range.
pub fn load_prefix_sets<TX: DbTx>(
    tx: &TX,
    range: RangeInclusive<BlockNumber>,
) -> Result<TriePrefixSets, DatabaseError> {
    let mut account_prefix_set = PrefixSetMut::default();
    let mut storage_prefix_sets: HashMap<B256, PrefixSetMut> = HashMap::new();
    let mut destroyed_accounts = HashSet::new();

    let account_range = (*range.start(), Address::ZERO)..=(*range.end(), Address::repeat_byte(0xff));
    for ((_, address), _) in tx.walk_range::<AccountChangeSets>(account_range)? {
        let hashed_address = keccak256(address);
        account_prefix_set.insert(Nibbles::unpack(hashed_address));

        if tx.get::<HashedAccounts>(&hashed_address)?.is_none() {
            destroyed_accounts.insert(hashed_address);
        }
    }

    let storage_range = (*range.start(), Address::ZERO, B256::ZERO)..=(
        *range.end(),
        Address::repeat_byte(0xff),
        B256::repeat_byte(0xff),
    );
    for ((_, address, slot), _) in tx.walk_range::<StorageChangeSets>(storage_range)? {
        let hashed_address = keccak256(address);
        account_prefix_set.insert(Nibbles::unpack(hashed_address));
        storage_prefix_sets
            .entry(hashed_address)
            .or_default()
            .insert(Nibbles::unpack(keccak256(slot)));
    }

    Ok(TriePrefixSets {
        account_prefix_set: account_prefix_set.freeze(),
        storage_prefix_sets: storage_prefix_sets
            .into_iter()
            .map(|(address, set)| (address, set.freeze()))
            .collect(),
        destroyed_accounts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mask::TrieKey,
        test_utils::{state_root, storage_root, trie_root_prehashed},
        updates::TrieOp,
        TrieMask,
    };
    use alloy_primitives::{address, b256, U256};
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use stele_kv::{mem::MemDb, tables::HashedStorage, Database, DbTxMut};
    use stele_primitives::{Account, KECCAK_EMPTY};

    fn account_sets(prefixes: impl IntoIterator<Item = B256>) -> TriePrefixSets {
        let mut set = PrefixSetMut::default();
        for prefix in prefixes {
            set.insert(Nibbles::unpack(prefix));
        }
        TriePrefixSets { account_prefix_set: set.freeze(), ..Default::default() }
    }

    fn insert_account(
        tx: &mut impl DbTxMut,
        address: Address,
        account: Account,
        storage: &BTreeMap<B256, U256>,
    ) {
        let hashed_address = keccak256(address);
        tx.put::<HashedAccounts>(hashed_address, account).unwrap();
        insert_storage(tx, hashed_address, storage);
    }

    fn insert_storage(
        tx: &mut impl DbTxMut,
        hashed_address: B256,
        storage: &BTreeMap<B256, U256>,
    ) {
        for (slot, value) in storage {
            tx.put::<HashedStorage>((hashed_address, keccak256(slot)), *value).unwrap();
        }
    }

    fn encode_account(account: Account, storage_root: Option<B256>) -> Vec<u8> {
        let trie_account = TrieAccount::from_account_with_root(
            &account,
            storage_root.unwrap_or(EMPTY_ROOT),
        );
        alloy_rlp::encode(trie_account)
    }

    #[test]
    fn empty_storage_has_empty_root() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();

        let address = address!("16b07afd1c635f77172e842a000ead9a2a222459");
        insert_account(
            &mut tx,
            address,
            Account { nonce: 155, balance: U256::from(414241124u32), ..Default::default() },
            &Default::default(),
        );

        let got = StorageRoot::new(&tx, address).root().unwrap();
        assert_eq!(got, EMPTY_ROOT);
    }

    #[test]
    fn storage_root_matches_reference() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();

        let address = address!("16b07afd1c635f77172e842a000ead9a2a222459");
        let storage = BTreeMap::from([
            (B256::ZERO, U256::from(3)),
            (B256::with_last_byte(2), U256::from(1)),
        ]);
        insert_account(
            &mut tx,
            address,
            Account { nonce: 155, balance: U256::from(414241124u32), ..Default::default() },
            &storage,
        );

        let got = StorageRoot::new(&tx, address).root().unwrap();
        assert_eq!(got, storage_root(storage));
    }

    #[test]
    fn storage_root_regression() {
        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();
        // Some address whose hash starts with 0xB041.
        let address3 = address!("16b07afd1c635f77172e842a000ead9a2a222459");
        let key3 = keccak256(address3);
        assert_eq!(key3[0], 0xB0);
        assert_eq!(key3[1], 0x41);

        let storage = BTreeMap::from(
            [
                ("1200000000000000000000000000000000000000000000000000000000000000", 0x42u64),
                ("1400000000000000000000000000000000000000000000000000000000000000", 0x01),
                ("3000000000000000000000000000000000000000000000000000000000E00000", 0x127a89),
                ("3000000000000000000000000000000000000000000000000000000000E00001", 0x05),
            ]
            .map(|(slot, value)| (slot.parse::<B256>().unwrap(), U256::from(value))),
        );
        for (hashed_slot, value) in &storage {
            tx.put::<HashedStorage>((key3, *hashed_slot), *value).unwrap();
        }

        let got = StorageRoot::new(&tx, address3).root().unwrap();
        let expected = trie_root_prehashed(
            storage.iter().map(|(slot, value)| (*slot, alloy_rlp::encode(value))),
        );
        assert_eq!(got, expected);
    }

    #[test]
    fn incremental_vs_full_storage_root() {
        fn run(inputs: &[&str], modified: &str) {
            let db = MemDb::new();
            let mut tx = db.tx_mut().unwrap();
            let hashed_address = B256::with_last_byte(1);

            let value = U256::ZERO;
            for slot in inputs {
                let key = slot.parse::<B256>().unwrap();
                tx.put::<HashedStorage>((hashed_address, key), value).unwrap();
            }

            // Seed the stored intermediate nodes.
            let (_, trie_updates) =
                StorageRoot::new_hashed(&tx, hashed_address).root_with_updates().unwrap();
            trie_updates.flush(&mut tx).unwrap();

            // A state transition updates one slot.
            let modified_key = modified.parse::<B256>().unwrap();
            let value = U256::from(1);
            tx.put::<HashedStorage>((hashed_address, modified_key), value).unwrap();

            // Full recomputation vs incremental with the changed prefix.
            let full_root = StorageRoot::new_hashed(&tx, hashed_address).root().unwrap();

            let mut changes = PrefixSetMut::default();
            changes.insert(Nibbles::unpack(modified_key));
            let incremental_root = StorageRoot::new_hashed(&tx, hashed_address)
                .with_prefix_set(changes.freeze())
                .root()
                .unwrap();

            assert_eq!(full_root, incremental_root);
        }

        run(
            &[
                "1000000000000000000000000000000000000000000000000000000000000000",
                "1100000000000000000000000000000000000000000000000000000000000000",
                "1110000000000000000000000000000000000000000000000000000000000000",
                "1200000000000000000000000000000000000000000000000000000000000000",
                "1220000000000000000000000000000000000000000000000000000000000000",
                "1320000000000000000000000000000000000000000000000000000000000000",
            ],
            "1200000000000000000000000000000000000000000000000000000000000000",
        );
    }

    #[test]
    fn account_and_storage_trie() {
        let ether = U256::from(10u64).pow(U256::from(18));
        let storage = BTreeMap::from(
            [
                ("1200000000000000000000000000000000000000000000000000000000000000", 0x42u64),
                ("1400000000000000000000000000000000000000000000000000000000000000", 0x01),
                ("3000000000000000000000000000000000000000000000000000000000E00000", 0x127a89),
                ("3000000000000000000000000000000000000000000000000000000000E00001", 0x05),
            ]
            .map(|(slot, value)| (slot.parse::<B256>().unwrap(), U256::from(value))),
        );

        let db = MemDb::new();
        let mut tx = db.tx_mut().unwrap();

        let key1 =
            b256!("b000000000000000000000000000000000000000000000000000000000000000");
        let account1 = Account { nonce: 0, balance: U256::from(3) * ether, ..Default::default() };
        tx.put::<HashedAccounts>(key1, account1).unwrap();

        // Some address whose hash starts with 0xB040.
        let address2 = address!("7db3e81b72d2695e19764583f6d219dbee0f35ca");
        let key2 = keccak256(address2);
        assert_eq!(key2[0], 0xB0);
        assert_eq!(key2[1], 0x40);
        let account2 = Account { balance: ether, ..Default::default() };
        tx.put::<HashedAccounts>(key2, account2).unwrap();

        // Some address whose hash starts with 0xB041.
        let address3 = address!("16b07afd1c635f77172e842a000ead9a2a222459");
        let key3 = keccak256(address3);
        assert_eq!(key3[0], 0xB0);
        assert_eq!(key3[1], 0x41);
        let code_hash =
            b256!("5be74cad16203c4905c068b012a2e9fb6d19d036c410f16fd177f337541440dd");
        let account3 =
            Account { balance: U256::from(2) * ether, code_hash, ..Default::default() };
        tx.put::<HashedAccounts>(key3, account3).unwrap();
        for (hashed_slot, value) in &storage {
            tx.put::<HashedStorage>((key3, *hashed_slot), *value).unwrap();
        }
        let account3_storage_root = StorageRoot::new(&tx, address3).root().unwrap();

        let key4a =
            b256!("B1A0000000000000000000000000000000000000000000000000000000000000");
        let account4a = Account { balance: U256::from(4) * ether, ..Default::default() };
        tx.put::<HashedAccounts>(key4a, account4a).unwrap();

        let key5 =
            b256!("B310000000000000000000000000000000000000000000000000000000000000");
        let account5 = Account { balance: U256::from(8) * ether, ..Default::default() };
        tx.put::<HashedAccounts>(key5, account5).unwrap();

        let key6 =
            b256!("B340000000000000000000000000000000000000000000000000000000000000");
        let account6 = Account { balance: ether, ..Default::default() };
        tx.put::<HashedAccounts>(key6, account6).unwrap();

        let expected_root =
            b256!("72861041bc90cd2f93777956f058a545412b56de79af5eb6b8075fe2eabbe015");
        let computed_expected_root = trie_root_prehashed([
            (key1, encode_account(account1, None)),
            (key2, encode_account(account2, None)),
            (key3, encode_account(account3, Some(account3_storage_root))),
            (key4a, encode_account(account4a, None)),
            (key5, encode_account(account5, None)),
            (key6, encode_account(account6, None)),
        ]);
        assert_eq!(computed_expected_root, expected_root);

        let (root, trie_updates) = StateRoot::new(&tx).root_with_updates().unwrap();
        assert_eq!(root, expected_root);

        // Check the retained account nodes.
        let mut account_updates: Vec<_> = trie_updates
            .iter()
            .filter_map(|(key, op)| match (key, op) {
                (TrieKey::AccountNode(nibbles), TrieOp::Update(node)) => Some((nibbles, node)),
                _ => None,
            })
            .collect();
        account_updates.sort_unstable_by(|a, b| a.0.cmp(b.0));
        assert_eq!(account_updates.len(), 2);

        let (nibbles1a, node1a) = account_updates[0];
        assert_eq!(nibbles1a.as_slice(), [0xB]);
        assert_eq!(node1a.state_mask, TrieMask::new(0b1011));
        assert_eq!(node1a.tree_mask, TrieMask::new(0b0001));
        assert_eq!(node1a.hash_mask, TrieMask::new(0b1001));
        assert_eq!(node1a.root_hash, None);
        assert_eq!(node1a.hashes.len(), 2);

        let (nibbles2a, node2a) = account_updates[1];
        assert_eq!(nibbles2a.as_slice(), [0xB, 0x0]);
        assert_eq!(node2a.state_mask, TrieMask::new(0b10001));
        assert_eq!(node2a.tree_mask, TrieMask::new(0b00000));
        assert_eq!(node2a.hash_mask, TrieMask::new(0b10000));
        assert_eq!(node2a.root_hash, None);
        assert_eq!(node2a.hashes.len(), 1);

        // Check the retained storage nodes of account 3.
        let storage_updates: Vec<_> = trie_updates
            .iter()
            .filter_map(|(key, op)| match (key, op) {
                (TrieKey::StorageNode(_, nibbles), TrieOp::Update(node)) => {
                    Some((nibbles, node))
                }
                _ => None,
            })
            .collect();
        assert_eq!(storage_updates.len(), 1);

        let (nibbles3, node3) = storage_updates[0];
        assert!(nibbles3.is_empty());
        assert_eq!(node3.state_mask, TrieMask::new(0b1010));
        assert_eq!(node3.tree_mask, TrieMask::new(0b0000));
        assert_eq!(node3.hash_mask, TrieMask::new(0b0010));
        assert_eq!(node3.hashes.len(), 1);
        assert_eq!(node3.root_hash, Some(account3_storage_root));

        let node1a = node1a.clone();
        let node2a = node2a.clone();
        trie_updates.flush(&mut tx).unwrap();

        // Add an account whose hash shares the first byte with key4a.
        let address4b = address!("4f61f2d5ebd991b85aa1677db97307caf5215c91");
        let key4b = keccak256(address4b);
        assert_eq!(key4b.0[0], key4a.0[0]);
        let account4b = Account { balance: U256::from(5) * ether, ..Default::default() };
        tx.put::<HashedAccounts>(key4b, account4b).unwrap();

        let expected_state_root =
            b256!("8e263cd4eefb0c3cbbb14e5541a66a755cad25bcfab1e10dd9d706263e811b28");

        let (root, trie_updates) = StateRoot::new(&tx)
            .with_prefix_sets(account_sets([key4b]))
            .root_with_updates()
            .unwrap();
        assert_eq!(root, expected_state_root);

        let account_updates: Vec<_> = trie_updates
            .iter()
            .filter_map(|(key, op)| match (key, op) {
                (TrieKey::AccountNode(nibbles), TrieOp::Update(node)) => Some((nibbles, node)),
                _ => None,
            })
            .collect();
        // The subtree under [0xB, 0x0] was skipped via its recorded hash, so
        // only the top branch is re-stored.
        assert_eq!(account_updates.len(), 1);

        let (nibbles1b, node1b) = account_updates[0];
        assert_eq!(nibbles1b.as_slice(), [0xB]);
        assert_eq!(node1b.state_mask, TrieMask::new(0b1011));
        assert_eq!(node1b.tree_mask, TrieMask::new(0b0001));
        assert_eq!(node1b.hash_mask, TrieMask::new(0b1011));
        assert_eq!(node1b.root_hash, None);
        assert_eq!(node1b.hashes.len(), 3);
        assert_eq!(node1a.hashes[0], node1b.hashes[0]);
        assert_eq!(node1a.hashes[1], node1b.hashes[2]);
        let _ = node2a;

        let node1b = node1b.clone();
        drop(trie_updates);
        tx.commit().unwrap();

        // Delete account 2 and recompute incrementally.
        {
            let mut tx = db.tx_mut().unwrap();
            tx.delete::<HashedAccounts>(&key2).unwrap();

            let computed_expected_root = trie_root_prehashed([
                (key1, encode_account(account1, None)),
                // DELETED: key2
                (key3, encode_account(account3, Some(account3_storage_root))),
                (key4a, encode_account(account4a, None)),
                (key4b, encode_account(account4b, None)),
                (key5, encode_account(account5, None)),
                (key6, encode_account(account6, None)),
            ]);

            let (root, trie_updates) = StateRoot::new(&tx)
                .with_prefix_sets(account_sets([key2]))
                .root_with_updates()
                .unwrap();
            assert_eq!(root, computed_expected_root);
            assert_eq!(trie_updates.len(), 7);
            assert_eq!(trie_updates.iter().filter(|(_, op)| op.is_update()).count(), 2);

            let account_updates: Vec<_> = trie_updates
                .iter()
                .filter_map(|(key, op)| match (key, op) {
                    (TrieKey::AccountNode(nibbles), TrieOp::Update(node)) => {
                        Some((nibbles, node))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(account_updates.len(), 1);

            let (nibbles1c, node1c) = account_updates[0];
            assert_eq!(nibbles1c.as_slice(), [0xB]);
            assert_eq!(node1c.state_mask, TrieMask::new(0b1011));
            assert_eq!(node1c.tree_mask, TrieMask::new(0b0000));
            assert_eq!(node1c.hash_mask, TrieMask::new(0b1011));
            assert_eq!(node1c.root_hash, None);
            assert_eq!(node1c.hashes.len(), 3);
            assert_ne!(node1c.hashes[0], node1b.hashes[0]);
            assert_eq!(node1c.hashes[1], node1b.hashes[1]);
            assert_eq!(node1c.hashes[2], node1b.hashes[2]);
            // The transaction is dropped without committing.
        }

        // Delete accounts 2 and 3 and recompute incrementally.
        {
            let mut tx = db.tx_mut().unwrap();
            tx.delete::<HashedAccounts>(&key2).unwrap();
            tx.delete::<HashedAccounts>(&key3).unwrap();

            let computed_expected_root = trie_root_prehashed([
                (key1, encode_account(account1, None)),
                // DELETED: key2, key3
                (key4a, encode_account(account4a, None)),
                (key4b, encode_account(account4b, None)),
                (key5, encode_account(account5, None)),
                (key6, encode_account(account6, None)),
            ]);

            let (root, trie_updates) = StateRoot::new(&tx)
                .with_prefix_sets(account_sets([key2, key3]))
                .root_with_updates()
                .unwrap();
            assert_eq!(root, computed_expected_root);
            assert_eq!(trie_updates.len(), 6);
            // No storage root update this time.
            assert_eq!(trie_updates.iter().filter(|(_, op)| op.is_update()).count(), 1);

            let account_updates: Vec<_> = trie_updates
                .iter()
                .filter_map(|(key, op)| match (key, op) {
                    (TrieKey::AccountNode(nibbles), TrieOp::Update(node)) => {
                        Some((nibbles, node))
                    }
                    _ => None,
                })
                .collect();
            assert_eq!(account_updates.len(), 1);

            let (nibbles1d, node1d) = account_updates[0];
            assert_eq!(nibbles1d.as_slice(), [0xB]);
            assert_eq!(node1d.state_mask, TrieMask::new(0b1011));
            assert_eq!(node1d.tree_mask, TrieMask::new(0b0000));
            assert_eq!(node1d.hash_mask, TrieMask::new(0b1010));
            assert_eq!(node1d.root_hash, None);
            assert_eq!(node1d.hashes.len(), 2);
            assert_eq!(node1d.hashes[0], node1b.hashes[1]);
            assert_eq!(node1d.hashes[1], node1b.hashes[2]);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(10))]

        #[test]
        fn arbitrary_storage_root(
            address in any::<[u8; 20]>(),
            storage in proptest::collection::btree_map(any::<[u8; 32]>(), 1u64..u64::MAX, 0..20),
        ) {
            let address = Address::from(address);
            let storage: BTreeMap<B256, U256> = storage
                .into_iter()
                .map(|(slot, value)| (B256::from(slot), U256::from(value)))
                .collect();

            let db = MemDb::new();
            let mut tx = db.tx_mut().unwrap();
            let hashed_address = keccak256(address);
            for (slot, value) in &storage {
                tx.put::<HashedStorage>((hashed_address, keccak256(slot)), *value).unwrap();
            }

            let got = StorageRoot::new(&tx, address).root().unwrap();
            prop_assert_eq!(got, storage_root(storage));
        }

        #[test]
        fn arbitrary_state_root(
            state in proptest::collection::btree_map(
                any::<[u8; 20]>(),
                (
                    (any::<u64>(), any::<u64>()),
                    proptest::collection::btree_map(any::<[u8; 32]>(), 1u64..u64::MAX, 0..10),
                ),
                1..10,
            ),
        ) {
            let db = MemDb::new();
            let mut tx = db.tx_mut().unwrap();

            let mut expected_state = Vec::new();
            for (address, ((nonce, balance), storage)) in state {
                let address = Address::from(address);
                let account = Account {
                    nonce,
                    balance: U256::from(balance),
                    code_hash: KECCAK_EMPTY,
                    ..Default::default()
                };
                let storage: BTreeMap<B256, U256> = storage
                    .into_iter()
                    .map(|(slot, value)| (B256::from(slot), U256::from(value)))
                    .collect();
                insert_account(&mut tx, address, account, &storage);
                expected_state.push((address, (account, storage)));
            }

            let expected = state_root(expected_state);
            let got = StateRoot::new(&tx).root().unwrap();
            prop_assert_eq!(got, expected);
        }

        #[test]
        fn fuzz_state_root_incremental(
            account_changes in proptest::collection::vec(
                proptest::collection::btree_map(any::<[u8; 32]>(), 1u64..u64::MAX, 1..5),
                1..4,
            ),
        ) {
            let db = MemDb::new();
            let mut tx = db.tx_mut().unwrap();

            let mut state: BTreeMap<B256, u64> = BTreeMap::new();
            for accounts in account_changes {
                let should_generate_changeset = !state.is_empty();
                let mut changes = PrefixSetMut::default();
                for (hashed_address, balance) in &accounts {
                    let hashed_address = B256::from(*hashed_address);
                    tx.put::<HashedAccounts>(
                        hashed_address,
                        Account { balance: U256::from(*balance), ..Default::default() },
                    )
                    .unwrap();
                    if should_generate_changeset {
                        changes.insert(Nibbles::unpack(hashed_address));
                    }
                }

                let (state_root, trie_updates) = StateRoot::new(&tx)
                    .with_prefix_sets(TriePrefixSets {
                        account_prefix_set: changes.freeze(),
                        ..Default::default()
                    })
                    .root_with_updates()
                    .unwrap();

                state.extend(accounts.into_iter().map(|(key, balance)| (B256::from(key), balance)));
                let expected_root = trie_root_prehashed(state.iter().map(|(key, balance)| {
                    (
                        *key,
                        encode_account(
                            Account { balance: U256::from(*balance), ..Default::default() },
                            None,
                        ),
                    )
                }));
                prop_assert_eq!(expected_root, state_root);
                trie_updates.flush(&mut tx).unwrap();
            }
        }
    }
}

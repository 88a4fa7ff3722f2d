use alloy_primitives::{Address, B256, U256};
use std::collections::BTreeMap;
use stele_kv::{
    tables::{AccountChangeSets, StorageBefore, StorageChangeSets},
    DatabaseError, DbTxMut,
};
use stele_primitives::{Account, BlockNumber};

/// Records the pre-images of one block's state mutations.
///
/// Only the first touch of a key within the block is recorded: replaying
/// the set restores the state exactly as it was before the block.
#[derive(Debug)]
pub struct ChangeSetWriter {
    block_number: BlockNumber,
    accounts: BTreeMap<Address, Option<Account>>,
    storage: BTreeMap<(Address, B256), StorageBefore>,
}

impl ChangeSetWriter {
    /// Creates a writer for `block_number`.
    pub fn new(block_number: BlockNumber) -> Self {
        Self { block_number, accounts: BTreeMap::new(), storage: BTreeMap::new() }
    }

    /// The block this writer records for.
    pub fn block_number(&self) -> BlockNumber {
        self.block_number
    }

    /// Records an account pre-image; `None` marks an account that did not
    /// exist.
    pub fn record_account(&mut self, address: Address, before: Option<Account>) {
        self.accounts.entry(address).or_insert(before);
    }

    /// Records a storage slot pre-image under the incarnation it was
    /// written at.
    pub fn record_storage(
        &mut self,
        address: Address,
        incarnation: u64,
        slot: B256,
        before: U256,
    ) {
        self.storage
            .entry((address, slot))
            .or_insert(StorageBefore { incarnation, value: before });
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.accounts.len() + self.storage.len()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.storage.is_empty()
    }

    /// Persists the recorded pre-images into the change-set tables.
    pub fn write(self, tx: &mut impl DbTxMut) -> Result<(), DatabaseError> {
        tracing::trace!(
            target: "state::changeset",
            block = self.block_number,
            accounts = self.accounts.len(),
            storage = self.storage.len(),
            "writing change set",
        );
        for (address, before) in self.accounts {
            tx.put::<AccountChangeSets>((self.block_number, address), before)?;
        }
        for ((address, slot), before) in self.storage {
            tx.put::<StorageChangeSets>((self.block_number, address, slot), before)?;
        }
        Ok(())
    }
}

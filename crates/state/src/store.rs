use crate::changeset::ChangeSetWriter;
use alloy_primitives::{keccak256, Address, B256, U256};
use stele_kv::{
    tables::{Bytecodes, HashedAccounts, HashedStorage, IncarnationMap, PlainAccounts, PlainStorage},
    DatabaseError, DbTxMut,
};
use stele_primitives::{Account, BlockNumber, FIRST_INCARNATION};

/// Read/write access to the world state with optional change-set recording.
///
/// Reads observe all writes made earlier through the same store
/// (read-your-writes within a block). Writes keep the keccak-keyed tables
/// consumed by the trie in sync with the plain tables.
#[derive(Debug)]
pub struct StateStore<'a, TX> {
    tx: &'a mut TX,
    changes: Option<ChangeSetWriter>,
}

impl<'a, TX: DbTxMut> StateStore<'a, TX> {
    /// Creates a store without change-set recording.
    pub fn new(tx: &'a mut TX) -> Self {
        Self { tx, changes: None }
    }

    /// Creates a store recording pre-images for `block_number`.
    pub fn with_changeset(tx: &'a mut TX, block_number: BlockNumber) -> Self {
        Self { tx, changes: Some(ChangeSetWriter::new(block_number)) }
    }

    /// The underlying transaction.
    pub fn tx(&mut self) -> &mut TX {
        self.tx
    }

    /// Reads an account. Absence is not an error: callers interpret it as
    /// the empty account per protocol rules.
    pub fn read_account(&self, address: Address) -> Result<Option<Account>, DatabaseError> {
        self.tx.get::<PlainAccounts>(&address)
    }

    /// Reads a storage slot under the given incarnation; absent slots read
    /// as zero.
    pub fn read_storage(
        &self,
        address: Address,
        incarnation: u64,
        slot: B256,
    ) -> Result<U256, DatabaseError> {
        Ok(self.tx.get::<PlainStorage>(&(address, incarnation, slot))?.unwrap_or_default())
    }

    /// Reads contract code by hash.
    pub fn read_code(&self, code_hash: B256) -> Result<Option<Vec<u8>>, DatabaseError> {
        self.tx.get::<Bytecodes>(&code_hash)
    }

    /// The incarnation a contract re-created at `address` must use.
    pub fn next_incarnation(&self, address: Address) -> Result<u64, DatabaseError> {
        Ok(match self.tx.get::<IncarnationMap>(&address)? {
            Some(previous) => previous + 1,
            None => FIRST_INCARNATION,
        })
    }

    /// Writes an account, recording its pre-image.
    pub fn write_account(&mut self, address: Address, account: Account) -> Result<(), DatabaseError> {
        let before = self.read_account(address)?;
        if let Some(changes) = self.changes.as_mut() {
            changes.record_account(address, before);
        }
        self.tx.put::<PlainAccounts>(address, account)?;
        self.tx.put::<HashedAccounts>(keccak256(address), account)?;
        Ok(())
    }

    /// Stores contract code under its hash.
    pub fn write_code(&mut self, code: Vec<u8>) -> Result<B256, DatabaseError> {
        let code_hash = keccak256(&code);
        self.tx.put::<Bytecodes>(code_hash, code)?;
        Ok(code_hash)
    }

    /// Writes a storage slot, recording its pre-image. Zero values delete
    /// the entry: a zero slot is indistinguishable from an absent one.
    pub fn write_storage(
        &mut self,
        address: Address,
        incarnation: u64,
        slot: B256,
        value: U256,
    ) -> Result<(), DatabaseError> {
        let before = self.read_storage(address, incarnation, slot)?;
        if before == value {
            return Ok(());
        }
        if let Some(changes) = self.changes.as_mut() {
            changes.record_storage(address, incarnation, slot, before);
        }

        let hashed_key = (keccak256(address), keccak256(slot));
        if value.is_zero() {
            self.tx.delete::<PlainStorage>(&(address, incarnation, slot))?;
            self.tx.delete::<HashedStorage>(&hashed_key)?;
        } else {
            self.tx.put::<PlainStorage>((address, incarnation, slot), value)?;
            self.tx.put::<HashedStorage>(hashed_key, value)?;
        }
        Ok(())
    }

    /// Deletes an account and wipes its storage, recording every pre-image.
    /// Contract deletions bump the incarnation map so stale storage is
    /// unreachable if the address is re-created.
    pub fn delete_account(&mut self, address: Address) -> Result<(), DatabaseError> {
        let Some(before) = self.read_account(address)? else { return Ok(()) };
        if let Some(changes) = self.changes.as_mut() {
            changes.record_account(address, Some(before));
        }

        // Record and remove the live storage of the current incarnation.
        let range = (address, before.incarnation, B256::ZERO)..=(
            address,
            before.incarnation,
            B256::repeat_byte(0xff),
        );
        for ((_, incarnation, slot), value) in self.tx.walk_range::<PlainStorage>(range.clone())? {
            if let Some(changes) = self.changes.as_mut() {
                changes.record_storage(address, incarnation, slot, value);
            }
        }
        self.tx.delete_range::<PlainStorage>(range)?;

        let hashed_address = keccak256(address);
        self.tx.delete::<PlainAccounts>(&address)?;
        self.tx.delete::<HashedAccounts>(&hashed_address)?;
        self.tx.delete_range::<HashedStorage>(
            (hashed_address, B256::ZERO)..=(hashed_address, B256::repeat_byte(0xff)),
        )?;

        if before.incarnation >= FIRST_INCARNATION {
            self.tx.put::<IncarnationMap>(address, before.incarnation)?;
        }
        Ok(())
    }

    /// Finishes the block, persisting the recorded change set.
    pub fn finish(self) -> Result<(), DatabaseError> {
        if let Some(changes) = self.changes {
            changes.write(self.tx)?;
        }
        Ok(())
    }
}

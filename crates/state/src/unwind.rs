use alloy_primitives::{keccak256, Address, B256};
use stele_kv::{
    tables::{AccountChangeSets, HashedAccounts, HashedStorage, PlainAccounts, PlainStorage, StorageChangeSets},
    DatabaseError, DbTxMut,
};
use stele_primitives::BlockNumber;

/// Reverts the plain and hashed state back to how it was at the end of
/// block `unwind_to` by replaying change sets of blocks
/// `unwind_to + 1 ..= tip` in reverse order, then truncates the replayed
/// change sets.
///
/// The caller owns truncation of receipts and canonical markers.
pub fn unwind_state(
    tx: &mut impl DbTxMut,
    tip: BlockNumber,
    unwind_to: BlockNumber,
) -> Result<(), DatabaseError> {
    if unwind_to >= tip {
        return Ok(());
    }
    tracing::debug!(target: "state::unwind", tip, unwind_to, "unwinding state");

    for block_number in (unwind_to + 1..=tip).rev() {
        let account_range =
            (block_number, Address::ZERO)..=(block_number, Address::repeat_byte(0xff));
        for ((_, address), before) in tx.walk_range::<AccountChangeSets>(account_range)? {
            let hashed_address = keccak256(address);
            match before {
                Some(account) => {
                    tx.put::<PlainAccounts>(address, account)?;
                    tx.put::<HashedAccounts>(hashed_address, account)?;
                }
                None => {
                    tx.delete::<PlainAccounts>(&address)?;
                    tx.delete::<HashedAccounts>(&hashed_address)?;
                    tx.delete_range::<HashedStorage>(
                        (hashed_address, B256::ZERO)..=(hashed_address, B256::repeat_byte(0xff)),
                    )?;
                }
            }
        }

        let storage_range = (block_number, Address::ZERO, B256::ZERO)..=(
            block_number,
            Address::repeat_byte(0xff),
            B256::repeat_byte(0xff),
        );
        for ((_, address, slot), before) in tx.walk_range::<StorageChangeSets>(storage_range)? {
            let plain_key = (address, before.incarnation, slot);
            let hashed_key = (keccak256(address), keccak256(slot));
            if before.value.is_zero() {
                tx.delete::<PlainStorage>(&plain_key)?;
                tx.delete::<HashedStorage>(&hashed_key)?;
            } else {
                tx.put::<PlainStorage>(plain_key, before.value)?;
                tx.put::<HashedStorage>(hashed_key, before.value)?;
            }
        }
    }

    // Truncate the replayed change sets.
    tx.delete_range::<AccountChangeSets>(
        (unwind_to + 1, Address::ZERO)..=(tip, Address::repeat_byte(0xff)),
    )?;
    tx.delete_range::<StorageChangeSets>(
        (unwind_to + 1, Address::ZERO, B256::ZERO)..=(
            tip,
            Address::repeat_byte(0xff),
            B256::repeat_byte(0xff),
        ),
    )?;

    Ok(())
}

//! Chain-building helpers shared by stage and engine tests.

use alloy_primitives::{Address, U256};
use stele_executor::{
    test_utils::{TestEvm, TEST_TX_GAS},
    BeaconConsensus, BlockExecutor, EvmFactory, NoSystemCall, SpuriousDragonRule,
};
use stele_kv::{
    mem::MemDb,
    tables::{BlockBodies, CanonicalHeaders, HeaderNumbers, Headers},
    Database, DbTxMut,
};
use stele_primitives::{
    Account, Block, BlockBody, Bloom, Header, SealedBlock, SealedHeader, Transaction,
};
use stele_state::StateStore;
use stele_trie::{proofs::calculate_receipts_root, StateRoot};

/// Gas limit used by all test blocks.
pub const TEST_GAS_LIMIT: u64 = 1_000_000;

/// Builds a consistent chain: executes the given per-block transaction
/// lists on a scratch database and assembles headers whose state root,
/// receipts root, bloom and gas usage match the execution outcome.
///
/// `gas_of` must mirror the configured [`TestEvm`] gas charges.
pub fn build_chain(
    genesis_accounts: &[(Address, u64)],
    blocks_txs: Vec<Vec<Transaction>>,
    evm: &TestEvm,
    gas_of: impl Fn(&Transaction) -> u64,
) -> (SealedHeader, Vec<SealedBlock>) {
    let db = MemDb::new();
    let genesis_header = {
        let mut tx = db.tx_mut().unwrap();
        seed_genesis_state(&mut tx, genesis_accounts);
        let state_root = StateRoot::new(&tx).root().unwrap();
        tx.commit().unwrap();
        Header { number: 0, gas_limit: TEST_GAS_LIMIT, state_root, ..Default::default() }
            .seal_slow()
    };

    let mut parent = genesis_header.clone();
    let mut blocks = Vec::with_capacity(blocks_txs.len());
    for (offset, transactions) in blocks_txs.into_iter().enumerate() {
        let number = offset as u64 + 1;
        let gas_used = transactions.iter().map(&gas_of).sum();

        // Execute against a provisional header first; the commitment fields
        // do not influence execution.
        let provisional = Block {
            header: Header {
                number,
                parent_hash: parent.hash,
                timestamp: number,
                gas_limit: TEST_GAS_LIMIT,
                gas_used,
                ..Default::default()
            },
            body: BlockBody { transactions, withdrawals: vec![] },
        }
        .seal_slow();

        let mut tx = db.tx_mut().unwrap();
        let engine = BeaconConsensus::default();
        let mut executor = BlockExecutor::new(
            StateStore::with_changeset(&mut tx, number),
            evm.create(),
            NoSystemCall,
            &engine,
            &SpuriousDragonRule,
        );
        let receipts = executor.execute_block(&provisional).expect("builder block must execute");
        executor.finish().unwrap();

        let (state_root, updates) =
            StateRoot::incremental_root_with_updates(&tx, number..=number).unwrap();
        updates.flush(&mut tx).unwrap();
        tx.commit().unwrap();

        let mut logs_bloom = Bloom::default();
        for receipt in &receipts {
            logs_bloom.accrue_bloom(&receipt.bloom);
        }

        let sealed = Block {
            header: Header {
                state_root,
                receipts_root: calculate_receipts_root(&receipts),
                logs_bloom,
                ..provisional.header.header
            },
            body: provisional.body,
        }
        .seal_slow();
        parent = sealed.header.clone();
        blocks.push(sealed);
    }

    (genesis_header, blocks)
}

/// Writes genesis accounts into the plain and hashed state tables.
pub fn seed_genesis_state(tx: &mut impl DbTxMut, accounts: &[(Address, u64)]) {
    let mut store = StateStore::new(tx);
    for (address, balance) in accounts {
        store
            .write_account(
                *address,
                Account { balance: U256::from(*balance), ..Default::default() },
            )
            .unwrap();
    }
}

/// Inserts a header (and body) into the lookup tables, optionally marking
/// it canonical.
pub fn insert_block(tx: &mut impl DbTxMut, block: &SealedBlock, canonical: bool) {
    tx.put::<Headers>(block.hash(), block.header.header.clone()).unwrap();
    tx.put::<HeaderNumbers>(block.hash(), block.number()).unwrap();
    tx.put::<BlockBodies>(block.hash(), block.body.clone()).unwrap();
    if canonical {
        tx.put::<CanonicalHeaders>(block.number(), block.hash()).unwrap();
    }
}

/// Seeds a database with genesis state plus a chain of blocks, all marked
/// canonical.
pub fn seed_chain(
    db: &MemDb,
    genesis_accounts: &[(Address, u64)],
    genesis_header: &SealedHeader,
    blocks: &[SealedBlock],
) {
    let mut tx = db.tx_mut().unwrap();
    seed_genesis_state(&mut tx, genesis_accounts);
    tx.put::<Headers>(genesis_header.hash, genesis_header.header.clone()).unwrap();
    tx.put::<HeaderNumbers>(genesis_header.hash, 0).unwrap();
    tx.put::<BlockBodies>(genesis_header.hash, BlockBody::default()).unwrap();
    tx.put::<CanonicalHeaders>(0, genesis_header.hash).unwrap();
    for block in blocks {
        insert_block(&mut tx, block, true);
    }
    tx.commit().unwrap();
}

/// A plain transfer with the default test gas.
pub fn transfer(from: Address, nonce: u64, to: Address, value: u64) -> Transaction {
    Transaction {
        tx_type: 0,
        from,
        to: stele_primitives::TxKind::Call(to),
        nonce,
        gas_limit: TEST_TX_GAS,
        value: U256::from(value),
        input: Default::default(),
    }
}

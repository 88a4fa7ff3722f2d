//! The staged execution pipeline.
//!
//! Stages own one concern each — executing transactions, committing the
//! trie — and run serially through the [`Pipeline`], each persisting its
//! own checkpoint. Unwinds run in reverse, replaying change sets so the
//! forkchoice engine can move the canonical chain atomically.

mod error;
mod execution;
mod id;
mod merkle;
mod pipeline;
mod stage;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{DatabaseIntegrityError, StageError};
pub use execution::ExecutionStage;
pub use id::{StageId, EXECUTION, MERKLE};
pub use merkle::MerkleStage;
pub use pipeline::Pipeline;
pub use stage::{ExecInput, ExecOutput, Stage, UnwindInput, UnwindOutput};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_chain, seed_chain, transfer};
    use alloy_primitives::{Address, U256};
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use stele_executor::{
        test_utils::{TestEvm, TEST_TX_GAS},
        BeaconConsensus, BlockValidationError, NoSystemCall, SpuriousDragonRule,
    };
    use stele_kv::{
        mem::MemDb,
        tables::{PlainAccounts, Receipts},
        Database, DbTx, DbTxMut,
    };
    use stele_primitives::{Block, Receipt, SealedBlock};
    use stele_trie::StateRoot;

    fn pipeline<TX: DbTxMut + Sync + 'static>(evm: TestEvm) -> Pipeline<TX> {
        Pipeline::new()
            .push(ExecutionStage::new(
                evm,
                NoSystemCall,
                Arc::new(BeaconConsensus::default()),
                Arc::new(SpuriousDragonRule),
            ))
            .push(MerkleStage)
    }

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    fn bob() -> Address {
        Address::repeat_byte(0xb0)
    }

    #[tokio::test]
    async fn pipeline_executes_and_validates_chain() {
        let genesis_accounts = [(alice(), 1_000u64)];
        let evm = TestEvm::new();
        let (genesis, blocks) = build_chain(
            &genesis_accounts,
            vec![
                vec![transfer(alice(), 0, bob(), 100)],
                vec![transfer(alice(), 1, bob(), 50), transfer(bob(), 0, alice(), 25)],
                vec![],
            ],
            &evm,
            |_| TEST_TX_GAS,
        );

        let db = MemDb::new();
        seed_chain(&db, &genesis_accounts, &genesis, &blocks);

        let mut tx = db.tx_mut().unwrap();
        let mut pipeline = pipeline(evm);
        pipeline.run(&mut tx, 3).await.unwrap();
        tx.commit().unwrap();

        let tx = db.tx().unwrap();
        // Balances reflect all three blocks.
        let alice_account = tx.get::<PlainAccounts>(&alice()).unwrap().unwrap();
        assert_eq!(alice_account.balance, U256::from(1_000 - 100 - 50 + 25));
        assert_eq!(alice_account.nonce, 2);

        // Receipts were persisted and decode with correct cumulative gas.
        let stored = tx.walk_range::<Receipts>((2, 0)..=(2, u64::MAX)).unwrap();
        assert_eq!(stored.len(), 2);
        let receipt =
            Receipt::decode_storage(&stored[1].1, blocks[1].hash(), 2, 1).unwrap();
        assert_eq!(receipt.cumulative_gas_used, 2 * TEST_TX_GAS);

        // Checkpoints advanced for both stages.
        assert_eq!(tx.get::<stele_kv::tables::StageCheckpoints>(&EXECUTION.0).unwrap(), Some(3));
        assert_eq!(tx.get::<stele_kv::tables::StageCheckpoints>(&MERKLE.0).unwrap(), Some(3));
    }

    #[tokio::test]
    async fn unwind_restores_previous_state_root() {
        let genesis_accounts = [(alice(), 1_000u64)];
        let evm = TestEvm::new();
        let (genesis, blocks) = build_chain(
            &genesis_accounts,
            vec![
                vec![transfer(alice(), 0, bob(), 100)],
                vec![transfer(alice(), 1, bob(), 200)],
            ],
            &evm,
            |_| TEST_TX_GAS,
        );

        let db = MemDb::new();
        seed_chain(&db, &genesis_accounts, &genesis, &blocks);

        let mut tx = db.tx_mut().unwrap();
        let mut pipeline = pipeline(evm);
        pipeline.run(&mut tx, 2).await.unwrap();

        // Unwind block 2; the state must match block 1's committed root.
        pipeline.unwind(&mut tx, 1, None).await.unwrap();
        assert_eq!(StateRoot::new(&tx).root().unwrap(), blocks[0].header.state_root);

        // Receipts beyond the unwind point are truncated.
        assert!(tx.walk_range::<Receipts>((2, 0)..=(2, u64::MAX)).unwrap().is_empty());

        // The pipeline can replay forward to the same tip.
        pipeline.run(&mut tx, 2).await.unwrap();
        assert_eq!(StateRoot::new(&tx).root().unwrap(), blocks[1].header.state_root);
    }

    #[tokio::test]
    async fn state_root_mismatch_is_consensus_invalid() {
        let genesis_accounts = [(alice(), 1_000u64)];
        let evm = TestEvm::new();
        let (genesis, mut blocks) = build_chain(
            &genesis_accounts,
            vec![vec![transfer(alice(), 0, bob(), 100)]],
            &evm,
            |_| TEST_TX_GAS,
        );

        // Corrupt the declared state root.
        let mut header = blocks[0].header.header.clone();
        header.state_root = alloy_primitives::B256::repeat_byte(0xde);
        blocks[0] = Block { header, body: blocks[0].body.clone() }.seal_slow();

        let db = MemDb::new();
        seed_chain(&db, &genesis_accounts, &genesis, &blocks);

        let mut tx = db.tx_mut().unwrap();
        let mut pipeline = pipeline(evm);
        let err = pipeline.run(&mut tx, 1).await.unwrap_err();
        assert_matches!(
            err,
            StageError::Validation {
                block: 1,
                error: BlockValidationError::StateRootMismatch { .. },
            }
        );
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn missing_block_is_an_integrity_error() {
        let db = MemDb::new();
        // Nothing seeded: the canonical hash for block 1 is missing.
        let mut tx = db.tx_mut().unwrap();
        let mut pipeline = pipeline(TestEvm::new());
        let err = pipeline.run(&mut tx, 1).await.unwrap_err();
        assert_matches!(
            err,
            StageError::Integrity(DatabaseIntegrityError::CanonicalHash { number: 1 })
        );
    }

    #[tokio::test]
    async fn parallel_execution_stage_produces_identical_state() {
        let genesis_accounts = [(alice(), 1_000u64), (bob(), 500u64)];
        let evm = TestEvm::new();
        let txs = vec![
            transfer(alice(), 0, bob(), 100),
            transfer(bob(), 0, alice(), 30),
            transfer(alice(), 1, bob(), 10),
        ];
        let (genesis, blocks) =
            build_chain(&genesis_accounts, vec![txs], &evm, |_| TEST_TX_GAS);

        let run = |parallel: bool| {
            let evm = evm.clone();
            let genesis = genesis.clone();
            let blocks: Vec<SealedBlock> = blocks.clone();
            let genesis_accounts = genesis_accounts;
            async move {
                let db = MemDb::new();
                seed_chain(&db, &genesis_accounts, &genesis, &blocks);
                let mut tx = db.tx_mut().unwrap();
                let execution = ExecutionStage::new(
                    evm,
                    NoSystemCall,
                    Arc::new(BeaconConsensus::default()),
                    Arc::new(SpuriousDragonRule),
                );
                let execution =
                    if parallel { execution.with_parallel_workers(4) } else { execution };
                let mut pipeline = Pipeline::new().push(execution).push(MerkleStage);
                pipeline.run(&mut tx, 1).await.unwrap();
                tx.commit().unwrap();
                let tx = db.tx().unwrap();
                tx.walk_range::<PlainAccounts>(..).unwrap()
            }
        };

        let sequential = run(false).await;
        let parallel = run(true).await;
        assert_eq!(sequential, parallel);
    }
}

//! Block validation.
//!
//! - **Structural** ([`validate_block_structure`]): context-free checks on the
//!   block body plus the PoW check against the header's own claimed
//!   difficulty.
//! - **Contextual** ([`validate_block`]): header linkage, expected difficulty,
//!   the median-time-past and future-drift timestamp rules, per-transaction
//!   stateful validation against a block-local UTXO overlay (so later
//!   transactions may spend earlier ones' outputs), intra-block double-spend
//!   detection, certificate effects, and the coinbase value ceiling.
//!
//! The genesis block is not validated through this module; the chain manager
//! accepts only the exact genesis constant at height 0.

use std::collections::{HashMap, HashSet};

use crate::certificate::CertificateRegistry;
use crate::constants::{MAX_BLOCK_SIZE, MAX_FUTURE_DRIFT, MAX_TXS_PER_BLOCK};
use crate::error::{BlockError, TransactionError};
use crate::merkle;
use crate::types::{Block, CoinState, Hash256, TxKind, UtxoEntry, UtxoKey};
use crate::validation;

/// Context the chain state provides for full block validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockContext {
    /// Height the block must claim.
    pub height: u64,
    /// Required previous block hash.
    pub prev_hash: Hash256,
    /// Median of the last 11 block timestamps on this branch.
    pub median_time_past: i64,
    /// Difficulty the retarget schedule demands at this height.
    pub expected_difficulty: u32,
    /// Wall-clock time, for the future-drift rule.
    pub current_time: i64,
    /// Base subsidy at this height.
    pub subsidy: u64,
}

/// Summary of a successfully validated block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedBlock {
    /// Sum of all non-coinbase transaction fees.
    pub total_fees: u64,
    /// Total value claimed by the coinbase outputs.
    pub coinbase_value: u64,
}

/// Median of the last up-to-11 timestamps, newest last.
///
/// A block's timestamp must be strictly greater than this value.
pub fn median_time_past(timestamps: &[i64]) -> i64 {
    debug_assert!(!timestamps.is_empty());
    let mut window = timestamps.to_vec();
    window.sort_unstable();
    window[window.len() / 2]
}

/// Validate block structure (context-free).
pub fn validate_block_structure(block: &Block) -> Result<(), BlockError> {
    // --- Coinbase position ---

    if block.transactions.is_empty() {
        return Err(BlockError::NoCoinbase);
    }
    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::FirstTxNotCoinbase);
    }

    // --- Count limit ---

    if block.transactions.len() > MAX_TXS_PER_BLOCK {
        return Err(BlockError::TooManyTransactions {
            count: block.transactions.len(),
            max: MAX_TXS_PER_BLOCK,
        });
    }

    // --- Per-transaction stateless checks, single coinbase ---

    for (i, tx) in block.transactions.iter().enumerate() {
        if i > 0 && tx.is_coinbase() {
            return Err(BlockError::MultipleCoinbase);
        }
        validation::validate_transaction_stateless(tx)
            .map_err(|source| BlockError::Transaction { index: i, source })?;
    }

    // --- Unique txids and merkle root ---

    let mut txids = Vec::with_capacity(block.transactions.len());
    let mut seen = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        let txid = tx.txid();
        if !seen.insert(txid) {
            return Err(BlockError::DuplicateTxid(txid.to_string()));
        }
        txids.push(txid);
    }
    if block.header.merkle_root != merkle::merkle_root(&txids) {
        return Err(BlockError::InvalidMerkleRoot);
    }

    // --- Size limit ---

    let size = block.size();
    if size > MAX_BLOCK_SIZE {
        return Err(BlockError::OversizedBlock { size, max: MAX_BLOCK_SIZE });
    }

    // --- PoW against the header's own claim ---

    if !block.header.meets_difficulty() {
        return Err(BlockError::InvalidPoW);
    }

    Ok(())
}

/// Validate a block against the chain state (contextual).
///
/// `get_utxo` resolves outpoints from the state *before* this block; outputs
/// created by earlier transactions in the block are visible to later ones
/// through an internal overlay. `registry` is the certificate registry at the
/// parent tip; the block's certificate effects are staged on a scratch copy.
pub fn validate_block<F>(
    block: &Block,
    context: &BlockContext,
    get_utxo: F,
    registry: &CertificateRegistry,
) -> Result<ValidatedBlock, BlockError>
where
    F: Fn(&UtxoKey) -> Option<UtxoEntry>,
{
    validate_block_structure(block)?;

    // --- Header linkage ---

    if block.header.height != context.height {
        return Err(BlockError::HeightMismatch {
            expected: context.height,
            got: block.header.height,
        });
    }
    if block.header.prev_hash != context.prev_hash {
        return Err(BlockError::InvalidPrevHash);
    }

    // --- Timestamp rules ---

    if block.header.timestamp <= context.median_time_past {
        return Err(BlockError::TimestampNotAfterMedian {
            got: block.header.timestamp,
            median: context.median_time_past,
        });
    }
    let drift = block.header.timestamp - context.current_time;
    if drift > MAX_FUTURE_DRIFT {
        return Err(BlockError::TimestampTooFar(drift));
    }

    // --- Difficulty schedule ---

    if block.header.difficulty != context.expected_difficulty {
        return Err(BlockError::InvalidDifficulty {
            got: block.header.difficulty,
            expected: context.expected_difficulty,
        });
    }

    // --- Transactions against a block-local overlay ---

    let mut spent: HashSet<UtxoKey> = HashSet::new();
    let mut created: HashMap<UtxoKey, UtxoEntry> = HashMap::new();
    let mut scratch = registry.clone();
    let mut total_fees: u64 = 0;

    for (i, tx) in block.transactions.iter().enumerate().skip(1) {
        // Intra-block double-spends are detected here; the overlay lookup
        // below would otherwise report them as unknown UTXOs.
        for input in &tx.inputs {
            if spent.contains(&input.previous_output) {
                return Err(BlockError::DoubleSpend(input.previous_output.to_string()));
            }
        }

        let validated = validation::validate_transaction(
            tx,
            |key| {
                if spent.contains(key) {
                    return None;
                }
                created.get(key).cloned().or_else(|| get_utxo(key))
            },
            &scratch,
            context.height,
        )
        .map_err(|source| BlockError::Transaction { index: i, source })?;

        total_fees = total_fees
            .checked_add(validated.fee)
            .ok_or(BlockError::Transaction {
                index: i,
                source: TransactionError::ValueOverflow,
            })?;

        // Stage this transaction's effects for the rest of the block.
        for input in &tx.inputs {
            spent.insert(input.previous_output);
        }
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            created.insert(
                UtxoKey::new(txid, index as u32),
                UtxoEntry {
                    output: output.clone(),
                    height: context.height,
                    is_coinbase: false,
                },
            );
        }
        stage_certificate_effects(tx, &mut scratch)
            .map_err(|source| BlockError::Transaction { index: i, source })?;
    }

    // --- Coinbase value ceiling ---

    let coinbase = &block.transactions[0];
    let coinbase_value = coinbase
        .total_output_amount()
        .ok_or(BlockError::Transaction {
            index: 0,
            source: TransactionError::ValueOverflow,
        })?;
    let max_value = context
        .subsidy
        .checked_add(total_fees)
        .ok_or(BlockError::SupplyExceeded)?;
    if coinbase_value > max_value {
        return Err(BlockError::InvalidSubsidy {
            got: coinbase_value,
            expected: max_value,
        });
    }

    Ok(ValidatedBlock {
        total_fees,
        coinbase_value,
    })
}

/// Apply a transaction's certificate effects to a registry.
///
/// Shared by block validation (on a scratch copy) and block application
/// (on the authoritative registry).
pub fn stage_certificate_effects(
    tx: &crate::types::Transaction,
    registry: &mut CertificateRegistry,
) -> Result<(), TransactionError> {
    match &tx.kind {
        TxKind::Coinbase | TxKind::Transfer => Ok(()),
        TxKind::CertificateIssue(payload) => {
            registry.issue(payload, tx.timestamp).map_err(Into::into)
        }
        TxKind::CertificateAssign => {
            let (id, amount) = assign_delta(tx);
            registry.assign(id, amount).map_err(Into::into)
        }
        TxKind::Compensation => {
            let (id, amount) = compensation_delta(tx);
            registry.compensate(id, amount).map_err(Into::into)
        }
    }
}

/// Certificate id and total certified amount created by an assignment.
///
/// Callers must have validated the transaction's shape first.
pub fn assign_delta(tx: &crate::types::Transaction) -> (&crate::types::CertificateId, u64) {
    let amount = tx
        .outputs
        .iter()
        .filter(|o| o.coin_state == CoinState::Certified)
        .map(|o| o.amount)
        .sum();
    let id = tx
        .outputs
        .iter()
        .find(|o| o.coin_state == CoinState::Certified)
        .and_then(|o| o.certificate_id.as_ref())
        .expect("validated assignment carries a tagged certified output");
    (id, amount)
}

/// Certificate id and burned amount of a compensation.
///
/// Callers must have validated the transaction's shape first.
pub fn compensation_delta(tx: &crate::types::Transaction) -> (&crate::types::CertificateId, u64) {
    let burn = tx
        .outputs
        .iter()
        .find(|o| o.coin_state == CoinState::Compensated)
        .expect("validated compensation carries one burn output");
    let id = burn
        .certificate_id
        .as_ref()
        .expect("validated burn output carries its certificate id");
    (id, burn.amount)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Address, Network};
    use crate::constants::{COIN, MIN_DIFFICULTY};
    use crate::crypto::{self, KeyPair};
    use crate::subsidy;
    use crate::types::{Transaction, TxInput, TxOutput};

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn keypair(seed: u8) -> KeyPair {
        KeyPair::from_secret_bytes([seed.max(1); 32]).unwrap()
    }

    fn addr_of(kp: &KeyPair) -> Address {
        kp.address(Network::Mainnet)
    }

    fn make_coinbase(value: u64, recipient: Address, height: u64) -> Transaction {
        Transaction {
            kind: TxKind::Coinbase,
            inputs: vec![],
            outputs: vec![TxOutput {
                metadata: Some(format!("height:{height}")),
                ..TxOutput::plain(value, recipient)
            }],
            timestamp: 1_750_000_000 + height as i64 * 600,
        }
    }

    /// Build a block with a correct merkle root. Difficulty 0 keeps PoW
    /// trivially satisfied for tests that are not about PoW.
    fn make_block(
        height: u64,
        prev_hash: Hash256,
        timestamp: i64,
        txs: Vec<Transaction>,
    ) -> Block {
        let txids: Vec<Hash256> = txs.iter().map(|tx| tx.txid()).collect();
        Block {
            header: crate::types::BlockHeader {
                height,
                prev_hash,
                merkle_root: merkle::merkle_root(&txids),
                timestamp,
                difficulty: 0,
                nonce: 0,
            },
            transactions: txs,
        }
    }

    fn context(height: u64, prev_hash: Hash256) -> BlockContext {
        BlockContext {
            height,
            prev_hash,
            median_time_past: 1_750_000_000,
            expected_difficulty: 0,
            current_time: 1_760_000_000,
            subsidy: subsidy::block_subsidy(height),
        }
    }

    fn no_utxos(_key: &UtxoKey) -> Option<UtxoEntry> {
        None
    }

    // ------------------------------------------------------------------
    // median_time_past
    // ------------------------------------------------------------------

    #[test]
    fn median_of_eleven() {
        let timestamps: Vec<i64> = (0..11).map(|i| 1000 + i * 10).collect();
        assert_eq!(median_time_past(&timestamps), 1050);
    }

    #[test]
    fn median_of_one() {
        assert_eq!(median_time_past(&[42]), 42);
    }

    #[test]
    fn median_is_order_independent() {
        let mut timestamps: Vec<i64> = (0..11).map(|i| 1000 + i * 10).collect();
        timestamps.reverse();
        assert_eq!(median_time_past(&timestamps), 1050);
    }

    // ------------------------------------------------------------------
    // Structure
    // ------------------------------------------------------------------

    #[test]
    fn empty_block_rejected() {
        let block = make_block(1, Hash256::ZERO, 1_750_000_600, vec![]);
        assert_eq!(validate_block_structure(&block), Err(BlockError::NoCoinbase));
    }

    #[test]
    fn first_tx_must_be_coinbase() {
        let kp = keypair(1);
        let tx = Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput::unsigned(UtxoKey::new(Hash256([1; 32]), 0))],
            outputs: vec![TxOutput::plain(1, addr_of(&kp))],
            timestamp: 0,
        };
        let block = make_block(1, Hash256::ZERO, 1_750_000_600, vec![tx]);
        assert_eq!(
            validate_block_structure(&block),
            Err(BlockError::FirstTxNotCoinbase),
        );
    }

    #[test]
    fn second_coinbase_rejected() {
        let kp = keypair(1);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![
                make_coinbase(50 * COIN, addr_of(&kp), 1),
                make_coinbase(50 * COIN, addr_of(&kp), 2),
            ],
        );
        assert_eq!(
            validate_block_structure(&block),
            Err(BlockError::MultipleCoinbase),
        );
    }

    #[test]
    fn duplicate_txid_rejected() {
        let kp = keypair(1);
        let cb = make_coinbase(50 * COIN, addr_of(&kp), 1);
        let mut tx = Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput::unsigned(UtxoKey::new(Hash256([1; 32]), 0))],
            outputs: vec![TxOutput::plain(1, addr_of(&kp))],
            timestamp: 5,
        };
        crypto::sign_transaction_input(&mut tx, 0, &kp).unwrap();
        let block = make_block(1, Hash256::ZERO, 1_750_000_600, vec![cb, tx.clone(), tx]);
        assert!(matches!(
            validate_block_structure(&block),
            Err(BlockError::DuplicateTxid(_)),
        ));
    }

    #[test]
    fn wrong_merkle_root_rejected() {
        let kp = keypair(1);
        let mut block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        block.header.merkle_root = Hash256([0xEE; 32]);
        assert_eq!(
            validate_block_structure(&block),
            Err(BlockError::InvalidMerkleRoot),
        );
    }

    #[test]
    fn insufficient_pow_rejected() {
        let kp = keypair(1);
        let mut block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        // Demand an absurd difficulty the zero nonce cannot meet.
        block.header.difficulty = 200;
        assert_eq!(validate_block_structure(&block), Err(BlockError::InvalidPoW));
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    #[test]
    fn coinbase_only_block_validates() {
        let kp = keypair(1);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        let validated =
            validate_block(&block, &context(1, Hash256::ZERO), no_utxos, &CertificateRegistry::new())
                .unwrap();
        assert_eq!(validated.total_fees, 0);
        assert_eq!(validated.coinbase_value, 50 * COIN);
    }

    #[test]
    fn wrong_height_rejected() {
        let kp = keypair(1);
        let block = make_block(
            2,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 2)],
        );
        assert_eq!(
            validate_block(&block, &context(1, Hash256::ZERO), no_utxos, &CertificateRegistry::new()),
            Err(BlockError::HeightMismatch { expected: 1, got: 2 }),
        );
    }

    #[test]
    fn wrong_prev_hash_rejected() {
        let kp = keypair(1);
        let block = make_block(
            1,
            Hash256([0x11; 32]),
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        assert_eq!(
            validate_block(&block, &context(1, Hash256::ZERO), no_utxos, &CertificateRegistry::new()),
            Err(BlockError::InvalidPrevHash),
        );
    }

    #[test]
    fn timestamp_at_median_rejected_median_plus_one_accepted() {
        let kp = keypair(1);
        let ctx = context(1, Hash256::ZERO);

        let at_median = make_block(
            1,
            Hash256::ZERO,
            ctx.median_time_past,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        assert!(matches!(
            validate_block(&at_median, &ctx, no_utxos, &CertificateRegistry::new()),
            Err(BlockError::TimestampNotAfterMedian { .. }),
        ));

        let after_median = make_block(
            1,
            Hash256::ZERO,
            ctx.median_time_past + 1,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        validate_block(&after_median, &ctx, no_utxos, &CertificateRegistry::new()).unwrap();
    }

    #[test]
    fn far_future_timestamp_rejected() {
        let kp = keypair(1);
        let ctx = context(1, Hash256::ZERO);
        let block = make_block(
            1,
            Hash256::ZERO,
            ctx.current_time + MAX_FUTURE_DRIFT + 1,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        assert!(matches!(
            validate_block(&block, &ctx, no_utxos, &CertificateRegistry::new()),
            Err(BlockError::TimestampTooFar(_)),
        ));
    }

    #[test]
    fn wrong_difficulty_rejected() {
        let kp = keypair(1);
        let mut ctx = context(1, Hash256::ZERO);
        ctx.expected_difficulty = MIN_DIFFICULTY;
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(50 * COIN, addr_of(&kp), 1)],
        );
        assert_eq!(
            validate_block(&block, &ctx, no_utxos, &CertificateRegistry::new()),
            Err(BlockError::InvalidDifficulty { got: 0, expected: MIN_DIFFICULTY }),
        );
    }

    #[test]
    fn coinbase_one_unit_over_rejected() {
        let kp = keypair(1);
        let ctx = context(1, Hash256::ZERO);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(ctx.subsidy + 1, addr_of(&kp), 1)],
        );
        assert_eq!(
            validate_block(&block, &ctx, no_utxos, &CertificateRegistry::new()),
            Err(BlockError::InvalidSubsidy { got: ctx.subsidy + 1, expected: ctx.subsidy }),
        );
    }

    // ------------------------------------------------------------------
    // Overlay behavior
    // ------------------------------------------------------------------

    /// Later transactions can spend outputs created earlier in the block,
    /// and the coinbase may claim their fees.
    #[test]
    fn intra_block_spend_allowed() {
        let alice = keypair(1);
        let bob = keypair(2);

        let funding = UtxoKey::new(Hash256([0x77; 32]), 0);
        let fund_entry = UtxoEntry {
            output: TxOutput::plain(100, addr_of(&alice)),
            height: 0,
            is_coinbase: false,
        };

        let mut first = Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput::unsigned(funding)],
            outputs: vec![TxOutput::plain(95, addr_of(&bob))],
            timestamp: 10,
        };
        crypto::sign_transaction_input(&mut first, 0, &alice).unwrap();
        let first_txid = first.txid();

        let mut second = Transaction {
            kind: TxKind::Transfer,
            inputs: vec![TxInput::unsigned(UtxoKey::new(first_txid, 0))],
            outputs: vec![TxOutput::plain(90, addr_of(&alice))],
            timestamp: 11,
        };
        crypto::sign_transaction_input(&mut second, 0, &bob).unwrap();

        let ctx = context(1, Hash256::ZERO);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![
                make_coinbase(ctx.subsidy + 10, addr_of(&alice), 1),
                first,
                second,
            ],
        );

        let validated = validate_block(
            &block,
            &ctx,
            |key| (*key == funding).then(|| fund_entry.clone()),
            &CertificateRegistry::new(),
        )
        .unwrap();
        assert_eq!(validated.total_fees, 10); // 5 + 5
    }

    #[test]
    fn intra_block_double_spend_rejected() {
        let alice = keypair(1);
        let funding = UtxoKey::new(Hash256([0x77; 32]), 0);
        let fund_entry = UtxoEntry {
            output: TxOutput::plain(100, addr_of(&alice)),
            height: 0,
            is_coinbase: false,
        };

        let mut spend = |amount: u64, ts: i64| {
            let mut tx = Transaction {
                kind: TxKind::Transfer,
                inputs: vec![TxInput::unsigned(funding)],
                outputs: vec![TxOutput::plain(amount, addr_of(&alice))],
                timestamp: ts,
            };
            crypto::sign_transaction_input(&mut tx, 0, &alice).unwrap();
            tx
        };

        let ctx = context(1, Hash256::ZERO);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![
                make_coinbase(ctx.subsidy, addr_of(&alice), 1),
                spend(90, 10),
                spend(80, 11),
            ],
        );

        assert!(matches!(
            validate_block(
                &block,
                &ctx,
                |key| (*key == funding).then(|| fund_entry.clone()),
                &CertificateRegistry::new(),
            ),
            Err(BlockError::DoubleSpend(_)),
        ));
    }

    /// A certificate issued earlier in the block is assignable later in the
    /// same block; issuing it twice in one block is rejected.
    #[test]
    fn intra_block_certificate_visibility() {
        let alice = keypair(1);
        let funding = UtxoKey::new(Hash256([0x77; 32]), 0);
        let fund_entry = UtxoEntry {
            output: TxOutput::plain(1000, addr_of(&alice)),
            height: 0,
            is_coinbase: false,
        };

        let payload = crate::types::CertificatePayload {
            certificate_id: crate::types::CertificateId::new("C1"),
            project_id: "kelp-1".into(),
            vintage_year: 2025,
            total_amount: 500,
            cert_type: "removal".into(),
            standard: "".into(),
            issuer: "".into(),
        };

        let mut issue = Transaction {
            kind: TxKind::CertificateIssue(payload.clone()),
            inputs: vec![TxInput::unsigned(funding)],
            outputs: vec![TxOutput::plain(1000, addr_of(&alice))],
            timestamp: 10,
        };
        crypto::sign_transaction_input(&mut issue, 0, &alice).unwrap();
        let issue_txid = issue.txid();

        let mut assign = Transaction {
            kind: TxKind::CertificateAssign,
            inputs: vec![TxInput::unsigned(UtxoKey::new(issue_txid, 0))],
            outputs: vec![TxOutput::certified(
                400,
                addr_of(&alice),
                crate::types::CertificateId::new("C1"),
            ),
            TxOutput::plain(600, addr_of(&alice))],
            timestamp: 11,
        };
        crypto::sign_transaction_input(&mut assign, 0, &alice).unwrap();

        let ctx = context(1, Hash256::ZERO);
        let block = make_block(
            1,
            Hash256::ZERO,
            1_750_000_600,
            vec![make_coinbase(ctx.subsidy, addr_of(&alice), 1), issue, assign],
        );

        validate_block(
            &block,
            &ctx,
            |key| (*key == funding).then(|| fund_entry.clone()),
            &CertificateRegistry::new(),
        )
        .unwrap();

        // The same issue landing in a registry that already has C1 fails.
        let mut registry = CertificateRegistry::new();
        registry.issue(&payload, 0).unwrap();
        assert!(matches!(
            validate_block(
                &block,
                &ctx,
                |key| (*key == funding).then(|| fund_entry.clone()),
                &registry,
            ),
            Err(BlockError::Transaction { .. }),
        ));
    }
}

//! Transaction validation.
//!
//! Two levels, mirroring how the chain consumes them:
//!
//! - **Stateless** ([`validate_transaction_stateless`]): shape and bounds
//!   checks that need no chain state.
//! - **Stateful** ([`validate_transaction`]): checks against the UTXO set and
//!   certificate registry at a given tip: input resolution, signatures,
//!   value conservation, coinbase maturity, and the per-kind certificate
//!   rules.
//!
//! Coinbase transactions are only statelessly validated here; their claimed
//! value is checked during block validation where fees are known.
//!
//! # Coin-state discipline
//!
//! Certified value may only move through the certificate lifecycle:
//! `Transfer` and `CertificateIssue` spend plain inputs and create plain
//! outputs; `CertificateAssign` converts plain value into certified outputs;
//! `Compensation` retires certified inputs into a single burn output, the
//! un-retired remainder returning as certified change under the same
//! certificate, with plain change covered entirely by plain inputs.

use std::collections::HashSet;

use crate::address::Network;
use crate::certificate::CertificateRegistry;
use crate::constants::{MAX_SUPPLY, MAX_TX_METADATA, MAX_TX_SIZE};
use crate::crypto;
use crate::error::{CertificateError, TransactionError};
use crate::types::{CoinState, Transaction, TxKind, UtxoEntry, UtxoKey};

/// Summary of a successfully validated transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    /// Total value of all spent inputs.
    pub total_input: u64,
    /// Total value of all created outputs.
    pub total_output: u64,
    /// Fee: `total_input - total_output`.
    pub fee: u64,
}

/// Validate a transaction's shape and bounds (no chain state).
///
/// Checks, in order:
/// - at least one output; non-coinbase has at least one input, coinbase none
/// - serialized size within [`MAX_TX_SIZE`]
/// - every amount and the output sum within `[0, MAX_SUPPLY]`
/// - no two inputs reference the same UTXO
/// - metadata fields within [`MAX_TX_METADATA`]
/// - output coin states consistent with the transaction kind, certificate
///   ids present exactly where required, burn outputs only on the sink
/// - `CertificateIssue` payload carries all required fields
pub fn validate_transaction_stateless(tx: &Transaction) -> Result<(), TransactionError> {
    // --- Cardinality ---

    if tx.outputs.is_empty() {
        return Err(TransactionError::EmptyOutputs);
    }
    if tx.is_coinbase() {
        if !tx.inputs.is_empty() {
            return Err(TransactionError::InvalidCoinbase(
                "coinbase carries no inputs".into(),
            ));
        }
    } else if tx.inputs.is_empty() {
        return Err(TransactionError::MissingInputs);
    }

    // --- Size ---

    let size = tx.size();
    if size > MAX_TX_SIZE {
        return Err(TransactionError::TxSizeExceeded { size, max: MAX_TX_SIZE });
    }

    // --- Amounts ---

    for (i, output) in tx.outputs.iter().enumerate() {
        if output.amount > MAX_SUPPLY {
            return Err(TransactionError::AmountOutOfRange(i));
        }
        if let Some(metadata) = &output.metadata {
            if metadata.len() > MAX_TX_METADATA {
                return Err(TransactionError::MetadataTooLarge(i));
            }
        }
    }
    let total = tx.total_output_amount().ok_or(TransactionError::ValueOverflow)?;
    if total > MAX_SUPPLY {
        return Err(TransactionError::ValueOverflow);
    }

    // --- Self-double-spend ---

    let mut seen: HashSet<&UtxoKey> = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(&input.previous_output) {
            return Err(TransactionError::DoubleSpend(
                input.previous_output.to_string(),
            ));
        }
    }

    // --- Output coin states per kind ---

    validate_output_shape(tx)?;

    // --- Certificate payload ---

    if let TxKind::CertificateIssue(payload) = &tx.kind {
        if payload.certificate_id.as_str().is_empty() {
            return Err(CertificateError::MissingField("certificate_id").into());
        }
        if payload.project_id.is_empty() {
            return Err(CertificateError::MissingField("project_id").into());
        }
        if payload.vintage_year == 0 {
            return Err(CertificateError::MissingField("vintage_year").into());
        }
        if payload.total_amount == 0 {
            return Err(CertificateError::MissingField("total_amount").into());
        }
        if payload.cert_type.is_empty() {
            return Err(CertificateError::MissingField("cert_type").into());
        }
    }

    Ok(())
}

/// Check output coin states and certificate tags against the kind.
fn validate_output_shape(tx: &Transaction) -> Result<(), TransactionError> {
    let kind = tx.kind.name();
    let shape = |reason: String| TransactionError::KindShape { kind, reason };

    // Per-output invariants that hold for every kind.
    for (i, output) in tx.outputs.iter().enumerate() {
        Network::from_address_version(output.address.version()).map_err(|_| {
            shape(format!("output {i} pays an address with an unknown version byte"))
        })?;
        match output.coin_state {
            CoinState::Plain => {
                if output.certificate_id.is_some() {
                    return Err(shape(format!("plain output {i} carries a certificate id")));
                }
                if output.address.is_burn() {
                    return Err(shape(format!("plain output {i} pays the burn sink")));
                }
            }
            CoinState::Certified => {
                if output.certificate_id.is_none() {
                    return Err(shape(format!("certified output {i} lacks a certificate id")));
                }
                if output.address.is_burn() {
                    return Err(shape(format!("certified output {i} pays the burn sink")));
                }
            }
            CoinState::Compensated => {
                if output.certificate_id.is_none() {
                    return Err(shape(format!("burn output {i} lacks a certificate id")));
                }
                if !output.address.is_burn() {
                    return Err(shape(format!("burn output {i} does not pay the burn sink")));
                }
            }
        }
    }

    let certified = tx
        .outputs
        .iter()
        .filter(|o| o.coin_state == CoinState::Certified)
        .count();
    let compensated = tx
        .outputs
        .iter()
        .filter(|o| o.coin_state == CoinState::Compensated)
        .count();

    match &tx.kind {
        TxKind::Coinbase | TxKind::Transfer | TxKind::CertificateIssue(_) => {
            if certified + compensated > 0 {
                return Err(shape("only plain outputs are allowed".into()));
            }
        }
        TxKind::CertificateAssign => {
            if certified == 0 {
                return Err(shape("no certified output".into()));
            }
            if compensated > 0 {
                return Err(shape("burn output in assignment".into()));
            }
            // All certified outputs must reference the same certificate.
            let mut ids = tx
                .outputs
                .iter()
                .filter(|o| o.coin_state == CoinState::Certified)
                .filter_map(|o| o.certificate_id.as_ref());
            let first = ids.next().expect("at least one certified output");
            if ids.any(|id| id != first) {
                return Err(shape("certified outputs reference multiple certificates".into()));
            }
        }
        TxKind::Compensation => {
            if compensated != 1 {
                return Err(shape(format!("expected exactly one burn output, found {compensated}")));
            }
            // Certified change (the un-retired remainder) must stay under the
            // burned certificate.
            let burn_id = tx
                .outputs
                .iter()
                .find(|o| o.coin_state == CoinState::Compensated)
                .and_then(|o| o.certificate_id.as_ref())
                .expect("per-output checks guarantee a tagged burn output");
            for output in &tx.outputs {
                if output.coin_state == CoinState::Certified
                    && output.certificate_id.as_ref() != Some(burn_id)
                {
                    return Err(shape(
                        "certified change under a different certificate".into(),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Validate a non-coinbase transaction against chain state.
///
/// `get_utxo` resolves an outpoint against the current view (the authoritative
/// set, or a block-local overlay during block validation). `registry` is the
/// certificate registry at the same tip. `current_height` is the height the
/// transaction would confirm at, used for coinbase maturity.
pub fn validate_transaction<F>(
    tx: &Transaction,
    get_utxo: F,
    registry: &CertificateRegistry,
    current_height: u64,
) -> Result<ValidatedTransaction, TransactionError>
where
    F: Fn(&UtxoKey) -> Option<UtxoEntry>,
{
    if tx.is_coinbase() {
        return Err(TransactionError::InvalidCoinbase(
            "coinbase is validated as part of its block".into(),
        ));
    }

    validate_transaction_stateless(tx)?;

    let kind = tx.kind.name();
    let shape = |reason: String| TransactionError::KindShape { kind, reason };

    // --- Resolve inputs, verify signatures, total up values per state ---

    let mut total_input: u64 = 0;
    let mut plain_input: u64 = 0;
    let mut certified_input: u64 = 0;
    let mut certified_input_id = None;

    for (i, input) in tx.inputs.iter().enumerate() {
        let entry = get_utxo(&input.previous_output)
            .ok_or_else(|| TransactionError::UnknownUtxo(input.previous_output.to_string()))?;

        if !entry.is_mature(current_height) {
            return Err(TransactionError::ImmatureCoinbase { index: i });
        }

        crypto::verify_transaction_input(tx, i, &entry.output.address)
            .map_err(|_| TransactionError::InvalidSignature { index: i })?;

        match entry.output.coin_state {
            CoinState::Plain => plain_input += entry.output.amount,
            CoinState::Certified => {
                certified_input += entry.output.amount;
                let id = entry
                    .output
                    .certificate_id
                    .clone()
                    .expect("certified UTXO carries its certificate id");
                match &certified_input_id {
                    None => certified_input_id = Some(id),
                    Some(existing) if *existing != id => {
                        return Err(shape(
                            "certified inputs span multiple certificates".into(),
                        ));
                    }
                    Some(_) => {}
                }
            }
            CoinState::Compensated => {
                return Err(shape(format!(
                    "input {i} spends a retired output",
                )));
            }
        }

        total_input = total_input
            .checked_add(entry.output.amount)
            .ok_or(TransactionError::ValueOverflow)?;
    }

    // --- Value conservation ---

    let total_output = tx.total_output_amount().ok_or(TransactionError::ValueOverflow)?;
    if total_input < total_output {
        return Err(TransactionError::InsufficientFunds {
            have: total_input,
            need: total_output,
        });
    }

    // --- Per-kind rules against the registry ---

    match &tx.kind {
        TxKind::Coinbase => unreachable!("rejected above"),
        TxKind::Transfer | TxKind::CertificateIssue(_) => {
            if certified_input > 0 {
                return Err(shape("certified inputs outside the certificate lifecycle".into()));
            }
            if let TxKind::CertificateIssue(payload) = &tx.kind {
                if registry.contains(&payload.certificate_id) {
                    return Err(CertificateError::CertificateDuplicate(
                        payload.certificate_id.to_string(),
                    )
                    .into());
                }
            }
        }
        TxKind::CertificateAssign => {
            if certified_input > 0 {
                return Err(shape("assignment must spend plain inputs".into()));
            }
            let assigned: u64 = tx
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
                .expect("stateless checks guarantee a tagged certified output");
            let record = registry
                .get(id)
                .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
            if assigned > record.remaining_capacity() {
                return Err(CertificateError::CertificateExhausted {
                    id: id.to_string(),
                    assigned: record.assigned_amount,
                    requested: assigned,
                    total: record.total_amount,
                }
                .into());
            }
        }
        TxKind::Compensation => {
            let burn = tx
                .outputs
                .iter()
                .find(|o| o.coin_state == CoinState::Compensated)
                .expect("stateless checks guarantee one burn output");
            let id = burn
                .certificate_id
                .as_ref()
                .expect("stateless checks guarantee a tagged burn output");

            let input_id = certified_input_id
                .as_ref()
                .ok_or_else(|| CertificateError::CompensationNotCertified(id.to_string()))?;
            if input_id != id {
                return Err(shape(
                    "burn output certificate differs from the certified inputs".into(),
                ));
            }

            let record = registry
                .get(id)
                .ok_or_else(|| CertificateError::UnknownCertificate(id.to_string()))?;
            if burn.amount > record.remaining_certified() {
                return Err(CertificateError::CompensationAlreadyUsed {
                    id: id.to_string(),
                    requested: burn.amount,
                    remaining: record.remaining_certified(),
                }
                .into());
            }

            // Certified value is conserved: whatever is not retired comes
            // back as certified change under the same certificate. Plain
            // change (and the fee) is covered by the plain inputs alone.
            let certified_change: u64 = tx
                .outputs
                .iter()
                .filter(|o| o.coin_state == CoinState::Certified)
                .map(|o| o.amount)
                .sum();
            let retired_plus_change = burn
                .amount
                .checked_add(certified_change)
                .ok_or(TransactionError::ValueOverflow)?;
            if retired_plus_change > certified_input {
                return Err(TransactionError::InsufficientFunds {
                    have: certified_input,
                    need: retired_plus_change,
                });
            }
            if retired_plus_change < certified_input {
                return Err(shape(format!(
                    "certified inputs ({certified_input}) not fully accounted: \
                     {} burned, {certified_change} returned as change",
                    burn.amount,
                )));
            }
            let plain_output: u64 = tx
                .outputs
                .iter()
                .filter(|o| o.coin_state == CoinState::Plain)
                .map(|o| o.amount)
                .sum();
            if plain_output > plain_input {
                return Err(shape(
                    "plain change exceeds plain inputs".into(),
                ));
            }
        }
    }

    Ok(ValidatedTransaction {
        total_input,
        total_output,
        fee: total_input - total_output,
    })
}

//! Pending Transaction Validation
//!
//! The small fixed rule set a pending transaction must pass before it is
//! written to the transaction log:
//!
//! 1. the sender is recoverable from the signature under its declared chain id
//! 2. the value is non-negative
//! 3. the fee cap fits in 256 bits
//! 4. the tip cap fits in 256 bits
//! 5. the tip cap does not exceed the fee cap
//!
//! Rules 2-4 are carried by the types: values are `U256` and fee caps are
//! `u128`, so any payload violating them fails to decode upstream and never
//! reaches the pipeline.

use alloy::consensus::{Transaction as _, TxEnvelope};
use alloy::primitives::Address;
use thiserror::Error;

/// Reason a transaction was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid sender: {0}")]
    InvalidSender(String),

    #[error("max priority fee per gas {tip} higher than max fee per gas {fee_cap}")]
    TipAboveFeeCap { tip: u128, fee_cap: u128 },
}

/// Fee cap and tip cap of a transaction, with the legacy gas price standing in for both
pub fn fee_caps(tx: &TxEnvelope) -> (u128, u128) {
    let fee_cap = tx.max_fee_per_gas();
    let tip = tx.max_priority_fee_per_gas().unwrap_or(fee_cap);
    (fee_cap, tip)
}

/// Check a transaction against the rule set, returning the recovered sender
pub fn validate_transaction(tx: &TxEnvelope) -> Result<Address, Rejection> {
    let sender = tx
        .recover_signer()
        .map_err(|e| Rejection::InvalidSender(e.to_string()))?;

    let (fee_cap, tip) = fee_caps(tx);
    if tip > fee_cap {
        return Err(Rejection::TipAboveFeeCap { tip, fee_cap });
    }

    Ok(sender)
}

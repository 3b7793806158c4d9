//! Transaction Codec
//!
//! Canonical EIP-2718 wire encoding of pending transactions, as stored in the
//! transaction log. Covers legacy (type 0), EIP-2930 (type 1), EIP-1559
//! (type 2) and EIP-4844 (type 3) envelopes.

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::{Decodable2718, Encodable2718};
use alloy::primitives::TxHash;
use thiserror::Error;

/// Errors that can occur while decoding a logged payload
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("Failed to decode envelope: {0}")]
    Envelope(String),

    #[error("Empty input data")]
    EmptyInput,
}

/// Lowercase, 0x-prefixed transaction hash; the dedup identity of a transaction
pub fn format_hash(hash: &TxHash) -> String {
    format!("{:#x}", hash)
}

/// Encode a transaction to its canonical wire bytes as a 0x-prefixed lowercase hex string
pub fn encode_transaction_hex(tx: &TxEnvelope) -> String {
    format!("0x{}", hex::encode(tx.encoded_2718()))
}

/// Parse a hex string to bytes (with or without 0x prefix)
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>, CodecError> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    Ok(hex::decode(hex_str)?)
}

/// Decode a payload written by [`encode_transaction_hex`]
pub fn decode_transaction_hex(payload: &str) -> Result<TxEnvelope, CodecError> {
    let bytes = hex_to_bytes(payload)?;
    if bytes.is_empty() {
        return Err(CodecError::EmptyInput);
    }
    TxEnvelope::decode_2718(&mut bytes.as_slice()).map_err(|e| CodecError::Envelope(e.to_string()))
}


#[cfg(test)]
mod tests {
    use super::fixtures::{signed_eip1559, signed_legacy};
    use super::*;
    use alloy::primitives::b256;

    // ==================== format_hash tests ====================

    #[test]
    fn test_format_hash_is_prefixed_lowercase() {
        let hash = b256!("1234567890ABCDEF1234567890abcdef1234567890abcdef1234567890abcdef");
        let formatted = format_hash(&hash);
        assert!(formatted.starts_with("0x"));
        assert_eq!(formatted.len(), 66);
        assert_eq!(formatted, formatted.to_lowercase());
    }

    // ==================== hex_to_bytes tests ====================

    #[test]
    fn test_hex_to_bytes_with_prefix() {
        assert_eq!(hex_to_bytes("0x38ed1739").unwrap(), vec![0x38, 0xed, 0x17, 0x39]);
    }

    #[test]
    fn test_hex_to_bytes_without_prefix() {
        assert_eq!(hex_to_bytes("38ed1739").unwrap(), vec![0x38, 0xed, 0x17, 0x39]);
    }

    #[test]
    fn test_hex_to_bytes_invalid() {
        assert!(matches!(hex_to_bytes("0xGGGG"), Err(CodecError::Hex(_))));
    }

    // ==================== encode tests ====================

    #[test]
    fn test_encode_eip1559_starts_with_type_byte() {
        let tx = signed_eip1559(0, 30_000_000_000, 1_000_000_000);
        let encoded = encode_transaction_hex(&tx);
        assert!(encoded.starts_with("0x02"));
        assert_eq!(encoded, encoded.to_lowercase());
    }

    #[test]
    fn test_encode_legacy_is_rlp_list() {
        let tx = signed_legacy(0, 20_000_000_000);
        let encoded = encode_transaction_hex(&tx);
        // Legacy envelopes are bare RLP lists, long-form prefix 0xf8
        assert!(encoded.starts_with("0xf8"));
    }

    #[test]
    fn test_encoded_payload_decodes_to_same_hash() {
        let tx = signed_eip1559(7, 30_000_000_000, 1_000_000_000);
        let decoded = decode_transaction_hex(&encode_transaction_hex(&tx)).unwrap();
        assert_eq!(decoded.tx_hash(), tx.tx_hash());
    }

    // ==================== decode error tests ====================

    #[test]
    fn test_decode_empty_input_returns_error() {
        assert!(matches!(decode_transaction_hex("0x"), Err(CodecError::EmptyInput)));
    }

    #[test]
    fn test_decode_invalid_envelope_returns_error() {
        assert!(matches!(
            decode_transaction_hex("0xffffffff"),
            Err(CodecError::Envelope(_))
        ));
    }
}

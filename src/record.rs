//! Log Records
//!
//! The in-flight [`Event`] and the two CSV line layouts written by the
//! pipeline. Both logs share the `arrival_ms,hash,...` prefix so they can be
//! joined offline.

use alloy::consensus::TxEnvelope;
use chrono::{DateTime, Utc};

use crate::codec::format_hash;

/// A pending transaction as received from the subscription
#[derive(Debug, Clone)]
pub struct Event {
    /// Arrival time, stamped by the subscriber
    pub timestamp: DateTime<Utc>,
    /// The full transaction
    pub tx: TxEnvelope,
    /// Label of the upstream the transaction came from
    pub source: String,
}

impl Event {
    /// Stamp a transaction with the current time
    pub fn received(tx: TxEnvelope, source: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            tx,
            source: source.into(),
        }
    }

    /// Lowercase, 0x-prefixed transaction hash
    pub fn hash(&self) -> String {
        format_hash(self.tx.tx_hash())
    }

    /// Arrival time in Unix milliseconds
    pub fn arrival_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// `arrival_ms,hash,source\n`
pub fn source_line(arrival_ms: i64, hash: &str, source: &str) -> String {
    format!("{arrival_ms},{hash},{source}\n")
}

/// `arrival_ms,hash,0x<payload>\n`
pub fn transaction_line(arrival_ms: i64, hash: &str, payload_hex: &str) -> String {
    format!("{arrival_ms},{hash},{payload_hex}\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::fixtures::signed_eip1559;
    use chrono::TimeZone;

    #[test]
    fn test_source_line_layout() {
        let line = source_line(1703000000000, "0xabc", "node");
        assert_eq!(line, "1703000000000,0xabc,node\n");
    }

    #[test]
    fn test_transaction_line_layout() {
        let line = transaction_line(1703000000000, "0xabc", "0x02f8");
        assert_eq!(line, "1703000000000,0xabc,0x02f8\n");
    }

    #[test]
    fn test_source_line_with_empty_label() {
        assert_eq!(source_line(1, "0xabc", ""), "1,0xabc,\n");
    }

    #[test]
    fn test_event_hash_matches_envelope() {
        let tx = signed_eip1559(0, 30_000_000_000, 1_000_000_000);
        let expected = format!("{:#x}", tx.tx_hash());
        let event = Event::received(tx, "node");
        assert_eq!(event.hash(), expected);
        assert_eq!(event.source, "node");
    }

    #[test]
    fn test_event_arrival_ms() {
        let tx = signed_eip1559(0, 30_000_000_000, 1_000_000_000);
        let event = Event {
            timestamp: Utc.timestamp_millis_opt(1703000000123).unwrap(),
            tx,
            source: String::new(),
        };
        assert_eq!(event.arrival_ms(), 1703000000123);
    }

    #[test]
    fn test_received_timestamp_is_reasonable() {
        let tx = signed_eip1559(0, 30_000_000_000, 1_000_000_000);
        let event = Event::received(tx, "node");
        // After Jan 1, 2024
        assert!(event.arrival_ms() > 1704067200000);
    }
}

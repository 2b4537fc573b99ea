//! Opaque keyset-pagination cursors.
//!
//! A cursor pins a (created_at, id) position so listing pages stay stable
//! under concurrent inserts and never need a COUNT. The wire form is
//! hex-encoded so callers treat it as opaque.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::error::{LedgerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.id);
        hex::encode(raw.as_bytes())
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded)
            .map_err(|_| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        let raw = String::from_utf8(bytes)
            .map_err(|_| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        let (micros, id) = raw
            .split_once(':')
            .ok_or_else(|| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        let micros: i64 = micros
            .parse()
            .map_err(|_| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or_else(|| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        let id = Uuid::parse_str(id)
            .map_err(|_| LedgerError::InvalidArgument("malformed cursor".to_string()))?;
        Ok(Self { created_at, id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = Cursor {
            created_at: Utc.timestamp_micros(1_722_470_400_123_456).single().unwrap(),
            id: Uuid::new_v4(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
    }

    #[test]
    fn garbage_cursors_are_invalid_argument() {
        for bad in ["zzzz", "", "deadbeef", &hex::encode("no-colon")] {
            let err = Cursor::decode(bad).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidArgument(_)), "{bad}");
        }
    }
}

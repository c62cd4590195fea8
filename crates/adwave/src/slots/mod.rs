//! Voice-slot capacity management.
//!
//! A slot is one in-use unit of voice-cloning capacity, bounded to N
//! concurrent clones. Callers first obtain a short-lived reservation ticket,
//! run the (slow, externally billed) clone call, then atomically convert the
//! ticket into a slot. Expired slots and tickets are reclaimed lazily on
//! capacity checks, never by a background timer.

mod pool;
mod store;

pub use pool::{AcquireError, SlotGuard, SlotPool};
pub use store::{MemoryStore, SlotStore, StoreError, StoreOp};

use serde::{Deserialize, Serialize};

pub const SLOT_META_PREFIX: &str = "voice_slot:";
pub const RESERVATION_PREFIX: &str = "reservation:";

/// Status of an active slot, updated as the owning job progresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// Short-lived ticket granting the right to acquire exactly one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(String);

impl ReservationId {
    /// 8-character ticket derived from a v4 uuid.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        Self(hex[..8].to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn store_key(&self) -> String {
        format!("{RESERVATION_PREFIX}{}", self.0)
    }
}

impl std::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata stored per outstanding reservation (`reservation:<id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationMeta {
    pub reservation_id: ReservationId,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Metadata stored per active slot (`voice_slot:<voice_id>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotMeta {
    pub voice_id: String,
    pub status: SlotStatus,
    pub created_at: i64,
    pub expires_at: i64,
    pub reservation_id: ReservationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

pub(crate) fn slot_key(voice_id: &str) -> String {
    format!("{SLOT_META_PREFIX}{voice_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_ids_are_short_and_unique() {
        let a = ReservationId::generate();
        let b = ReservationId::generate();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn slot_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SlotStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::from_str::<SlotStatus>("\"error\"").unwrap(),
            SlotStatus::Error
        );
    }

    #[test]
    fn slot_meta_roundtrip() {
        let meta = SlotMeta {
            voice_id: "v1".to_string(),
            status: SlotStatus::Pending,
            created_at: 100,
            expires_at: 3700,
            reservation_id: ReservationId::from_raw("abcd1234"),
            updated_at: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let back: SlotMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.voice_id, "v1");
        assert_eq!(back.status, SlotStatus::Pending);
        assert_eq!(back.reservation_id.as_str(), "abcd1234");
    }
}

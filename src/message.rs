//! Message records and their lifecycle.
//!
//! A message is always in exactly one of three states:
//!
//! 1. **Available**: its id sits in the queue's available list and it carries no lease
//! 2. **In-flight**: its id sits in the queue's in-flight list, it carries a lease and
//!    the expiry index holds an entry for it
//! 3. **Deleted**: no record, no list membership, no expiry entry
//!
//! Records are persisted as a store hash. The immutable part (`id`, `queue`,
//! `created_at`) is a single JSON field; the payload is stored raw so callers
//! can put arbitrary bytes in it. Lease fields only exist while the message is
//! in-flight.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Hash field names of a stored record.
pub mod field {
    pub const META: &str = "meta";
    pub const PAYLOAD: &str = "payload";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const RECEIPT: &str = "receipt";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const LEASED_FROM: &str = "leased_from";

    /// Fields removed when a lease is released without deleting the message.
    pub const LEASE: [&str; 3] = [RECEIPT, EXPIRES_AT, LEASED_FROM];
}

/// Temporary exclusive claim on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Single-use token the holder presents to acknowledge the message
    pub receipt: String,
    /// Instant after which the reaper may hand the message to someone else
    pub expires_at: DateTime<Utc>,
    /// Queue whose in-flight list holds the message
    pub leased_from: String,
}

impl Lease {
    pub(crate) fn fields(&self) -> [(&'static str, Bytes); 3] {
        [
            (field::RECEIPT, Bytes::from(self.receipt.clone())),
            (
                field::EXPIRES_AT,
                Bytes::from(self.expires_at.timestamp_millis().to_string()),
            ),
            (field::LEASED_FROM, Bytes::from(self.leased_from.clone())),
        ]
    }
}

/// A message moving through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// 128-bit random identifier, rendered as 32 hex characters
    pub id: String,
    /// Queue the message was pushed to
    pub queue: String,
    /// Opaque caller payload
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    /// Number of times the message has been pulled
    pub retry_count: u32,
    /// Present only while the message is in-flight
    pub lease: Option<Lease>,
}

#[derive(Serialize, Deserialize)]
struct Meta {
    id: String,
    queue: String,
    created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(queue: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_id(),
            queue: queue.into(),
            payload: payload.into(),
            created_at: Utc::now(),
            retry_count: 0,
            lease: None,
        }
    }

    /// Receipt of the current lease, if any.
    pub fn receipt(&self) -> Option<&str> {
        self.lease.as_ref().map(|lease| lease.receipt.as_str())
    }

    /// Fields written when the record is first stored.
    pub(crate) fn record_fields(&self) -> Result<Vec<(&'static str, Bytes)>, Error> {
        let meta = serde_json::to_vec(&Meta {
            id: self.id.clone(),
            queue: self.queue.clone(),
            created_at: self.created_at,
        })
        .map_err(|e| Error::corrupt(&self.id, e.to_string()))?;

        Ok(vec![
            (field::META, Bytes::from(meta)),
            (field::PAYLOAD, self.payload.clone()),
            (field::RETRY_COUNT, retry_count_value(self.retry_count)),
        ])
    }

    /// Rebuild a message from its stored hash. An empty hash means the record
    /// does not exist.
    pub(crate) fn from_record(
        id: &str,
        mut fields: HashMap<String, Bytes>,
    ) -> Result<Option<Self>, Error> {
        if fields.is_empty() {
            return Ok(None);
        }

        let meta = fields
            .remove(field::META)
            .ok_or_else(|| Error::corrupt(id, "missing meta field"))?;
        let meta: Meta =
            serde_json::from_slice(&meta).map_err(|e| Error::corrupt(id, e.to_string()))?;

        let payload = fields.remove(field::PAYLOAD).unwrap_or_default();

        let retry_count = match fields.remove(field::RETRY_COUNT) {
            Some(raw) => parse_number::<u32>(id, field::RETRY_COUNT, &raw)?,
            None => 0,
        };

        let lease = match fields.remove(field::RECEIPT) {
            Some(receipt) => {
                let expires_at = fields
                    .remove(field::EXPIRES_AT)
                    .ok_or_else(|| Error::corrupt(id, "lease without expiry"))?;
                let millis = parse_number::<i64>(id, field::EXPIRES_AT, &expires_at)?;
                let expires_at = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| Error::corrupt(id, "expiry out of range"))?;
                let leased_from = fields
                    .remove(field::LEASED_FROM)
                    .map(|raw| utf8(id, field::LEASED_FROM, &raw))
                    .transpose()?
                    .unwrap_or_else(|| meta.queue.clone());

                Some(Lease {
                    receipt: utf8(id, field::RECEIPT, &receipt)?,
                    expires_at,
                    leased_from,
                })
            }
            None => None,
        };

        Ok(Some(Self {
            id: meta.id,
            queue: meta.queue,
            payload,
            created_at: meta.created_at,
            retry_count,
            lease,
        }))
    }
}

pub(crate) fn retry_count_value(retry_count: u32) -> Bytes {
    Bytes::from(retry_count.to_string())
}

/// Expiry index score for an instant: epoch milliseconds.
pub(crate) fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64
}

fn utf8(id: &str, name: &str, raw: &[u8]) -> Result<String, Error> {
    String::from_utf8(raw.to_vec()).map_err(|e| Error::corrupt(id, format!("{name}: {e}")))
}

fn parse_number<T>(id: &str, name: &str, raw: &[u8]) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    utf8(id, name, raw)?
        .parse::<T>()
        .map_err(|e| Error::corrupt(id, format!("{name}: {e}")))
}

/// Generates `N` random bytes rendered as lowercase hex.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> String {
    let mut token = [0u8; N];
    rng.fill(&mut token[..]);
    hex::encode(token)
}

/// Fresh message id or receipt. Collisions are treated as impossible.
pub fn generate_id() -> String {
    generate_token::<16>(rand::thread_rng())
}

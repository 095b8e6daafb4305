use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IdError;
use crate::id_gen::{SHARD_MASK, SHARD_SHIFT};

/// Identifier of the customer that owns an order. Sharding key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(i64);

impl CustomerId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for CustomerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CustomerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Index of a physical order partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(u16);

impl ShardId {
    pub fn new(index: u16) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Numeric order identifier produced by [`IdGenerator`](crate::IdGenerator).
///
/// Bits 16..22 carry the owning shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(i64);

impl OrderId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Returns the shard encoded in the identifier.
    pub fn shard(&self) -> ShardId {
        ShardId(((self.0 >> SHARD_SHIFT) & SHARD_MASK) as u16)
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Human-readable order number: `YYYYMMDD-SSS-<order id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNo(String);

impl OrderNo {
    /// Formats the order number for a freshly generated id.
    pub fn generate(id: OrderId, at: DateTime<Utc>) -> Self {
        Self(format!("{}-{}-{}", at.format("%Y%m%d"), id.shard(), id))
    }

    /// Parses and validates an order number.
    pub fn parse(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        let mut parts = raw.splitn(3, '-');
        let (Some(date), Some(shard), Some(id)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(IdError::MalformedOrderNo(raw));
        };
        let well_formed = date.len() == 8
            && date.bytes().all(|b| b.is_ascii_digit())
            && shard.len() == 3
            && shard.bytes().all(|b| b.is_ascii_digit())
            && !id.is_empty()
            && id.bytes().all(|b| b.is_ascii_digit());
        let (Some(segment), Some(id)) = (
            shard.parse::<u16>().ok().filter(|_| well_formed),
            id.parse::<i64>().ok().filter(|_| well_formed),
        ) else {
            return Err(IdError::MalformedOrderNo(raw));
        };

        // The shard segment is what routing reads; it must agree with the id.
        let embedded = OrderId(id).shard();
        if embedded.as_u16() != segment {
            return Err(IdError::ShardMismatch {
                order_no: raw,
                segment,
                embedded: embedded.as_u16(),
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the shard segment of the number.
    pub fn shard(&self) -> ShardId {
        // validated on construction
        let segment = self.0.split('-').nth(1).unwrap_or("0");
        ShardId(segment.parse().unwrap_or(0))
    }

    /// Returns the numeric id segment of the number.
    pub fn order_id(&self) -> OrderId {
        let segment = self.0.split('-').nth(2).unwrap_or("0");
        OrderId(segment.parse().unwrap_or(0))
    }
}

impl std::fmt::Display for OrderNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OrderNo {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNo {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<OrderNo> for String {
    fn from(no: OrderNo) -> Self {
        no.0
    }
}

impl AsRef<str> for OrderNo {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn id_on_shard(shard: i64) -> OrderId {
        OrderId::from_raw((12345 << 22) | (shard << SHARD_SHIFT) | 7)
    }

    #[test]
    fn order_id_exposes_embedded_shard() {
        assert_eq!(id_on_shard(5).shard(), ShardId::new(5));
        assert_eq!(id_on_shard(63).shard(), ShardId::new(63));
    }

    #[test]
    fn order_no_generate_and_parse() {
        let id = id_on_shard(3);
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 8, 30, 0).unwrap();
        let no = OrderNo::generate(id, at);

        assert!(no.as_str().starts_with("20261016-003-"));
        assert_eq!(no.shard(), ShardId::new(3));
        assert_eq!(no.order_id(), id);

        let parsed: OrderNo = no.as_str().parse().unwrap();
        assert_eq!(parsed, no);
    }

    #[test]
    fn order_no_rejects_malformed_input() {
        assert!(OrderNo::parse("").is_err());
        assert!(OrderNo::parse("20261016-3-12").is_err());
        assert!(OrderNo::parse("2026101-003-12").is_err());
        assert!(OrderNo::parse("20261016-003-abc").is_err());
        assert!(OrderNo::parse("20261016-003").is_err());
    }

    #[test]
    fn order_no_rejects_shard_segment_that_disagrees_with_id() {
        let id = id_on_shard(3);
        let forged = format!("20261016-004-{id}");
        assert_eq!(
            OrderNo::parse(forged.clone()),
            Err(IdError::ShardMismatch {
                order_no: forged,
                segment: 4,
                embedded: 3,
            })
        );
        assert!(OrderNo::parse(format!("20261016-003-{id}")).is_ok());
    }

    #[test]
    fn order_no_rejects_signed_id_segment() {
        assert!(OrderNo::parse("20261016-000--5").is_err());
        assert!(OrderNo::parse("20261016-000-+5").is_err());
    }

    #[test]
    fn order_no_deserialization_validates() {
        let ok: Result<OrderNo, _> = serde_json::from_str("\"20261016-000-99\"");
        assert!(ok.is_ok());

        let bad: Result<OrderNo, _> = serde_json::from_str("\"not-an-order\"");
        assert!(bad.is_err());
    }

    #[test]
    fn customer_id_serializes_transparently() {
        let json = serde_json::to_string(&CustomerId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}

//! Domain types for the parking-fee workflow.
//!
//! Value objects (ids, [`BillingMonth`], [`Money`]) validate on construction so
//! the rest of the system never sees a malformed month or a fractional cent.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while constructing domain values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Billing month not in `YYYY-MM` form
    #[error("Invalid billing month '{0}', expected YYYY-MM")]
    InvalidMonth(String),

    /// Amount not a non-negative decimal with at most two fraction digits
    #[error("Invalid amount '{0}'")]
    InvalidAmount(String),

    /// Unknown status literal read from storage
    #[error("Invalid {kind} status '{value}'")]
    InvalidStatus {
        /// Which status type was being parsed
        kind: &'static str,
        /// The rejected literal
        value: String,
    },

    /// Unknown user tier
    #[error("Invalid user type '{0}'")]
    InvalidUserType(String),
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw identifier
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            /// The raw identifier
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a property owner (user-service)
    UserId
);
numeric_id!(
    /// Identifier of a parking space (parking-service)
    ParkId
);
numeric_id!(
    /// Identifier of a monthly fee record (fee-service)
    FeeId
);
numeric_id!(
    /// Identifier of a parking assignment row (parking-service)
    AssignmentId
);

// ============================================================================
// Billing month
// ============================================================================

/// Calendar month a fee is charged for, rendered as `YYYY-MM`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingMonth {
    year: i32,
    month: u32,
}

impl BillingMonth {
    /// Build a month, rejecting out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidMonth`] if `month` is not 1-12 or `year` is
    /// outside 1000-9999.
    pub fn new(year: i32, month: u32) -> Result<Self, ModelError> {
        if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
            return Err(ModelError::InvalidMonth(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// The month containing the given instant (UTC).
    #[must_use]
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }

    /// Four-digit year
    #[must_use]
    pub const fn year(self) -> i32 {
        self.year
    }

    /// Month number, 1-12
    #[must_use]
    pub const fn month(self) -> u32 {
        self.month
    }
}

impl fmt::Display for BillingMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingMonth {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidMonth(s.to_string());
        let (year, month) = s.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

impl Serialize for BillingMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BillingMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Money
// ============================================================================

/// Monetary amount in integer cents.
///
/// Serialized as a two-decimal string (`"300.00"`) so no float rounding
/// happens on the wire. Deserialization also accepts a JSON number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(i64);

impl Money {
    /// Creates a `Money` value from cents
    #[must_use]
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Returns the amount in cents
    #[must_use]
    pub const fn cents(self) -> i64 {
        self.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidAmount(s.to_string());
        let trimmed = s.trim();
        let (whole, fraction) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty()
            || fraction.len() > 2
            || !whole.bytes().all(|b| b.is_ascii_digit())
            || !fraction.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(invalid());
        }
        let whole: i64 = whole.parse().map_err(|_| invalid())?;
        let fraction: i64 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<i64>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };
        whole
            .checked_mul(100)
            .and_then(|cents| cents.checked_add(fraction))
            .map(Self)
            .ok_or_else(invalid)
    }
}

impl Serialize for Money {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Integer(i64),
            Float(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Raw::Integer(units) => units
                .checked_mul(100)
                .map(Self)
                .ok_or_else(|| serde::de::Error::custom("amount out of range")),
            #[allow(clippy::cast_possible_truncation)]
            Raw::Float(units) if units.is_finite() && units >= 0.0 => {
                Ok(Self((units * 100.0).round() as i64))
            }
            Raw::Float(units) => Err(serde::de::Error::custom(format!("invalid amount {units}"))),
        }
    }
}

// ============================================================================
// Fee records
// ============================================================================

/// Payment state of a fee record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    /// Issued, awaiting payment
    Unpaid,
    /// Settled; amount, owner, space and month are frozen
    Paid,
}

impl FeeStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Paid => "paid",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "unpaid" => Ok(Self::Unpaid),
            "paid" => Ok(Self::Paid),
            _ => Err(ModelError::InvalidStatus {
                kind: "fee",
                value: s.to_string(),
            }),
        }
    }
}

/// A monthly parking fee owed by one owner for one space.
///
/// `(user_id, park_id, billing_month)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRecord {
    /// Fee identifier
    pub fee_id: FeeId,
    /// Owner the fee is charged to
    pub user_id: UserId,
    /// Parking space the fee covers
    pub park_id: ParkId,
    /// Month the fee covers
    pub billing_month: BillingMonth,
    /// Amount due
    pub amount: Money,
    /// Payment state
    pub status: FeeStatus,
    /// Set exactly once, when the fee is paid
    pub paid_at: Option<DateTime<Utc>>,
    /// When the fee was issued
    pub created_at: DateTime<Utc>,
}

impl FeeRecord {
    /// Whether the fee has been settled.
    #[must_use]
    pub fn is_paid(&self) -> bool {
        self.status == FeeStatus::Paid
    }
}

/// A fee record about to be inserted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFeeRecord {
    /// Owner the fee is charged to
    pub user_id: UserId,
    /// Parking space the fee covers
    pub park_id: ParkId,
    /// Month the fee covers
    pub billing_month: BillingMonth,
    /// Amount due
    pub amount: Money,
}

// ============================================================================
// Parking assignments
// ============================================================================

/// Lifecycle of a parking assignment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// The owner currently holds the space
    Active,
    /// The space was returned
    Closed,
}

impl AssignmentStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            _ => Err(ModelError::InvalidStatus {
                kind: "assignment",
                value: s.to_string(),
            }),
        }
    }
}

/// An owner's hold on a parking space.
///
/// At most one active assignment exists per user and per space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParkingAssignment {
    /// Row identifier
    #[serde(rename = "ownerParkingId")]
    pub assignment_id: AssignmentId,
    /// Owner holding the space
    pub user_id: UserId,
    /// Space held
    pub park_id: ParkId,
    /// Human-readable space number, when known
    pub park_num: Option<String>,
    /// Registered car plate
    pub car_number: String,
    /// When the assignment started
    pub entry_time: DateTime<Utc>,
    /// When the space was returned
    pub exit_time: Option<DateTime<Utc>>,
    /// Active or closed
    pub status: AssignmentStatus,
}

impl ParkingAssignment {
    /// The read model served to other services.
    #[must_use]
    pub fn to_record(&self) -> ActiveParkingRecord {
        ActiveParkingRecord {
            user_id: self.user_id,
            park_id: self.park_id,
            park_num: self.park_num.clone(),
            car_num: Some(self.car_number.clone()),
        }
    }
}

/// Request to assign a space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewAssignment {
    /// Owner receiving the space
    pub user_id: UserId,
    /// Space assigned
    pub park_id: ParkId,
    /// Human-readable space number, when known
    pub park_num: Option<String>,
    /// Registered car plate
    pub car_number: String,
    /// Start of the assignment
    pub entry_time: DateTime<Utc>,
}

/// `GET /parking/owner/record` payload: the caller's active assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveParkingRecord {
    /// Owner holding the space
    pub user_id: UserId,
    /// Space held
    pub park_id: ParkId,
    /// Human-readable space number
    #[serde(default)]
    pub park_num: Option<String>,
    /// Registered car plate
    #[serde(default)]
    pub car_num: Option<String>,
}

// ============================================================================
// Owners
// ============================================================================

/// Owner tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserTier {
    /// Regular owner
    Normal,
    /// Premium owner
    Vip,
}

impl UserTier {
    /// Wire/database literal.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Vip => "VIP",
        }
    }

    /// Parse a tier literal.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidUserType`] for anything other than `NORMAL`/`VIP`.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "NORMAL" => Ok(Self::Normal),
            "VIP" => Ok(Self::Vip),
            other => Err(ModelError::InvalidUserType(other.to_string())),
        }
    }
}

/// `GET /user/owners/{userId}` payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerProfile {
    /// Owner identifier
    pub user_id: UserId,
    /// Display name
    pub owner_name: String,
    /// Contact phone
    #[serde(default)]
    pub phone: Option<String>,
    /// Tier
    pub user_type: UserTier,
}

// ============================================================================
// Consumer bookkeeping
// ============================================================================

/// Proof that `consumer_name` has applied the effect of `event_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingLedgerEntry {
    /// Event identifier (idempotency key)
    pub event_id: Uuid,
    /// Consumer that applied it
    pub consumer_name: String,
    /// When it was applied
    pub processed_at: DateTime<Utc>,
}

/// "Payment received" notice recorded for an owner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeNotification {
    /// Fee that was paid
    pub fee_id: FeeId,
    /// Owner notified
    pub user_id: UserId,
    /// Rendered notice text
    pub message: String,
    /// When the notice was produced
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn billing_month_from_entry_time() {
        let at = Utc.with_ymd_and_hms(2025, 6, 30, 23, 59, 0).unwrap();
        assert_eq!(BillingMonth::from_datetime(at).to_string(), "2025-06");
    }

    #[test]
    fn billing_month_rejects_malformed() {
        for raw in ["2025-6", "2025-13", "25-06", "2025/06", "2025-00", ""] {
            assert!(raw.parse::<BillingMonth>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn money_renders_two_decimals() {
        assert_eq!(Money::from_cents(30_000).to_string(), "300.00");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
        assert_eq!("300".parse::<Money>().unwrap(), Money::from_cents(30_000));
        assert_eq!("12.5".parse::<Money>().unwrap(), Money::from_cents(1_250));
    }

    #[test]
    fn money_rejects_excess_precision() {
        assert!("1.005".parse::<Money>().is_err());
        assert!("-1.00".parse::<Money>().is_err());
        assert!("abc".parse::<Money>().is_err());
    }

    #[test]
    fn money_accepts_json_number_or_string() {
        let from_number: Money = serde_json::from_str("300.0").unwrap();
        let from_string: Money = serde_json::from_str("\"300.00\"").unwrap();
        let from_integer: Money = serde_json::from_str("300").unwrap();
        assert_eq!(from_number, from_string);
        assert_eq!(from_integer, from_string);
        assert_eq!(serde_json::to_string(&from_string).unwrap(), "\"300.00\"");
    }

    #[test]
    fn owner_profile_wire_shape() {
        let json = r#"{"userId":7,"ownerName":"Li","userType":"VIP"}"#;
        let owner: OwnerProfile = serde_json::from_str(json).unwrap();
        assert_eq!(owner.user_id, UserId::new(7));
        assert_eq!(owner.user_type, UserTier::Vip);
        assert_eq!(owner.phone, None);
    }

    #[test]
    fn status_literals_round_trip() {
        assert_eq!(FeeStatus::parse("paid").unwrap(), FeeStatus::Paid);
        assert_eq!(AssignmentStatus::parse(AssignmentStatus::Closed.as_str()).unwrap(), AssignmentStatus::Closed);
        assert!(FeeStatus::parse("1").is_err());
    }

    proptest! {
        #[test]
        fn money_display_parses_back(cents in 0i64..10_000_000_000) {
            let money = Money::from_cents(cents);
            prop_assert_eq!(money.to_string().parse::<Money>().unwrap(), money);
        }

        #[test]
        fn billing_month_display_parses_back(year in 1000i32..=9999, month in 1u32..=12) {
            let parsed: BillingMonth = BillingMonth::new(year, month).unwrap().to_string().parse().unwrap();
            prop_assert_eq!(parsed.year(), year);
            prop_assert_eq!(parsed.month(), month);
        }
    }
}

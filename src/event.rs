//! Domain events carried over the tolling bus.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed enumeration of the event kinds the bus carries.
///
/// The serialized form is the dot-separated topic string, which doubles as
/// the routing key on the broker (`transit.recorded`, `payment.recorded`, ...).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "transit.recorded")]
    TransitRecorded,
    #[serde(rename = "plate.captured")]
    PlateCaptured,
    #[serde(rename = "toll.status.updated")]
    TollStatusUpdated,
    #[serde(rename = "payment.recorded")]
    PaymentRecorded,
    #[serde(rename = "prepaid.balance.updated")]
    PrepaidBalanceUpdated,
    #[serde(rename = "debt.created")]
    DebtCreated,
    #[serde(rename = "debt.settled")]
    DebtSettled,
    #[serde(rename = "fine.issued")]
    FineIssued,
    #[serde(rename = "rate.updated")]
    RateUpdated,
    #[serde(rename = "vehicle.category.changed")]
    VehicleCategoryChanged,
    #[serde(rename = "customer.upserted")]
    CustomerUpserted,
    #[serde(rename = "vehicle.upserted")]
    VehicleUpserted,
    #[serde(rename = "audit.logged")]
    AuditLogged,
}

impl EventKind {
    /// Every kind the bus knows about.
    pub const ALL: [EventKind; 13] = [
        EventKind::TransitRecorded,
        EventKind::PlateCaptured,
        EventKind::TollStatusUpdated,
        EventKind::PaymentRecorded,
        EventKind::PrepaidBalanceUpdated,
        EventKind::DebtCreated,
        EventKind::DebtSettled,
        EventKind::FineIssued,
        EventKind::RateUpdated,
        EventKind::VehicleCategoryChanged,
        EventKind::CustomerUpserted,
        EventKind::VehicleUpserted,
        EventKind::AuditLogged,
    ];

    /// The dot-separated topic string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TransitRecorded => "transit.recorded",
            EventKind::PlateCaptured => "plate.captured",
            EventKind::TollStatusUpdated => "toll.status.updated",
            EventKind::PaymentRecorded => "payment.recorded",
            EventKind::PrepaidBalanceUpdated => "prepaid.balance.updated",
            EventKind::DebtCreated => "debt.created",
            EventKind::DebtSettled => "debt.settled",
            EventKind::FineIssued => "fine.issued",
            EventKind::RateUpdated => "rate.updated",
            EventKind::VehicleCategoryChanged => "vehicle.category.changed",
            EventKind::CustomerUpserted => "customer.upserted",
            EventKind::VehicleUpserted => "vehicle.upserted",
            EventKind::AuditLogged => "audit.logged",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a topic string that is not a known kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventKind(pub String);

impl fmt::Display for UnknownEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown event kind '{}'", self.0)
    }
}

impl std::error::Error for UnknownEventKind {}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownEventKind(s.to_string()))
    }
}

/// A state change emitted by one of the tolling modules, destined for the bus.
///
/// `sequence` is assigned by the emitting collaborator and must be monotonic
/// per `entity_id`; the gateway preserves per-entity order but never assigns
/// or rewrites sequences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    /// The aggregate the event pertains to (vehicle plate, customer id, ...).
    pub entity_id: String,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    /// Kind-specific fields, validated against the kind's schema at encode time.
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
}

impl DomainEvent {
    /// Create an event stamped with the current time.
    pub fn new(
        kind: EventKind,
        entity_id: impl Into<String>,
        sequence: u64,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            sequence,
            occurred_at: Utc::now(),
            payload,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Override the occurrence timestamp.
    pub fn with_occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = at;
        self
    }

    /// Attach a correlation id for tracing across modules.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach the id of the event that caused this one.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

//! Validation and wire encoding of domain events.
//!
//! The wire format is a self-describing JSON envelope, so downstream modules
//! can evolve their schemas additively without coordinating releases:
//!
//! ```json
//! {
//!   "event": "payment.recorded",
//!   "version": "1.0",
//!   "data": { ... kind-specific fields ... },
//!   "meta": {
//!     "occurred_at": "2026-08-27T10:15:00Z",
//!     "producer": "tolling-gateway",
//!     "entity_id": "ABC123",
//!     "sequence": 4
//!   }
//! }
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{DomainEvent, EventKind};
use crate::routing::{RoutingDescriptor, DEFAULT_EXCHANGE};

/// Envelope schema version stamped on every message.
pub const ENVELOPE_VERSION: &str = "1.0";

/// JSON type a required payload field must carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
        }
    }
}

/// Required payload fields per event kind.
///
/// Optional fields (alert lists, free-form details, extra master-data
/// attributes) are passed through untouched; only the required core is
/// enforced at the gateway boundary.
pub fn required_fields(kind: EventKind) -> &'static [(&'static str, FieldType)] {
    use FieldType::*;
    match kind {
        EventKind::TransitRecorded => &[
            ("transit_id", String),
            ("toll_id", String),
            ("toll_name", String),
            ("lane", String),
            ("vehicle_id", String),
            ("vehicle_type", String),
            ("timestamp", String),
        ],
        EventKind::PlateCaptured => &[
            ("toll_id", String),
            ("lane", String),
            ("image_id", String),
            ("plate", String),
            ("confidence", Number),
            ("timestamp", String),
        ],
        EventKind::TollStatusUpdated => &[
            ("toll_id", String),
            ("toll_name", String),
            ("open_lanes", Integer),
            ("closed_lanes", Integer),
            ("timestamp", String),
        ],
        EventKind::PaymentRecorded => &[
            ("payment_id", String),
            ("toll_id", String),
            ("toll_name", String),
            ("cashier_id", String),
            ("timestamp", String),
            ("payment_method", String),
            ("amount", Number),
            ("reason", String),
        ],
        EventKind::PrepaidBalanceUpdated => &[
            ("account_id", String),
            ("vehicle_id", String),
            ("delta", Number),
            ("balance", Number),
            ("timestamp", String),
            ("source", String),
        ],
        EventKind::DebtCreated => &[
            ("debt_id", String),
            ("vehicle_id", String),
            ("amount", Number),
            ("origin", String),
            ("timestamp", String),
        ],
        EventKind::DebtSettled => &[
            ("debt_id", String),
            ("vehicle_id", String),
            ("amount", Number),
            ("timestamp", String),
        ],
        EventKind::FineIssued => &[
            ("fine_id", String),
            ("vehicle_id", String),
            ("timestamp", String),
            ("amount", Number),
            ("infraction_type", String),
            ("state", String),
        ],
        EventKind::RateUpdated => &[
            ("rate_id", String),
            ("category_id", String),
            ("peak_price", Number),
            ("offpeak_price", Number),
            ("valid_from", String),
            ("valid_to", String),
        ],
        EventKind::VehicleCategoryChanged => &[
            ("vehicle_id", String),
            ("old_category_id", String),
            ("new_category_id", String),
            ("timestamp", String),
        ],
        EventKind::CustomerUpserted => &[
            ("customer_id", String),
            ("name", String),
            ("is_active", Boolean),
        ],
        EventKind::VehicleUpserted => &[
            ("vehicle_id", String),
            ("plate", String),
            ("category_id", String),
        ],
        EventKind::AuditLogged => &[
            ("event_id", String),
            ("event_type", String),
            ("timestamp", String),
            ("toll_name", String),
            ("details", String),
        ],
    }
}

/// Why an event was rejected at the codec boundary. Always the caller's bug;
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    UnknownKind(String),
    EmptyEntityId,
    PayloadNotObject {
        kind: EventKind,
    },
    MissingField {
        kind: EventKind,
        field: &'static str,
    },
    WrongFieldType {
        kind: EventKind,
        field: &'static str,
        expected: &'static str,
    },
    /// The bytes were not a well-formed envelope (decode side).
    Malformed(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::UnknownKind(kind) => write!(f, "unknown event kind '{}'", kind),
            ValidationError::EmptyEntityId => write!(f, "entity_id must not be empty"),
            ValidationError::PayloadNotObject { kind } => {
                write!(f, "{} payload must be a JSON object", kind)
            }
            ValidationError::MissingField { kind, field } => {
                write!(f, "{} payload missing required field '{}'", kind, field)
            }
            ValidationError::WrongFieldType {
                kind,
                field,
                expected,
            } => write!(
                f,
                "{} payload field '{}' must be a {}",
                kind, field, expected
            ),
            ValidationError::Malformed(msg) => write!(f, "malformed envelope: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Trace metadata carried alongside the payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub occurred_at: DateTime<Utc>,
    pub producer: String,
    pub entity_id: String,
    pub sequence: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<String>,
}

/// The wire message, as consumers see it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: EventKind,
    pub version: String,
    pub data: Value,
    pub meta: EnvelopeMeta,
}

/// Validates events and turns them into routed wire payloads.
///
/// Pure and deterministic: no I/O, no clocks, no hidden state. The same event
/// always encodes to the same bytes and routing.
#[derive(Clone, Debug)]
pub struct EventCodec {
    producer: String,
    exchange: String,
}

impl EventCodec {
    /// Create a codec stamping `producer` into every envelope's meta.
    pub fn new(producer: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            exchange: DEFAULT_EXCHANGE.to_string(),
        }
    }

    /// Publish to a different exchange than [`DEFAULT_EXCHANGE`].
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Check the event against its kind's schema without encoding it.
    pub fn validate(&self, event: &DomainEvent) -> Result<(), ValidationError> {
        if event.entity_id.is_empty() {
            return Err(ValidationError::EmptyEntityId);
        }
        let object = event
            .payload
            .as_object()
            .ok_or(ValidationError::PayloadNotObject { kind: event.kind })?;
        for (field, expected) in required_fields(event.kind) {
            match object.get(*field) {
                None => {
                    return Err(ValidationError::MissingField {
                        kind: event.kind,
                        field,
                    })
                }
                Some(value) if !expected.matches(value) => {
                    return Err(ValidationError::WrongFieldType {
                        kind: event.kind,
                        field,
                        expected: expected.name(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Validate and serialize the event into its routing and wire bytes.
    pub fn encode(
        &self,
        event: &DomainEvent,
    ) -> Result<(RoutingDescriptor, Vec<u8>), ValidationError> {
        self.validate(event)?;
        let envelope = Envelope {
            event: event.kind,
            version: ENVELOPE_VERSION.to_string(),
            data: event.payload.clone(),
            meta: EnvelopeMeta {
                occurred_at: event.occurred_at,
                producer: self.producer.clone(),
                entity_id: event.entity_id.clone(),
                sequence: event.sequence,
                correlation_id: event.correlation_id.clone(),
                causation_id: event.causation_id.clone(),
            },
        };
        let body = serde_json::to_vec(&envelope)
            .map_err(|err| ValidationError::Malformed(err.to_string()))?;
        Ok((RoutingDescriptor::for_kind(event.kind, &self.exchange), body))
    }

    /// Parse wire bytes back into an envelope. Used by consumers and tests;
    /// rejects unknown kinds the same way `encode` does.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, ValidationError> {
        serde_json::from_slice(bytes).map_err(|err| {
            let msg = err.to_string();
            if msg.contains("unknown variant") {
                ValidationError::UnknownKind(msg)
            } else {
                ValidationError::Malformed(msg)
            }
        })
    }
}

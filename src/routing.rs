//! Routing derivation for published events.

use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Exchange events are published to when none is configured.
///
/// The bus uses a single durable topic exchange; consumers bind queues with
/// topic patterns (`transit.*`, `#`, ...). A fanout dead-letter exchange sits
/// next to it on the broker side, outside this gateway's responsibility.
pub const DEFAULT_EXCHANGE: &str = "tolling.events";

/// Where a message goes on the broker: exchange plus routing key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDescriptor {
    pub exchange: String,
    pub routing_key: String,
}

impl RoutingDescriptor {
    /// Derive routing for an event kind. The routing key is the kind's topic
    /// string and nothing else; payload contents never influence routing.
    pub fn for_kind(kind: EventKind, exchange: &str) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: kind.as_str().to_string(),
        }
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;

/// Events a client sends over its realtime channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Subscribe { booking_id: Uuid },
    Unsubscribe { booking_id: Uuid },
    UpdatePosition { booking_id: Uuid, location: GeoPoint },
}

/// Events the hub pushes to a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    PositionUpdated {
        booking_id: Uuid,
        location: GeoPoint,
    },
    Subscribed {
        booking_id: Uuid,
    },
    Unsubscribed {
        booking_id: Uuid,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        booking_id: Option<Uuid>,
        code: String,
        reason: String,
    },
}

//! Order event wire model.
//!
//! `OrderEvent` is the payload exchanged between the order service (producer)
//! and the reserver (consumer). The JSON shape is camelCase, with `products`
//! carrying the line items. Decoding is forward-compatible: unknown fields are
//! ignored and the legacy aliases `id` (for `orderId`) and `userId` (for
//! `email`) map onto the canonical fields. A body carrying both a canonical
//! name and its alias is rejected as a duplicate field. Numeric fields decode
//! an explicit `null` as zero.

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Prefix of every stored snapshot object name.
pub const SNAPSHOT_PREFIX: &str = "session-";
/// Suffix of every stored snapshot object name.
pub const SNAPSHOT_SUFFIX: &str = ".json";

/// Build the deterministic snapshot object name for a session.
pub fn snapshot_name(session_id: &str) -> String {
    format!("{}{}{}", SNAPSHOT_PREFIX, session_id, SNAPSHOT_SUFFIX)
}

/// Current time with the local UTC offset.
pub fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// An order-change event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    /// Shopping session identity; idempotency key for storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,

    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Serialized as an RFC 3339 string with offset, never as epoch numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<FixedOffset>>,

    #[serde(default, rename = "products", skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<OrderItem>>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub total: f64,
}

/// A line item within an order event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub product_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, deserialize_with = "null_as_default")]
    pub quantity: i32,

    #[serde(default, deserialize_with = "null_as_default")]
    pub price: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,

    #[serde(default, rename = "photoURL", skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

impl OrderEvent {
    /// Decode an event from a UTF-8 JSON body.
    pub fn from_json(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }

    /// Canonical serialized form, used both on the wire and for snapshots.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// The session id, if present and not blank.
    pub fn session(&self) -> Option<&str> {
        non_blank(self.session_id.as_deref())
    }

    /// Fill in the fields that the ingestion boundary owns.
    ///
    /// Generates an `orderId` when absent or empty and stamps `timestamp`
    /// with the current time when absent. Existing values are kept, so calling
    /// this more than once is harmless.
    pub fn resolve(&mut self) {
        if non_blank(self.order_id.as_deref()).is_none() {
            self.order_id = Some(Uuid::new_v4().to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now());
        }
    }
}

/// Decode `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Treat empty and whitespace-only strings as absent.
pub fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// The order service's view of an order, as handed to the publisher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,

    #[serde(default)]
    pub email: Option<String>,

    /// Session the order was last touched from, if the order carries one.
    #[serde(default)]
    pub session_id: Option<String>,

    #[serde(default)]
    pub products: Vec<OrderItem>,
}

impl Order {
    /// Order total derived from line items.
    pub fn total(&self) -> f64 {
        self.products
            .iter()
            .map(|p| p.price * f64::from(p.quantity))
            .sum()
    }
}

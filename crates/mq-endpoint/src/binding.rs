//! Default message binding.
//!
//! Maps [`Message`] to [`TransportMessage`] and back:
//!
//! | Message | Transport |
//! |---------|-----------|
//! | `Body::Text` / `Body::Bytes` / `Body::Empty` | same payload |
//! | `Body::Json` | text payload + `MqBodyType = "json"` |
//! | headers | properties (invalid names are dropped) |

use crate::domain::correlation::CorrelationId;
use crate::domain::error::BindingError;
use crate::domain::exchange::{Body, HeaderValue, Message};
use crate::ports::outbound::{MessageBinding, TransportMessage, TransportPayload};
use crate::BODY_TYPE_PROPERTY;
use tracing::debug;

const JSON_BODY_TYPE: &str = "json";

/// Words a selector parser treats as keywords; never valid property names.
const RESERVED_WORDS: &[&str] = &[
    "NULL", "TRUE", "FALSE", "NOT", "AND", "OR", "BETWEEN", "LIKE", "IN", "IS", "ESCAPE",
];

/// Whether `name` can be carried as a transport property.
///
/// Names must be identifiers (letter, `_` or `$` first; then alphanumerics,
/// `_` or `$`), must not be selector keywords and must not use the `JMS`
/// prefix reserved for header fields.
pub fn is_valid_property_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_alphabetic() || first == '_' || first == '$') {
        return false;
    }
    if !chars.all(|c| c.is_alphanumeric() || c == '_' || c == '$') {
        return false;
    }
    if name.starts_with("JMS") {
        return false;
    }
    !RESERVED_WORDS
        .iter()
        .any(|word| word.eq_ignore_ascii_case(name))
}

/// Binding used when the endpoint is not given one.
#[derive(Debug, Default, Clone)]
pub struct DefaultBinding;

impl DefaultBinding {
    pub fn new() -> Self {
        Self
    }
}

impl MessageBinding for DefaultBinding {
    fn to_transport(&self, message: &Message) -> Result<TransportMessage, BindingError> {
        let mut properties = std::collections::BTreeMap::new();
        for (name, value) in &message.headers {
            if name == BODY_TYPE_PROPERTY || !is_valid_property_name(name) {
                debug!(header = %name, "Dropping header that cannot be a transport property");
                continue;
            }
            properties.insert(name.clone(), value.clone());
        }

        let payload = match &message.body {
            Body::Empty => TransportPayload::Empty,
            Body::Text(text) => TransportPayload::Text(text.clone()),
            Body::Bytes(bytes) => TransportPayload::Bytes(bytes.clone()),
            Body::Json(value) => {
                let text = serde_json::to_string(value)
                    .map_err(|e| BindingError::InvalidJson(e.to_string()))?;
                properties.insert(BODY_TYPE_PROPERTY.to_string(), JSON_BODY_TYPE.into());
                TransportPayload::Text(text)
            }
        };

        Ok(TransportMessage {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.as_ref().map(|id| id.to_string()),
            reply_to: message.reply_to.clone(),
            message_type: message.message_type.clone(),
            properties,
            payload,
            redelivered: message.redelivered,
        })
    }

    fn from_transport(&self, message: &TransportMessage) -> Result<Message, BindingError> {
        let body_type = message.property(BODY_TYPE_PROPERTY).and_then(HeaderValue::as_str);

        let body = match (&message.payload, body_type) {
            (TransportPayload::Text(text), Some(JSON_BODY_TYPE)) => Body::Json(
                serde_json::from_str(text).map_err(|e| BindingError::InvalidJson(e.to_string()))?,
            ),
            (_, Some(other)) if other != JSON_BODY_TYPE => {
                return Err(BindingError::UnsupportedBody(other.to_string()));
            }
            (TransportPayload::Empty, _) => Body::Empty,
            (TransportPayload::Text(text), _) => Body::Text(text.clone()),
            (TransportPayload::Bytes(bytes), _) => Body::Bytes(bytes.clone()),
        };

        let headers = message
            .properties
            .iter()
            .filter(|(name, _)| name.as_str() != BODY_TYPE_PROPERTY)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Ok(Message {
            message_id: message.message_id.clone(),
            correlation_id: message.correlation_id.clone().map(CorrelationId::from),
            reply_to: message.reply_to.clone(),
            message_type: message.message_type.clone(),
            headers,
            body,
            redelivered: message.redelivered,
        })
    }
}

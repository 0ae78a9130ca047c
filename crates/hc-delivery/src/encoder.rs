//! Body Encoder
//!
//! Turns a (mapped) event or a whole batch into request bytes according to the
//! configured [`BodyFormat`]. Encoding is a pure function of its inputs.
//!
//! Form bodies only carry top-level fields. Nested mappings and sequences are
//! flattened to their compact JSON text before percent-encoding.

use bytes::Bytes;
use hc_common::{BodyFormat, Event};
use hc_config::DeliveryConfig;
use serde_json::{Map, Value};

use crate::mapper::FieldMapper;
use crate::template::{stringify, Template};
use crate::Result;

/// A ready-to-send request body
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBody {
    pub bytes: Bytes,
    pub content_type: String,
}

impl EncodedBody {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Lossy text view, used in diagnostic reports
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct BodyEncoder {
    format: BodyFormat,
    content_type: String,
    mapper: FieldMapper,
    message: Option<Template>,
}

impl BodyEncoder {
    pub fn new(format: BodyFormat, content_type: impl Into<String>, mapper: FieldMapper) -> Self {
        Self {
            format,
            content_type: content_type.into(),
            mapper,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(Template::parse(message));
        self
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        let mapper = match config.format {
            BodyFormat::Message => FieldMapper::passthrough(),
            _ => FieldMapper::new(config.mapping.as_ref()),
        };
        let encoder = Self::new(config.format, config.content_type.clone(), mapper);
        match config.message.as_deref() {
            Some(message) => encoder.with_message(message),
            None => encoder,
        }
    }

    pub fn format(&self) -> BodyFormat {
        self.format
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Encode a single event. For `json_batch` the event becomes a one-element array.
    pub fn encode_event(&self, event: &Event) -> Result<EncodedBody> {
        let bytes = match self.format {
            BodyFormat::Json => serde_json::to_vec(&Value::Object(self.mapper.map(event)))?,
            BodyFormat::JsonBatch => return self.encode_batch(std::slice::from_ref(event)),
            BodyFormat::Form => encode_form(&self.mapper.map(event)).into_bytes(),
            BodyFormat::Message => self.render_message(event).into_bytes(),
        };
        Ok(self.body(bytes))
    }

    /// Encode a whole batch as one JSON array, mapping each element first
    pub fn encode_batch(&self, events: &[Event]) -> Result<EncodedBody> {
        let items: Vec<Value> = events
            .iter()
            .map(|event| Value::Object(self.mapper.map(event)))
            .collect();
        Ok(self.body(serde_json::to_vec(&items)?))
    }

    fn render_message(&self, event: &Event) -> String {
        match &self.message {
            Some(template) => template.render(event),
            None => String::new(),
        }
    }

    fn body(&self, bytes: Vec<u8>) -> EncodedBody {
        EncodedBody {
            bytes: Bytes::from(bytes),
            content_type: self.content_type.clone(),
        }
    }
}

/// `key=value&...` with both sides percent-encoded
pub fn encode_form(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .map(|(key, value)| {
            format!(
                "{}={}",
                urlencoding::encode(key),
                urlencoding::encode(&stringify(value))
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

//! Message body codecs.
//!
//! A codec decides how an outgoing value becomes a payload plus attributes,
//! and how a delivered payload becomes the value a handler receives. Topics
//! and subscriptions are parameterized by their codec at the type level.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{Attributes, RawMessage, Received};

/// An encoded message ready to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodedMessage {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// String attributes.
    pub attributes: Attributes,
}

impl EncodedMessage {
    /// Payload without attributes.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            attributes: Attributes::new(),
        }
    }

    /// Add one attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Encoding capability associated with a topic/subscription.
pub trait MessageCodec: Send + Sync + 'static {
    /// What publishers hand in.
    type Outgoing: Send + Sync;
    /// What handlers receive.
    type Incoming: Send + 'static;

    /// Encode an outgoing value.
    fn encode(message: &Self::Outgoing) -> Result<EncodedMessage>;

    /// Decode a delivered payload. Failures cause the delivery to be released.
    fn decode(raw: RawMessage) -> Result<Self::Incoming>;
}

/// Pass-through codec: bytes and attributes in, bytes and attributes out.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl MessageCodec for BytesCodec {
    type Outgoing = EncodedMessage;
    type Incoming = RawMessage;

    fn encode(message: &EncodedMessage) -> Result<EncodedMessage> {
        Ok(message.clone())
    }

    fn decode(raw: RawMessage) -> Result<RawMessage> {
        Ok(raw)
    }
}

/// UTF-8 text bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec;

impl MessageCodec for TextCodec {
    type Outgoing = String;
    type Incoming = Received<String>;

    fn encode(message: &String) -> Result<EncodedMessage> {
        Ok(EncodedMessage::new(message.as_bytes()))
    }

    fn decode(raw: RawMessage) -> Result<Received<String>> {
        let text = String::from_utf8(raw.body.clone())
            .map_err(|e| Error::Decode(format!("message {} is not valid UTF-8: {}", raw.id, e)))?;
        Ok(raw.with_body(text))
    }
}

/// JSON bodies deserialized into `T`.
pub struct JsonCodec<T>(PhantomData<fn() -> T>);

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Outgoing = T;
    type Incoming = Received<T>;

    fn encode(message: &T) -> Result<EncodedMessage> {
        let data = serde_json::to_vec(message).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(EncodedMessage::new(data).with_attribute("content-type", "application/json"))
    }

    fn decode(raw: RawMessage) -> Result<Received<T>> {
        let value = serde_json::from_slice(&raw.body)
            .map_err(|e| Error::Decode(format!("message {}: {}", raw.id, e)))?;
        Ok(raw.with_body(value))
    }
}

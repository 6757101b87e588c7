use std::sync::OnceLock;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use super::error_code::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
    #[serde(rename = "multiple-clients", default, skip_serializing_if = "Option::is_none")]
    pub multiple_clients: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `subscription` is either one channel name or a list of them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Subscription {
    One(String),
    Many(Vec<String>),
}

impl Subscription {
    pub fn names(&self) -> Vec<String> {
        match self {
            Subscription::One(name) => vec![name.clone()],
            Subscription::Many(names) => names.clone(),
        }
    }
}

/// a bayeux message as it travels on the wire; unknown fields are kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(channel: &str, data: Option<Value>) -> Self {
        Self {
            channel: Some(channel.to_string()),
            data,
            ..Default::default()
        }
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// blank reply carrying the request `id` and `channel`
    pub fn reply_to(&self) -> Self {
        Self {
            id: self.id.clone(),
            channel: self.channel.clone(),
            ..Default::default()
        }
    }

    pub fn fail(&mut self, code: ErrorCode) {
        self.successful = Some(false);
        self.error = Some(code.to_string());
    }

    pub fn advice_mut(&mut self) -> &mut Advice {
        self.advice.get_or_insert_with(Advice::default)
    }

    pub fn is_successful(&self) -> bool {
        self.successful == Some(true)
    }
}

/// message plus the out-of-band state the broker attaches to it.
///
/// the reply is never serialized with the payload. the encoding is computed
/// at most once per instance and dropped whenever the payload is touched.
#[derive(Debug, Clone, Default)]
pub struct ServerMessage {
    payload: Message,
    reply: Option<Message>,
    encoded: OnceLock<Bytes>,
}

impl ServerMessage {
    pub fn new(payload: Message) -> Self {
        Self { payload, reply: None, encoded: OnceLock::new() }
    }

    /// inbound message with its reply already prepared
    pub fn incoming(payload: Message) -> Self {
        let reply = payload.reply_to();
        Self { payload, reply: Some(reply), encoded: OnceLock::new() }
    }

    pub fn payload(&self) -> &Message {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Message {
        self.encoded.take();
        &mut self.payload
    }

    pub fn channel(&self) -> Option<&str> {
        self.payload.channel()
    }

    pub fn reply(&self) -> Option<&Message> {
        self.reply.as_ref()
    }

    pub fn reply_mut(&mut self) -> Option<&mut Message> {
        self.reply.as_mut()
    }

    pub fn ensure_reply(&mut self) {
        if self.reply.is_none() {
            self.reply = Some(self.payload.reply_to());
        }
    }

    pub fn take_reply(&mut self) -> Option<Message> {
        self.reply.take()
    }

    /// mark the reply as failed, no-op for server-side messages without one
    pub fn fail(&mut self, code: ErrorCode) {
        if let Some(reply) = self.reply.as_mut() {
            reply.fail(code);
        }
    }

    pub fn encode(&self) -> Result<Bytes, serde_json::Error> {
        if let Some(encoded) = self.encoded.get() {
            return Ok(encoded.clone());
        }
        let encoded = Bytes::from(serde_json::to_vec(&self.payload)?);
        Ok(self.encoded.get_or_init(|| encoded).clone())
    }

    pub fn is_encoded(&self) -> bool {
        self.encoded.get().is_some()
    }
}

impl From<Message> for ServerMessage {
    fn from(payload: Message) -> Self {
        Self::new(payload)
    }
}

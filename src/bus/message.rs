//! Control bus messages.
//!
//! Payloads are JSON documents carried in NATS `MSG`/`PUB` frames.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::registry::{BackendDescriptor, BackendInfo, RegistryEvent};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bus message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bus protocol error: {0}")]
    Protocol(String),

    #[error("bus server error: {0}")]
    Server(String),

    #[error("bus server closed the connection")]
    Closed,

    #[error("bad payload on {subject}: {source}")]
    Payload {
        subject: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A message delivered on, or published to, a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub subject: String,
    pub reply: Option<String>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(subject: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            data,
        }
    }

    /// Decode a delivered payload. An empty payload is `null`.
    pub fn from_payload(
        subject: String,
        reply: Option<String>,
        payload: &[u8],
    ) -> Result<Self, BusError> {
        let data = if payload.iter().all(u8::is_ascii_whitespace) {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(payload).map_err(|source| BusError::Payload {
                subject: subject.clone(),
                source,
            })?
        };
        Ok(Self {
            subject,
            reply,
            data,
        })
    }

    pub fn payload(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(&self.data)?)
    }
}

/// Answer to a `list` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListReply {
    pub uid: String,
    pub hosts: BTreeMap<String, Vec<BackendInfo>>,
}

/// What an inbound envelope asks this worker to do.
#[derive(Debug, Clone, PartialEq)]
pub enum BusCommand {
    Registry(RegistryEvent),
    List { reply: String },
    Ignore,
}

/// Subject names under a configurable prefix.
#[derive(Debug, Clone)]
pub struct Subjects {
    pub register: String,
    pub unregister: String,
    pub list: String,
    pub start: String,
}

impl Subjects {
    pub fn new(prefix: &str) -> Self {
        Self {
            register: format!("{prefix}.register"),
            unregister: format!("{prefix}.unregister"),
            list: format!("{prefix}.list"),
            start: format!("{prefix}.start"),
        }
    }

    /// Subjects a worker subscribes to, with their subscription ids.
    pub fn subscriptions(&self) -> [(&str, u64); 3] {
        [
            (self.register.as_str(), 1),
            (self.unregister.as_str(), 2),
            (self.list.as_str(), 3),
        ]
    }

    /// Interpret an inbound envelope.
    pub fn parse(&self, envelope: Envelope) -> Result<BusCommand, BusError> {
        let descriptor = |data: serde_json::Value| {
            serde_json::from_value::<BackendDescriptor>(data).map_err(|source| BusError::Payload {
                subject: envelope.subject.clone(),
                source,
            })
        };

        let subject = envelope.subject.as_str();
        if subject == self.register {
            Ok(BusCommand::Registry(RegistryEvent::Register(descriptor(
                envelope.data.clone(),
            )?)))
        } else if subject == self.unregister {
            Ok(BusCommand::Registry(RegistryEvent::Unregister(
                descriptor(envelope.data.clone())?,
            )))
        } else if subject == self.list {
            Ok(match envelope.reply {
                Some(reply) => BusCommand::List { reply },
                None => BusCommand::Ignore,
            })
        } else {
            Ok(BusCommand::Ignore)
        }
    }
}

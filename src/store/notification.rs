//! Signed change notifications shared between decision-plane instances.
//!
//! The signature is the lowercase hex SHA-256 of `command ‖ payload` with no
//! separator; every instance must produce exactly these bytes to interoperate.

use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::bus::NotificationBus;
use super::load::{ReloadQueue, ReloadRequest};

/// Channel every instance publishes to and listens on.
pub const NOTIFICATION_CHANNEL: &str = "iam.cluster.notifications";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationCommand {
    PolicyChanged,
    SecretChanged,
}

impl NotificationCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCommand::PolicyChanged => "PolicyChanged",
            NotificationCommand::SecretChanged => "SecretChanged",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PolicyChanged" => Some(NotificationCommand::PolicyChanged),
            "SecretChanged" => Some(NotificationCommand::SecretChanged),
            _ => None,
        }
    }
}

/// On the wire the algorithm is a numeric hash identifier (`5` for
/// SHA-256, `0` when unsigned), the encoding every instance already emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Sha256,
}

impl SignatureAlgorithm {
    pub const SHA256_CODE: u64 = 5;

    pub fn code(&self) -> u64 {
        match self {
            SignatureAlgorithm::Sha256 => Self::SHA256_CODE,
        }
    }
}

mod algorithm_code {
    use super::*;
    use serde::de::Error as _;

    #[derive(Debug, Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Code(u64),
        Name(String),
    }

    pub fn serialize<S: Serializer>(algorithm: &Option<SignatureAlgorithm>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(algorithm.map(|a| a.code()).unwrap_or(0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SignatureAlgorithm>, D::Error> {
        match Option::<Repr>::deserialize(d)? {
            None | Some(Repr::Code(0)) => Ok(None),
            Some(Repr::Code(SignatureAlgorithm::SHA256_CODE)) => Ok(Some(SignatureAlgorithm::Sha256)),
            Some(Repr::Name(name)) if name.eq_ignore_ascii_case("sha256") => Ok(Some(SignatureAlgorithm::Sha256)),
            Some(other) => Err(D::Error::custom(format!("unsupported signature algorithm {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub command: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default, with = "algorithm_code")]
    pub algorithm: Option<SignatureAlgorithm>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("malformed notification: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("notification is not signed")]
    Unsigned,
    #[error("notification signature does not match its content")]
    InvalidSignature,
    #[error("unknown notification command {0:?}")]
    UnknownCommand(String),
}

fn content_hash(command: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hasher.update(payload.as_bytes());
    base16ct::lower::encode_string(&hasher.finalize())
}

impl ChangeNotification {
    pub fn new(command: NotificationCommand, payload: impl Into<String>) -> Self {
        Self {
            command: command.as_str().to_string(),
            payload: payload.into(),
            signature: String::new(),
            algorithm: None,
        }
    }

    pub fn sign(&mut self) {
        self.algorithm = Some(SignatureAlgorithm::Sha256);
        self.signature = content_hash(&self.command, &self.payload);
    }

    pub fn verify(&self) -> Result<(), NotificationError> {
        match self.algorithm {
            Some(SignatureAlgorithm::Sha256) => {}
            None => return Err(NotificationError::Unsigned),
        }
        let expected = content_hash(&self.command, &self.payload);
        if expected.as_bytes().ct_eq(self.signature.as_bytes()).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(NotificationError::InvalidSignature)
        }
    }

    /// Parse a raw bus message, check its signature and recognize its command.
    pub fn parse_verified(raw: &str) -> Result<(Self, NotificationCommand), NotificationError> {
        let notification: ChangeNotification = serde_json::from_str(raw)?;
        notification.verify()?;
        let command = NotificationCommand::parse(&notification.command)
            .ok_or_else(|| NotificationError::UnknownCommand(notification.command.clone()))?;
        Ok((notification, command))
    }
}

/// Turn one bus message into a reload request. Returns whether a reload was
/// queued; anything unverifiable or unrecognized is logged and dropped.
pub fn handle_bus_message(raw: &str, queue: &ReloadQueue) -> bool {
    match ChangeNotification::parse_verified(raw) {
        Ok((notification, command)) => {
            info!(
                command = command.as_str(),
                payload = %notification.payload,
                "received change notification, reloading secrets and policies"
            );
            queue.enqueue(ReloadRequest::noop())
        }
        Err(NotificationError::UnknownCommand(command)) => {
            warn!(command = %command, "unknown notification command");
            false
        }
        Err(err) => {
            error!(error = %err, "discarding change notification");
            false
        }
    }
}

/// Publishes signed notifications for other instances.
#[derive(Clone)]
pub struct Notifier {
    bus: Arc<dyn NotificationBus>,
    channel: String,
}

impl Notifier {
    pub fn new(bus: Arc<dyn NotificationBus>) -> Self {
        Self::with_channel(bus, NOTIFICATION_CHANNEL)
    }

    pub fn with_channel(bus: Arc<dyn NotificationBus>, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
        }
    }

    /// Sign and publish. `true` means the message reached the transport, not
    /// that any subscriber processed it.
    pub async fn notify(&self, mut notification: ChangeNotification) -> bool {
        notification.sign();
        let to_send = match serde_json::to_string(&notification) {
            Ok(s) => s,
            Err(err) => {
                error!(error = %err, "problem marshaling notification");
                return false;
            }
        };

        debug!(command = %notification.command, "sending notification");
        match self.bus.publish(&self.channel, to_send).await {
            Ok(()) => true,
            Err(err) => {
                error!(error = %err, "could not send notification");
                false
            }
        }
    }
}

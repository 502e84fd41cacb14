//! Wire protocol between the browser client and the bridge.
//!
//! Every frame is a JSON object. Inbound frames carry a `command` plus the
//! optional `message` / `fingerprint` fields; outbound frames always carry a
//! human-readable `communication` and whatever result fields apply.

use serde::{Deserialize, Serialize};

use crate::keys::KeyRecord;

pub const AUTH_SUCCESS: &str = "Authentication successful.";
pub const AUTH_REJECTED: &str = "Invalid passcode.";
pub const AUTH_ALREADY: &str = "Already authenticated.";
pub const AUTH_REQUIRED: &str = "Authentication required. Send the passcode first.";
pub const INVALID_PAYLOAD: &str = "Invalid payload.";
pub const UNKNOWN_COMMAND: &str = "Unknown command.";
pub const INTERNAL_ERROR: &str = "Internal server error";
pub const VERSION: &str = "version";

/// Longest key specifier accepted in the `fingerprint` field.
pub const MAX_KEY_SPEC_LEN: usize = 256;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// The finite set of commands a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Passcode,
    Sign,
    GetKeys,
    Version,
    ImportKey,
}

impl CommandName {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passcode" => Some(Self::Passcode),
            "sign" => Some(Self::Sign),
            "getkeys" => Some(Self::GetKeys),
            "version" => Some(Self::Version),
            "importkey" => Some(Self::ImportKey),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passcode => "passcode",
            Self::Sign => "sign",
            Self::GetKeys => "getkeys",
            Self::Version => "version",
            Self::ImportKey => "importkey",
        }
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while turning a raw frame into a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InboundError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("'{command}' requires the '{field}' field")]
    MissingField {
        command: CommandName,
        field: &'static str,
    },

    #[error("'{field}' is not a valid key specifier")]
    InvalidKeySpec { field: &'static str },
}

/// The shape every inbound frame must have before the command is looked at.
///
/// Unknown extra fields are ignored. A frame that is not a JSON object, or
/// whose known fields have the wrong type, is malformed.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub command: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl Envelope {
    pub fn from_json(text: &str) -> Result<Self, InboundError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| InboundError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(InboundError::Malformed("expected a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| InboundError::Malformed(e.to_string()))
    }

    /// `None` when the literal is not one of the known commands.
    pub fn command_name(&self) -> Option<CommandName> {
        CommandName::parse(&self.command)
    }

    /// Check the command-specific fields and build the typed command.
    pub fn into_command(self, name: CommandName) -> Result<Command, InboundError> {
        match name {
            CommandName::Passcode => Ok(Command::Passcode {
                code: required(name, "message", self.message)?,
            }),
            CommandName::Sign => {
                let message = present(name, "message", self.message)?;
                let fingerprint = required(name, "fingerprint", self.fingerprint)?;
                validate_key_spec("fingerprint", &fingerprint)?;
                Ok(Command::Sign {
                    message,
                    fingerprint,
                })
            }
            CommandName::GetKeys => Ok(Command::GetKeys),
            CommandName::Version => Ok(Command::Version),
            CommandName::ImportKey => Ok(Command::ImportKey {
                message: required(name, "message", self.message)?,
            }),
        }
    }
}

fn required(
    command: CommandName,
    field: &'static str,
    value: Option<String>,
) -> Result<String, InboundError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(InboundError::MissingField { command, field }),
    }
}

/// Like [`required`], but an empty string is a value. An empty sign
/// payload is valid base64.
fn present(
    command: CommandName,
    field: &'static str,
    value: Option<String>,
) -> Result<String, InboundError> {
    value.ok_or(InboundError::MissingField { command, field })
}

/// Reject key specifiers gpg would read as an option or that carry
/// control characters.
fn validate_key_spec(field: &'static str, spec: &str) -> Result<(), InboundError> {
    if spec.len() > MAX_KEY_SPEC_LEN
        || spec.starts_with('-')
        || spec.chars().any(|c| c.is_control())
    {
        return Err(InboundError::InvalidKeySpec { field });
    }
    Ok(())
}

/// A validated client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Passcode { code: String },
    Sign { message: String, fingerprint: String },
    GetKeys,
    Version,
    ImportKey { message: String },
}

impl Command {
    pub fn name(&self) -> CommandName {
        match self {
            Self::Passcode { .. } => CommandName::Passcode,
            Self::Sign { .. } => CommandName::Sign,
            Self::GetKeys => CommandName::GetKeys,
            Self::Version => CommandName::Version,
            Self::ImportKey { .. } => CommandName::ImportKey,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// An outbound frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub communication: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpgkeys: Option<Vec<KeyRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Reasons an outbound frame is refused before it reaches the socket.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboundError {
    #[error("communication must not be empty")]
    EmptyCommunication,

    #[error("gpgkeys[{index}] has an empty {field}")]
    IncompleteKey { index: usize, field: &'static str },
}

impl Response {
    pub fn status(communication: impl Into<String>) -> Self {
        Self {
            communication: communication.into(),
            ..Self::default()
        }
    }

    pub fn failure(communication: impl Into<String>, error: impl Into<String>) -> Self {
        Self::status(communication).with_error(error)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_keys(mut self, keys: Vec<KeyRecord>) -> Self {
        self.gpgkeys = Some(keys);
        self
    }

    pub fn with_product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self.version = Some(version.into());
        self
    }

    pub fn must_authenticate() -> Self {
        Self::status(AUTH_REQUIRED)
    }

    pub fn invalid_payload(err: &InboundError) -> Self {
        Self::failure(INVALID_PAYLOAD, err.to_string())
    }

    pub fn unknown_command() -> Self {
        Self::status(UNKNOWN_COMMAND)
    }

    /// Check the frame against the outbound schema.
    pub fn validate(&self) -> Result<(), OutboundError> {
        if self.communication.trim().is_empty() {
            return Err(OutboundError::EmptyCommunication);
        }
        for (index, key) in self.gpgkeys.iter().flatten().enumerate() {
            if key.fingerprint.is_empty() {
                return Err(OutboundError::IncompleteKey {
                    index,
                    field: "fingerprint",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Command, InboundError> {
        let envelope = Envelope::from_json(text)?;
        let name = envelope
            .command_name()
            .ok_or_else(|| InboundError::Malformed("unknown".into()))?;
        envelope.into_command(name)
    }

    #[test]
    fn parses_every_known_command() {
        assert_eq!(
            parse(r#"{"command":"passcode","message":"123456"}"#).unwrap(),
            Command::Passcode {
                code: "123456".into()
            }
        );
        assert_eq!(
            parse(r#"{"command":"sign","message":"aGk=","fingerprint":"ABCD"}"#).unwrap(),
            Command::Sign {
                message: "aGk=".into(),
                fingerprint: "ABCD".into()
            }
        );
        assert_eq!(parse(r#"{"command":"getkeys"}"#).unwrap(), Command::GetKeys);
        assert_eq!(parse(r#"{"command":"version"}"#).unwrap(), Command::Version);
        assert_eq!(
            parse(r#"{"command":"importkey","message":"a2V5"}"#).unwrap(),
            Command::ImportKey {
                message: "a2V5".into()
            }
        );
    }

    #[test]
    fn unknown_literal_is_schema_valid_but_unnamed() {
        let envelope = Envelope::from_json(r#"{"command":"frobnicate"}"#).unwrap();
        assert_eq!(envelope.command, "frobnicate");
        assert!(envelope.command_name().is_none());
    }

    #[test]
    fn extra_fields_are_ignored() {
        let envelope = Envelope::from_json(r#"{"command":"version","extra":1}"#).unwrap();
        assert_eq!(envelope.command_name(), Some(CommandName::Version));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in [
            "not json",
            "[]",
            r#"["sign"]"#,
            r#""version""#,
            r#"{"message":"x"}"#,
            r#"{"command":42}"#,
            r#"{"command":"sign","message":7}"#,
        ] {
            assert!(
                matches!(Envelope::from_json(text), Err(InboundError::Malformed(_))),
                "accepted {text}"
            );
        }
    }

    #[test]
    fn sign_requires_message_and_fingerprint() {
        let err = parse(r#"{"command":"sign","fingerprint":"ABCD"}"#).unwrap_err();
        assert_eq!(
            err,
            InboundError::MissingField {
                command: CommandName::Sign,
                field: "message"
            }
        );

        let err = parse(r#"{"command":"sign","message":"aGk=","fingerprint":"  "}"#).unwrap_err();
        assert!(err.to_string().contains("fingerprint"));
    }

    #[test]
    fn fingerprint_cannot_look_like_an_option() {
        let err = parse(r#"{"command":"sign","message":"aGk=","fingerprint":"--yes"}"#).unwrap_err();
        assert_eq!(
            err,
            InboundError::InvalidKeySpec {
                field: "fingerprint"
            }
        );

        let err =
            parse(r#"{"command":"sign","message":"aGk=","fingerprint":"AB\nCD"}"#).unwrap_err();
        assert!(matches!(err, InboundError::InvalidKeySpec { .. }));
    }

    #[test]
    fn passcode_requires_message() {
        let err = parse(r#"{"command":"passcode"}"#).unwrap_err();
        assert!(matches!(
            err,
            InboundError::MissingField {
                command: CommandName::Passcode,
                ..
            }
        ));
    }

    #[test]
    fn response_omits_absent_fields() {
        let json = serde_json::to_value(Response::status("hello")).unwrap();
        assert_eq!(json, serde_json::json!({ "communication": "hello" }));
    }

    #[test]
    fn empty_key_list_is_serialized() {
        let resp = Response::status("No GPG keys found.").with_keys(vec![]);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["gpgkeys"], serde_json::json!([]));
    }

    #[test]
    fn validate_rejects_empty_communication() {
        assert_eq!(
            Response::status(" ").validate(),
            Err(OutboundError::EmptyCommunication)
        );
        assert!(Response::status("ok").validate().is_ok());
    }

    #[test]
    fn validate_rejects_incomplete_key() {
        let resp = Response::status("Keys retrieved.").with_keys(vec![KeyRecord {
            fingerprint: String::new(),
            uid: "Alice".into(),
            pubkey: None,
        }]);
        assert_eq!(
            resp.validate(),
            Err(OutboundError::IncompleteKey {
                index: 0,
                field: "fingerprint"
            })
        );
    }

    #[test]
    fn key_without_uid_is_still_valid() {
        let resp = Response::status("Keys retrieved.").with_keys(vec![KeyRecord {
            fingerprint: "ABCD1234".into(),
            uid: String::new(),
            pubkey: None,
        }]);
        assert!(resp.validate().is_ok());
    }

    #[test]
    fn sign_message_may_be_empty_but_not_absent() {
        assert_eq!(
            parse(r#"{"command":"sign","message":"","fingerprint":"ABCD"}"#).unwrap(),
            Command::Sign {
                message: String::new(),
                fingerprint: "ABCD".into()
            }
        );
        assert!(parse(r#"{"command":"importkey","message":""}"#).is_err());
    }

    #[test]
    fn version_response_shape() {
        let resp = Response::status(VERSION).with_product("gpg-bridge", "0.3.0");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["communication"], "version");
        assert_eq!(json["name"], "gpg-bridge");
        assert_eq!(json["version"], "0.3.0");
    }
}

pub mod certs;
pub mod context;
pub mod dispatch;
pub mod events;
pub mod gpg;
pub mod keys;
pub mod locator;
pub mod proto;
pub mod runner;
pub mod session;
pub mod temp;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

/// Product name reported by the `version` command.
pub const APP_NAME: &str = "gpg-bridge";

/// Port the HTTPS/WebSocket listener binds by default.
pub const DEFAULT_PORT: u16 = 5151;

/// Maximum inbound WebSocket message size in bytes (8 MB).
///
/// Sign and import payloads arrive base64-encoded inside a single text
/// frame, so this bounds the size of a document that can be signed.
pub const MAX_MESSAGE_LENGTH: usize = 8 * 1024 * 1024;

//! Command workflows that shell out to gpg.
//!
//! Sign and import share one shape: decode the payload, park it in a
//! [`TempResource`], run gpg against the file, remove the file once the
//! process has exited, then turn the outcome into a [`Response`]. The temp
//! file is removed whatever the outcome.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::{debug, error, info, warn};

use crate::context::BridgeContext;
use crate::dispatch::Outbox;
use crate::events::{BridgeEvent, LogLevel};
use crate::gpg::GpgError;
use crate::keys;
use crate::proto::{INVALID_PAYLOAD, Response};
use crate::temp::TempResource;

pub const SIGN_STARTED: &str = "Signing process started. Please touch your YubiKey.";
pub const SIGN_SUCCEEDED: &str = "Message has been signed successfully.";
pub const SIGN_FAILED: &str = "Signing failed";
pub const KEYS_RETRIEVED: &str = "Keys retrieved.";
pub const NO_KEYS: &str = "No GPG keys found.";
pub const KEYS_FAILED: &str = "Failed to retrieve keys.";
pub const IMPORT_SUCCEEDED: &str = "Key successfully imported.";
pub const IMPORT_FAILED: &str = "Key import failed";

const ARMOR_HEADER: &str = "-----BEGIN PGP";

/// Standard alphabet with optional padding and ignored trailing bits.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode a client payload.
///
/// Browsers hand over base64 in several shapes: wrapped at 76 columns,
/// unpadded, or in the URL-safe alphabet. All of those decode; anything
/// outside both alphabets does not.
pub fn decode_payload(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let normalized: String = text
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            c => c,
        })
        .collect();
    LENIENT.decode(normalized)
}

/// Text to put in a response's `error` field.
///
/// A gpg that ran and failed is described by what it printed; everything
/// else by the error itself.
fn error_text(err: &GpgError) -> String {
    match err {
        GpgError::Failed { stderr, .. } if !stderr.trim().is_empty() => {
            stderr.trim().to_owned()
        }
        other => other.to_string(),
    }
}

/// Detach-sign a base64 payload with the key `fingerprint`.
///
/// Sends the "touch your token" status through `out` before gpg starts and
/// returns the final response.
pub async fn sign(
    ctx: &BridgeContext,
    out: &Outbox,
    message: &str,
    fingerprint: &str,
) -> Response {
    let bytes = match decode_payload(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("sign payload is not base64: {e}");
            return Response::failure(
                INVALID_PAYLOAD,
                format!("message is not valid base64: {e}"),
            );
        }
    };

    let file = match TempResource::create(ctx.temp_dir(), "message", "txt", &bytes).await {
        Ok(file) => file,
        Err(e) => {
            error!("{e}");
            ctx.log(LogLevel::Error, format!("Signing failed: {e}"));
            return Response::failure(SIGN_FAILED, e.to_string());
        }
    };

    out.send(Response::status(SIGN_STARTED)).await;
    ctx.emit(BridgeEvent::TouchRequired {
        fingerprint: fingerprint.to_owned(),
    });
    info!(fingerprint = %fingerprint, bytes = bytes.len(), "signing started");

    let result = ctx.gpg().detach_sign(fingerprint, file.path()).await;
    file.remove().await;

    ctx.emit(BridgeEvent::TouchCompleted {
        fingerprint: fingerprint.to_owned(),
        success: result.is_ok(),
    });

    match result {
        Ok(signature) => {
            info!(fingerprint = %fingerprint, "message signed");
            ctx.log(LogLevel::Info, SIGN_SUCCEEDED);
            Response::status(SIGN_SUCCEEDED)
                .with_message(message)
                .with_signature(signature)
        }
        Err(e) => {
            warn!(fingerprint = %fingerprint, "signing failed: {e}");
            ctx.log(LogLevel::Error, format!("Signing failed: {e}"));
            Response::failure(SIGN_FAILED, error_text(&e))
        }
    }
}

/// List public keys with their armored exports.
pub async fn get_keys(ctx: &BridgeContext) -> Response {
    match keys::list_keys(ctx.gpg()).await {
        Ok(keys) if keys.is_empty() => Response::status(NO_KEYS).with_keys(keys),
        Ok(keys) => {
            info!("returning {} keys", keys.len());
            Response::status(KEYS_RETRIEVED).with_keys(keys)
        }
        Err(e) => {
            warn!("key listing failed: {e}");
            ctx.log(LogLevel::Error, format!("{KEYS_FAILED} {e}"));
            Response::failure(KEYS_FAILED, error_text(&e))
        }
    }
}

/// Import key material into the keyring.
///
/// Accepts either ASCII armor as-is or base64 of any key encoding.
pub async fn import_key(ctx: &BridgeContext, message: &str) -> Response {
    let bytes = if message.trim_start().starts_with(ARMOR_HEADER) {
        message.as_bytes().to_vec()
    } else {
        match decode_payload(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("import payload is neither armor nor base64: {e}");
                return Response::failure(
                    INVALID_PAYLOAD,
                    format!("message is neither ASCII armor nor base64: {e}"),
                );
            }
        }
    };

    let file = match TempResource::create(ctx.temp_dir(), "key", "asc", &bytes).await {
        Ok(file) => file,
        Err(e) => {
            error!("{e}");
            return Response::failure(IMPORT_FAILED, e.to_string());
        }
    };

    let result = ctx.gpg().import(file.path()).await;
    file.remove().await;

    match result {
        Ok(report) => {
            info!("key imported");
            ctx.log(LogLevel::Info, IMPORT_SUCCEEDED);
            let response = Response::status(IMPORT_SUCCEEDED);
            match report.trim() {
                "" => response,
                report => response.with_message(report),
            }
        }
        Err(e) => {
            warn!("key import failed: {e}");
            ctx.log(LogLevel::Error, format!("{IMPORT_FAILED}: {e}"));
            Response::failure(IMPORT_FAILED, error_text(&e))
        }
    }
}

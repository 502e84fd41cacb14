//! Key catalog: parse `gpg --with-colons` listings and attach armored exports.
//!
//! Listing format (one record per line, fields separated by `:`):
//!
//! ```text
//! pub:u:255:22:1A2B3C4D5E6F7A8B:1700000000:::u:::scESC:::::ed25519:::0:
//! fpr:::::::::0123456789ABCDEF0123456789ABCDEF01234567:
//! uid:u::::1700000000::HASH::Alice <alice@example.com>::::::::::0:
//! sub:u:255:18:...
//! fpr:::::::::...
//! ```
//!
//! Both the fingerprint and the user id live in field 10 (index 9).

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gpg::{Gpg, GpgError};

const USER_ID_FIELD: usize = 9;

/// One public key as reported to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub fingerprint: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
}

#[derive(Debug, Default)]
struct OpenRecord {
    fingerprint: Option<String>,
}

/// Parse a colon listing into records without public key material.
///
/// A `pub` line opens a record, the first `fpr` after it sets the
/// fingerprint, and the first `uid` closes it. Later `fpr` lines (subkeys)
/// and additional `uid` lines of an already closed record are ignored, and
/// a `pub` never followed by a `uid` produces nothing.
pub fn parse_colon_listing(listing: &str) -> Vec<KeyRecord> {
    let mut records = Vec::new();
    let mut open: Option<OpenRecord> = None;

    for line in listing.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        match fields[0] {
            "pub" => open = Some(OpenRecord::default()),
            "fpr" => {
                if let Some(record) = open.as_mut()
                    && record.fingerprint.is_none()
                {
                    record.fingerprint = field(&fields, USER_ID_FIELD);
                }
            }
            "uid" => {
                if let Some(record) = open.take() {
                    records.push(KeyRecord {
                        fingerprint: record.fingerprint.unwrap_or_default(),
                        uid: field(&fields, USER_ID_FIELD).unwrap_or_default(),
                        pubkey: None,
                    });
                }
            }
            _ => {}
        }
    }

    records
}

fn field(fields: &[&str], index: usize) -> Option<String> {
    fields.get(index).map(|s| unescape_colon_field(s))
}

/// gpg escapes `:` and other special bytes in user ids as `\xHH`.
fn unescape_colon_field(raw: &str) -> String {
    if !raw.contains("\\x") {
        return raw.to_owned();
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && bytes.get(i + 1) == Some(&b'x')
            && let Some(hex) = raw.get(i + 2..i + 4)
            && let Ok(byte) = u8::from_str_radix(hex, 16)
        {
            out.push(byte);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// List every public key with its armored export.
///
/// Keys with no fingerprint or whose export fails are left out, so the
/// result may be shorter than the keyring. An empty uid is kept as is.
pub async fn list_keys(gpg: &Gpg) -> Result<Vec<KeyRecord>, GpgError> {
    let listing = gpg.list_keys_colons().await?;
    let mut records = parse_colon_listing(&listing);
    debug!("parsed {} key records", records.len());
    // Without a fingerprint there is nothing to export by.
    records.retain(|record| !record.fingerprint.is_empty());

    let exports = join_all(
        records
            .iter()
            .map(|record| gpg.export_armored(&record.fingerprint)),
    )
    .await;

    let keys = records
        .into_iter()
        .zip(exports)
        .filter_map(|(mut record, export)| match export {
            Ok(armored) => {
                record.pubkey = Some(armored);
                Some(record)
            }
            Err(e) => {
                warn!("dropping key {} from listing: {e}", record.fingerprint);
                None
            }
        })
        .collect();

    Ok(keys)
}

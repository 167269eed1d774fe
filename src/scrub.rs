//! Hide credentials in data that is about to be logged.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use reqwest::header::{HeaderMap, HeaderValue};

use crate::defs::JsonValue;

/// The replacement for any secret value.
pub const MASK: &str = "********";

/// Field names whose values must never be logged, compared case-insensitively.
const SECRET_KEYS: [&str; 3] = ["password", "authenticate", "cookie"];

/// Should the value of this field be masked?
#[inline]
#[must_use]
pub fn is_secret_key(key: &str) -> bool {
    SECRET_KEYS
        .iter()
        .any(|secret| key.eq_ignore_ascii_case(secret))
}

/// Replace the values of all secret fields with [`MASK`], at any depth.
///
/// Objects nested in arrays are scrubbed too; all other values are returned
/// unchanged.
#[must_use]
pub fn scrub_passwords(data: &JsonValue) -> JsonValue {
    match *data {
        JsonValue::Object(ref obj) => JsonValue::Object(
            obj.iter()
                .map(|(key, value)| {
                    if is_secret_key(key) {
                        (key.clone(), JsonValue::String(MASK.to_owned()))
                    } else {
                        (key.clone(), scrub_passwords(value))
                    }
                })
                .collect(),
        ),
        JsonValue::Array(ref items) => JsonValue::Array(items.iter().map(scrub_passwords).collect()),
        ref other => other.clone(),
    }
}

/// Render a header value for the log, masking anything secret or sensitive.
fn header_for_log(name: &str, value: &HeaderValue) -> String {
    if is_secret_key(name) || value.is_sensitive() {
        MASK.to_owned()
    } else {
        String::from_utf8_lossy(value.as_bytes()).into_owned()
    }
}

/// Render a set of headers as `(name, value)` pairs fit for logging.
#[must_use]
pub fn scrub_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str().to_owned(), header_for_log(name.as_str(), value)))
        .collect()
}

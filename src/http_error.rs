//! Normalize the error envelopes returned by the appliances.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause
//!
//! Different appliance families report failures in different ways: NetShark
//! and friends send an XML `<error>` element, NetProfiler sends JSON with
//! either flat `error_id`/`error_text` keys or a `status_text` key, newer
//! services nest an `error` object, and some only send a bare status line.
//! [`HttpError`] folds all of them into an `(error_id, error_text)` pair.

use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Error as AnyError};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use xmltree::Element;

/// The session cookie is no longer valid.
pub const AUTH_INVALID_SESSION: &str = "AUTH_INVALID_SESSION";

/// The OAuth access token has expired.
pub const AUTH_EXPIRED_TOKEN: &str = "AUTH_EXPIRED_TOKEN";

/// The resource requires authentication.
pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";

/// The supplied credentials were rejected.
pub const AUTH_INVALID_CREDENTIALS: &str = "AUTH_INVALID_CREDENTIALS";

/// The error envelope itself could not be understood.
pub const INVALID_ERROR_IDENTIFIER: &str = "INVALID_ERROR_IDENTIFIER";

/// The text used when a 401 response carries no usable envelope.
const NOT_AUTHORIZED: &str = "Not authorized";

/// The hint appended to [`NOT_AUTHORIZED`].
const NOT_AUTHORIZED_HINT: &str = " You are not logged in. Use the auth parameter to enter valid \
                                   credentials or authenticate using the authenticate() method";

/// A non-success HTTP response from an appliance.
#[derive(Debug, Clone, Error)]
#[error(
    "HTTP {method} on {url} returned status {} ({reason}): {error_text}",
    .status.as_u16()
)]
pub struct HttpError {
    /// The request method.
    method: Method,

    /// The full request URL.
    url: String,

    /// The HTTP status code.
    status: StatusCode,

    /// The reason phrase for the status code.
    reason: String,

    /// The appliance-specific error identifier, if any.
    error_id: Option<String>,

    /// The human-readable error description.
    error_text: String,
}

/// The JSON error envelopes we know about.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonEnvelope {
    /// NetShark-style flat identifier and text.
    Flat {
        /// The error identifier.
        error_id: Option<String>,

        /// The error description.
        error_text: String,
    },

    /// A nested `error` object.
    Nested {
        /// The error details.
        error: NestedError,
    },

    /// NetProfiler-style status text only.
    Status {
        /// The error description.
        status_text: String,
    },
}

/// The nested `error` object of a JSON envelope.
#[derive(Debug, Deserialize)]
struct NestedError {
    /// The short error message; an identifier if it looks like one.
    message: Option<String>,

    /// The longer error description.
    detail: Option<String>,
}

/// Decode an XML error envelope.
fn parse_xml(body: &str) -> Result<(Option<String>, String), AnyError> {
    let elem = Element::parse(body.as_bytes()).context("Could not parse the XML error body")?;
    match elem.name.as_str() {
        "error" => Ok((
            elem.attributes.get("error_id").cloned(),
            elem.attributes
                .get("error_text")
                .cloned()
                .unwrap_or_default(),
        )),
        "TraceStats" => Ok((
            None,
            elem.attributes.get("Cause").cloned().unwrap_or_default(),
        )),
        other => Err(anyhow!(
            "Unable to parse error message from server: unexpected <{other}> element"
        )),
    }
}

/// Check whether a nested error message is an identifier like `BAD_FILTER`.
fn is_identifier(msg: &str) -> bool {
    !msg.is_empty()
        && msg
            .chars()
            .all(|chr| chr.is_ascii_uppercase() || chr.is_ascii_digit() || chr == '_')
}

/// Decode a JSON error envelope.
fn parse_json(body: &str) -> Result<(Option<String>, String), AnyError> {
    let envelope: JsonEnvelope =
        serde_json::from_str(body).context("Could not parse the JSON error body")?;
    Ok(match envelope {
        JsonEnvelope::Flat {
            error_id,
            error_text,
        } => (error_id, error_text),
        JsonEnvelope::Nested { error } => {
            let error_id = error
                .message
                .as_deref()
                .filter(|msg| is_identifier(msg))
                .map(str::to_owned);
            let text = error.detail.or(error.message).unwrap_or_default();
            (error_id, text)
        }
        JsonEnvelope::Status { status_text } => (None, status_text),
    })
}

impl HttpError {
    /// Build the normalized error from the pieces of a failed response.
    ///
    /// Never fails: an envelope that cannot be decoded yields
    /// [`INVALID_ERROR_IDENTIFIER`] with the decoding problem as the text.
    #[must_use]
    pub fn from_response(
        method: &Method,
        url: &str,
        status: StatusCode,
        content_type: Option<&str>,
        body: &str,
    ) -> Self {
        let reason = status.canonical_reason().unwrap_or_default().to_owned();
        let parsed = match content_type {
            Some(ctype) if ctype.contains("text/xml") => parse_xml(body),
            Some(ctype) if ctype.contains("application/json") => parse_json(body),
            _ if status == StatusCode::UNAUTHORIZED => Ok((None, NOT_AUTHORIZED.to_owned())),
            _ => Ok((None, reason.clone())),
        };
        let (error_id, error_text) = match parsed {
            Ok((error_id, text)) if text == NOT_AUTHORIZED => {
                (error_id, format!("{text}{NOT_AUTHORIZED_HINT}"))
            }
            Ok(pair) => pair,
            Err(err) => (Some(INVALID_ERROR_IDENTIFIER.to_owned()), format!("{err:#}")),
        };
        Self {
            method: method.clone(),
            url: url.to_owned(),
            status,
            reason,
            error_id,
            error_text,
        }
    }

    #[inline]
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    #[inline]
    #[must_use]
    pub fn error_id(&self) -> Option<&str> {
        self.error_id.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn error_text(&self) -> &str {
        &self.error_text
    }
}

/// The error identifiers that mean "log in again and retry".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExpiry {
    /// The identifiers themselves.
    codes: BTreeSet<String>,
}

impl Default for SessionExpiry {
    /// The identifiers reported by appliances for expired sessions and tokens.
    #[inline]
    fn default() -> Self {
        Self::from_codes([AUTH_INVALID_SESSION, AUTH_EXPIRED_TOKEN])
    }
}

impl SessionExpiry {
    /// Also treat missing or rejected credentials as an expired session.
    #[inline]
    #[must_use]
    pub fn extended() -> Self {
        Self::from_codes([
            AUTH_INVALID_SESSION,
            AUTH_EXPIRED_TOKEN,
            AUTH_REQUIRED,
            AUTH_INVALID_CREDENTIALS,
        ])
    }

    /// Build a set from arbitrary identifiers.
    #[inline]
    #[must_use]
    pub fn from_codes<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
        }
    }

    /// Never reauthenticate.
    #[inline]
    #[must_use]
    pub fn none() -> Self {
        Self {
            codes: BTreeSet::new(),
        }
    }

    /// Does this error identifier mean the session has expired?
    #[inline]
    #[must_use]
    pub fn contains(&self, error_id: Option<&str>) -> bool {
        error_id.map_or(false, |id| self.codes.contains(id))
    }

    /// Does this HTTP error mean the session has expired?
    #[inline]
    #[must_use]
    pub fn matches(&self, err: &HttpError) -> bool {
        self.contains(err.error_id())
    }

    #[inline]
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }
}

//! Common definitions for the steelscript REST bindings.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

#![allow(clippy::pub_use)]

use core::fmt::Debug;
use std::path::PathBuf;
use std::result::Result as StdResult;

use anyhow::Error as AnyError;
use thiserror::Error;

use crate::http_error::HttpError;

pub use serde_json::Value as JsonValue;

/// The version of the steelscript package, sent in the User-Agent header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The common resource used to check that an appliance is alive.
pub const PING_PATH: &str = "/api/common/1.0/ping";

/// The common resource listing the services and API versions of an appliance.
pub const SERVICES_PATH: &str = "/api/common/1.0/services";

/// The common resource listing the supported authentication methods.
pub const AUTH_INFO_PATH: &str = "/api/common/1.0/auth_info";

/// The cookie-based login resource.
pub const LOGIN_PATH: &str = "/api/common/1.0/login";

/// The OAuth access token resource.
pub const OAUTH_TOKEN_PATH: &str = "/api/common/1.0/oauth/token";

/// An error that occurred while talking to an appliance.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The appliance could not authenticate us.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The connection parameters (hostname, port, URL) are invalid.
    #[error("Invalid connection configuration: {0}")]
    Config(String),

    /// The appliance returned something that is not what the request expected.
    #[error("Unexpected content type: expected {expected}, got {actual}")]
    ContentType {
        /// The content type we asked for.
        expected: String,

        /// The content type the appliance sent.
        actual: String,
    },

    /// The appliance's response could not be decoded.
    #[error("Could not decode the appliance response")]
    Decode(#[source] AnyError),

    /// Something went wrong while reading or writing a local file.
    #[error("Local file operation failed")]
    File(#[source] AnyError),

    /// A download would overwrite an existing file.
    #[error("The file {} already exists", .0.display())]
    FileExists(PathBuf),

    /// The appliance returned an HTTP error status.
    #[error(transparent)]
    Http(Box<HttpError>),

    /// Something went really, really wrong...
    #[error("steelscript internal error: {0}")]
    Internal(String),

    /// No file name could be determined for a download.
    #[error("{0} is not a valid path; specify a full path for the file to be created")]
    NoFilename(String),

    /// Could not build or send an HTTP(S) request.
    #[error("Could not send an HTTP request to the appliance")]
    Reqwest(#[source] AnyError),

    /// The appliance does not support the requested API versions.
    #[error("API version negotiation failed: {0}")]
    Version(String),
}

impl Error {
    /// The normalized HTTP error, if the appliance returned one.
    #[inline]
    #[must_use]
    pub fn http(&self) -> Option<&HttpError> {
        match *self {
            Self::Http(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<HttpError> for Error {
    #[inline]
    fn from(err: HttpError) -> Self {
        Self::Http(Box::new(err))
    }
}

/// A helper type for functions that may return an [`enum@Error`] value.
pub type Result<T> = StdResult<T, Error>;

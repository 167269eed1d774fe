//! Authentication descriptors and the credentials derived from them.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use md5::{Digest, Md5};
use reqwest::header::{self, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::defs::{Error, Result};

/// The order in which authentication methods are tried.
const PREFERENCE: [AuthMethod; 4] = [
    AuthMethod::OAuth2ClientCredentials,
    AuthMethod::OAuth,
    AuthMethod::Cookie,
    AuthMethod::Basic,
];

/// The JOSE header of the unsigned OAuth assertion.
const ASSERTION_HEADER: &[u8] = br#"{"alg":"none"}"#;

/// A way of proving our identity to an appliance.
///
/// Note: any changes to this enum shall be considered breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_enums)]
pub enum AuthMethod {
    /// HTTP Basic authentication.
    Basic,

    /// A session cookie obtained from the login resource.
    Cookie,

    /// A bearer token obtained for an OAuth access code.
    OAuth,

    /// A bearer token obtained through an OAuth 2.0 client credentials grant.
    OAuth2ClientCredentials,
}

impl AsRef<str> for AuthMethod {
    #[inline]
    fn as_ref(&self) -> &str {
        match *self {
            Self::Basic => "BASIC",
            Self::Cookie => "COOKIE",
            Self::OAuth => "OAUTH_2_0",
            Self::OAuth2ClientCredentials => "OAUTH2.0 CLIENT CREDENTIALS",
        }
    }
}

impl Display for AuthMethod {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{name}", name = self.as_ref())
    }
}

/// Username/password credentials for Basic or Cookie authentication.
#[derive(Debug, Clone)]
pub struct UserAuth {
    /// The account name.
    username: String,

    /// The account password.
    password: SecretString,

    /// The methods these credentials may be used with.
    methods: Vec<AuthMethod>,
}

impl UserAuth {
    /// Use these credentials with whichever of Basic or Cookie the appliance supports.
    #[inline]
    #[must_use]
    pub fn new(username: &str, password: SecretString) -> Self {
        Self {
            username: username.to_owned(),
            password,
            methods: vec![AuthMethod::Basic, AuthMethod::Cookie],
        }
    }

    /// Restrict these credentials to a single method.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] unless `method` is Basic or Cookie.
    pub fn with_method(username: &str, password: SecretString, method: AuthMethod) -> Result<Self> {
        match method {
            AuthMethod::Basic | AuthMethod::Cookie => Ok(Self {
                username: username.to_owned(),
                password,
                methods: vec![method],
            }),
            other => Err(Error::Auth(format!(
                "{other} cannot be used with a username and password"
            ))),
        }
    }

    #[inline]
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    #[inline]
    #[must_use]
    pub fn password(&self) -> &SecretString {
        &self.password
    }

    #[inline]
    #[must_use]
    pub fn methods(&self) -> &[AuthMethod] {
        &self.methods
    }
}

/// An OAuth access code.
#[derive(Debug, Clone)]
pub struct OAuth {
    /// The access code generated on the appliance.
    access_code: SecretString,
}

impl OAuth {
    #[inline]
    #[must_use]
    pub fn new(access_code: SecretString) -> Self {
        Self { access_code }
    }

    #[inline]
    #[must_use]
    pub fn access_code(&self) -> &SecretString {
        &self.access_code
    }
}

/// OAuth 2.0 client credentials for an external token endpoint.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    /// The URL of the token endpoint.
    token_url: String,

    /// The requested scope.
    scope: String,

    /// The client identifier.
    client_id: String,

    /// The client secret.
    client_secret: SecretString,
}

impl ClientCredentials {
    #[inline]
    #[must_use]
    pub fn new(token_url: &str, scope: &str, client_id: &str, client_secret: SecretString) -> Self {
        Self {
            token_url: token_url.to_owned(),
            scope: scope.to_owned(),
            client_id: client_id.to_owned(),
            client_secret,
        }
    }

    #[inline]
    #[must_use]
    pub fn token_url(&self) -> &str {
        &self.token_url
    }

    #[inline]
    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[inline]
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[inline]
    #[must_use]
    pub fn client_secret(&self) -> &SecretString {
        &self.client_secret
    }
}

/// How do we authenticate to the appliance?
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Auth {
    /// Username and password.
    User(UserAuth),

    /// An OAuth access code.
    OAuth(OAuth),

    /// An OAuth 2.0 client credentials grant.
    ClientCredentials(ClientCredentials),
}

impl Auth {
    /// The methods these credentials may be used with.
    #[inline]
    #[must_use]
    pub fn methods(&self) -> &[AuthMethod] {
        match *self {
            Self::User(ref user) => user.methods(),
            Self::OAuth(_) => &[AuthMethod::OAuth],
            Self::ClientCredentials(_) => &[AuthMethod::OAuth2ClientCredentials],
        }
    }
}

/// The authentication methods an appliance accepts.
///
/// Note: any changes to this structure shall be considered breaking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs, clippy::struct_excessive_bools)]
pub struct SupportedMethods {
    /// HTTP Basic authentication.
    pub basic: bool,

    /// Session cookie authentication.
    pub cookie: bool,

    /// OAuth access code authentication.
    pub oauth: bool,

    /// OAuth 2.0 client credentials.
    pub client_credentials: bool,
}

impl SupportedMethods {
    /// The fallback when the appliance does not tell us.
    #[inline]
    #[must_use]
    pub const fn basic_only() -> Self {
        Self {
            basic: true,
            cookie: false,
            oauth: false,
            client_credentials: false,
        }
    }

    /// Interpret the `supported_methods` list of the `auth_info` resource.
    #[must_use]
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .fold(Self::default(), |mut acc, name| {
                match name.as_ref() {
                    "BASIC" => acc.basic = true,
                    "COOKIE" => acc.cookie = true,
                    "OAUTH_2_0" | "OAUTH2.0" => acc.oauth = true,
                    "OAUTH2.0 CLIENT CREDENTIALS" => acc.client_credentials = true,
                    _ => (),
                };
                acc
            })
    }

    #[inline]
    #[must_use]
    pub const fn supports(&self, method: AuthMethod) -> bool {
        match method {
            AuthMethod::Basic => self.basic,
            AuthMethod::Cookie => self.cookie,
            AuthMethod::OAuth => self.oauth,
            AuthMethod::OAuth2ClientCredentials => self.client_credentials,
        }
    }

    /// Pick the preferred method that is both supported and wanted.
    #[must_use]
    pub fn select(&self, wanted: &[AuthMethod]) -> Option<AuthMethod> {
        PREFERENCE
            .iter()
            .copied()
            .find(|method| self.supports(*method) && wanted.contains(method))
    }
}

/// Mark a credential header value as sensitive so that it is never printed.
fn sensitive(value: String) -> Result<HeaderValue> {
    let mut hdr = HeaderValue::try_from(value)
        .context("Could not build the HTTPS Authorization header")
        .map_err(Error::Reqwest)?;
    hdr.set_sensitive(true);
    Ok(hdr)
}

/// Build an `Authorization: Basic ...` header.
///
/// # Errors
///
/// [`Error::Reqwest`] if the credentials do not fit in a header.
pub fn basic_header(username: &str, password: &SecretString) -> Result<HeaderMap> {
    let encoded = STANDARD.encode(format!(
        "{username}:{password}",
        password = password.expose_secret()
    ));
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, sensitive(format!("Basic {encoded}"))?);
    Ok(headers)
}

/// Build the Authorization header for an OAuth access token.
///
/// A plain token yields `Bearer`, a three-part signed token `SignedBearer`.
///
/// # Errors
///
/// [`Error::Auth`] for any other number of dot-separated segments.
pub fn bearer_header(token: &str) -> Result<HeaderMap> {
    let scheme = match token.split('.').count() {
        1 => "Bearer",
        3 => "SignedBearer",
        count => {
            return Err(Error::Auth(format!(
                "Unknown OAuth response from server: {count} token segments"
            )));
        }
    };
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, sensitive(format!("{scheme} {token}"))?);
    Ok(headers)
}

/// Build the unsigned assertion wrapping an OAuth access code.
#[must_use]
pub fn oauth_assertion(access_code: &str) -> String {
    format!(
        "{header}.{access_code}.",
        header = URL_SAFE.encode(ASSERTION_HEADER)
    )
}

/// Generate a fresh `state` value for an OAuth token request.
#[must_use]
pub fn oauth_state() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{digest:x}", digest = Md5::digest(now.to_string().as_bytes()))
}

/// Extract the `name=value` pairs from the Set-Cookie response headers.
#[must_use]
pub fn parse_set_cookie(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| {
            let pair = value.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                None
            } else {
                Some((name.to_owned(), value.trim().to_owned()))
            }
        })
        .collect()
}

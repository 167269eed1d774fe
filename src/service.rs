//! Log in to an appliance and access its common resources.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause
//!
//! A [`Service`] wraps a [`Connection`] to one REST namespace of an appliance
//! (e.g. "netshark" or "profiler"). It discovers the authentication methods
//! and API versions the appliance supports and logs in with the best method
//! allowed by the caller's [`Auth`] descriptor.

use std::sync::Arc;

use anyhow::Context;
use itertools::Itertools;
use reqwest::header::{self, HeaderValue};
use reqwest::{ClientBuilder, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::api_version::ApiVersion;
use crate::auth::{self, Auth, AuthMethod, ClientCredentials, OAuth, SupportedMethods, UserAuth};
use crate::connection::{
    BoxFuture, Connection, ConnectionConfig, Reauthenticate, RequestBody, RequestOptions,
    RetryBudget,
};
use crate::defs::{
    Error, JsonValue, Result, AUTH_INFO_PATH, LOGIN_PATH, OAUTH_TOKEN_PATH, PING_PATH,
    SERVICES_PATH,
};

/// The `auth_info` common resource.
#[derive(Debug, Deserialize)]
struct AuthInfo {
    /// The names of the supported authentication methods.
    supported_methods: Vec<String>,
}

/// A reply from an OAuth token endpoint.
#[derive(Debug, Deserialize)]
struct TokenReply {
    /// The access token itself.
    access_token: String,

    /// The echoed `state` value, if any.
    state: Option<String>,
}

/// A single entry of the `services` common resource.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceEntry {
    /// The service namespace, e.g. "netshark".
    id: String,

    /// The API versions of the service.
    versions: Vec<ApiVersion>,
}

impl ServiceEntry {
    #[inline]
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    #[must_use]
    pub fn versions(&self) -> &[ApiVersion] {
        &self.versions
    }
}

/// Settings for a [`Service`].
///
/// Note: any changes to this structure shall be considered breaking.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct ServiceConfig {
    /// The REST namespace, e.g. "netshark".
    pub service: String,

    /// Where and how to connect.
    pub connection: ConnectionConfig,

    /// The API versions the caller can use, in order of preference.
    pub versions: Option<Vec<ApiVersion>>,

    /// Query `auth_info` for the supported authentication methods.
    pub detect_auth: bool,

    /// Query `services` for the supported API versions on connect.
    pub detect_versions: bool,

    /// The methods assumed to be supported when `detect_auth` is off.
    pub supported: SupportedMethods,
}

impl ServiceConfig {
    /// Connect to a service on the specified host, certificates unchecked.
    #[inline]
    #[must_use]
    pub fn new(service: &str, host: &str) -> Self {
        let mut connection = ConnectionConfig::new(host);
        connection.verify = false;
        Self {
            service: service.to_owned(),
            connection,
            versions: None,
            detect_auth: true,
            detect_versions: true,
            supported: SupportedMethods::basic_only(),
        }
    }
}

/// Where a [`Service`] is in its login handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum AuthState {
    /// No credentials have been installed.
    Unauthenticated,

    /// The appliance's methods are known, the login has not completed.
    MethodsDetected(SupportedMethods),

    /// Credentials for this method are installed on the connection.
    Authenticated(AuthMethod),
}

/// Performs the login handshake for an [`Auth`] descriptor.
///
/// Also registered with the [`Connection`] as its reauthentication handler.
#[derive(Debug)]
pub struct Authenticator {
    /// The caller's credentials.
    auth: Auth,

    /// Query the appliance for the supported methods.
    detect: bool,

    /// The supported methods if not detected.
    preset: SupportedMethods,
}

/// Options for the requests sent during the handshake: never retried.
fn handshake_opts() -> RequestOptions {
    RequestOptions::new().budget(RetryBudget::exhausted())
}

/// Decode an OAuth token endpoint reply.
fn parse_token_reply(body: &[u8]) -> Result<TokenReply> {
    serde_json::from_slice(body)
        .context("Could not parse the OAuth token response")
        .map_err(Error::Decode)
}

impl Authenticator {
    #[inline]
    #[must_use]
    pub fn new(auth: Auth, detect: bool, preset: SupportedMethods) -> Self {
        Self {
            auth,
            detect,
            preset,
        }
    }

    #[inline]
    #[must_use]
    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    /// Find out which authentication methods the appliance supports.
    ///
    /// An HTTP error from the `auth_info` resource means Basic only.
    ///
    /// # Errors
    ///
    /// [`Error::Reqwest`] if the appliance could not be reached.
    /// [`Error::Decode`] if the `auth_info` resource makes no sense.
    pub async fn detect_methods(&self, conn: &mut Connection) -> Result<SupportedMethods> {
        if !self.detect {
            return Ok(self.preset);
        }
        match conn
            .json_request(Method::GET, AUTH_INFO_PATH, None, handshake_opts())
            .await
        {
            Ok(value) => {
                let info: AuthInfo = serde_json::from_value(value.unwrap_or(JsonValue::Null))
                    .context("Could not parse the auth_info response")
                    .map_err(Error::Decode)?;
                info!(
                    "Supported authentication methods: {methods}",
                    methods = info.supported_methods.join(",")
                );
                Ok(SupportedMethods::from_names(&info.supported_methods))
            }
            Err(Error::Http(err)) => {
                warn!("Failed to retrieve auth_info ({err}), assuming basic");
                Ok(SupportedMethods::basic_only())
            }
            Err(err) => Err(err),
        }
    }

    /// Log in using the preferred method among the supported ones.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] if no method is usable or the appliance rejects the login.
    /// Propagates the connection's request errors.
    pub async fn login(
        &self,
        conn: &mut Connection,
        supported: SupportedMethods,
    ) -> Result<AuthMethod> {
        let method = supported
            .select(self.auth.methods())
            .ok_or_else(|| Error::Auth("No supported authentication methods".to_owned()))?;
        match (method, &self.auth) {
            (AuthMethod::OAuth2ClientCredentials, &Auth::ClientCredentials(ref creds)) => {
                Self::login_client_credentials(conn, creds).await?;
            }
            (AuthMethod::OAuth, &Auth::OAuth(ref oauth)) => Self::login_oauth(conn, oauth).await?,
            (AuthMethod::Cookie, &Auth::User(ref user)) => Self::login_cookie(conn, user).await?,
            (AuthMethod::Basic, &Auth::User(ref user)) => {
                conn.add_headers(auth::basic_header(user.username(), user.password())?);
            }
            (other, _) => {
                return Err(Error::Internal(format!(
                    "{other} selected for unsuitable credentials"
                )));
            }
        }
        info!("Authenticated using {method}");
        Ok(method)
    }

    /// Detect the supported methods, then log in.
    ///
    /// # Errors
    ///
    /// Propagates errors from `detect_methods()` and `login()`.
    pub async fn authenticate(
        &self,
        conn: &mut Connection,
    ) -> Result<(SupportedMethods, AuthMethod)> {
        let supported = self.detect_methods(conn).await?;
        let method = self.login(conn, supported).await?;
        Ok((supported, method))
    }

    /// Exchange an OAuth access code for a bearer token.
    async fn login_oauth(conn: &mut Connection, oauth: &OAuth) -> Result<()> {
        let assertion = auth::oauth_assertion(oauth.access_code().expose_secret());
        let state = auth::oauth_state();
        let resp = conn
            .urlencoded_request(
                Method::POST,
                OAUTH_TOKEN_PATH,
                &[
                    ("grant_type", "access_code"),
                    ("assertion", &assertion),
                    ("state", &state),
                ],
                handshake_opts(),
            )
            .await?;
        let reply = parse_token_reply(resp.body())?;
        if reply.state.as_deref() != Some(state.as_str()) {
            return Err(Error::Auth(
                "Inconsistent state value in OAuth response".to_owned(),
            ));
        }
        conn.add_headers(auth::bearer_header(&reply.access_token)?);
        Ok(())
    }

    /// Post the username and password, keep the session cookies.
    async fn login_cookie(conn: &mut Connection, user: &UserAuth) -> Result<()> {
        let body = json!({
            "username": user.username(),
            "password": user.password().expose_secret(),
        });
        let (_, resp) = conn
            .json_request_full(Method::POST, LOGIN_PATH, Some(&body), handshake_opts())
            .await?;
        let cookies = auth::parse_set_cookie(resp.headers());
        if cookies.is_empty() {
            warn!("The login response did not set any session cookies");
        }
        debug!(
            "Got session cookies: {names}",
            names = cookies.iter().map(|(name, _)| name).join(", ")
        );
        conn.set_cookies(cookies);
        Ok(())
    }

    /// Obtain a bearer token from an external OAuth 2.0 token endpoint.
    async fn login_client_credentials(
        conn: &mut Connection,
        creds: &ClientCredentials,
    ) -> Result<()> {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", creds.client_id())
            .append_pair("client_secret", creds.client_secret().expose_secret())
            .append_pair("scope", creds.scope())
            .finish();
        let client = ClientBuilder::new()
            .build()
            .context("Could not build the HTTPS client for the token endpoint")
            .map_err(Error::Reqwest)?;
        let token_url = creds.token_url();
        let resp = client
            .post(token_url)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            )
            .body(form)
            .send()
            .await
            .with_context(|| format!("The token request to {token_url} failed"))
            .map_err(Error::Reqwest)?
            .error_for_status()
            .map_err(|err| Error::Auth(format!("The token request to {token_url} was rejected: {err}")))?;
        let body = resp
            .bytes()
            .await
            .with_context(|| format!("Could not receive the token from {token_url}"))
            .map_err(Error::Reqwest)?;
        let reply = parse_token_reply(&body)?;
        conn.add_headers(auth::bearer_header(&reply.access_token)?);
        Ok(())
    }
}

impl Reauthenticate for Authenticator {
    fn reauthenticate<'fut>(
        &'fut self,
        conn: &'fut mut Connection,
    ) -> BoxFuture<'fut, Result<()>> {
        Box::pin(async move { self.authenticate(conn).await.map(|_| ()) })
    }
}

/// A REST namespace on an appliance.
#[derive(Debug)]
pub struct Service {
    /// The REST namespace, e.g. "netshark".
    name: String,

    /// The connection used for all requests.
    conn: Connection,

    /// Query `auth_info` before logging in.
    detect_auth: bool,

    /// The methods assumed to be supported when not detected.
    preset: SupportedMethods,

    /// The handshake for the current credentials, if any.
    authenticator: Option<Arc<Authenticator>>,

    /// Where we are in the login handshake.
    state: AuthState,

    /// The API versions the appliance supports for this service, if known.
    supported_versions: Option<Vec<ApiVersion>>,

    /// The API version selected by `check_api_versions()`.
    api_version: Option<ApiVersion>,
}

impl Service {
    /// Connect to the appliance, check the API versions, log in.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Connection::new`], `check_api_versions()`
    /// and `authenticate()`.
    pub async fn connect(cfg: ServiceConfig, auth: Option<Auth>) -> Result<Self> {
        info!(
            "New service {service} for host {host}",
            service = cfg.service,
            host = cfg.connection.hostname
        );
        let mut service = Self {
            name: cfg.service,
            conn: Connection::new(cfg.connection)?,
            detect_auth: cfg.detect_auth,
            preset: cfg.supported,
            authenticator: None,
            state: AuthState::Unauthenticated,
            supported_versions: None,
            api_version: None,
        };
        if cfg.detect_versions {
            service.check_api_versions(cfg.versions.as_deref()).await?;
        }
        if let Some(auth) = auth {
            service.authenticate(auth).await?;
        }
        Ok(service)
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection, for sending requests to the service's resources.
    #[inline]
    pub fn conn(&mut self) -> &mut Connection {
        &mut self.conn
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn supported_versions(&self) -> Option<&[ApiVersion]> {
        self.supported_versions.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn api_version(&self) -> Option<ApiVersion> {
        self.api_version
    }

    /// Run the handshake for the current authenticator, tracking the state.
    async fn run_handshake(&mut self, authenticator: &Authenticator) -> Result<AuthMethod> {
        self.state = AuthState::Unauthenticated;
        let supported = authenticator.detect_methods(&mut self.conn).await?;
        self.state = AuthState::MethodsDetected(supported);
        let method = authenticator.login(&mut self.conn, supported).await?;
        self.state = AuthState::Authenticated(method);
        Ok(method)
    }

    /// Log in and install the resulting credentials on the connection.
    ///
    /// Any earlier credentials are forgotten first, even if the login fails.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] if no usable method is found or the login is rejected.
    /// Propagates the connection's request errors.
    pub async fn authenticate(&mut self, auth: Auth) -> Result<AuthMethod> {
        let authenticator = Arc::new(Authenticator::new(auth, self.detect_auth, self.preset));
        self.conn.set_reauthenticate(None);
        self.authenticator = None;
        let method = self.run_handshake(&authenticator).await?;
        self.conn
            .set_reauthenticate(Some(Arc::clone(&authenticator) as Arc<dyn Reauthenticate>));
        self.authenticator = Some(authenticator);
        Ok(method)
    }

    /// Log in again with the credentials of the last `authenticate()` call.
    ///
    /// # Errors
    ///
    /// [`Error::Auth`] if `authenticate()` was never called.
    /// Otherwise the same as `authenticate()`.
    pub async fn reauthenticate(&mut self) -> Result<AuthMethod> {
        let authenticator = self
            .authenticator
            .clone()
            .ok_or_else(|| Error::Auth("No credentials to reauthenticate with".to_owned()))?;
        self.conn.clear_cookies();
        self.run_handshake(&authenticator).await
    }

    /// End the authenticated session: forget all credentials.
    pub fn logout(&mut self) {
        self.conn
            .del_headers(&[header::AUTHORIZATION, header::COOKIE]);
        self.conn.clear_cookies();
        self.conn.set_reauthenticate(None);
        self.authenticator = None;
        self.state = AuthState::Unauthenticated;
    }

    /// Check that the appliance is alive.
    ///
    /// # Errors
    ///
    /// Propagates the connection's request errors.
    pub async fn ping(&mut self) -> Result<bool> {
        self.conn
            .request(Method::GET, PING_PATH, RequestBody::Empty, RequestOptions::new())
            .await?;
        Ok(true)
    }

    /// Fetch the list of services and their API versions.
    ///
    /// Entries that cannot be decoded are logged and skipped.
    ///
    /// # Errors
    ///
    /// Propagates the connection's request errors.
    /// [`Error::Decode`] if the response makes no sense.
    pub async fn services(&mut self) -> Result<Vec<ServiceEntry>> {
        let value = self
            .conn
            .json_request(Method::GET, SERVICES_PATH, None, RequestOptions::new())
            .await?;
        let raw: Vec<JsonValue> =
            serde_json::from_value(value.unwrap_or_else(|| JsonValue::Array(Vec::new())))
                .context("Could not parse the services response")
                .map_err(Error::Decode)?;
        Ok(raw
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<ServiceEntry>(item.clone()) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!("Skipping an unrecognized services entry {item}: {err}");
                    None
                }
            })
            .collect())
    }

    /// Check that the appliance supports one of the specified API versions.
    ///
    /// Returns false if the appliance does not report its versions at all.
    ///
    /// # Errors
    ///
    /// [`Error::Version`] if none of the requested versions is supported.
    /// Propagates non-404 errors from `services()`.
    pub async fn check_api_versions(&mut self, versions: Option<&[ApiVersion]>) -> Result<bool> {
        let entries = match self.services().await {
            Ok(entries) => entries,
            Err(Error::Http(ref err)) if err.status() == StatusCode::NOT_FOUND => {
                warn!("Failed to retrieve the supported versions");
                self.supported_versions = None;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };
        self.supported_versions = entries
            .into_iter()
            .find(|entry| entry.id == self.name)
            .map(|entry| entry.versions);
        let Some(ref supported) = self.supported_versions else {
            return Ok(false);
        };
        let supported_list = supported.iter().join(", ");
        debug!("Server supports the following versions: {supported_list}");

        let Some(wanted) = versions else {
            return Ok(true);
        };
        match wanted.iter().copied().find(|version| supported.contains(version)) {
            Some(version) => {
                debug!(
                    "Service '{name}' supports version '{version}'",
                    name = self.name
                );
                self.api_version = Some(version);
                Ok(true)
            }
            None => Err(Error::Version(format!(
                "API version(s) {wanted} not supported (supported version(s): {supported_list})",
                wanted = wanted.iter().join(", ")
            ))),
        }
    }
}

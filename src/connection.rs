//! Send requests to an appliance's REST API over HTTP(S).
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause
//!
//! A [`Connection`] talks to a single appliance. It resolves relative paths
//! against the appliance's base URL, merges its default headers and session
//! cookies into every request and turns HTTP error statuses into
//! [`HttpError`] values. When the appliance reports an expired session and a
//! [`Reauthenticate`] handler is registered, the handler gets one chance to
//! log in again before the request is repeated.

use core::fmt::Debug;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{self, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use itertools::Itertools;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::tls::Version as TlsVersion;
use reqwest::{Client, ClientBuilder, Method, Response, StatusCode};
use serde::Serialize;
use tokio::fs::{self as tfs, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::{form_urlencoded, Url};
use xmltree::Element;

use crate::defs::{Error, JsonValue, Result, VERSION};
use crate::http_error::{HttpError, SessionExpiry};
use crate::scrub::{scrub_headers, scrub_passwords};

/// The tracing target for the request/response traffic log.
pub const REST_TARGET: &str = "steelscript::rest";

/// The product token of the underlying HTTP client in the User-Agent header.
const CLIENT_AGENT: &str = "reqwest";

/// Downloaded data is written to disk in pieces of at most this size.
const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// The JSON content type.
const APPLICATION_JSON: &str = "application/json";

/// The XML content type.
const TEXT_XML: &str = "text/xml";

/// A boxed future returned by [`Reauthenticate`] implementations.
pub type BoxFuture<'fut, T> = Pin<Box<dyn Future<Output = T> + Send + 'fut>>;

/// Something that can log in to the appliance again when the session expires.
pub trait Reauthenticate: Debug + Send + Sync {
    /// Refresh the connection's credentials (default headers, cookies).
    ///
    /// Requests sent from here should use [`RetryBudget::exhausted`] so that a
    /// failing login is reported instead of triggering another login.
    ///
    /// # Errors
    ///
    /// Whatever the login handshake fails with; the original request is then
    /// not retried.
    fn reauthenticate<'fut>(&'fut self, conn: &'fut mut Connection)
        -> BoxFuture<'fut, Result<()>>;
}

/// How many times a single request may be retried after reauthenticating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    /// The number of reauthentication retries left.
    reauth: u8,
}

impl Default for RetryBudget {
    #[inline]
    fn default() -> Self {
        Self::single()
    }
}

impl RetryBudget {
    /// Allow one reauthentication and retry.
    #[inline]
    #[must_use]
    pub const fn single() -> Self {
        Self { reauth: 1 }
    }

    /// Never retry.
    #[inline]
    #[must_use]
    pub const fn exhausted() -> Self {
        Self { reauth: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn remaining(&self) -> u8 {
        self.reauth
    }

    /// Use up one retry, if there is one left.
    #[inline]
    fn spend(&mut self) -> bool {
        if self.reauth == 0 {
            false
        } else {
            self.reauth -= 1;
            true
        }
    }
}

/// How much of the REST traffic to log.
///
/// Note: any changes to this structure shall be considered breaking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct RestLogConfig {
    /// 0: method, URL and status; 1: also headers; 2: also bodies.
    pub debug: u8,

    /// The maximum number of body lines to log.
    pub body_lines: usize,
}

/// The settings used to open a [`Connection`].
///
/// Note: any changes to this structure shall be considered breaking.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct ConnectionConfig {
    /// The appliance hostname, optionally with a scheme and a port.
    pub hostname: String,

    /// The port to connect to, if not part of the hostname.
    pub port: Option<u16>,

    /// Require a valid certificate from the appliance.
    pub verify: bool,

    /// How much of the REST traffic to log.
    pub rest_log: RestLogConfig,

    /// The error identifiers that trigger reauthentication.
    pub expiry: SessionExpiry,
}

impl ConnectionConfig {
    /// Connect to the specified host with certificate verification enabled.
    #[inline]
    #[must_use]
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            port: None,
            verify: true,
            rest_log: RestLogConfig::default(),
            expiry: SessionExpiry::default(),
        }
    }
}

/// Per-request settings: query parameters, extra headers, retry budget.
#[derive(Debug, Clone, Default)]
#[allow(clippy::exhaustive_structs)]
pub struct RequestOptions {
    /// The query parameters to append to the URL.
    pub params: Vec<(String, String)>,

    /// Headers overriding the connection's defaults for this request.
    pub headers: HeaderMap,

    /// How many reauthentication retries this request may use.
    pub budget: RetryBudget,
}

impl RequestOptions {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a query parameter.
    #[inline]
    #[must_use]
    pub fn param(mut self, name: &str, value: &str) -> Self {
        self.params.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Add or replace an extra header.
    #[inline]
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Use the specified retry budget.
    #[inline]
    #[must_use]
    pub fn budget(mut self, budget: RetryBudget) -> Self {
        self.budget = budget;
        self
    }
}

/// A local file about to be uploaded.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// The file name sent to the appliance.
    filename: String,

    /// The guessed MIME type.
    mime: String,

    /// The file contents.
    contents: Vec<u8>,
}

impl FilePart {
    /// Read a file and guess its MIME type from its name.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the file cannot be read or has no name.
    pub async fn read(path: &Path) -> Result<Self> {
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::File(anyhow!(
                    "Could not determine the file name of {path}",
                    path = path.display()
                ))
            })?;
        let contents = tfs::read(path)
            .await
            .with_context(|| format!("Could not open {path} for uploading", path = path.display()))
            .map_err(Error::File)?;
        let mime = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        Ok(Self {
            filename,
            mime,
            contents,
        })
    }

    #[inline]
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    #[inline]
    #[must_use]
    pub fn mime(&self) -> &str {
        &self.mime
    }
}

/// The payload of a request.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RequestBody {
    /// No body at all.
    Empty,

    /// Raw bytes sent as-is.
    Raw(Vec<u8>),

    /// An encoded JSON document; the value is kept for logging.
    Json {
        /// The serialized document.
        encoded: Vec<u8>,

        /// The document itself.
        value: JsonValue,
    },

    /// A `multipart/form-data` payload.
    Multipart(Vec<FilePart>),
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct RestResponse {
    /// The HTTP status code.
    status: StatusCode,

    /// The response headers.
    headers: HeaderMap,

    /// The final URL, including the query string.
    url: Url,

    /// The response body.
    body: Vec<u8>,
}

impl RestResponse {
    #[inline]
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[inline]
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8, invalid sequences replaced.
    #[inline]
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The value of the Content-Type header, if any.
    #[inline]
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Decode the body as JSON; `None` for a 204 status or an empty body.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] if the body is not valid JSON.
    pub fn json(&self) -> Result<Option<JsonValue>> {
        if self.status == StatusCode::NO_CONTENT || self.body.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.body)
            .with_context(|| format!("Could not decode the response from {url} as JSON", url = self.url))
            .map(Some)
            .map_err(Error::Decode)
    }
}

/// The outcome of a raw upload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UploadResult {
    /// The appliance accepted the data and had nothing to say (204).
    NoContent,

    /// The appliance created a resource (201).
    Created {
        /// The value of the Location header, empty if absent.
        location: String,
    },

    /// Any other successful response.
    Body(String),
}

/// A request ready to be sent, possibly more than once.
#[derive(Debug, Clone)]
struct PreparedRequest {
    /// The HTTP method.
    method: Method,

    /// The absolute URL.
    url: Url,

    /// The payload.
    body: RequestBody,

    /// Query parameters, extra headers, retry budget.
    opts: RequestOptions,
}

/// Make sure the hostname carries a scheme and the requested port.
///
/// Without a scheme `https://` is assumed, unless the port is 80.
///
/// # Errors
///
/// [`Error::Config`] if the hostname embeds a port that differs from `port`,
/// or the embedded port is not a number.
pub fn resolve_hostname(hostname: &str, port: Option<u16>) -> Result<String> {
    let (scheme, rest) = match hostname.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, hostname),
    };
    let (authority, tail) = rest.find('/').map_or((rest, ""), |idx| rest.split_at(idx));
    let (authority, effective) = match (embedded_port(authority)?, port) {
        (Some(inner), Some(outer)) if inner != outer => {
            return Err(Error::Config(format!(
                "Mismatched ports provided: {inner} in {hostname:?}, {outer} requested"
            )));
        }
        (Some(inner), _) => (authority.to_owned(), Some(inner)),
        (None, Some(outer)) => (format!("{authority}:{outer}"), Some(outer)),
        (None, None) => (authority.to_owned(), None),
    };
    let scheme = match scheme {
        Some(scheme) => scheme,
        None if effective == Some(80) => {
            info!("Connection defaulting to 'http://' scheme");
            "http"
        }
        None => {
            info!("Connection defaulting to 'https://' scheme");
            "https"
        }
    };
    Ok(format!("{scheme}://{authority}{tail}"))
}

/// Extract the port from a `[user@]host[:port]` string.
fn embedded_port(authority: &str) -> Result<Option<u16>> {
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    let Some((name, port)) = host.rsplit_once(':') else {
        return Ok(None);
    };
    if name.starts_with('[') && !name.ends_with(']') {
        // a bracketed IPv6 address without a port
        return Ok(None);
    }
    port.parse::<u16>()
        .map(Some)
        .map_err(|_| Error::Config(format!("Invalid port {port:?} in {authority:?}")))
}

/// Build the User-Agent string, optionally with an extra product token.
fn compose_user_agent(extra: Option<&str>) -> String {
    let agent = format!("{CLIENT_AGENT} SteelScript/{VERSION}");
    match extra {
        Some(extra) => format!("{agent} {extra}"),
        None => agent,
    }
}

/// Create the underlying HTTP client.
fn build_client(verify: bool, user_agent: &str, legacy_tls: bool) -> Result<Client> {
    let builder = ClientBuilder::new()
        .danger_accept_invalid_certs(!verify)
        .user_agent(user_agent);
    let builder = if legacy_tls {
        builder.max_tls_version(TlsVersion::TLS_1_0)
    } else {
        builder
    };
    builder
        .build()
        .context("Could not build the HTTPS client")
        .map_err(Error::Reqwest)
}

/// Build the multipart form for a set of files.
fn multipart_form(files: &[FilePart]) -> Result<Form> {
    files.iter().try_fold(Form::new(), |form, file| {
        let part = Part::bytes(file.contents.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.mime)
            .with_context(|| format!("Invalid MIME type {mime} for {name}", mime = file.mime, name = file.filename))
            .map_err(Error::Reqwest)?;
        Ok(form.part("file", part))
    })
}

/// Extract a bare file name from a Content-Disposition header.
fn content_disposition_filename(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    let (_, rest) = value.split_once("filename=")?;
    let raw = rest.split(';').next()?.trim().trim_matches('"');
    let name = Path::new(raw).file_name()?.to_string_lossy().into_owned();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Figure out the directory and, possibly, the file name for a download.
fn download_target(dest: Option<&Path>) -> Result<(PathBuf, Option<String>)> {
    let Some(dest) = dest else {
        let tempdir = tempfile::Builder::new()
            .prefix("steelscript-")
            .tempdir()
            .context("Could not create a temporary download directory")
            .map_err(Error::File)?;
        return Ok((tempdir.keep(), None));
    };
    if dest.is_dir() {
        return Ok((dest.to_owned(), None));
    }
    if dest
        .as_os_str()
        .to_string_lossy()
        .chars()
        .last()
        .map_or(false, path::is_separator)
    {
        return Err(Error::File(anyhow!(
            "{dest} directory does not exist",
            dest = dest.display()
        )));
    }
    let filename = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| Error::NoFilename(dest.display().to_string()))?;
    let directory = dest
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok((directory, Some(filename)))
}

/// Stream a response body into a newly created local file.
async fn save_stream(mut resp: Response, target: &Path) -> Result<()> {
    let mut file = File::create(target)
        .await
        .with_context(|| format!("Could not create {target}", target = target.display()))
        .map_err(Error::File)?;
    while let Some(chunk) = resp
        .chunk()
        .await
        .with_context(|| format!("Could not receive the data for {target}", target = target.display()))
        .map_err(Error::Reqwest)?
    {
        for piece in chunk.chunks(DOWNLOAD_CHUNK_SIZE) {
            file.write_all(piece)
                .await
                .with_context(|| format!("Could not write to {target}", target = target.display()))
                .map_err(Error::File)?;
        }
    }
    file.flush()
        .await
        .with_context(|| format!("Could not write to {target}", target = target.display()))
        .map_err(Error::File)?;
    Ok(())
}

/// A connection to a single appliance.
#[derive(Debug)]
pub struct Connection {
    /// The hostname with its scheme and port.
    hostname: String,

    /// The URL relative paths are resolved against.
    base: Url,

    /// The HTTP client used to send the requests.
    client: Client,

    /// Require a valid certificate from the appliance.
    verify: bool,

    /// The User-Agent header value.
    user_agent: String,

    /// Headers sent with every request.
    headers: HeaderMap,

    /// Session cookies sent with every request.
    cookies: BTreeMap<String, String>,

    /// Called when the appliance reports an expired session.
    reauth: Option<Arc<dyn Reauthenticate>>,

    /// How much of the REST traffic to log.
    rest_log: RestLogConfig,

    /// The error identifiers that trigger reauthentication.
    expiry: SessionExpiry,

    /// Has the client already been rebuilt to use legacy TLS?
    tls_downgraded: bool,
}

impl Connection {
    /// Prepare to send requests to the specified appliance.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the hostname or port are invalid.
    /// [`Error::Reqwest`] if the HTTP client could not be initialized.
    pub fn new(cfg: ConnectionConfig) -> Result<Self> {
        let hostname = resolve_hostname(&cfg.hostname, cfg.port)?;
        let base = Url::parse(&hostname)
            .with_context(|| format!("Could not parse {hostname:?} as a URL"))
            .map_err(|err| Error::Config(format!("{err:#}")))?;
        let user_agent = compose_user_agent(None);
        let client = build_client(cfg.verify, &user_agent, false)?;
        debug!("Connection initialized for {hostname}");
        Ok(Self {
            hostname,
            base,
            client,
            verify: cfg.verify,
            user_agent,
            headers: HeaderMap::new(),
            cookies: BTreeMap::new(),
            reauth: None,
            rest_log: cfg.rest_log,
            expiry: cfg.expiry,
            tls_downgraded: false,
        })
    }

    #[inline]
    #[must_use]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[inline]
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    #[must_use]
    pub fn cookies(&self) -> &BTreeMap<String, String> {
        &self.cookies
    }

    #[inline]
    #[must_use]
    pub fn rest_log(&self) -> RestLogConfig {
        self.rest_log
    }

    #[inline]
    pub fn set_rest_log(&mut self, rest_log: RestLogConfig) {
        self.rest_log = rest_log;
    }

    #[inline]
    #[must_use]
    pub fn session_expiry(&self) -> &SessionExpiry {
        &self.expiry
    }

    #[inline]
    pub fn set_session_expiry(&mut self, expiry: SessionExpiry) {
        self.expiry = expiry;
    }

    #[inline]
    #[must_use]
    pub fn is_tls_downgraded(&self) -> bool {
        self.tls_downgraded
    }

    /// Register (or remove) the handler run on session-expiry errors.
    #[inline]
    pub fn set_reauthenticate(&mut self, handler: Option<Arc<dyn Reauthenticate>>) {
        self.reauth = handler;
    }

    /// Resolve a path against the appliance's base URL.
    ///
    /// Absolute URLs are returned unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the resulting URL is invalid.
    pub fn get_url(&self, path: &str) -> Result<Url> {
        match Url::parse(path) {
            Ok(url) if url.has_host() => Ok(url),
            _ => self
                .base
                .join(path)
                .with_context(|| format!("Could not resolve {path:?} against {base}", base = self.base))
                .map_err(|err| Error::Config(format!("{err:#}"))),
        }
    }

    /// Append a product token to the User-Agent header.
    ///
    /// # Errors
    ///
    /// [`Error::Reqwest`] if the HTTP client could not be rebuilt.
    pub fn set_user_agent(&mut self, extra: Option<&str>) -> Result<()> {
        let user_agent = compose_user_agent(extra);
        self.client = build_client(self.verify, &user_agent, self.tls_downgraded)?;
        self.user_agent = user_agent;
        Ok(())
    }

    /// Send these headers with every subsequent request.
    #[inline]
    pub fn add_headers(&mut self, headers: HeaderMap) {
        self.headers.extend(headers);
    }

    /// Stop sending these headers.
    #[inline]
    pub fn del_headers(&mut self, names: &[HeaderName]) {
        for name in names {
            self.headers.remove(name);
        }
    }

    /// Send these cookies with every subsequent request.
    #[inline]
    pub fn set_cookies<I>(&mut self, cookies: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.cookies.extend(cookies);
    }

    /// Forget all session cookies.
    #[inline]
    pub fn clear_cookies(&mut self) {
        self.cookies.clear();
    }

    /// Build the Cookie header from the stored session cookies.
    fn cookie_header(&self) -> Result<Option<HeaderValue>> {
        if self.cookies.is_empty() {
            return Ok(None);
        }
        let joined = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .join("; ");
        let mut value = HeaderValue::try_from(joined)
            .context("Could not build the Cookie header")
            .map_err(Error::Reqwest)?;
        value.set_sensitive(true);
        Ok(Some(value))
    }

    /// The headers to send: defaults, then cookies, then per-request ones.
    fn merged_headers(&self, extra: &HeaderMap) -> Result<HeaderMap> {
        let mut merged = self.headers.clone();
        if let Some(cookie) = self.cookie_header()? {
            merged.insert(header::COOKIE, cookie);
        }
        merged.extend(extra.clone());
        Ok(merged)
    }

    /// Log some text line by line, honoring the configured line limit.
    fn log_lines(&self, title: &str, text: &str) {
        let limit = self.rest_log.body_lines;
        info!(target: REST_TARGET, "{title}:");
        let lines = text.lines().collect::<Vec<_>>();
        for line in lines.iter().take(limit) {
            info!(target: REST_TARGET, "... {line}");
        }
        if lines.len() > limit {
            info!(
                target: REST_TARGET,
                "... <truncated {count} lines>",
                count = lines.len() - limit
            );
        }
    }

    /// Log a body, pretty-printing and scrubbing it if it is JSON.
    fn log_body(&self, title: &str, body: &[u8]) {
        if self.rest_log.debug < 2 || body.is_empty() {
            return;
        }
        let text = match serde_json::from_slice::<JsonValue>(body) {
            Ok(value) => serde_json::to_string_pretty(&scrub_passwords(&value))
                .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned()),
            Err(_) => String::from_utf8_lossy(body).into_owned(),
        };
        self.log_lines(title, &text);
    }

    /// Log a set of headers with their secrets masked.
    fn log_headers(title: &str, headers: &HeaderMap) {
        info!(target: REST_TARGET, "{title}:");
        for (name, value) in scrub_headers(headers) {
            info!(target: REST_TARGET, "... {name}: {value}");
        }
    }

    /// Log what we are about to send.
    fn log_request(&self, req: &PreparedRequest) {
        info!(target: REST_TARGET, "{method} {url}", method = req.method, url = req.url);
        if !req.opts.params.is_empty() {
            info!(target: REST_TARGET, "Parameters:");
            for (name, value) in &req.opts.params {
                info!(target: REST_TARGET, "... {name}: {value}");
            }
        }
        if self.rest_log.debug >= 1 {
            if !req.opts.headers.is_empty() {
                Self::log_headers("Extra request headers", &req.opts.headers);
            }
            if let Ok(merged) = self.merged_headers(&req.opts.headers) {
                Self::log_headers("Request headers", &merged);
            }
        }
        if self.rest_log.debug >= 2 {
            match req.body {
                RequestBody::Empty => (),
                RequestBody::Json { ref value, .. } => {
                    let text = serde_json::to_string_pretty(&scrub_passwords(value))
                        .unwrap_or_else(|err| format!("<unprintable JSON: {err}>"));
                    self.log_lines("Request body", &text);
                }
                RequestBody::Raw(ref data) => {
                    self.log_lines("Request body", &String::from_utf8_lossy(data));
                }
                RequestBody::Multipart(ref files) => {
                    info!(
                        target: REST_TARGET,
                        "Request body: multipart, {names}",
                        names = files.iter().map(FilePart::filename).join(", ")
                    );
                }
            }
        }
    }

    /// Turn a prepared request into something the HTTP client can send.
    fn build_request(&self, req: &PreparedRequest) -> Result<reqwest::Request> {
        let mut builder = self
            .client
            .request(req.method.clone(), req.url.clone())
            .headers(self.merged_headers(&req.opts.headers)?);
        if !req.opts.params.is_empty() {
            builder = builder.query(&req.opts.params);
        }
        builder = match req.body {
            RequestBody::Empty => builder,
            RequestBody::Raw(ref data) | RequestBody::Json { encoded: ref data, .. } => {
                builder.body(data.clone())
            }
            RequestBody::Multipart(ref files) => builder.multipart(multipart_form(files)?),
        };
        builder
            .build()
            .with_context(|| format!("Could not build a {method} request for {url}", method = req.method, url = req.url))
            .map_err(Error::Reqwest)
    }

    /// Send a request once, falling back to legacy TLS on a failed handshake.
    async fn send(&mut self, req: &PreparedRequest) -> Result<Response> {
        match self.client.execute(self.build_request(req)?).await {
            Ok(resp) => Ok(resp),
            Err(err) if err.is_connect() && !self.tls_downgraded && req.url.scheme() == "https" => {
                info!("Could not connect to {url} ({err}), retrying with TLS 1.0", url = req.url);
                self.client = build_client(self.verify, &self.user_agent, true)?;
                self.tls_downgraded = true;
                self.client
                    .execute(self.build_request(req)?)
                    .await
                    .with_context(|| {
                        format!("The {method} request for {url} failed with TLS 1.0, too", method = req.method, url = req.url)
                    })
                    .map_err(Error::Reqwest)
            }
            Err(err) => Err(Error::Reqwest(anyhow::Error::new(err).context(format!(
                "The {method} request for {url} failed",
                method = req.method,
                url = req.url
            )))),
        }
    }

    /// Consume an error response, build the normalized error.
    async fn http_error(&self, req: &PreparedRequest, resp: Response) -> HttpError {
        let status = resp.status();
        let ctype = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = match resp.bytes().await {
            Ok(body) => body.to_vec(),
            Err(err) => {
                warn!("Could not read the error response from {url}: {err}", url = req.url);
                Vec::new()
            }
        };
        info!(
            target: REST_TARGET,
            "Response status {status}, {len} bytes",
            status = status.as_u16(),
            len = body.len()
        );
        self.log_body("Response body", &body);
        HttpError::from_response(
            &req.method,
            req.url.as_str(),
            status,
            ctype.as_deref(),
            &String::from_utf8_lossy(&body),
        )
    }

    /// Send a request, reauthenticating and retrying once on session expiry.
    async fn dispatch(&mut self, req: &PreparedRequest) -> Result<Response> {
        let mut budget = req.opts.budget;
        self.log_request(req);
        loop {
            let resp = self.send(req).await?;
            if *resp.url() != req.url {
                info!(target: REST_TARGET, "Full URL: {url}", url = resp.url());
            }
            if self.rest_log.debug >= 1 {
                Self::log_headers("Response headers", resp.headers());
            }
            if !resp.status().is_client_error() && !resp.status().is_server_error() {
                return Ok(resp);
            }

            let err = self.http_error(req, resp).await;
            let handler = match self.reauth {
                Some(ref handler) if self.expiry.matches(&err) => Arc::clone(handler),
                _ => return Err(err.into()),
            };
            if !budget.spend() {
                debug!("The session expired again, not retrying");
                return Err(err.into());
            }
            debug!("Session timed out ({err}), reauthenticating");
            self.cookies.clear();
            handler.reauthenticate(self).await?;
            debug!("Session reauthentication succeeded, retrying");
        }
    }

    /// Send a request and buffer the whole response.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the path cannot be resolved.
    /// [`Error::Reqwest`] if the request could not be built, sent or received.
    /// [`Error::Http`] if the appliance returned an error status.
    /// Propagates the reauthentication handler's errors.
    pub async fn request(
        &mut self,
        method: Method,
        path: &str,
        body: RequestBody,
        opts: RequestOptions,
    ) -> Result<RestResponse> {
        let req = PreparedRequest {
            method,
            url: self.get_url(path)?,
            body,
            opts,
        };
        let resp = self.dispatch(&req).await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let url = resp.url().clone();
        let body = resp
            .bytes()
            .await
            .with_context(|| {
                format!("Could not receive the full response to the {method} request for {url}", method = req.method)
            })
            .map_err(Error::Reqwest)?
            .to_vec();
        info!(
            target: REST_TARGET,
            "Response status {status}, {len} bytes",
            status = status.as_u16(),
            len = body.len()
        );
        self.log_body("Response body", &body);
        Ok(RestResponse {
            status,
            headers,
            url,
            body,
        })
    }

    /// Send a request and return the response without reading its body.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::request`].
    pub async fn request_stream(
        &mut self,
        method: Method,
        path: &str,
        body: RequestBody,
        opts: RequestOptions,
    ) -> Result<Response> {
        let req = PreparedRequest {
            method,
            url: self.get_url(path)?,
            body,
            opts,
        };
        let resp = self.dispatch(&req).await?;
        info!(
            target: REST_TARGET,
            "Response status {status}, streaming content",
            status = resp.status().as_u16()
        );
        Ok(resp)
    }

    /// Send a JSON document, decode the JSON response.
    ///
    /// Returns `None` if the appliance sent no data.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::request`].
    /// [`Error::Decode`] if the response is not valid JSON.
    pub async fn json_request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        opts: RequestOptions,
    ) -> Result<Option<JsonValue>> {
        Ok(self.json_request_full(method, path, body, opts).await?.0)
    }

    /// Serialize any value as the JSON request body, decode the JSON response.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`] if the value cannot be serialized.
    /// Otherwise the same as [`Connection::json_request`].
    pub async fn json_request_with<B>(
        &mut self,
        method: Method,
        path: &str,
        body: &B,
        opts: RequestOptions,
    ) -> Result<Option<JsonValue>>
    where
        B: Serialize + ?Sized + Sync,
    {
        let value = serde_json::to_value(body)
            .context("Could not encode the JSON request body")
            .map_err(Error::Decode)?;
        self.json_request(method, path, Some(&value), opts).await
    }

    /// Send a JSON document, return both the decoded JSON and the response.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::json_request`].
    pub async fn json_request_full(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&JsonValue>,
        opts: RequestOptions,
    ) -> Result<(Option<JsonValue>, RestResponse)> {
        let opts = opts
            .header(header::CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON))
            .header(header::ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        let body = match body {
            Some(value) => RequestBody::Json {
                encoded: serde_json::to_vec(value)
                    .context("Could not encode the JSON request body")
                    .map_err(Error::Decode)?,
                value: value.clone(),
            },
            None => RequestBody::Empty,
        };
        let resp = self.request(method, path, body, opts).await?;
        Ok((resp.json()?, resp))
    }

    /// Send an XML document, parse the XML response into an element tree.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::request`].
    /// [`Error::ContentType`] if the response is not `text/xml`.
    /// [`Error::Decode`] if the response is not valid XML.
    pub async fn xml_request(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&str>,
        opts: RequestOptions,
    ) -> Result<Element> {
        Ok(self.xml_request_full(method, path, body, opts).await?.0)
    }

    /// Send an XML document, return both the parsed tree and the response.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::xml_request`].
    pub async fn xml_request_full(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&str>,
        opts: RequestOptions,
    ) -> Result<(Element, RestResponse)> {
        let opts = opts
            .header(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_XML))
            .header(header::ACCEPT, HeaderValue::from_static(TEXT_XML));
        let body = body.map_or(RequestBody::Empty, |text| {
            RequestBody::Raw(text.as_bytes().to_vec())
        });
        let resp = self.request(method, path, body, opts).await?;
        let ctype = resp.content_type().unwrap_or("none");
        if !ctype.contains(TEXT_XML) {
            return Err(Error::ContentType {
                expected: TEXT_XML.to_owned(),
                actual: ctype.to_owned(),
            });
        }
        let tree = Element::parse(resp.body())
            .with_context(|| format!("Could not parse the response from {url} as XML", url = resp.url()))
            .map_err(Error::Decode)?;
        Ok((tree, resp))
    }

    /// Send form-encoded key/value pairs.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::request`].
    pub async fn urlencoded_request(
        &mut self,
        method: Method,
        path: &str,
        pairs: &[(&str, &str)],
        opts: RequestOptions,
    ) -> Result<RestResponse> {
        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs.iter())
            .finish();
        let opts = opts.header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        self.request(method, path, RequestBody::Raw(encoded.into_bytes()), opts)
            .await
    }

    /// Upload raw data; the caller sets the Content-Type in `opts`.
    ///
    /// # Errors
    ///
    /// The same as [`Connection::request`].
    pub async fn upload(
        &mut self,
        method: Method,
        path: &str,
        data: Vec<u8>,
        opts: RequestOptions,
    ) -> Result<UploadResult> {
        let resp = self.request(method, path, RequestBody::Raw(data), opts).await?;
        Ok(match resp.status() {
            StatusCode::NO_CONTENT => UploadResult::NoContent,
            StatusCode::CREATED => UploadResult::Created {
                location: resp
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_owned(),
            },
            _ => UploadResult::Body(resp.text()),
        })
    }

    /// POST one or more local files, decode the JSON response.
    ///
    /// The files go out as the parts of a single `multipart/form-data`
    /// payload, one part per file.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if no files were given or any of them cannot be read;
    /// nothing is sent in that case.
    /// Otherwise the same as [`Connection::json_request`].
    pub async fn upload_file<P: AsRef<Path> + Sync>(
        &mut self,
        path: &str,
        files: &[P],
        opts: RequestOptions,
    ) -> Result<Option<JsonValue>> {
        if files.is_empty() {
            return Err(Error::File(anyhow!("No files specified for uploading to {path}")));
        }
        let mut parts = Vec::with_capacity(files.len());
        for file in files {
            parts.push(FilePart::read(file.as_ref()).await?);
        }

        let opts = opts.header(header::ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
        self.request(Method::POST, path, RequestBody::Multipart(parts), opts)
            .await?
            .json()
    }

    /// Download a resource into a local file, return the file's path.
    ///
    /// `dest` may be a full file path, an existing directory (the file name is
    /// then taken from the Content-Disposition header), or `None` for a new
    /// temporary directory.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if `dest` names a missing directory or writing fails.
    /// [`Error::NoFilename`] if no file name could be determined.
    /// [`Error::FileExists`] if the file exists and `overwrite` is not set.
    /// Otherwise the same as [`Connection::request`].
    pub async fn download(
        &mut self,
        method: Method,
        url: &str,
        dest: Option<&Path>,
        overwrite: bool,
        opts: RequestOptions,
    ) -> Result<PathBuf> {
        let (directory, filename) = download_target(dest)?;
        let opts = opts.header(header::CONNECTION, HeaderValue::from_static("close"));
        let resp = self.request_stream(method, url, RequestBody::Empty, opts).await?;

        let filename = match filename {
            Some(filename) => filename,
            None => content_disposition_filename(resp.headers()).ok_or_else(|| {
                Error::NoFilename(
                    dest.map_or_else(|| "<unspecified>".to_owned(), |dest| dest.display().to_string()),
                )
            })?,
        };
        let target = directory.join(filename);
        if target.exists() && !overwrite {
            return Err(Error::FileExists(target));
        }
        save_stream(resp, &target).await?;
        debug!("Downloaded {url} into {target}", target = target.display());
        Ok(target)
    }
}

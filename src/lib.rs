//! Typed bindings for the REST APIs of Riverbed appliances.
//!
//! ```no_run
//! # use std::error::Error;
//! #
//! # use secrecy::SecretString;
//! # use steelscript::{Auth, Service, ServiceConfig, UserAuth};
//! #
//! # async fn send_req() -> Result<(), Box<dyn Error>> {
//! let auth = Auth::User(UserAuth::new("admin", SecretString::from("mellon".to_owned())));
//! let mut profiler = Service::connect(ServiceConfig::new("profiler", "np.example.com"), Some(auth)).await?;
//! profiler.ping().await?;
//! let info = profiler
//!     .conn()
//!     .json_request(reqwest::Method::GET, "/api/profiler/1.0/system/info", None, Default::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::pub_use)]

#[cfg(test)]
mod tests;

pub mod api_version;
pub mod auth;
pub mod connection;
pub mod defs;
pub mod dirs;
pub mod http_error;
pub mod scrub;
pub mod service;

pub use api_version::ApiVersion;
pub use auth::{Auth, AuthMethod, ClientCredentials, OAuth, SupportedMethods, UserAuth};
pub use connection::{Connection, ConnectionConfig, RequestOptions, RestLogConfig, RetryBudget};
pub use defs::{Error, JsonValue, Result};
pub use http_error::{HttpError, SessionExpiry};
pub use service::{AuthState, Service, ServiceConfig};

//! Parse the configuration files for the steel tool.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context};
use secrecy::SecretString;
use serde::Deserialize;
use tracing::debug;
use xdg::BaseDirectories;

use steelscript::dirs::XDG_PREFIX;
use steelscript::{Auth, ClientCredentials, OAuth, UserAuth};

use crate::cli::Target;
use crate::defs::{Error, Result};

/// The name of the general configuration file.
const GLOBAL_FILE: &str = "steel.toml";

/// The name of the credentials file.
const AUTH_FILE: &str = "auth.toml";

/// Authentication data for a single appliance.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "auth_type")]
pub enum AuthAppliance {
    /// A username and a password.
    #[serde(rename = "user")]
    User {
        /// The account name.
        username: String,

        /// The account password.
        password: String,
    },

    /// An OAuth access code.
    #[serde(rename = "oauth")]
    OAuth {
        /// The access code generated on the appliance.
        access_code: String,
    },

    /// OAuth 2.0 client credentials for an external token endpoint.
    #[serde(rename = "client_credentials")]
    ClientCredentials {
        /// The URL of the token endpoint.
        token_url: String,

        /// The requested scope.
        scope: String,

        /// The client identifier.
        client_id: String,

        /// The client secret.
        client_secret: String,
    },
}

impl AuthAppliance {
    /// Build the library's credentials descriptor.
    fn to_auth(&self) -> Auth {
        match *self {
            Self::User {
                ref username,
                ref password,
            } => Auth::User(UserAuth::new(username, SecretString::from(password.clone()))),
            Self::OAuth { ref access_code } => {
                Auth::OAuth(OAuth::new(SecretString::from(access_code.clone())))
            }
            Self::ClientCredentials {
                ref token_url,
                ref scope,
                ref client_id,
                ref client_secret,
            } => Auth::ClientCredentials(ClientCredentials::new(
                token_url,
                scope,
                client_id,
                SecretString::from(client_secret.clone()),
            )),
        }
    }
}

/// Authentication data for the appliances.
#[derive(Debug, Deserialize)]
pub struct AuthSnippet {
    /// Authentication data for each appliance.
    pub appliances: HashMap<String, AuthAppliance>,
}

/// Default settings if not overridden at each invocation.
#[derive(Debug, Deserialize)]
pub struct SteelDefaults {
    /// The appliance to talk to.
    pub appliance: String,
}

/// General configuration settings for an appliance.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplianceSnippet {
    /// The appliance hostname, possibly with a scheme and a port.
    host: String,

    /// The port to connect to, if not part of the hostname.
    port: Option<u16>,

    /// Require a valid certificate from the appliance.
    #[serde(default)]
    verify_ssl: bool,
}

/// General configuration settings for the steel tool.
#[derive(Debug, Deserialize)]
pub struct SteelSnippet {
    /// Some default values.
    pub defaults: SteelDefaults,

    /// Per-appliance configuration settings.
    pub appliances: HashMap<String, ApplianceSnippet>,
}

/// The format of the `steel.toml` global configuration file.
#[derive(Debug, Deserialize)]
pub struct GlobalSnippet {
    /// General settings for the steel tool.
    pub steel: SteelSnippet,
}

/// Everything needed to connect to an appliance.
#[derive(Debug)]
pub struct Appliance {
    /// The appliance hostname, possibly with a scheme and a port.
    pub host: String,

    /// The port to connect to, if not part of the hostname.
    pub port: Option<u16>,

    /// Require a valid certificate from the appliance.
    pub verify: bool,

    /// How to authenticate, if at all.
    pub auth: Option<Auth>,
}

/// Read a single configuration file with format version 0.x.
///
/// # Errors
///
/// [`Error::ConfigRead`] if the configuration file could not be read.
/// [`Error::ConfigParse`] if the configuration file's contents could not be parsed.
fn read_format_version(path: &Path) -> Result<String> {
    let contents = fs::read_to_string(path).map_err(Error::ConfigRead)?;
    let fver = typed_format_version::get_version_from_str(&contents, toml::from_str)
        .with_context(|| {
            format!(
                "Could not parse the format version of the {path} file",
                path = path.display()
            )
        })
        .map_err(Error::ConfigParse)?;
    if fver.major() != 0 {
        return Err(Error::ConfigParse(anyhow!(
            "Unsupported format version {major}.{minor} for the {path} file",
            major = fver.major(),
            minor = fver.minor(),
            path = path.display(),
        )));
    }
    Ok(contents)
}

/// Parse a TOML file once its format version has been checked.
fn parse_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    toml::from_str::<T>(&read_format_version(path)?)
        .with_context(|| format!("Could not parse the {path} file", path = path.display()))
        .map_err(Error::ConfigParse)
}

/// Look up an appliance in the steel configuration files.
///
/// # Errors
///
/// [`Error::ConfigEnv`] if something goes wrong during initialization.
/// [`Error::ConfigFileMissing`] if the `steel.toml` file could not be found.
/// [`Error::ConfigParse`] if the appliance is not defined.
fn parse_configured(name: Option<&str>) -> Result<Appliance> {
    let dirs = BaseDirectories::with_prefix(XDG_PREFIX)
        .context("Could not initialize the XDG base directories parser")
        .map_err(Error::ConfigEnv)?;

    let global_path = dirs
        .find_config_file(GLOBAL_FILE)
        .ok_or_else(|| Error::ConfigFileMissing(format!("{XDG_PREFIX}/{GLOBAL_FILE}")))?;
    let global: GlobalSnippet = parse_file(&global_path)?;
    let appl_name = name.unwrap_or(&global.steel.defaults.appliance).to_owned();
    let appl = global.steel.appliances.get(&appl_name).ok_or_else(|| {
        Error::ConfigParse(anyhow!(
            "No {appl_name} in the {global_path} config file",
            global_path = global_path.display()
        ))
    })?;

    let auth = match dirs.find_config_file(AUTH_FILE) {
        Some(auth_path) => {
            let snippet: AuthSnippet = parse_file(&auth_path)?;
            let found = snippet.appliances.get(&appl_name).map(AuthAppliance::to_auth);
            if found.is_none() {
                debug!(
                    "No credentials for {appl_name} in {auth_path}",
                    auth_path = auth_path.display()
                );
            }
            found
        }
        None => {
            debug!("No {XDG_PREFIX}/{AUTH_FILE} file, not authenticating");
            None
        }
    };

    debug!("Using the {appl_name} appliance at {host}", host = appl.host);
    Ok(Appliance {
        host: appl.host.clone(),
        port: appl.port,
        verify: appl.verify_ssl,
        auth,
    })
}

/// Figure out the connection and authentication parameters.
///
/// # Errors
///
/// Propagates configuration file errors for configured appliances.
pub fn resolve(target: Target) -> Result<Appliance> {
    match target {
        Target::Configured { name } => parse_configured(name.as_deref()),
        Target::AdHoc {
            host,
            port,
            username,
            password,
            oauth,
            verify,
        } => {
            let auth = match (oauth, username, password) {
                (Some(code), _, _) => Some(Auth::OAuth(OAuth::new(code))),
                (None, Some(username), Some(password)) => {
                    Some(Auth::User(UserAuth::new(&username, password)))
                }
                (None, Some(username), None) => {
                    return Err(Error::Internal(format!(
                        "No password for {username} after parsing the command line"
                    )));
                }
                (None, None, _) => None,
            };
            Ok(Appliance {
                host,
                port,
                verify,
                auth,
            })
        }
    }
}

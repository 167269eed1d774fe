//! A command-line tool for talking to Riverbed appliances.

use std::env::consts as env_consts;
use std::path::PathBuf;
use std::process::{ExitCode, Termination};

use anyhow::{Context, Result as AnyResult};
use itertools::Itertools;
use reqwest::Method;
use tracing::{debug, warn};
use xdg::BaseDirectories;

use steelscript::defs::{Error as SsError, JsonValue, VERSION};
use steelscript::dirs::{SteelScriptDir, XDG_PREFIX};
use steelscript::service::ServiceEntry;
use steelscript::{RequestOptions, RestLogConfig, Service, ServiceConfig};

mod cli;
mod config;
mod defs;

use crate::cli::{Mode, Target};
use crate::config::Appliance;
use crate::defs::{Error, Result};

/// The service namespace used for the common resources.
const COMMON_SERVICE: &str = "common";

/// The version of the cached services list format.
const SERVICES_CACHE_VERSION: u32 = 1;

/// The exit status of a main program's subcommand.
enum MainExit {
    /// Everything went fine.
    Ok,

    /// The appliance reported an error.
    Failed,
}

impl Termination for MainExit {
    fn report(self) -> ExitCode {
        match self {
            Self::Ok => ExitCode::SUCCESS,
            Self::Failed => ExitCode::FAILURE,
        }
    }
}

/// Connect to the appliance, authenticate if credentials are configured.
async fn connect(appl: Appliance, rest_log: RestLogConfig) -> Result<(String, Service)> {
    let mut cfg = ServiceConfig::new(COMMON_SERVICE, &appl.host);
    cfg.connection.port = appl.port;
    cfg.connection.verify = appl.verify;
    cfg.connection.rest_log = rest_log;
    cfg.detect_versions = false;
    let svc = Service::connect(cfg, appl.auth)
        .await
        .map_err(Error::Api)?;
    Ok((appl.host, svc))
}

/// Display information about the steelscript installation.
fn cmd_about(verbose: bool) -> Result<MainExit> {
    println!("steelscript {VERSION}");
    println!(
        "Platform: {os} {arch}",
        os = env_consts::OS,
        arch = env_consts::ARCH
    );
    if verbose {
        let dirs = BaseDirectories::with_prefix(XDG_PREFIX)
            .context("Could not initialize the XDG base directories parser")
            .map_err(Error::ConfigEnv)?;
        println!(
            "Configuration directory: {path}",
            path = dirs.get_config_home().display()
        );
        println!("Data directory: {path}", path = dirs.get_data_home().display());
        match dirs.find_config_file("steel.toml") {
            Some(path) => println!("Configuration file: {path}", path = path.display()),
            None => println!("Configuration file: none"),
        }
    }
    Ok(MainExit::Ok)
}

/// Check whether the appliance is alive.
async fn cmd_ping(target: Target) -> Result<MainExit> {
    let (host, mut svc) = connect(config::resolve(target)?, RestLogConfig::default()).await?;
    match svc.ping().await {
        Ok(_) => {
            println!("{host} is alive");
            Ok(MainExit::Ok)
        }
        Err(SsError::Http(err)) => {
            warn!("{err}");
            println!("{host} returned an error: {status}", status = err.status());
            Ok(MainExit::Failed)
        }
        Err(err) => Err(Error::Api(err)),
    }
}

/// Turn a hostname into something usable as a file name.
fn cache_name(host: &str) -> String {
    let safe: String = host
        .chars()
        .map(|chr| if chr.is_ascii_alphanumeric() || chr == '.' || chr == '-' { chr } else { '_' })
        .collect();
    format!("{safe}.json")
}

/// Decode a list of services, either cached or freshly fetched.
fn decode_services(value: JsonValue) -> Result<Vec<ServiceEntry>> {
    serde_json::from_value(value)
        .context("Could not decode the list of services")
        .map_err(Error::ConfigParse)
}

/// List the services supported by the appliance.
async fn cmd_services(target: Target, refresh: bool) -> Result<MainExit> {
    let appl = config::resolve(target)?;
    let cache_dir = SteelScriptDir::new(&["steel", "services"], None).map_err(Error::Api)?;
    let mut cache = cache_dir.get_data(&cache_name(&appl.host)).map_err(Error::Api)?;

    let entries = match cache.data.take() {
        Some(value) if !refresh && cache.version == SERVICES_CACHE_VERSION => {
            debug!("Using the cached services list for {host}", host = appl.host);
            decode_services(value)?
        }
        _ => {
            let (_, mut svc) = connect(appl, RestLogConfig::default()).await?;
            let entries = svc.services().await.map_err(Error::Api)?;
            cache.version = SERVICES_CACHE_VERSION;
            cache.data = Some(
                serde_json::to_value(&entries)
                    .context("Could not encode the list of services")
                    .map_err(|err| Error::Internal(format!("{err:#}")))?,
            );
            cache.write().map_err(Error::Api)?;
            entries
        }
    };
    for entry in &entries {
        println!(
            "{id}: {versions}",
            id = entry.id(),
            versions = entry.versions().iter().join(", ")
        );
    }
    Ok(MainExit::Ok)
}

/// Send a single REST request, display the response.
async fn cmd_rest(
    target: Target,
    method: &str,
    path: &str,
    data: Option<&str>,
    xml: bool,
    rest_log: RestLogConfig,
) -> Result<MainExit> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {method:?}"))
        .map_err(Error::Invoke)?;
    let (_, mut svc) = connect(config::resolve(target)?, rest_log).await?;
    if xml {
        let tree = svc
            .conn()
            .xml_request(method, path, data, RequestOptions::new())
            .await
            .map_err(Error::Api)?;
        let mut output = Vec::new();
        tree.write(&mut output)
            .map_err(|err| Error::Internal(format!("Could not format the XML response: {err}")))?;
        println!("{text}", text = String::from_utf8_lossy(&output));
        return Ok(MainExit::Ok);
    }

    let body = data
        .map(serde_json::from_str::<JsonValue>)
        .transpose()
        .context("The request body is not a valid JSON document")
        .map_err(Error::Invoke)?;
    match svc
        .conn()
        .json_request(method, path, body.as_ref(), RequestOptions::new())
        .await
        .map_err(Error::Api)?
    {
        Some(reply) => println!(
            "{text}",
            text = serde_json::to_string_pretty(&reply)
                .context("Could not format the JSON response")
                .map_err(|err| Error::Internal(format!("{err:#}")))?
        ),
        None => println!("<no content>"),
    }
    Ok(MainExit::Ok)
}

/// Download a resource into a local file.
async fn cmd_download(
    target: Target,
    url: &str,
    output: Option<PathBuf>,
    overwrite: bool,
) -> Result<MainExit> {
    let (_, mut svc) = connect(config::resolve(target)?, RestLogConfig::default()).await?;
    let path = svc
        .conn()
        .download(
            Method::GET,
            url,
            output.as_deref(),
            overwrite,
            RequestOptions::new(),
        )
        .await
        .map_err(Error::Api)?;
    println!("{path}", path = path.display());
    Ok(MainExit::Ok)
}

#[tokio::main]
async fn main() -> AnyResult<MainExit> {
    match cli::parse().context("Could not parse the command-line arguments")? {
        Mode::About { verbose } => cmd_about(verbose).context("Could not gather the information"),
        Mode::Ping { target } => cmd_ping(target)
            .await
            .context("Could not ping the appliance"),
        Mode::Services { target, refresh } => cmd_services(target, refresh)
            .await
            .context("Could not list the appliance services"),
        Mode::Rest {
            target,
            method,
            path,
            data,
            xml,
            rest_log,
        } => cmd_rest(target, &method, &path, data.as_deref(), xml, rest_log)
            .await
            .with_context(|| format!("Could not send the {method} request for {path}")),
        Mode::Download {
            target,
            url,
            output,
            overwrite,
        } => cmd_download(target, &url, output, overwrite)
            .await
            .with_context(|| format!("Could not download {url}")),
    }
}

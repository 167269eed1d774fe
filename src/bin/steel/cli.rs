//! Parse the steel command-line - subcommands, options, etc.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context};
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;
use tracing::Level;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

use steelscript::RestLogConfig;

use crate::defs::{Error, Result};

/// Which appliance to talk to and how to authenticate to it.
#[derive(Debug)]
pub enum Target {
    /// An appliance defined in the steel configuration files.
    Configured {
        /// The appliance name, if not the default one.
        name: Option<String>,
    },

    /// An appliance specified on the command line.
    AdHoc {
        /// The appliance hostname, possibly with a scheme and a port.
        host: String,

        /// The port to connect to, if not part of the hostname.
        port: Option<u16>,

        /// The username for Basic or Cookie authentication.
        username: Option<String>,

        /// The password for Basic or Cookie authentication.
        password: Option<SecretString>,

        /// An OAuth access code.
        oauth: Option<SecretString>,

        /// Require a valid certificate from the appliance.
        verify: bool,
    },
}

/// The action requested by the command-line subcommands.
#[derive(Debug)]
pub enum Mode {
    /// Display information about the steelscript installation.
    About {
        /// Also list the directories and the environment.
        verbose: bool,
    },

    /// Check whether the appliance is alive.
    Ping {
        /// The appliance to ping.
        target: Target,
    },

    /// List the services supported by the appliance.
    Services {
        /// The appliance to query.
        target: Target,

        /// Ignore any cached list.
        refresh: bool,
    },

    /// Send a single REST request, display the response.
    Rest {
        /// The appliance to send the request to.
        target: Target,

        /// The HTTP method.
        method: String,

        /// The resource path or full URL.
        path: String,

        /// The request body.
        data: Option<String>,

        /// Send and expect XML instead of JSON.
        xml: bool,

        /// How much of the REST traffic to log.
        rest_log: RestLogConfig,
    },

    /// Download a resource into a local file.
    Download {
        /// The appliance to download from.
        target: Target,

        /// The resource path or full URL.
        url: String,

        /// The file or directory to download into.
        output: Option<PathBuf>,

        /// Replace an existing file.
        overwrite: bool,
    },
}

/// Command-line options selecting the appliance.
#[derive(Debug, Args)]
struct CliTarget {
    /// The name of a configured appliance, if not the default one.
    #[clap(short, long, conflicts_with = "host")]
    appliance: Option<String>,

    /// The hostname of an appliance not in the configuration files.
    #[clap(long)]
    host: Option<String>,

    /// The port to connect to.
    #[clap(long, requires = "host")]
    port: Option<u16>,

    /// The username to authenticate as.
    #[clap(short, long, requires = "host")]
    username: Option<String>,

    /// The password to authenticate with.
    #[clap(short, long, requires = "username")]
    password: Option<String>,

    /// An OAuth access code to authenticate with.
    #[clap(long, requires = "host", conflicts_with = "username")]
    oauth: Option<String>,

    /// Verify the appliance's TLS certificate.
    #[clap(long, requires = "host")]
    verify_ssl: bool,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
enum CliCommand {
    /// Display information about the steelscript installation.
    About {
        /// Also list the directories and the environment.
        #[clap(short, long)]
        verbose: bool,
    },

    /// Check whether the appliance is alive.
    Ping,

    /// List the services and API versions supported by the appliance.
    Services {
        /// Query the appliance even if a cached list exists.
        #[clap(long)]
        refresh: bool,
    },

    /// Send a single REST request, display the response.
    Rest {
        /// The HTTP method, e.g. GET or POST.
        method: String,

        /// The resource path, e.g. /api/common/1.0/services.
        path: String,

        /// The request body: a JSON document, or XML with --xml.
        #[clap(short, long)]
        data: Option<String>,

        /// Send and expect XML instead of JSON.
        #[clap(long)]
        xml: bool,

        /// REST logging: 1 for headers, 2 for bodies, too.
        #[clap(long, default_value_t = 0)]
        rest_debug: u8,

        /// The maximum number of body lines to log.
        #[clap(long, default_value_t = 20)]
        body_lines: usize,
    },

    /// Download a resource into a local file.
    Download {
        /// The resource path or full URL.
        url: String,

        /// The file or existing directory to download into.
        #[clap(short, long)]
        output: Option<PathBuf>,

        /// Replace the file if it already exists.
        #[clap(long)]
        overwrite: bool,
    },
}

/// The top-level command-line parser.
#[derive(Debug, Parser)]
#[clap(about("talk to Riverbed appliances over their REST API"), author, version)]
struct Cli {
    /// The minimum level of the log messages to display.
    #[clap(long, default_value = "warn")]
    loglevel: Level,

    /// Write the log messages to this file instead of the standard error stream.
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Which appliance to talk to.
    #[clap(flatten)]
    target: CliTarget,

    /// What to do, what to do...
    #[clap(subcommand)]
    command: CliCommand,
}

/// Initialize the `tracing` crate's facilities.
///
/// Create a tracing subscriber, set the level according to the "--loglevel"
/// option, send the messages to the "--logfile" file if specified.
///
/// # Errors
///
/// [`Error::ConfigEnv`] if something goes wrong.
fn setup_tracing(cli: &Cli) -> Result<()> {
    let (writer, ansi) = match cli.logfile {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Could not open the {path} log file", path = path.display()))
                .map_err(Error::ConfigEnv)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };
    let formatter = FmtSubscriber::builder()
        .with_max_level(cli.loglevel)
        .with_ansi(ansi)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(formatter)
        .context("Could not initialize the tracing subscriber")
        .map_err(Error::ConfigEnv)?;
    Ok(())
}

/// Figure out which appliance the command-line options point to.
fn build_target(opts: CliTarget) -> Result<Target> {
    let Some(host) = opts.host else {
        return Ok(Target::Configured {
            name: opts.appliance,
        });
    };
    if opts.username.is_some() && opts.password.is_none() {
        return Err(Error::Invoke(anyhow!(
            "No --password specified for the {username} user",
            username = opts.username.unwrap_or_default()
        )));
    }
    Ok(Target::AdHoc {
        host,
        port: opts.port,
        username: opts.username,
        password: opts.password.map(SecretString::from),
        oauth: opts.oauth.map(SecretString::from),
        verify: opts.verify_ssl,
    })
}

/// Parse the command-line arguments: subcommands, options, etc.
///
/// # Errors
///
/// [`Error::Invoke`] if the arguments are invalid.
/// [`Error::ConfigEnv`] if the logging could not be set up.
pub fn parse() -> Result<Mode> {
    let cli = Cli::try_parse()
        .context("Could not parse the command-line parameters")
        .map_err(Error::Invoke)?;
    setup_tracing(&cli)?;
    let target = build_target(cli.target)?;
    Ok(match cli.command {
        CliCommand::About { verbose } => Mode::About { verbose },
        CliCommand::Ping => Mode::Ping { target },
        CliCommand::Services { refresh } => Mode::Services { target, refresh },
        CliCommand::Rest {
            method,
            path,
            data,
            xml,
            rest_debug,
            body_lines,
        } => Mode::Rest {
            target,
            method,
            path,
            data,
            xml,
            rest_log: RestLogConfig {
                debug: rest_debug,
                body_lines,
            },
        },
        CliCommand::Download {
            url,
            output,
            overwrite,
        } => Mode::Download {
            target,
            url,
            output,
            overwrite,
        },
    })
}

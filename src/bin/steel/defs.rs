//! Error types for the steel command-line tool.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use std::io::Error as IoError;
use std::result::Result as StdResult;

use anyhow::Error as AnyError;
use thiserror::Error;

use steelscript::defs::Error as SsError;

/// Why a steel subcommand could not do its job.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The steelscript library failed to reach or log into the appliance,
    /// or the appliance rejected a request.
    #[error("Could not talk to the appliance")]
    Api(#[source] SsError),

    /// The XDG directories or the log file could not be set up.
    #[error("Could not prepare the steel runtime environment")]
    ConfigEnv(#[source] AnyError),

    /// No `steel.toml` file names the appliances to talk to.
    #[error("No {0} file, use --host or create one")]
    ConfigFileMissing(String),

    /// A `steel.toml` or `auth.toml` file, or a cached services list, is malformed.
    #[error("Invalid appliance or credentials settings")]
    ConfigParse(#[source] AnyError),

    /// A `steel.toml` or `auth.toml` file exists but cannot be read.
    #[error("Could not read the appliance settings")]
    ConfigRead(#[source] IoError),

    /// A response could not be formatted for display, or the command-line
    /// parser let an inconsistent combination through.
    #[error("steel internal error: {0}")]
    Internal(String),

    /// Bad command-line arguments, e.g. an unknown HTTP method or a request
    /// body that is not valid JSON.
    #[error("Invalid steel command-line arguments")]
    Invoke(#[source] AnyError),
}

/// The result of a steel subcommand step.
pub type Result<T> = StdResult<T, Error>;

//! API version identifiers as reported by the common `services` resource.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize, Serializer};

use crate::defs::Error;

/// A `major.minor` API version.
///
/// Any components past the minor one, e.g. the patch level of "1.0.0", are
/// dropped when parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ApiVersion {
    /// The major version number.
    major: u32,

    /// The minor version number.
    minor: u32,
}

impl ApiVersion {
    #[inline]
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    #[inline]
    #[must_use]
    pub const fn major(&self) -> u32 {
        self.major
    }

    #[inline]
    #[must_use]
    pub const fn minor(&self) -> u32 {
        self.minor
    }
}

impl Display for ApiVersion {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{major}.{minor}", major = self.major, minor = self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut components = value.split('.');
        let (Some(major), Some(minor)) = (components.next(), components.next()) else {
            return Err(Error::Version(format!("Not a major.minor API version: {value:?}")));
        };
        let parse_part = |part: &str| -> Result<u32, Error> {
            part.parse::<u32>()
                .with_context(|| format!("Invalid component {part:?} in API version {value:?}"))
                .map_err(|err| Error::Version(format!("{err:#}")))
        };
        Ok(Self {
            major: parse_part(major)?,
            minor: parse_part(minor)?,
        })
    }
}

impl Serialize for ApiVersion {
    #[inline]
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl TryFrom<String> for ApiVersion {
    type Error = anyhow::Error;

    #[inline]
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map_err(|err| anyhow!("{err}"))
    }
}

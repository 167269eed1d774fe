//! The per-user SteelScript directory: configuration and cached data.
// SPDX-FileCopyrightText: StorPool <support@storpool.com>
// SPDX-License-Identifier: BSD-2-Clause

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use xdg::BaseDirectories;

use crate::defs::{Error, JsonValue, Result};

/// The XDG prefix of the SteelScript directories.
pub const XDG_PREFIX: &str = "steelscript";

/// The format of the cached data files; others are ignored.
pub const CACHE_VERSION: u32 = 1;

/// A directory holding SteelScript configuration and data files.
#[derive(Debug, Clone)]
pub struct SteelScriptDir {
    /// The full path to the directory.
    basedir: PathBuf,
}

impl SteelScriptDir {
    /// Locate the directory, create it if needed.
    ///
    /// The components are appended to `directory` if specified, or to
    /// the `steelscript/` subdirectory of the XDG data home otherwise.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the XDG directories cannot be determined or
    /// the directory cannot be created.
    pub fn new(components: &[&str], directory: Option<&Path>) -> Result<Self> {
        let base = match directory {
            Some(dir) => dir.to_path_buf(),
            None => BaseDirectories::with_prefix(XDG_PREFIX)
                .context("Could not initialize the XDG base directories parser")
                .map_err(Error::File)?
                .get_data_home(),
        };
        let basedir = components
            .iter()
            .fold(base, |path, component| path.join(component));
        fs::create_dir_all(&basedir)
            .with_context(|| format!("Could not create the {dir} directory", dir = basedir.display()))
            .map_err(Error::File)?;
        debug!("Using the {dir} SteelScript directory", dir = basedir.display());
        Ok(Self { basedir })
    }

    #[inline]
    #[must_use]
    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// Is there a regular file with that name in the directory?
    #[inline]
    #[must_use]
    pub fn is_file(&self, filename: &str) -> bool {
        self.basedir.join(filename).is_file()
    }

    /// List the names of the entries in the directory.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the directory cannot be read.
    pub fn files(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.basedir)
            .with_context(|| format!("Could not list the {dir} directory", dir = self.basedir.display()))
            .map_err(Error::File)?;
        let mut names = entries
            .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().into_owned()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("Could not list the {dir} directory", dir = self.basedir.display()))
            .map_err(Error::File)?;
        names.sort();
        Ok(names)
    }

    /// Load a JSON configuration file from the directory.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`ConfigFile::read`].
    pub fn get_config(&self, filename: &str) -> Result<ConfigFile> {
        let mut file = ConfigFile {
            path: self.basedir.join(filename),
            data: None,
        };
        file.read()?;
        Ok(file)
    }

    /// Load a cached data file from the directory.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`DataFile::read`].
    pub fn get_data(&self, filename: &str) -> Result<DataFile> {
        let mut file = DataFile {
            path: self.basedir.join(filename),
            version: 0,
            data: None,
        };
        file.read()?;
        Ok(file)
    }
}

/// Read a file if it exists.
fn read_optional(path: &Path) -> Result<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .with_context(|| format!("Could not read {path}", path = path.display()))
        .map(Some)
        .map_err(Error::File)
}

/// Replace a file's contents.
fn write_contents(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .with_context(|| format!("Could not write {path}", path = path.display()))
        .map_err(Error::File)
}

/// A JSON configuration file.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// The full path to the file.
    path: PathBuf,

    /// The file contents; `None` if the file does not exist.
    pub data: Option<JsonValue>,
}

impl ConfigFile {
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file's contents.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the file cannot be read.
    /// [`Error::Decode`] if it does not contain valid JSON.
    pub fn read(&mut self) -> Result<()> {
        self.data = match read_optional(&self.path)? {
            Some(contents) => Some(
                serde_json::from_str(&contents)
                    .with_context(|| format!("Could not parse {path}", path = self.path.display()))
                    .map_err(Error::Decode)?,
            ),
            None => None,
        };
        Ok(())
    }

    /// Store the current contents; `None` is written as JSON `null`.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the file cannot be written.
    pub fn write(&self) -> Result<()> {
        let contents = serde_json::to_string_pretty(&self.data)
            .context("Could not encode the configuration data")
            .map_err(Error::Decode)?;
        write_contents(&self.path, &contents)
    }
}

/// The on-disk representation of a [`DataFile`].
#[derive(Debug, Serialize, Deserialize)]
struct DataEnvelope {
    /// The format of the file itself.
    cache_version: u32,

    /// The version of the data, managed by the caller.
    version: u32,

    /// The cached data.
    data: Option<JsonValue>,
}

/// A cached data file.
///
/// Files written with a different [`CACHE_VERSION`] read as absent.
#[derive(Debug, Clone)]
pub struct DataFile {
    /// The full path to the file.
    path: PathBuf,

    /// The caller's version of the cached data; 0 if absent.
    pub version: u32,

    /// The cached data; `None` if absent or stale.
    pub data: Option<JsonValue>,
}

impl DataFile {
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file's contents.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the file cannot be read.
    pub fn read(&mut self) -> Result<()> {
        self.version = 0;
        self.data = None;
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(());
        };
        match serde_json::from_str::<DataEnvelope>(&contents) {
            Ok(envelope) if envelope.cache_version == CACHE_VERSION => {
                self.version = envelope.version;
                self.data = envelope.data;
            }
            Ok(envelope) => debug!(
                "Ignoring {path}: cache version {found}, expected {CACHE_VERSION}",
                path = self.path.display(),
                found = envelope.cache_version
            ),
            Err(err) => warn!(
                "Ignoring the unparseable {path} cache file: {err}",
                path = self.path.display()
            ),
        }
        Ok(())
    }

    /// Store the current contents.
    ///
    /// # Errors
    ///
    /// [`Error::File`] if the file cannot be written.
    pub fn write(&self) -> Result<()> {
        let envelope = DataEnvelope {
            cache_version: CACHE_VERSION,
            version: self.version,
            data: self.data.clone(),
        };
        let contents = serde_json::to_string(&envelope)
            .context("Could not encode the cached data")
            .map_err(Error::Decode)?;
        write_contents(&self.path, &contents)
    }
}

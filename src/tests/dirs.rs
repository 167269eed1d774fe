//! Test the per-user SteelScript directory handling.

use std::fs;

use anyhow::{Context, Result};
use serde_json::json;
use tracing_test::traced_test;

use crate::dirs::{SteelScriptDir, CACHE_VERSION};

#[traced_test]
#[test]
fn test_empty_dir() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;

    let plain = SteelScriptDir::new(&[], Some(tempd.path()))?;
    assert_eq!(plain.basedir(), tempd.path());

    let nested = SteelScriptDir::new(&["np", "data"], Some(tempd.path()))?;
    assert_eq!(nested.basedir(), tempd.path().join("np").join("data"));
    assert!(nested.basedir().is_dir());
    assert!(nested.files()?.is_empty());

    let config = nested.get_config("empty.json")?;
    assert_eq!(config.data, None);
    let data = nested.get_data("empty.cache")?;
    assert_eq!(data.data, None);
    assert_eq!(data.version, 0);
    Ok(())
}

#[traced_test]
#[test]
fn test_config_file() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let ssdir = SteelScriptDir::new(&["profiler"], Some(tempd.path()))?;

    let mut config = ssdir.get_config("settings.json")?;
    config.data = Some(json!({"host": "np.example.com", "port": 443}));
    config.write()?;
    assert!(ssdir.is_file("settings.json"));
    assert_eq!(ssdir.files()?, vec!["settings.json".to_owned()]);

    let reread = ssdir.get_config("settings.json")?;
    assert_eq!(reread.data, Some(json!({"host": "np.example.com", "port": 443})));
    Ok(())
}

#[traced_test]
#[test]
fn test_data_file() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let ssdir = SteelScriptDir::new(&[], Some(tempd.path()))?;

    let mut data = ssdir.get_data("columns.cache")?;
    data.version = 3;
    data.data = Some(json!({"columns": ["avg_bytes", "peak_bytes"]}));
    data.write()?;

    let reread = ssdir.get_data("columns.cache")?;
    assert_eq!(reread.version, 3);
    assert_eq!(reread.data, Some(json!({"columns": ["avg_bytes", "peak_bytes"]})));

    let stale = json!({
        "cache_version": CACHE_VERSION + 1,
        "version": 3,
        "data": {"columns": []},
    });
    fs::write(reread.path(), stale.to_string()).context("Could not write the stale cache")?;
    let ignored = ssdir.get_data("columns.cache")?;
    assert_eq!(ignored.data, None);
    assert_eq!(ignored.version, 0);

    fs::write(reread.path(), "garbage").context("Could not write the broken cache")?;
    assert_eq!(ssdir.get_data("columns.cache")?.data, None);
    Ok(())
}

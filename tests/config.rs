use std::io::Write;

use anyhow::Result;
use docsync::error::RetryPolicy;
use docsync::SyncConfig;
use tempfile::NamedTempFile;

#[test]
fn json_file_fills_missing_fields_with_defaults() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "url": "wss://sync.example.com",
            "room": "proj",
            "reconnect": {{ "max_attempts": 5 }}
        }}"#
    )?;

    let config = SyncConfig::load(file.path())?;
    config.validate()?;

    assert_eq!(config.url, "wss://sync.example.com");
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(
        config.reconnect.initial_delay_ms,
        RetryPolicy::default().initial_delay_ms
    );
    assert_eq!(config.log_filter, "info");

    let endpoint = config.endpoint();
    assert_eq!(endpoint.child("a1").room, "proj--a1");
    Ok(())
}

#[test]
fn malformed_or_missing_file_is_an_error() -> Result<()> {
    let mut file = NamedTempFile::new()?;
    write!(file, "{{ not json")?;
    assert!(SyncConfig::load(file.path()).is_err());

    let dir = tempfile::tempdir()?;
    assert!(SyncConfig::load(&dir.path().join("missing.json")).is_err());
    Ok(())
}

#[test]
fn file_round_trips_through_serde() -> Result<()> {
    let original = SyncConfig {
        room: "team".into(),
        reconnect: RetryPolicy::aggressive(),
        ..Default::default()
    };
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("docsync.json");
    std::fs::write(&path, serde_json::to_string_pretty(&original)?)?;

    assert_eq!(SyncConfig::load(&path)?, original);
    Ok(())
}

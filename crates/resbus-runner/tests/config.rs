use std::fs;

use resbus_runner::{ConfigLoadError, ResbusConfig};
use resbus_runner::config::{LoggingConfig, NetConfig, QueueConfig};

#[test]
fn test_save_and_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");

    let config = ResbusConfig {
        tick_interval_ms: 33,
        autostart: vec!["base".into(), "chat".into()],
        queue: QueueConfig {
            max_depth: Some(10_000),
        },
        net: NetConfig {
            peer_events_per_second: Some(50),
            local_peer_id: 3,
            ..Default::default()
        },
        logging: LoggingConfig {
            file: true,
            ..Default::default()
        },
        ..Default::default()
    };

    config.save_to(&path).unwrap();
    let loaded = ResbusConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.contains("tick_interval_ms = 33"));
    assert!(text.contains("[queue]"));
}

#[test]
fn test_load_errors() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        ResbusConfig::load_from(&dir.path().join("missing.toml")),
        Err(ConfigLoadError::NotFound)
    ));

    let bad = dir.path().join("bad.toml");
    fs::write(&bad, "tick_interval_ms = \"fast\"\n").unwrap();
    assert!(matches!(
        ResbusConfig::load_from(&bad),
        Err(ConfigLoadError::ParseError(_))
    ));

    // A directory where the file should be
    let dir_path = dir.path().join("config.toml");
    fs::create_dir(&dir_path).unwrap();
    assert!(matches!(
        ResbusConfig::load_from(&dir_path),
        Err(ConfigLoadError::IoError(_))
    ));
}

//! Integration tests for configuration loading

use pendulum_sorter::domain::types::DelayWindow;
use pendulum_sorter::infra::{Config, LineMode};
use pendulum_sorter::io::ActuatorCommand;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_load_config_from_file() {
    let mut temp_file = NamedTempFile::new().unwrap();

    let config_content = r#"
[site]
id = "hall-a"

[line]
mode = "pendulum"
chutes_per_lane = 2

[trigger]
addr = "192.168.10.5:4001"
lower_ms = 150
upper_ms = 1200

[[lanes]]
name = "west"
addr = "192.168.10.11:4001"
lower_ms = 1800
upper_ms = 4200
swing_delay_ms = 40
reset_delay_ms = 350

[[lanes]]
name = "east"
addr = "192.168.10.12:4001"
lower_ms = 2600
upper_ms = 5200

[timing]
slack_ms = 300
reconnect_delay_ms = 1500

[commands]
swing_left = "AA 10 01 55"

[ingest]
port = 26000

[metrics]
interval_secs = 15
prometheus_port = 9091
"#;

    temp_file.write_all(config_content.as_bytes()).unwrap();
    temp_file.flush().unwrap();

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.site_id(), "hall-a");
    assert_eq!(config.mode(), LineMode::Pendulum);
    assert_eq!(config.trigger_addr(), "192.168.10.5:4001");
    assert_eq!(config.trigger_window(), DelayWindow::from_millis(150, 1200));
    assert_eq!(config.lanes().len(), 2);
    assert_eq!(config.lanes()[0].name, "west");
    assert_eq!(config.lanes()[0].reset_delay, Duration::from_millis(350));
    assert_eq!(config.lanes()[1].window, DelayWindow::from_millis(2600, 5200));
    assert_eq!(config.slack(), Duration::from_millis(300));
    assert_eq!(config.reconnect_delay(), Duration::from_millis(1500));
    assert_eq!(config.commands().frame(ActuatorCommand::SwingLeft), &[0xAA, 0x10, 0x01, 0x55]);
    assert_eq!(config.ingest_port(), 26000);
    assert_eq!(config.prometheus_port(), 9091);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/path/config.toml");

    assert_eq!(config.site_id(), "sorter");
    assert_eq!(config.config_file(), "default");
    assert_eq!(config.lanes().len(), 2);
}

#[test]
fn test_invalid_file_falls_back_to_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    // Lower bound above upper bound
    temp_file
        .write_all(b"[trigger]\naddr = \"127.0.0.1:1\"\nlower_ms = 900\nupper_ms = 100\n")
        .unwrap();
    temp_file.flush().unwrap();

    assert!(Config::from_file(temp_file.path()).is_err());
    let config = Config::load_from_path(temp_file.path().to_str().unwrap());
    assert_eq!(config.config_file(), "default");
}

#[test]
fn test_dev_config_is_valid() {
    let config = Config::from_file("config/dev.toml").unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.lanes().len(), 2);
}

use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use emergency_watch::config::{DetectorKind, PollerConfig, ServerConfig};
use emergency_watch::ImageEncoding;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "EMERGENCY_SERVER_CONFIG",
        "EMERGENCY_API_ADDR",
        "EMERGENCY_CAMERA_DEVICE",
        "EMERGENCY_MIN_INTERVAL_MS",
        "EMERGENCY_KEEP",
        "EMERGENCY_LOCATION",
        "EMERGENCY_POLLER_CONFIG",
        "EMERGENCY_ENDPOINT",
        "EMERGENCY_ALERT_URL",
        "EMERGENCY_ACCEPTED_STATUSES",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn server_config_from_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "api": { "addr": "0.0.0.0:9100" },
            "camera": { "device": "/dev/video2", "width": 1280, "height": 720 },
            "throttle": { "min_interval_ms": 500, "max_consecutive_failures": 10 },
            "storage": {
                "screenshots_dir": "/var/lib/watch/screenshots",
                "people_dir": "/var/lib/watch/people",
                "keep": 8
            },
            "detectors": { "people": "stub", "weapons": "stub" },
            "envelope": { "image_encoding": "binary" },
            "location": "40.0,-120.0"
        }"#,
    );

    std::env::set_var("EMERGENCY_SERVER_CONFIG", file.path());
    std::env::set_var("EMERGENCY_CAMERA_DEVICE", "stub://override");
    std::env::set_var("EMERGENCY_KEEP", "3");

    let cfg = ServerConfig::load().expect("load config");

    assert_eq!(cfg.api_addr, "0.0.0.0:9100");
    assert_eq!(cfg.camera.device, "stub://override");
    assert_eq!(cfg.camera.width, 1280);
    assert_eq!(cfg.camera.height, 720);
    assert_eq!(cfg.min_interval, Duration::from_millis(500));
    assert_eq!(cfg.max_consecutive_failures, Some(10));
    assert_eq!(
        cfg.storage.screenshots_dir,
        PathBuf::from("/var/lib/watch/screenshots")
    );
    assert_eq!(cfg.storage.weapons_dir, PathBuf::from("./shared/weapons"));
    assert_eq!(cfg.storage.keep, 3);
    assert_eq!(cfg.weapons_detector, DetectorKind::Stub);
    assert_eq!(cfg.image_encoding, ImageEncoding::Binary);
    assert_eq!(cfg.location, "40.0,-120.0");

    let api = cfg.api_config();
    assert_eq!(api.keep, 3);
    assert_eq!(api.image_encoding, ImageEncoding::Binary);

    clear_env();
}

#[test]
fn server_config_from_toml_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
location = "51.5,-0.12"

[api]
addr = "127.0.0.1:8111"

[storage]
keep = 7

[detectors]
people = "none"
"#,
    );

    let cfg = ServerConfig::load_from(Some(file.path())).expect("load toml config");
    assert_eq!(cfg.api_addr, "127.0.0.1:8111");
    assert_eq!(cfg.storage.keep, 7);
    assert_eq!(cfg.people_detector, DetectorKind::Disabled);
    assert_eq!(cfg.location, "51.5,-0.12");
    assert_eq!(cfg.camera.device, "stub://camera");

    clear_env();
}

#[test]
fn server_defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = ServerConfig::load().expect("defaults");
    assert_eq!(cfg.api_addr, "127.0.0.1:8100");
    assert_eq!(cfg.min_interval, Duration::from_secs(2));
    assert_eq!(cfg.max_consecutive_failures, None);
    assert_eq!(cfg.storage.keep, 5);
    assert_eq!(cfg.location, "37.8688956,-122.2600617");
    assert_eq!(cfg.image_encoding, ImageEncoding::Base64);
}

#[test]
fn invalid_server_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EMERGENCY_KEEP", "0");
    assert!(ServerConfig::load().is_err());
    clear_env();

    std::env::set_var("EMERGENCY_MIN_INTERVAL_MS", "soon");
    assert!(ServerConfig::load().is_err());
    clear_env();

    std::env::set_var("EMERGENCY_LOCATION", "somewhere");
    assert!(ServerConfig::load().is_err());
    clear_env();

    let file = config_file(".json", r#"{ "envelope": { "image_encoding": "jpeg" } }"#);
    assert!(ServerConfig::load_from(Some(file.path())).is_err());
    clear_env();
}

#[test]
fn poller_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "endpoint": "http://camera-host:8100/screenshot_people",
            "alert_url": "https://alerts.example.com/ingest",
            "timeout_ms": 2500,
            "interval_ms": 1000,
            "captioner_command": "caption-image --short"
        }"#,
    );
    std::env::set_var("EMERGENCY_POLLER_CONFIG", file.path());
    std::env::set_var("EMERGENCY_ACCEPTED_STATUSES", "200, 500");

    let cfg = PollerConfig::load().expect("load poller config");
    assert_eq!(cfg.endpoint, "http://camera-host:8100/screenshot_people");
    assert_eq!(cfg.alert_url, "https://alerts.example.com/ingest");
    assert_eq!(cfg.timeout, Duration::from_millis(2500));
    assert_eq!(cfg.interval, Duration::from_secs(1));
    assert_eq!(cfg.accepted_statuses, BTreeSet::from([200, 500]));
    assert_eq!(cfg.captioner_command.as_deref(), Some("caption-image --short"));

    clear_env();
}

#[test]
fn invalid_poller_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("EMERGENCY_ALERT_URL", "not a url");
    assert!(PollerConfig::load().is_err());
    clear_env();

    std::env::set_var("EMERGENCY_ACCEPTED_STATUSES", "200,teapot");
    assert!(PollerConfig::load().is_err());
    clear_env();

    let file = config_file(".json", r#"{ "timeout_ms": 0 }"#);
    assert!(PollerConfig::load_from(Some(file.path())).is_err());

    let file = config_file(".json", r#"{ "accepted_statuses": [] }"#);
    assert!(PollerConfig::load_from(Some(file.path())).is_err());
    clear_env();
}

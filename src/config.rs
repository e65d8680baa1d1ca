use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::{ApiConfig, DEFAULT_LOCATION};
use crate::envelope::ImageEncoding;
use crate::ingest::CameraConfig;
use crate::retention::DEFAULT_KEEP;

const DEFAULT_API_ADDR: &str = "127.0.0.1:8100";
const DEFAULT_CAMERA_DEVICE: &str = "stub://camera";
const DEFAULT_CAMERA_WIDTH: u32 = 640;
const DEFAULT_CAMERA_HEIGHT: u32 = 480;
const DEFAULT_MIN_INTERVAL_MS: u64 = 2000;
const DEFAULT_SCREENSHOTS_DIR: &str = "./shared/screenshots";
const DEFAULT_PEOPLE_DIR: &str = "./shared/people";
const DEFAULT_WEAPONS_DIR: &str = "./shared/weapons";
const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8100/screenshot_full";
const DEFAULT_ALERT_URL: &str = "http://127.0.0.1:8200/alert";
const DEFAULT_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_ACCEPTED_STATUS: u16 = 200;

#[derive(Debug, Deserialize, Default)]
struct ServerConfigFile {
    api: Option<ApiConfigFile>,
    camera: Option<CameraConfigFile>,
    throttle: Option<ThrottleConfigFile>,
    storage: Option<StorageConfigFile>,
    detectors: Option<DetectorsConfigFile>,
    envelope: Option<EnvelopeConfigFile>,
    location: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ThrottleConfigFile {
    min_interval_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct StorageConfigFile {
    screenshots_dir: Option<PathBuf>,
    people_dir: Option<PathBuf>,
    weapons_dir: Option<PathBuf>,
    keep: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorsConfigFile {
    people: Option<DetectorKind>,
    weapons: Option<DetectorKind>,
}

#[derive(Debug, Deserialize, Default)]
struct EnvelopeConfigFile {
    image_encoding: Option<ImageEncoding>,
}

#[derive(Debug, Deserialize, Default)]
struct PollerConfigFile {
    endpoint: Option<String>,
    alert_url: Option<String>,
    timeout_ms: Option<u64>,
    interval_ms: Option<u64>,
    accepted_statuses: Option<Vec<u16>>,
    captioner_command: Option<String>,
}

/// Which backend serves a detection route.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Fixed synthetic detections.
    Stub,
    /// Never detects; the route always answers "No ... detected".
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub api_addr: String,
    pub camera: CameraConfig,
    pub min_interval: Duration,
    pub max_consecutive_failures: Option<u32>,
    pub storage: StorageSettings,
    pub people_detector: DetectorKind,
    pub weapons_detector: DetectorKind,
    pub image_encoding: ImageEncoding,
    pub location: String,
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub screenshots_dir: PathBuf,
    pub people_dir: PathBuf,
    pub weapons_dir: PathBuf,
    pub keep: usize,
}

impl ServerConfig {
    /// Load from the file named by `EMERGENCY_SERVER_CONFIG`, if set.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("EMERGENCY_SERVER_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` (or defaults), then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ServerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServerConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let throttle = file.throttle.unwrap_or_default();
        let storage = file.storage.unwrap_or_default();
        let detectors = file.detectors.unwrap_or_default();
        Self {
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            camera: CameraConfig {
                device: camera
                    .device
                    .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            },
            min_interval: Duration::from_millis(
                throttle.min_interval_ms.unwrap_or(DEFAULT_MIN_INTERVAL_MS),
            ),
            max_consecutive_failures: throttle.max_consecutive_failures,
            storage: StorageSettings {
                screenshots_dir: storage
                    .screenshots_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SCREENSHOTS_DIR)),
                people_dir: storage
                    .people_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_PEOPLE_DIR)),
                weapons_dir: storage
                    .weapons_dir
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_WEAPONS_DIR)),
                keep: storage.keep.unwrap_or(DEFAULT_KEEP),
            },
            people_detector: detectors.people.unwrap_or(DetectorKind::Stub),
            weapons_detector: detectors.weapons.unwrap_or(DetectorKind::Disabled),
            image_encoding: file
                .envelope
                .and_then(|envelope| envelope.image_encoding)
                .unwrap_or_default(),
            location: file
                .location
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("EMERGENCY_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(device) = env_value("EMERGENCY_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(interval) = env_value("EMERGENCY_MIN_INTERVAL_MS") {
            let ms: u64 = interval.parse().map_err(|_| {
                anyhow!("EMERGENCY_MIN_INTERVAL_MS must be an integer number of milliseconds")
            })?;
            self.min_interval = Duration::from_millis(ms);
        }
        if let Some(keep) = env_value("EMERGENCY_KEEP") {
            self.storage.keep = keep
                .parse()
                .map_err(|_| anyhow!("EMERGENCY_KEEP must be a positive integer"))?;
        }
        if let Some(location) = env_value("EMERGENCY_LOCATION") {
            self.location = location;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| anyhow!("api addr '{}' is not a socket address", self.api_addr))?;
        if self.camera.device.trim().is_empty() {
            return Err(anyhow!("camera device must not be empty"));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera width and height must be greater than zero"));
        }
        if self.storage.keep == 0 {
            return Err(anyhow!("storage keep must be greater than zero"));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(anyhow!("max_consecutive_failures must be greater than zero"));
        }
        validate_location(&self.location)?;
        Ok(())
    }

    /// Settings handed to the capture API.
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            addr: self.api_addr.clone(),
            location: self.location.clone(),
            image_encoding: self.image_encoding,
            keep: self.storage.keep,
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub endpoint: String,
    pub alert_url: String,
    pub timeout: Duration,
    pub interval: Duration,
    pub accepted_statuses: BTreeSet<u16>,
    pub captioner_command: Option<String>,
}

impl PollerConfig {
    /// Load from the file named by `EMERGENCY_POLLER_CONFIG`, if set.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("EMERGENCY_POLLER_CONFIG").map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load from `path` (or defaults), then apply env overrides and validate.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => PollerConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PollerConfigFile) -> Self {
        Self {
            endpoint: file
                .endpoint
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            alert_url: file
                .alert_url
                .unwrap_or_else(|| DEFAULT_ALERT_URL.to_string()),
            timeout: Duration::from_millis(file.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
            interval: Duration::from_millis(file.interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS)),
            accepted_statuses: file
                .accepted_statuses
                .map(|statuses| statuses.into_iter().collect())
                .unwrap_or_else(|| BTreeSet::from([DEFAULT_ACCEPTED_STATUS])),
            captioner_command: file
                .captioner_command
                .filter(|command| !command.trim().is_empty()),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(endpoint) = env_value("EMERGENCY_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(alert_url) = env_value("EMERGENCY_ALERT_URL") {
            self.alert_url = alert_url;
        }
        if let Some(statuses) = env_value("EMERGENCY_ACCEPTED_STATUSES") {
            self.accepted_statuses = parse_statuses(&statuses)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_http_url("endpoint", &self.endpoint)?;
        validate_http_url("alert_url", &self.alert_url)?;
        if self.timeout.is_zero() {
            return Err(anyhow!("timeout must be greater than zero"));
        }
        if self.accepted_statuses.is_empty() {
            return Err(anyhow!("accepted_statuses must not be empty"));
        }
        if let Some(bad) = self
            .accepted_statuses
            .iter()
            .find(|status| !(100..=599).contains(*status))
        {
            return Err(anyhow!("accepted status {} is not an HTTP status", bad));
        }
        Ok(())
    }
}

/// Parse a comma-separated list of HTTP statuses.
pub fn parse_statuses(value: &str) -> Result<BTreeSet<u16>> {
    split_csv(value)
        .iter()
        .map(|entry| {
            entry
                .parse::<u16>()
                .map_err(|_| anyhow!("'{}' is not an HTTP status", entry))
        })
        .collect()
}

fn validate_http_url(field: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value).with_context(|| format!("{field} '{value}' is not a URL"))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("{field} must use http or https, not {other}")),
    }
}

fn validate_location(value: &str) -> Result<()> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [lat, lon] = parts.as_slice() else {
        return Err(anyhow!("location '{}' must be '<lat>,<lon>'", value));
    };
    let lat: f64 = lat
        .parse()
        .map_err(|_| anyhow!("location latitude '{}' is not a number", lat))?;
    let lon: f64 = lon
        .parse()
        .map_err(|_| anyhow!("location longitude '{}' is not a number", lon))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(anyhow!("location '{}' is out of range", value));
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

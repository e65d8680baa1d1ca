use anyhow::Result;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use emergency_watch::api::{ApiConfig, ApiHandle, ApiServer, CaptureServices};
use emergency_watch::detect::{CropService, DetectionCapability, StubBackend};
use emergency_watch::ingest::{Camera, CameraConfig, FrameSource, SyntheticSource};
use emergency_watch::throttle::ScreenshotThrottle;
use emergency_watch::{decode_response, CapturedFrame, ImageEncoding};

/// A camera whose reads always fail. Counts releases.
struct BrokenSource {
    releases: Arc<AtomicUsize>,
}

impl FrameSource for BrokenSource {
    fn describe(&self) -> String {
        "broken".to_string()
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_frame(&mut self) -> Result<CapturedFrame> {
        Err(anyhow::anyhow!("lens cap on"))
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

struct Setup {
    interval: Duration,
    keep: usize,
    people: bool,
    weapons: bool,
    broken_camera: bool,
    max_failures: Option<u32>,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            keep: 5,
            people: true,
            weapons: true,
            broken_camera: false,
            max_failures: None,
        }
    }
}

struct TestApi {
    dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
    camera_releases: Arc<AtomicUsize>,
}

impl TestApi {
    fn new(setup: Setup) -> Result<Self> {
        let dir = tempdir()?;
        let camera_releases = Arc::new(AtomicUsize::new(0));
        let source: Box<dyn FrameSource> = if setup.broken_camera {
            Box::new(BrokenSource {
                releases: camera_releases.clone(),
            })
        } else {
            Box::new(SyntheticSource::new(CameraConfig {
                device: "stub://test".to_string(),
                width: 64,
                height: 48,
            }))
        };
        let camera = Camera::open(source)?;
        let throttle =
            ScreenshotThrottle::new(camera, dir.path().join("screenshots"), setup.interval)?;
        let people_backend = if setup.people {
            StubBackend::people()
        } else {
            StubBackend::empty(DetectionCapability::People)
        };
        let weapons_backend = if setup.weapons {
            StubBackend::weapons()
        } else {
            StubBackend::empty(DetectionCapability::Weapons)
        };
        let services = CaptureServices {
            throttle,
            people: CropService::people(Box::new(people_backend), dir.path().join("people"))?,
            weapons: CropService::weapons(Box::new(weapons_backend), dir.path().join("weapons"))?,
        };
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            keep: setup.keep,
            image_encoding: ImageEncoding::Base64,
            max_consecutive_failures: setup.max_failures,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, services).spawn()?;
        Ok(Self {
            dir,
            api_handle: Some(api_handle),
            camera_releases,
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle.as_ref().unwrap()
    }

    fn request(&self, method: &str, path: &str) -> Result<(u16, String, Vec<u8>)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        write!(
            stream,
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<(u16, String, Vec<u8>)> {
        self.request("GET", path)
    }

    fn screenshots(&self) -> Vec<PathBuf> {
        list(&self.dir.path().join("screenshots"))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.stop();
        }
    }
}

fn list(dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.map(|entry| entry.unwrap().path()).collect())
        .unwrap_or_default();
    paths.sort();
    paths
}

fn read_response(stream: &mut TcpStream) -> Result<(u16, String, Vec<u8>)> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow::anyhow!("no header terminator"))?;
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response[split + 4..].to_vec();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("no status in {headers}"))?;
    Ok((status, headers, body))
}

#[test]
fn full_screenshot_matches_file_on_disk() -> Result<()> {
    let api = TestApi::new(Setup::default())?;

    let (status, headers, body) = api.get("/screenshot_full")?;
    assert_eq!(status, 200);
    assert!(headers.contains("Content-Type: application/x-msgpack"));

    let envelope = decode_response(&body)?;
    assert_eq!(envelope.loc.as_deref(), Some("37.8688956,-122.2600617"));
    let screenshots = api.screenshots();
    assert_eq!(screenshots.len(), 1);
    assert_eq!(envelope.image.as_deref(), Some(std::fs::read(&screenshots[0])?.as_slice()));
    Ok(())
}

#[test]
fn repeat_within_interval_serves_same_screenshot() -> Result<()> {
    let api = TestApi::new(Setup::default())?;

    let (_, _, first) = api.get("/screenshot_full")?;
    let (_, _, second) = api.get("/screenshot_full")?;

    assert_eq!(api.screenshots().len(), 1);
    assert_eq!(decode_response(&first)?.image, decode_response(&second)?.image);
    Ok(())
}

#[test]
fn people_route_returns_crops() -> Result<()> {
    let api = TestApi::new(Setup::default())?;

    let (status, _, body) = api.get("/screenshot_people")?;
    assert_eq!(status, 200);

    let envelope = decode_response(&body)?;
    assert!(envelope.image.is_none());
    assert_eq!(envelope.sub_images.len(), 1);
    assert!(envelope.sub_images[0].starts_with(&[0xFF, 0xD8]));

    let folders = list(&api.dir.path().join("people"));
    assert_eq!(folders.len(), 1);
    assert_eq!(
        folders[0].file_name(),
        api.screenshots()[0].file_name()
    );
    Ok(())
}

#[test]
fn people_route_without_detections_is_bad_request() -> Result<()> {
    let api = TestApi::new(Setup {
        people: false,
        ..Setup::default()
    })?;

    let (status, _, body) = api.get("/screenshot_people")?;
    assert_eq!(status, 400);
    assert_eq!(String::from_utf8(body)?, "No people detected");
    assert!(list(&api.dir.path().join("people")).is_empty());
    Ok(())
}

#[test]
fn weapons_route_uses_weapon_images_field() -> Result<()> {
    let api = TestApi::new(Setup::default())?;

    let (status, _, body) = api.get("/screenshot_weapons")?;
    assert_eq!(status, 200);
    let envelope = decode_response(&body)?;
    assert_eq!(
        envelope.sub_image_field,
        Some(emergency_watch::envelope::SubImageField::Weapons)
    );
    assert_eq!(envelope.sub_images.len(), 1);
    Ok(())
}

#[test]
fn weapons_route_without_detections_is_bad_request() -> Result<()> {
    let api = TestApi::new(Setup {
        weapons: false,
        ..Setup::default()
    })?;

    let (status, _, body) = api.get("/screenshot_weapons")?;
    assert_eq!(status, 400);
    assert_eq!(String::from_utf8(body)?, "No weapons detected");
    assert!(list(&api.dir.path().join("weapons")).is_empty());
    assert_eq!(api.screenshots().len(), 1);
    Ok(())
}

#[test]
fn capture_failure_is_server_error() -> Result<()> {
    let api = TestApi::new(Setup {
        broken_camera: true,
        ..Setup::default()
    })?;

    let (status, _, body) = api.get("/screenshot_full")?;
    assert_eq!(status, 500);
    assert_eq!(String::from_utf8(body)?, "Failed to take screenshot");

    let (status, _, _) = api.get("/screenshot_people")?;
    assert_eq!(status, 500);
    Ok(())
}

#[test]
fn repeated_capture_failures_stop_the_server() -> Result<()> {
    let mut api = TestApi::new(Setup {
        broken_camera: true,
        max_failures: Some(2),
        ..Setup::default()
    })?;

    api.get("/screenshot_full")?;
    assert_eq!(api.camera_releases.load(Ordering::SeqCst), 0);
    api.get("/screenshot_full")?;

    let handle = api.api_handle.take().unwrap();
    for _ in 0..100 {
        if handle.is_finished() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(handle.is_finished());
    assert_eq!(api.camera_releases.load(Ordering::SeqCst), 1);

    assert!(handle.stop().is_err());
    assert_eq!(api.camera_releases.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn retention_keeps_newest_screenshots() -> Result<()> {
    let api = TestApi::new(Setup {
        interval: Duration::ZERO,
        keep: 2,
        ..Setup::default()
    })?;

    let mut served = Vec::new();
    for _ in 0..4 {
        let (status, _, body) = api.get("/screenshot_full")?;
        assert_eq!(status, 200);
        served.push(decode_response(&body)?.image);
        std::thread::sleep(Duration::from_millis(5));
    }

    let remaining = api.screenshots();
    assert_eq!(remaining.len(), 2);
    assert_eq!(
        std::fs::read(&remaining[1])?,
        served[3].clone().unwrap_or_default()
    );
    Ok(())
}

#[test]
fn health_and_unknown_routes() -> Result<()> {
    let api = TestApi::new(Setup::default())?;

    let (status, _, body) = api.get("/health")?;
    assert_eq!(status, 200);
    assert_eq!(String::from_utf8(body)?, r#"{"status":"ok"}"#);

    let (status, _, _) = api.get("/screenshot_everything")?;
    assert_eq!(status, 404);

    let (status, _, _) = api.request("POST", "/screenshot_full")?;
    assert_eq!(status, 405);
    assert!(api.screenshots().is_empty());
    Ok(())
}

//! Capture API.
//!
//! A single worker thread accepts one connection at a time, so captures,
//! detections and retention sweeps never overlap. Routes:
//! - `GET /health`
//! - `GET /screenshot_full`
//! - `GET /screenshot_people`
//! - `GET /screenshot_weapons`
//!
//! Successful capture routes answer with a MessagePack envelope. Capture
//! failures answer 500, empty detections 400.

use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{DetectorKind, ServerConfig};
use crate::detect::{CropService, DetectionCapability, DetectorBackend, StubBackend};
use crate::envelope::{DetectionEnvelope, ImageEncoding, SubImageField, MSGPACK_CONTENT_TYPE};
use crate::error::PipelineError;
use crate::ingest::open_camera;
use crate::retention::{self, ArtifactKind, DEFAULT_KEEP};
use crate::throttle::{ScreenshotRecord, ScreenshotThrottle};

const MAX_REQUEST_BYTES: usize = 8192;

/// Location reported when none is configured.
pub const DEFAULT_LOCATION: &str = "37.8688956,-122.2600617";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// "<lat>,<lon>" sent as `loc` in every envelope.
    pub location: String,
    pub image_encoding: ImageEncoding,
    /// Retention window for screenshots and detection folders.
    pub keep: usize,
    /// Stop serving after this many consecutive capture failures.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8100".to_string(),
            location: DEFAULT_LOCATION.to_string(),
            image_encoding: ImageEncoding::Base64,
            keep: DEFAULT_KEEP,
            max_consecutive_failures: None,
        }
    }
}

/// Services the API drives. Built once at startup and owned by the worker.
pub struct CaptureServices {
    pub throttle: ScreenshotThrottle,
    pub people: CropService,
    pub weapons: CropService,
}

impl CaptureServices {
    /// Open the camera and load both detectors. Any failure here is fatal.
    pub fn build(cfg: &ServerConfig) -> Result<Self> {
        let camera = open_camera(&cfg.camera)?;
        let throttle =
            ScreenshotThrottle::new(camera, &cfg.storage.screenshots_dir, cfg.min_interval)?;
        let people = CropService::people(
            detector(cfg.people_detector, DetectionCapability::People),
            &cfg.storage.people_dir,
        )?;
        let weapons = CropService::weapons(
            detector(cfg.weapons_detector, DetectionCapability::Weapons),
            &cfg.storage.weapons_dir,
        )?;
        Ok(Self {
            throttle,
            people,
            weapons,
        })
    }
}

fn detector(kind: DetectorKind, capability: DetectionCapability) -> Box<dyn DetectorBackend> {
    match (kind, capability) {
        (DetectorKind::Stub, DetectionCapability::People) => Box::new(StubBackend::people()),
        (DetectorKind::Stub, _) => Box::new(StubBackend::weapons()),
        (DetectorKind::Disabled, capability) => Box::new(StubBackend::empty(capability)),
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<()>>>,
}

impl ApiHandle {
    /// True once the worker has exited, whether stopped or failed.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Stop the worker and report how it ended.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| anyhow!("api server thread panicked"))?,
            None => Ok(()),
        }
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    services: CaptureServices,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, services: CaptureServices) -> Self {
        Self { cfg, services }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let facade = Facade::new(self.cfg, self.services);
        let join = std::thread::spawn(move || {
            let result = run_api(listener, facade, shutdown_thread);
            if let Err(err) = &result {
                log::error!("capture api stopped: {:#}", err);
            }
            result
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, mut facade: Facade, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &mut facade) {
                    log::warn!("capture api request rejected: {:#}", err);
                }
                if facade.should_stop() {
                    return Err(anyhow!(
                        "camera unreadable for {} consecutive requests",
                        facade.consecutive_failures
                    ));
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, facade: &mut Facade) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::info!("{} {}", request.method, request.path);
    let response = facade.handle(&request);
    write_response(&mut stream, &response)
}

/// Route table plus the per-process capture state.
struct Facade {
    cfg: ApiConfig,
    services: CaptureServices,
    consecutive_failures: u32,
}

impl Facade {
    fn new(cfg: ApiConfig, services: CaptureServices) -> Self {
        Self {
            cfg,
            services,
            consecutive_failures: 0,
        }
    }

    fn should_stop(&self) -> bool {
        self.cfg
            .max_consecutive_failures
            .is_some_and(|max| self.consecutive_failures >= max)
    }

    fn handle(&mut self, request: &HttpRequest) -> Response {
        if request.method != "GET" {
            return Response::text(405, "Method not allowed");
        }
        let routed = match request.path.as_str() {
            "/health" => return Response::json(200, r#"{"status":"ok"}"#),
            "/screenshot_full" => self.screenshot_full(),
            "/screenshot_people" => self.screenshot_crops(SubImageField::People),
            "/screenshot_weapons" => self.screenshot_crops(SubImageField::Weapons),
            _ => return Response::text(404, "Not found"),
        };
        routed.unwrap_or_else(|err| failure_response(&err))
    }

    fn screenshot_full(&mut self) -> Result<Response, PipelineError> {
        let record = self.capture()?;
        let image = read_artifact(&record.path)?;
        self.envelope(DetectionEnvelope::full(
            image,
            Some(self.cfg.location.clone()),
        ))
    }

    fn screenshot_crops(&mut self, field: SubImageField) -> Result<Response, PipelineError> {
        let record = self.capture()?;
        let service = match field {
            SubImageField::People => &mut self.services.people,
            SubImageField::Weapons => &mut self.services.weapons,
        };
        let crops = service.detect(&record.path);
        sweep(service.output_dir(), ArtifactKind::Directories, self.cfg.keep);
        let crops = crops?;
        if crops.is_empty() {
            return Err(PipelineError::EmptyDetection {
                kind: service.capability().noun(),
            });
        }
        let images = crops
            .iter()
            .map(|path| read_artifact(path))
            .collect::<Result<Vec<_>, _>>()?;
        self.envelope(DetectionEnvelope::crops(
            field,
            images,
            Some(self.cfg.location.clone()),
        ))
    }

    /// Capture (or reuse) a screenshot, then sweep the screenshot directory.
    fn capture(&mut self) -> Result<ScreenshotRecord, PipelineError> {
        let result = self.services.throttle.request_capture();
        match &result {
            Ok(_) => self.consecutive_failures = 0,
            Err(PipelineError::CaptureFailure { .. }) => self.consecutive_failures += 1,
            Err(_) => {}
        }
        sweep(
            self.services.throttle.output_dir(),
            ArtifactKind::Files,
            self.cfg.keep,
        );
        result
    }

    fn envelope(&self, envelope: DetectionEnvelope) -> Result<Response, PipelineError> {
        let body = envelope
            .encode(self.cfg.image_encoding)
            .map_err(|err| PipelineError::EncodeFailure(err.to_string()))?;
        Ok(Response {
            status: 200,
            content_type: MSGPACK_CONTENT_TYPE,
            body,
        })
    }
}

fn sweep(dir: &Path, kind: ArtifactKind, keep: usize) {
    if let Err(err) = retention::prune(dir, kind, keep) {
        log::warn!("retention sweep of {} failed: {:#}", dir.display(), err);
    }
}

fn read_artifact(path: &Path) -> Result<Vec<u8>, PipelineError> {
    std::fs::read(path).map_err(|err| PipelineError::storage(path, err))
}

fn failure_response(err: &PipelineError) -> Response {
    match err {
        PipelineError::EmptyDetection { kind } => {
            log::info!("{}", err);
            Response::text(400, &format!("No {kind} detected"))
        }
        PipelineError::CaptureFailure { .. } | PipelineError::Storage { .. } => {
            log::error!("{}", err);
            Response::text(500, "Failed to take screenshot")
        }
        other => {
            log::error!("{}", other);
            Response::text(500, "Internal server error")
        }
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.as_bytes().to_vec(),
        }
    }

    fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.as_bytes().to_vec(),
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

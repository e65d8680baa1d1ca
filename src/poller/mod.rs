//! Remote poller.
//!
//! Each poll fetches one envelope from the capture API, classifies the
//! images it carries and, on an alarm label, forwards the flagged image to
//! the alert sink. A single failed poll is reported as `Label::Error`; the
//! loop keeps going.

mod alert;
mod classify;

pub use alert::{AlertOutcome, AlertSink};
pub use classify::{
    label_for_caption, CaptionClassifier, Captioner, Classifier, CommandCaptioner,
    FixedCaptioner, Label,
};

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::envelope::{decode_response, DetectionEnvelope};
use crate::error::PipelineError;

/// Upper bound on an envelope body.
const MAX_BODY_BYTES: u64 = 32 * 1024 * 1024;

const SHUTDOWN_CHECK: Duration = Duration::from_millis(50);

/// Result of one poll.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollReport {
    pub label: Label,
    /// Present when an alert was attempted.
    pub alert: Option<AlertOutcome>,
}

pub struct Poller<C> {
    agent: ureq::Agent,
    endpoint: String,
    classifier: C,
    sink: AlertSink,
    max_body_bytes: u64,
}

impl<C: Classifier> Poller<C> {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: Duration,
        classifier: C,
        sink: AlertSink,
    ) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.into(),
            classifier,
            sink,
            max_body_bytes: MAX_BODY_BYTES,
        }
    }

    /// Reject response bodies longer than `limit` bytes.
    pub fn with_max_body_bytes(mut self, limit: u64) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Poll once and return the classification.
    pub fn poll_once(&mut self) -> Label {
        self.poll().label
    }

    /// Poll once, reporting the alert attempt as well.
    pub fn poll(&mut self) -> PollReport {
        let envelope = match self.fetch().and_then(|body| decode_response(&body)) {
            Ok(envelope) => envelope,
            Err(err) => {
                log::error!("poll of {} failed: {}", self.endpoint, err);
                return PollReport {
                    label: Label::Error,
                    alert: None,
                };
            }
        };

        let (label, flagged) = self.classify_envelope(&envelope);
        let alert = flagged.map(|image| self.sink.send(label, image, envelope.loc.as_deref()));
        if alert.is_none() {
            log::debug!("no alert for label {}", label);
        }
        PollReport { label, alert }
    }

    /// Poll every `interval` until `shutdown` is set.
    pub fn run(&mut self, interval: Duration, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            let report = self.poll();
            log::info!("poll result: {}", report.label);

            let deadline = started + interval;
            while !shutdown.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(SHUTDOWN_CHECK));
            }
        }
    }

    /// Classify images in order, primary first. The first alarm wins;
    /// otherwise any error makes the whole envelope an error.
    fn classify_envelope<'a>(
        &mut self,
        envelope: &'a DetectionEnvelope,
    ) -> (Label, Option<&'a [u8]>) {
        let mut saw_error = false;
        for image in envelope.images() {
            let label = self.classifier.classify(image);
            if label.is_alarm() {
                return (label, Some(image));
            }
            saw_error |= label == Label::Error;
        }
        if saw_error {
            (Label::Error, None)
        } else {
            (Label::None, None)
        }
    }

    fn fetch(&self) -> Result<Vec<u8>, PipelineError> {
        let network = |reason: String| PipelineError::NetworkFailure {
            url: self.endpoint.clone(),
            reason,
        };
        let response = match self.agent.get(&self.endpoint).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(network(format!(
                    "status {} {}",
                    code,
                    response.status_text()
                )))
            }
            Err(err) => return Err(network(err.to_string())),
        };
        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_body_bytes.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|err| network(format!("read body: {err}")))?;
        if body.len() as u64 > self.max_body_bytes {
            return Err(PipelineError::DecodeFailure(format!(
                "response exceeds {} bytes",
                self.max_body_bytes
            )));
        }
        Ok(body)
    }
}

//! Alert delivery.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::collections::BTreeSet;
use std::time::Duration;

use super::classify::Label;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertOutcome {
    /// The sink answered with an accepted status.
    Delivered(u16),
    /// The sink answered with a status outside the accepted set.
    Rejected(u16),
    /// No status was received.
    Failed(String),
}

impl AlertOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, AlertOutcome::Delivered(_))
    }
}

/// HTTP endpoint receiving flagged images as base64 text.
///
/// Delivery is attempted once; every outcome is logged and returned, none
/// is raised.
pub struct AlertSink {
    agent: ureq::Agent,
    url: String,
    accepted: BTreeSet<u16>,
}

impl AlertSink {
    pub fn new(url: impl Into<String>, timeout: Duration, accepted: BTreeSet<u16>) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            url: url.into(),
            accepted,
        }
    }

    pub fn send(&self, label: Label, image: &[u8], loc: Option<&str>) -> AlertOutcome {
        let body = STANDARD.encode(image);
        let mut request = self
            .agent
            .post(&self.url)
            .set("Content-Type", "text/plain")
            .set("X-Alert-Label", label.as_str());
        if let Some(loc) = loc {
            request = request.set("X-Location", loc);
        }

        let status = match request.send_string(&body) {
            Ok(response) => response.status(),
            Err(ureq::Error::Status(code, _)) => code,
            Err(err) => {
                log::error!("alert ({}) to {} failed: {}", label, self.url, err);
                return AlertOutcome::Failed(err.to_string());
            }
        };

        if self.accepted.contains(&status) {
            log::info!("alert ({}) delivered to {} [{}]", label, self.url, status);
            AlertOutcome::Delivered(status)
        } else {
            log::warn!(
                "alert ({}) to {} answered with unaccepted status {}",
                label,
                self.url,
                status
            );
            AlertOutcome::Rejected(status)
        }
    }
}

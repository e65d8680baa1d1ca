//! Image classification for the poller.
//!
//! The poller only cares whether a label is an alarm. Captioning models are
//! opaque; `CaptionClassifier` maps a free-text caption onto a `Label` by
//! keyword.

use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::io::{Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long a captioner command may run before it is killed.
pub const DEFAULT_CAPTION_TIMEOUT: Duration = Duration::from_secs(30);

const EXIT_POLL: Duration = Duration::from_millis(10);

/// Classification of one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Label {
    Fire,
    Crash,
    None,
    /// The image could not be fetched, decoded or classified.
    Error,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Fire => "fire",
            Label::Crash => "crash",
            Label::None => "none",
            Label::Error => "error",
        }
    }

    /// Labels that trigger an alert.
    pub fn is_alarm(&self) -> bool {
        matches!(self, Label::Fire | Label::Crash)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait Classifier {
    /// Must be deterministic for a given image.
    fn classify(&mut self, image: &[u8]) -> Label;
}

/// Produces a short natural-language description of an image.
pub trait Captioner {
    fn caption(&mut self, image: &[u8]) -> Result<String>;
}

impl<C: Captioner + ?Sized> Captioner for Box<C> {
    fn caption(&mut self, image: &[u8]) -> Result<String> {
        (**self).caption(image)
    }
}

/// Map a caption onto a label.
pub fn label_for_caption(caption: &str) -> Label {
    let caption = caption.to_lowercase();
    if caption.contains("fire") {
        Label::Fire
    } else if ["crash", "accident", "wreck"]
        .iter()
        .any(|word| caption.contains(word))
    {
        Label::Crash
    } else {
        Label::None
    }
}

pub struct CaptionClassifier<C> {
    captioner: C,
}

impl<C: Captioner> CaptionClassifier<C> {
    pub fn new(captioner: C) -> Self {
        Self { captioner }
    }
}

impl<C: Captioner> Classifier for CaptionClassifier<C> {
    fn classify(&mut self, image: &[u8]) -> Label {
        match self.captioner.caption(image) {
            Ok(caption) => {
                let label = label_for_caption(&caption);
                log::info!("caption \"{}\" -> {}", caption.trim(), label);
                label
            }
            Err(err) => {
                log::error!("captioning failed: {:#}", err);
                Label::Error
            }
        }
    }
}

/// Runs an external program with the image on stdin and reads the caption
/// from stdout.
///
/// The image is written and the caption read on separate threads, so a
/// program that prints before draining its input cannot stall the poller.
/// A program still running after `timeout` is killed.
#[derive(Clone, Debug)]
pub struct CommandCaptioner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCaptioner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_CAPTION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Split a command line on whitespace. No quoting.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("captioner command is empty"))?;
        Ok(Self::new(program, parts.collect()))
    }

    fn timed_out(&self) -> anyhow::Error {
        anyhow!(
            "captioner {} timed out after {:?}",
            self.program,
            self.timeout
        )
    }
}

impl Captioner for CommandCaptioner {
    fn caption(&mut self, image: &[u8]) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn captioner {}", self.program))?;

        let deadline = Instant::now() + self.timeout;

        let (mut stdin, mut stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                kill(&mut child);
                return Err(anyhow!("captioner pipes unavailable"));
            }
        };

        let image = image.to_vec();
        let writer = thread::spawn(move || stdin.write_all(&image));
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut output = String::new();
            let _ = tx.send(stdout.read_to_string(&mut output).map(|_| output));
        });

        let output = match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => {
                kill(&mut child);
                return Err(anyhow::Error::new(err).context("read captioner output"));
            }
            Err(_) => {
                kill(&mut child);
                return Err(self.timed_out());
            }
        };

        let status = loop {
            if let Some(status) = child.try_wait().context("wait for captioner")? {
                break status;
            }
            if Instant::now() >= deadline {
                kill(&mut child);
                return Err(self.timed_out());
            }
            thread::sleep(EXIT_POLL);
        };
        if !status.success() {
            return Err(anyhow!("captioner {} exited with {}", self.program, status));
        }

        // A captioner may close stdin without reading the whole image.
        match writer.join() {
            Ok(Err(err)) if err.kind() != std::io::ErrorKind::BrokenPipe => {
                return Err(anyhow::Error::new(err).context("write image to captioner"));
            }
            Ok(_) => {}
            Err(_) => return Err(anyhow!("captioner input thread panicked")),
        }

        let caption = output.trim();
        if caption.is_empty() {
            return Err(anyhow!("captioner {} printed no caption", self.program));
        }
        Ok(caption.to_string())
    }
}

fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        log::debug!("captioner already exited: {}", err);
    }
    let _ = child.wait();
}

/// Returns the same caption for every image.
#[derive(Clone, Debug)]
pub struct FixedCaptioner(pub String);

impl Captioner for FixedCaptioner {
    fn caption(&mut self, _image: &[u8]) -> Result<String> {
        Ok(self.0.clone())
    }
}

//! Classification progress reporting.
//!
//! `jobtrail process` and the background classifier started by `ingest`
//! report how far through the backlog they are. Progress goes to
//! **stderr** so stdout stays parseable for scripts.

use std::io::Write;
use std::str::FromStr;

/// One progress event from the classification pipeline.
#[derive(Clone, Debug, PartialEq)]
pub enum ClassifyProgressEvent {
    /// A batch is about to be sent to the model.
    Classifying { done: u64, total: u64 },
    /// Emails classified and indexed so far.
    Stored { done: u64, total: u64 },
    /// The run is over.
    Finished {
        classified: u64,
        fallback: u64,
        failed: u64,
    },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ClassifyProgressEvent);
}

/// Human-friendly progress: "classify  stored  120 / 1,500 emails".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ClassifyProgressEvent) {
        let line = match &event {
            ClassifyProgressEvent::Classifying { done, total } => format!(
                "classify  sending batch  {} / {} emails\n",
                format_number(*done),
                format_number(*total)
            ),
            ClassifyProgressEvent::Stored { done, total } => format!(
                "classify  stored  {} / {} emails\n",
                format_number(*done),
                format_number(*total)
            ),
            ClassifyProgressEvent::Finished {
                classified,
                fallback,
                failed,
            } => format!(
                "classify  done  {} classified ({} by keyword fallback, {} failed)\n",
                format_number(*classified),
                format_number(*fallback),
                format_number(*failed)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ClassifyProgressEvent) {
        let obj = match &event {
            ClassifyProgressEvent::Classifying { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "classifying",
                "n": done,
                "total": total
            }),
            ClassifyProgressEvent::Stored { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "stored",
                "n": done,
                "total": total
            }),
            ClassifyProgressEvent::Finished {
                classified,
                fallback,
                failed,
            } => serde_json::json!({
                "event": "finished",
                "classified": classified,
                "fallback": fallback,
                "failed": failed
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ClassifyProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let digits: Vec<char> = n.to_string().chars().collect();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(*c);
    }
    out
}

/// `--progress` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}' (expected off, human, or json)",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_groups_thousands() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn mode_parses() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}

//! Progress reporting for lifecycle operations
//!
//! Lines go to stdout so per-service results can be piped. While waiting for
//! readiness each new condition message is printed once, prefixed with the
//! elapsed time.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use console::{Term, style};

#[derive(Clone)]
enum Sink {
    Term(Term),
    Buffer(Arc<Mutex<String>>),
    Silent,
}

/// Progress reporter for service operations
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Sink,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// Report to stdout
    pub fn new() -> Self {
        Self {
            sink: Sink::Term(Term::stdout()),
        }
    }

    /// Discard everything, for machine-readable output modes
    pub fn silent() -> Self {
        Self { sink: Sink::Silent }
    }

    /// Collect lines in memory; the handle reads them back
    pub fn buffered() -> (Self, Arc<Mutex<String>>) {
        let buffer = Arc::new(Mutex::new(String::new()));
        (
            Self {
                sink: Sink::Buffer(buffer.clone()),
            },
            buffer,
        )
    }

    /// Print a plain line
    pub fn line(&self, text: impl AsRef<str>) {
        let text = text.as_ref();
        match &self.sink {
            Sink::Term(term) => {
                let _ = term.write_line(text);
            }
            Sink::Buffer(buffer) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push_str(text);
                    buffer.push('\n');
                }
            }
            Sink::Silent => {}
        }
    }

    /// Header of an operation on one object
    pub fn start(&self, verb: &str, kind: &str, name: &str, namespace: &str) {
        self.line(format!("{verb} {kind} '{name}' in namespace '{namespace}':"));
        self.line("");
    }

    /// A condition message observed while waiting
    pub fn waiting(&self, elapsed: Duration, message: &str) {
        self.line(format!(
            "{:>6} {}",
            style(format_elapsed(elapsed)).dim(),
            message
        ));
    }

    /// The wait concluded with readiness
    pub fn ready(&self, elapsed: Duration) {
        self.line(format!(
            "{:>6} {}",
            style(format_elapsed(elapsed)).dim(),
            style("Ready to serve.").green()
        ));
        self.line("");
    }

    /// Final line with the service URL
    pub fn service_url(&self, name: &str, action: &str, revision: Option<&str>, url: Option<&str>) {
        let revision = revision
            .map(|r| format!(" to latest revision '{r}'"))
            .unwrap_or_default();
        match url {
            Some(url) => {
                self.line(format!(
                    "Service '{name}' {action}{revision} and is available at URL:"
                ));
                self.line(style(url).cyan().to_string());
            }
            None => self.line(format!("Service '{name}' {action}{revision}.")),
        }
    }

    /// Non-fatal problem worth the user's attention
    pub fn warn(&self, message: &str) {
        self.line(format!("{} {message}", style("Warning:").yellow().bold()));
    }
}

/// `1.2s` style elapsed time
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.1}s", elapsed.as_secs_f64())
}

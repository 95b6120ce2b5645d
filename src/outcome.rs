use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// How a run ended. `Canceled` is reserved for runs killed through our own
/// cancellation path; any other signal death is reported as `Signaled` with
/// the signal's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum RunStatus {
    Ok,
    Failed(i32),
    Signaled(String),
    Canceled,
}

impl RunStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Ok)
    }

    /// Process exit code for the CLI: 0 for success, the child's code for a
    /// plain failure, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Ok => 0,
            RunStatus::Failed(code) => *code,
            RunStatus::Signaled(_) | RunStatus::Canceled => 1,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RunStatus::Ok => "OK".to_string(),
            RunStatus::Failed(code) => format!("failed w/ exit code {}", code),
            RunStatus::Signaled(name) => format!("failed w/ signal {}", name),
            RunStatus::Canceled => "canceled".to_string(),
        }
    }
}

/// Everything captured from one finished run.
///
/// `stdout` and `stderr` hold each stream verbatim (lossy UTF-8); the
/// transcript interleaves both in arrival order with stderr lines marked,
/// and is what gets replayed from the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub stdout: String,
    pub stderr: String,
    pub transcript: String,
    pub elapsed_ms: u64,
}

impl RunOutcome {
    /// Outcome for a command that never started (executable missing, bad
    /// stdin file, unparsable argv). Reported as a failed run with the OS
    /// error text on stderr, matching what a direct shell invocation shows.
    pub fn spawn_failure(err: String) -> Self {
        let transcript = mark_stderr(&err);
        RunOutcome {
            status: RunStatus::Failed(1),
            stdout: String::new(),
            stderr: err,
            transcript,
            elapsed_ms: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Metadata persisted alongside a cached entry (`.meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub command: String,
    pub command_sha256: String,
    pub status: RunStatus,
    pub stored_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl RunMeta {
    pub fn new(command: &str, outcome: &RunOutcome) -> Self {
        RunMeta {
            command: command.to_string(),
            command_sha256: hash_command(command),
            status: outcome.status.clone(),
            stored_at: Utc::now(),
            elapsed_ms: outcome.elapsed_ms,
        }
    }
}

pub fn hash_command(command: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// Wrap a stderr chunk for the combined transcript.
pub fn mark_stderr(chunk: &str) -> String {
    let trimmed = chunk.strip_suffix('\n').unwrap_or(chunk);
    format!("<STDERR> {} </STDERR>\n", trimmed)
}

/// Compact elapsed-time rendering: "5s", "1m5s", "1h2m3s", "1d0h4m1s".
pub fn pretty_duration(d: Duration) -> String {
    let total = d.as_secs();
    let (days, rem) = (total / 86400, total % 86400);
    let (hours, rem) = (rem / 3600, rem % 3600);
    let (minutes, seconds) = (rem / 60, rem % 60);
    if days > 0 {
        format!("{}d{}h{}m{}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

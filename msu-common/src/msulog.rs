//! Harvest-and-rotate of the update client's activity log.
//!
//! The live log is detached by hard-linking it to a unique sibling name and
//! unlinking the original, so the client starts a fresh file on its next
//! write while this run reads the detached copy. Log mechanics never block
//! the rest of preflight: a failed detach just means "no logs this run".
//!
//! Line grammar:
//!
//! ```text
//! <unix-timestamp> INFO <user> : @@<source>:<event>@@ <optional description>
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

static LOG_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)?) INFO (\S+) : @@([^:@]+):([^@]+)@@ ?(.*)$")
        .expect("valid log line regex")
});

const TRUNCATE_USER: &str = "preflight";
const TRUNCATE_MARKER: &str = "truncate";

/// One structured entry from the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub user: String,
    pub source: String,
    pub event: String,
    pub description: String,
}

impl LogEntry {
    /// Parse one line; `None` for anything outside the grammar.
    pub fn parse(line: &str) -> Option<Self> {
        let caps = LOG_LINE.captures(line.trim_end_matches(['\r', '\n']))?;
        let timestamp = caps[1].parse::<f64>().ok()?;
        Some(Self {
            timestamp,
            user: caps[2].to_string(),
            source: caps[3].to_string(),
            event: caps[4].to_string(),
            description: caps[5].to_string(),
        })
    }

    /// Format back into the log grammar.
    pub fn to_log_line(&self) -> String {
        format!(
            "{} INFO {} : @@{}:{}@@ {}",
            self.timestamp, self.user, self.source, self.event, self.description
        )
    }

    /// Synthetic entry recording that reading stopped early.
    pub fn truncated(reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            user: TRUNCATE_USER.to_string(),
            source: TRUNCATE_MARKER.to_string(),
            event: TRUNCATE_MARKER.to_string(),
            description: reason.into(),
        }
    }

    pub fn is_truncation_marker(&self) -> bool {
        self.user == TRUNCATE_USER && self.source == TRUNCATE_MARKER && self.event == TRUNCATE_MARKER
    }
}

/// Parse entries from a reader until EOF or the first I/O error.
///
/// Malformed lines are skipped. An I/O error appends one truncation marker
/// and stops reading.
pub fn parse_entries<R: BufRead>(mut reader: R) -> Vec<LogEntry> {
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut dropped = 0usize;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                match LogEntry::parse(&line) {
                    Some(entry) => entries.push(entry),
                    None => dropped += 1,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, parsed = entries.len(), "Log read failed, truncating");
                entries.push(LogEntry::truncated(e.to_string()));
                break;
            }
        }
    }

    if dropped > 0 {
        debug!(dropped, "Skipped log lines outside the entry grammar");
    }
    entries
}

/// Detaches, parses, and removes the activity log.
pub struct LogHarvester {
    path: PathBuf,
}

impl LogHarvester {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique sibling name for the detached log.
    fn rotation_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "msu.log".to_string());
        self.path.with_file_name(format!(
            "{name}.{}.{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ))
    }

    /// Collect every entry written since the previous run.
    pub fn harvest_and_rotate(&self) -> Vec<LogEntry> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No activity log to harvest");
            return Vec::new();
        }

        let detached = self.rotation_path();
        if !detach(&self.path, &detached, |live| std::fs::remove_file(live)) {
            return Vec::new();
        }

        let entries = match File::open(&detached) {
            Ok(file) => parse_entries(BufReader::new(file)),
            Err(e) => {
                warn!(path = %detached.display(), error = %e, "Could not open detached activity log");
                vec![LogEntry::truncated(e.to_string())]
            }
        };

        if let Err(e) = std::fs::remove_file(&detached) {
            debug!(path = %detached.display(), error = %e, "Leaving rotated activity log behind");
        }

        info!(entries = entries.len(), "Harvested activity log");
        entries
    }
}

/// Move `live` aside to `detached` by hard link then unlink.
///
/// Succeeds only when the live name is gone; otherwise the link is removed
/// again so the same entries are not harvested twice.
fn detach(live: &Path, detached: &Path, unlink: impl FnOnce(&Path) -> io::Result<()>) -> bool {
    if let Err(e) = std::fs::hard_link(live, detached) {
        warn!(
            path = %live.display(),
            error = %e,
            "Could not detach activity log, skipping harvest"
        );
        return false;
    }
    if let Err(e) = unlink(live) {
        warn!(path = %live.display(), error = %e, "Could not unlink live activity log, skipping harvest");
        if let Err(e) = std::fs::remove_file(detached) {
            debug!(path = %detached.display(), error = %e, "Leaving detached activity log behind");
        }
        return false;
    }
    true
}

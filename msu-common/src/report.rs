//! Reports posted to the management server and the feedback it returns.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;

use thiserror::Error;

use crate::auth::AuthToken;
use crate::msulog::LogEntry;

pub const WWAN_REPORT_TYPE: &str = "wwan";
pub const ANDROID_WAP_REPORT_TYPE: &str = "android_wap";
pub const MSU_LOG_REPORT_KIND: &str = "msu_log";

/// Server instruction returned for a feedback report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    Ok,
    Exit,
    ForceContinue,
    Repair,
    UploadLogs,
    Unknown(String),
}

impl Feedback {
    /// Parse the transport's stdout. Empty output means `OK`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | "OK" => Self::Ok,
            "EXIT" => Self::Exit,
            "FORCE_CONTINUE" => Self::ForceContinue,
            "REPAIR" => Self::Repair,
            "UPLOAD_LOGS" => Self::UploadLogs,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Only an explicit force-continue overrides a gating decision.
    pub fn overrides_gate(&self) -> bool {
        matches!(self, Self::ForceContinue)
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("OK"),
            Self::Exit => f.write_str("EXIT"),
            Self::ForceContinue => f.write_str("FORCE_CONTINUE"),
            Self::Repair => f.write_str("REPAIR"),
            Self::UploadLogs => f.write_str("UPLOAD_LOGS"),
            Self::Unknown(s) => write!(f, "unknown({s})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("could not run report transport: {0}")]
    Spawn(#[source] io::Error),

    #[error("report transport exited with status {exit_code:?}: {stderr}")]
    Rejected {
        exit_code: Option<i32>,
        stderr: String,
    },
}

/// Delivery channel for reports and logs.
pub trait ReportTransport {
    /// Post a feedback report and wait for the server's instruction.
    fn post_report(
        &self,
        report_type: &str,
        payload: &BTreeMap<String, String>,
        token: &AuthToken,
    ) -> impl Future<Output = Result<Feedback, ReportError>> + Send;

    /// Forward harvested activity-log entries.
    fn post_logs(
        &self,
        entries: &[LogEntry],
        token: &AuthToken,
    ) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// URL-encoded body of a feedback report; `_report_type` comes first.
pub fn feedback_body(report_type: &str, payload: &BTreeMap<String, String>) -> String {
    std::iter::once(("_report_type", report_type))
        .chain(payload.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// `dict:msu_log:time=..:user=..:source=..:event=..:desc=..` argument for one entry.
pub fn log_report_arg(entry: &LogEntry) -> String {
    format!(
        "dict:{MSU_LOG_REPORT_KIND}:time={}:user={}:source={}:event={}:desc={}",
        entry.timestamp,
        urlencoding::encode(&entry.user),
        urlencoding::encode(&entry.source),
        urlencoding::encode(&entry.event),
        urlencoding::encode(&entry.description),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_parse() {
        assert_eq!(Feedback::parse(""), Feedback::Ok);
        assert_eq!(Feedback::parse("  \n"), Feedback::Ok);
        assert_eq!(Feedback::parse("OK\n"), Feedback::Ok);
        assert_eq!(Feedback::parse("EXIT"), Feedback::Exit);
        assert_eq!(Feedback::parse("FORCE_CONTINUE\n"), Feedback::ForceContinue);
        assert_eq!(Feedback::parse("REPAIR"), Feedback::Repair);
        assert_eq!(Feedback::parse("UPLOAD_LOGS"), Feedback::UploadLogs);
        assert_eq!(
            Feedback::parse("force_continue"),
            Feedback::Unknown("force_continue".to_string())
        );
    }

    #[test]
    fn test_only_force_continue_overrides() {
        assert!(Feedback::ForceContinue.overrides_gate());
        for fb in [
            Feedback::Ok,
            Feedback::Exit,
            Feedback::Repair,
            Feedback::UploadLogs,
            Feedback::Unknown("x".into()),
        ] {
            assert!(!fb.overrides_gate(), "{fb} must not override");
        }
    }

    #[test]
    fn test_feedback_body() {
        let mut payload = BTreeMap::new();
        payload.insert("interface".to_string(), "ppp0".to_string());
        payload.insert("hostname".to_string(), "mac 1".to_string());
        assert_eq!(
            feedback_body(WWAN_REPORT_TYPE, &payload),
            "_report_type=wwan&hostname=mac%201&interface=ppp0"
        );
        assert_eq!(
            feedback_body(ANDROID_WAP_REPORT_TYPE, &BTreeMap::new()),
            "_report_type=android_wap"
        );
    }

    #[test]
    fn test_log_report_arg_encodes_values() {
        let entry = LogEntry {
            timestamp: 1_700_000_000.5,
            user: "alice".into(),
            source: "MSU".into(),
            event: "install".into(),
            description: "a:b c".into(),
        };
        assert_eq!(
            log_report_arg(&entry),
            "dict:msu_log:time=1700000000.5:user=alice:source=MSU:event=install:desc=a%3Ab%20c"
        );
    }
}

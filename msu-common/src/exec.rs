//! Process-backed collaborators.
//!
//! Each type here wraps one external program behind the narrow trait the
//! orchestration talks to. None of them retry; callers decide what a failure
//! means.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

use if_addrs::IfAddr;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::auth::{AuthToken, CredentialExchange, ExchangeOutput, ExchangeRequest};
use crate::identity::{
    ClientIdentity, HOSTNAME_KEY, IdentitySource, Invocation, OS_VERSION_KEY, RUNTYPE_KEY, TRACK_KEY,
};
use crate::msulog::LogEntry;
use crate::network::{DnsProbe, InterfaceInspector, Ipv4Config};
use crate::report::{Feedback, ReportError, ReportTransport, feedback_body, log_report_arg};

impl From<Output> for ExchangeOutput {
    fn from(output: Output) -> Self {
        Self {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// Run `program args..` with no stdin and capture its output.
async fn run_captured<I, S>(program: &OsStr, args: I) -> io::Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

/// Trimmed stdout of a successful command, `None` otherwise.
async fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    match run_captured(OsStr::new(program), args).await {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!text.is_empty()).then_some(text)
        }
        Ok(output) => {
            debug!(program, status = ?output.status.code(), "Command reported failure");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "Command could not be started");
            None
        }
    }
}

/// Runs the credential-exchange executable.
#[derive(Debug, Clone)]
pub struct ProcessCredentialExchange {
    binary: PathBuf,
}

impl ProcessCredentialExchange {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(request: &ExchangeRequest) -> Vec<String> {
        vec![
            "--login".to_string(),
            "--print-cookie".to_string(),
            "--write-root-ca-certs".to_string(),
            request.certs_dir.display().to_string(),
            "--report".to_string(),
            format!("body:{}", request.report_body),
        ]
    }
}

impl CredentialExchange for ProcessCredentialExchange {
    async fn exchange(&self, request: &ExchangeRequest) -> io::Result<ExchangeOutput> {
        debug!(binary = %self.binary.display(), "Running credential exchange");
        let output = run_captured(self.binary.as_os_str(), Self::args(request)).await?;
        Ok(output.into())
    }
}

/// Posts reports through the credential-exchange executable.
#[derive(Debug, Clone)]
pub struct ProcessReportTransport {
    binary: PathBuf,
}

impl ProcessReportTransport {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String, ReportError> {
        let output = run_captured(self.binary.as_os_str(), args)
            .await
            .map_err(ReportError::Spawn)?;
        let output = ExchangeOutput::from(output);
        if !output.success() {
            return Err(ReportError::Rejected {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

impl ReportTransport for ProcessReportTransport {
    async fn post_report(
        &self,
        report_type: &str,
        payload: &BTreeMap<String, String>,
        token: &AuthToken,
    ) -> Result<Feedback, ReportError> {
        let args = vec![
            "--cookie".to_string(),
            token.cookie().to_string(),
            "--report".to_string(),
            format!("feedback:{}", feedback_body(report_type, payload)),
        ];
        let stdout = self.run(args).await?;
        let feedback = Feedback::parse(&stdout);
        info!(report_type, %feedback, "Server feedback received");
        Ok(feedback)
    }

    async fn post_logs(&self, entries: &[LogEntry], token: &AuthToken) -> Result<(), ReportError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut args = vec!["--cookie".to_string(), token.cookie().to_string()];
        for entry in entries {
            args.push("--report".to_string());
            args.push(log_report_arg(entry));
        }
        self.run(args).await?;
        Ok(())
    }
}

/// Interface state from `ifconfig` and the OS address table.
#[derive(Debug, Clone)]
pub struct SystemInterfaces {
    ifconfig: PathBuf,
}

impl Default for SystemInterfaces {
    fn default() -> Self {
        Self {
            ifconfig: PathBuf::from("ifconfig"),
        }
    }
}

impl SystemInterfaces {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            ifconfig: program.into(),
        }
    }
}

impl InterfaceInspector for SystemInterfaces {
    async fn interface_active(&self, name: &str) -> bool {
        let status = Command::new(&self.ifconfig)
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                warn!(program = %self.ifconfig.display(), error = %e, "Cannot query interface");
                false
            }
        }
    }

    async fn ipv4_config(&self, name: &str) -> Option<Ipv4Config> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                warn!(error = %e, "Cannot enumerate interface addresses");
                return None;
            }
        };
        interfaces
            .into_iter()
            .filter(|iface| iface.name == name)
            .find_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some(Ipv4Config {
                    addr: v4.ip,
                    netmask: v4.netmask,
                }),
                IfAddr::V6(_) => None,
            })
    }
}

/// `version.bind`-style TXT lookups through `dig`.
#[derive(Debug, Clone)]
pub struct DigDnsProbe {
    dig: PathBuf,
}

impl Default for DigDnsProbe {
    fn default() -> Self {
        Self {
            dig: PathBuf::from("dig"),
        }
    }
}

impl DigDnsProbe {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            dig: program.into(),
        }
    }

    fn args(server: Ipv4Addr, name: &str, timeout: Duration) -> Vec<String> {
        vec![
            "+short".to_string(),
            format!("+time={}", timeout.as_secs().max(1)),
            "+tries=1".to_string(),
            format!("@{server}"),
            name.to_string(),
            "chaos".to_string(),
            "txt".to_string(),
        ]
    }
}

impl DnsProbe for DigDnsProbe {
    async fn query_txt(&self, server: Ipv4Addr, name: &str, timeout: Duration) -> Option<String> {
        let query = run_captured(self.dig.as_os_str(), Self::args(server, name, timeout));
        match tokio::time::timeout(timeout, query).await {
            Err(_) => {
                debug!(%server, name, ?timeout, "DNS probe timed out");
                None
            }
            Ok(Err(e)) => {
                warn!(program = %self.dig.display(), error = %e, "DNS probe could not run");
                None
            }
            Ok(Ok(output)) if !output.status.success() => {
                debug!(%server, status = ?output.status.code(), "DNS probe failed");
                None
            }
            Ok(Ok(output)) => {
                let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!answer.is_empty()).then_some(answer)
            }
        }
    }
}

/// Identity built from the local host.
#[derive(Debug, Clone)]
pub struct HostIdentitySource {
    default_track: String,
}

impl HostIdentitySource {
    pub fn new(default_track: impl Into<String>) -> Self {
        Self {
            default_track: default_track.into(),
        }
    }
}

impl IdentitySource for HostIdentitySource {
    async fn client_identity(
        &self,
        invocation: &Invocation,
        current_track: Option<&str>,
    ) -> ClientIdentity {
        let track = current_track
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.default_track)
            .to_string();

        let mut fields = BTreeMap::new();
        fields.insert(TRACK_KEY.to_string(), track);
        fields.insert(RUNTYPE_KEY.to_string(), invocation.runtype().to_string());
        if let Some(hostname) = command_stdout("hostname", &[]).await {
            fields.insert(HOSTNAME_KEY.to_string(), hostname);
        }
        if let Some(version) = command_stdout("sw_vers", &["-productVersion"]).await {
            fields.insert(OS_VERSION_KEY.to_string(), version);
        }
        ClientIdentity::new(fields)
    }
}

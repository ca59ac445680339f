//! Preflight sequencing.
//!
//! Steps run strictly in order and the first fatal condition ends the run:
//! stale temp cleanup, secure record loading, identity, token acquisition,
//! log forwarding, network gating (unattended runs only), scratch directory
//! convergence, and finally a single save of each record. The user record is
//! only read once everything before it has passed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use msu_common::auth::AuthSession;
use msu_common::records::{
    ADDITIONAL_HTTP_HEADERS_KEY, CLIENT_IDENTIFIER_KEY, SOFTWARE_REPO_CA_PATH_KEY,
    USER_SETTINGS_KEY,
};
use msu_common::report::{ANDROID_WAP_REPORT_TYPE, WWAN_REPORT_TYPE};
use msu_common::{
    AuthToken, ConfigRecord, CredentialExchange, DirectoryConverger, DnsProbe,
    ExitStatus, IdentitySource, InterfaceInspector, LogHarvester, NetworkClassifier,
    Invocation, PreflightConfig, PreflightError, ReportTransport, RunMode,
};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Outcome of one network gate that fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkCheck {
    pub report_type: &'static str,
    pub interface: String,
    /// Server feedback, or `None` when the report could not be delivered.
    pub feedback: Option<String>,
    pub overridden: bool,
}

/// Machine-readable summary of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightSummary {
    pub status: ExitStatus,
    pub run_mode: RunMode,
    pub runtype: String,
    pub client_track: String,
    pub token_acquired: bool,
    pub logs_forwarded: usize,
    pub network_checks: Vec<NetworkCheck>,
    pub scratch_dir: PathBuf,
}

/// One preflight run over its external collaborators.
pub struct Preflight<X, R, I, D, S> {
    config: PreflightConfig,
    exchange: X,
    transport: R,
    classifier: NetworkClassifier<I, D>,
    identity: S,
}

impl<X, R, I, D, S> Preflight<X, R, I, D, S>
where
    X: CredentialExchange,
    R: ReportTransport,
    I: InterfaceInspector,
    D: DnsProbe,
    S: IdentitySource,
{
    pub fn new(
        config: PreflightConfig,
        exchange: X,
        transport: R,
        classifier: NetworkClassifier<I, D>,
        identity: S,
    ) -> Self {
        Self {
            config,
            exchange,
            transport,
            classifier,
            identity,
        }
    }

    pub async fn run(&self, invocation: &Invocation) -> Result<PreflightSummary, PreflightError> {
        let mode = invocation.mode();
        info!(%mode, runtype = invocation.runtype(), "Starting preflight");
        remove_stale_temp_dir(&self.config.temp_dir());

        let mut secure = ConfigRecord::open_or_init(&self.config.secure_config_path)?;

        let identity = self
            .identity
            .client_identity(invocation, secure.get_string(CLIENT_IDENTIFIER_KEY))
            .await;
        debug!(client_id = %identity.serialize(), "Client identity gathered");

        // No settings are collected from the user yet; the key is still
        // converged so stale values do not linger.
        let user_settings = BTreeMap::new();

        let token = AuthSession::new(&self.exchange, self.config.certs_dir())
            .with_user_settings(user_settings.clone())
            .acquire_token(&identity, &secure.string_array(ADDITIONAL_HTTP_HEADERS_KEY))
            .await?;

        let logs_forwarded = self.forward_logs(&token).await;

        let network_checks = if mode.is_auto() {
            self.gate_network(&token).await?
        } else {
            debug!("Interactive run, skipping network gating");
            Vec::new()
        };

        let scratch_dir = DirectoryConverger::new(self.config.converge_policy())
            .converge(&self.config.scratch_dir())
            .await?;

        let client_track = identity
            .track()
            .unwrap_or(&self.config.default_track)
            .to_string();
        let mut user = ConfigRecord::load(&self.config.user_config_path)?;
        persist_secure(&mut secure, &client_track, &token)?;
        persist_user(&mut user, &user_settings, &scratch_dir)?;

        info!(track = %client_track, logs_forwarded, "Preflight complete");
        Ok(PreflightSummary {
            status: ExitStatus::Success,
            run_mode: mode,
            runtype: invocation.runtype().to_string(),
            client_track,
            token_acquired: true,
            logs_forwarded,
            network_checks,
            scratch_dir,
        })
    }

    /// Harvest the activity log and forward it; failures only cost the logs.
    async fn forward_logs(&self, token: &AuthToken) -> usize {
        let entries = LogHarvester::new(&self.config.msu_log_path).harvest_and_rotate();
        if entries.is_empty() {
            return 0;
        }
        match self.transport.post_logs(&entries, token).await {
            Ok(()) => {
                info!(entries = entries.len(), "Forwarded activity log entries");
                entries.len()
            }
            Err(e) => {
                warn!(entries = entries.len(), error = %e, "Could not forward activity log");
                0
            }
        }
    }

    async fn gate_network(&self, token: &AuthToken) -> Result<Vec<NetworkCheck>, PreflightError> {
        let mut checks = Vec::new();

        if self.classifier.is_on_cellular_uplink().await {
            let check = self
                .report_gate(
                    WWAN_REPORT_TYPE,
                    self.classifier.cellular_interface(),
                    token,
                )
                .await;
            let overridden = check.overridden;
            checks.push(check);
            if !overridden {
                error!("Cellular uplink active and not overridden, aborting");
                return Err(PreflightError::WwanActive);
            }
        }

        if self.classifier.is_on_tethered_wap().await {
            let check = self
                .report_gate(
                    ANDROID_WAP_REPORT_TYPE,
                    self.classifier.wifi_interface(),
                    token,
                )
                .await;
            let overridden = check.overridden;
            checks.push(check);
            if !overridden {
                error!("Tethered access point active and not overridden, aborting");
                return Err(PreflightError::AndroidWapActive);
            }
        }

        Ok(checks)
    }

    /// Tell the server about a gated uplink and ask whether to proceed.
    async fn report_gate(
        &self,
        report_type: &'static str,
        interface: &str,
        token: &AuthToken,
    ) -> NetworkCheck {
        let payload = BTreeMap::from([("interface".to_string(), interface.to_string())]);
        let feedback = match self.transport.post_report(report_type, &payload, token).await {
            Ok(feedback) => Some(feedback),
            Err(e) => {
                warn!(report_type, error = %e, "Gate report not delivered, treating as not overridden");
                None
            }
        };
        let overridden = feedback.as_ref().is_some_and(|f| f.overrides_gate());
        if overridden {
            info!(report_type, "Server forced continuation");
        }
        NetworkCheck {
            report_type,
            interface: interface.to_string(),
            feedback: feedback.map(|f| f.to_string()),
            overridden,
        }
    }
}

/// Remove what a previous run left in the per-run temp directory.
fn remove_stale_temp_dir(path: &Path) {
    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale temp directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove stale temp directory"),
    }
}

fn persist_secure(
    record: &mut ConfigRecord,
    track: &str,
    token: &AuthToken,
) -> Result<(), PreflightError> {
    record.set_string(CLIENT_IDENTIFIER_KEY, track);
    record.set_string_array(ADDITIONAL_HTTP_HEADERS_KEY, token.headers());
    record.save()?;
    Ok(())
}

fn persist_user(
    record: &mut ConfigRecord,
    user_settings: &BTreeMap<String, String>,
    scratch_dir: &Path,
) -> Result<(), PreflightError> {
    record.set_or_remove_string_map(USER_SETTINGS_KEY, user_settings);
    record.set_string(SOFTWARE_REPO_CA_PATH_KEY, scratch_dir.display().to_string());
    record.save()?;
    Ok(())
}

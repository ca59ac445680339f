//! Session token acquisition.
//!
//! The credential-exchange executable logs in to the management server,
//! prints the session cookie on stdout, and drops the server's root CA
//! bundle into the managed-install `certs/` directory. The resulting cookie
//! and client-id headers replace any stale ones in the secure record's
//! additional HTTP headers.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info};

use crate::identity::{ClientIdentity, serialize_map};

pub const COOKIE_HEADER: &str = "Cookie";
pub const CLIENT_ID_HEADER: &str = "X-munki-client-id";
pub const PREFLIGHT_REPORT_TYPE: &str = "preflight";

/// Arguments for one credential exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    /// Directory the root CA bundle is written into.
    pub certs_dir: PathBuf,
    /// URL-encoded report body sent with the login.
    pub report_body: String,
}

/// Raw result of running the exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExchangeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Trades a client identity for a session cookie.
pub trait CredentialExchange {
    fn exchange(
        &self,
        request: &ExchangeRequest,
    ) -> impl Future<Output = io::Result<ExchangeOutput>> + Send;
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential exchange exited with {}: {}", describe_code(.exit_code), .stderr.trim())]
    ExchangeFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("credential exchange printed no token")]
    EmptyToken,

    #[error("could not run credential exchange: {0}")]
    Spawn(#[source] io::Error),

    #[error("could not create certificate directory {path}: {source}")]
    CertsDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}

/// Session cookie plus the header set derived from it.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    cookie: String,
    headers: Vec<String>,
}

impl AuthToken {
    pub fn new(cookie: impl Into<String>, headers: Vec<String>) -> Self {
        Self {
            cookie: cookie.into(),
            headers,
        }
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Headers to persist as the secure record's additional HTTP headers.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("cookie", &"<redacted>")
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Acquires the session token for one preflight run.
pub struct AuthSession<'a, X> {
    exchange: &'a X,
    certs_dir: PathBuf,
    user_settings: BTreeMap<String, String>,
}

impl<'a, X: CredentialExchange> AuthSession<'a, X> {
    pub fn new(exchange: &'a X, certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            exchange,
            certs_dir: certs_dir.into(),
            user_settings: BTreeMap::new(),
        }
    }

    pub fn with_user_settings(mut self, settings: BTreeMap<String, String>) -> Self {
        self.user_settings = settings;
        self
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Log in and derive the header set.
    ///
    /// `existing_headers` is the current header list; everything except
    /// cookie and client-id headers survives in order.
    pub async fn acquire_token(
        &self,
        identity: &ClientIdentity,
        existing_headers: &[String],
    ) -> Result<AuthToken, AuthError> {
        std::fs::create_dir_all(&self.certs_dir).map_err(|source| AuthError::CertsDir {
            path: self.certs_dir.clone(),
            source,
        })?;

        let request = ExchangeRequest {
            certs_dir: self.certs_dir.clone(),
            report_body: report_body(identity, &self.user_settings),
        };
        debug!(certs_dir = %self.certs_dir.display(), "Starting credential exchange");

        let output = self.exchange.exchange(&request).await.map_err(|e| {
            error!(error = %e, "Could not start credential exchange");
            AuthError::Spawn(e)
        })?;

        if !output.success() {
            error!(
                exit_code = ?output.exit_code,
                stderr = %output.stderr.trim(),
                "Credential exchange failed"
            );
            return Err(AuthError::ExchangeFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        let cookie = output.stdout.trim();
        if cookie.is_empty() {
            error!(stderr = %output.stderr.trim(), "Credential exchange printed no token");
            return Err(AuthError::EmptyToken);
        }

        let headers = rewrite_headers(existing_headers, cookie, identity);
        info!(headers = headers.len(), "Acquired session token");
        Ok(AuthToken {
            cookie: cookie.to_string(),
            headers,
        })
    }
}

/// URL-encoded login report body.
pub fn report_body(identity: &ClientIdentity, user_settings: &BTreeMap<String, String>) -> String {
    [
        ("_report_type", PREFLIGHT_REPORT_TYPE.to_string()),
        ("client_id", identity.serialize()),
        ("user_settings", serialize_map(user_settings)),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&")
}

fn header_name(header: &str) -> &str {
    header.split_once(':').map_or(header, |(name, _)| name).trim()
}

fn is_session_header(header: &str) -> bool {
    let name = header_name(header);
    name.eq_ignore_ascii_case(COOKIE_HEADER) || name.eq_ignore_ascii_case(CLIENT_ID_HEADER)
}

/// Keep unrelated headers, then append exactly one cookie and one client-id header.
pub fn rewrite_headers(existing: &[String], cookie: &str, identity: &ClientIdentity) -> Vec<String> {
    let mut headers: Vec<String> = existing
        .iter()
        .filter(|h| !is_session_header(h))
        .cloned()
        .collect();
    headers.push(format!("{COOKIE_HEADER}: {cookie}"));
    headers.push(format!(
        "{CLIENT_ID_HEADER}: {}",
        urlencoding::encode(&identity.serialize())
    ));
    headers
}

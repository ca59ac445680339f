//! Core components of the managed software update preflight gate.
//!
//! The preflight binary sequences these pieces before the update client
//! does its main work:
//!
//! - [`auth`]: token acquisition through the credential-exchange executable
//! - [`network`]: cellular / tethered-WAP uplink heuristics
//! - [`converge`]: self-healing scratch directory convergence
//! - [`msulog`]: harvest-and-rotate of the update client's activity log
//!
//! Process-backed implementations of the external collaborators live in
//! [`exec`]; everything else talks to them through narrow traits so the
//! orchestration can run against fakes.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod converge;
pub mod errors;
pub mod exec;
pub mod identity;
pub mod logging;
pub mod msulog;
pub mod network;
pub mod records;
pub mod report;

pub use auth::{
    AuthError, AuthSession, AuthToken, CredentialExchange, ExchangeOutput, ExchangeRequest,
};
pub use config::{ConfigError, PreflightConfig};
pub use converge::{ConvergeError, ConvergePolicy, DirectoryConverger};
pub use exec::{
    DigDnsProbe, HostIdentitySource, ProcessCredentialExchange, ProcessReportTransport,
    SystemInterfaces,
};
pub use errors::{ExitStatus, PreflightError};
pub use identity::{ClientIdentity, IdentitySource, Invocation, RunMode};
pub use logging::{LogConfig, LoggingError, LoggingGuards, init_logging};
pub use msulog::{LogEntry, LogHarvester};
pub use network::{DnsProbe, InterfaceInspector, Ipv4Config, NetworkClassifier};
pub use records::{ConfigRecord, RecordError};
pub use report::{Feedback, ReportError, ReportTransport};

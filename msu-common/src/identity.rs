//! Client identity reported to the management server.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;

use serde::Serialize;

pub const TRACK_KEY: &str = "track";
pub const RUNTYPE_KEY: &str = "runtype";
pub const HOSTNAME_KEY: &str = "hostname";
pub const OS_VERSION_KEY: &str = "os_version";

/// How the preflight was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Scheduled, unattended run; network gating applies.
    Auto,
    /// Anything started by a person.
    Interactive,
}

impl RunMode {
    /// `auto` selects an unattended run; anything else is interactive.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            Some("auto") => Self::Auto,
            _ => Self::Interactive,
        }
    }

    pub fn is_auto(self) -> bool {
        self == Self::Auto
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Interactive => "interactive",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run type reported when the update client passes no argument.
pub const DEFAULT_RUNTYPE: &str = "custom";

/// The invocation argument as given, with the mode derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invocation {
    mode: RunMode,
    runtype: String,
}

impl Invocation {
    pub fn from_arg(arg: Option<&str>) -> Self {
        Self {
            mode: RunMode::from_arg(arg),
            runtype: arg.unwrap_or(DEFAULT_RUNTYPE).to_string(),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Raw run type sent to the server, e.g. `auto` or `manualcheck`.
    pub fn runtype(&self) -> &str {
        &self.runtype
    }
}

/// Immutable key/value description of this device's update channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientIdentity {
    fields: BTreeMap<String, String>,
}

impl ClientIdentity {
    pub fn new(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }

    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn track(&self) -> Option<&str> {
        self.get(TRACK_KEY)
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// `key=value` pairs joined with `|`, keys in sorted order.
    pub fn serialize(&self) -> String {
        serialize_map(&self.fields)
    }
}

/// Shared `key=value|key=value` form used for identities and user settings.
pub fn serialize_map(map: &BTreeMap<String, String>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Produces the identity for a run.
pub trait IdentitySource {
    /// `current_track` is the track already recorded on this device, if any.
    fn client_identity(
        &self,
        invocation: &Invocation,
        current_track: Option<&str>,
    ) -> impl Future<Output = ClientIdentity> + Send;
}

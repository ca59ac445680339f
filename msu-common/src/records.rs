//! Persisted managed-install preference records.
//!
//! Each record is a property-list dictionary at a fixed path. Records are
//! loaded once, mutated in memory, and written back with a single atomic
//! replace so a crash never leaves a half-written document behind.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::{debug, info};

pub const CLIENT_IDENTIFIER_KEY: &str = "ClientIdentifier";
pub const ADDITIONAL_HTTP_HEADERS_KEY: &str = "AdditionalHttpHeaders";
pub const USER_SETTINGS_KEY: &str = "UserSettings";
pub const SOFTWARE_REPO_CA_PATH_KEY: &str = "SoftwareRepoCAPath";

/// Mode for records written for the first time; they may hold session cookies.
#[cfg(unix)]
const NEW_RECORD_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: plist::Error,
    },

    #[error("{path} does not contain a dictionary")]
    NotADictionary { path: PathBuf },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: plist::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One property-list preference record.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    path: PathBuf,
    dict: Dictionary,
}

impl ConfigRecord {
    /// Load the record, treating a missing file as an empty dictionary.
    pub fn load(path: &Path) -> Result<Self, RecordError> {
        if !path.exists() {
            debug!(path = %path.display(), "Preference record absent, starting empty");
            return Ok(Self {
                path: path.to_path_buf(),
                dict: Dictionary::new(),
            });
        }
        let value = Value::from_file(path).map_err(|source| RecordError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| RecordError::NotADictionary {
                path: path.to_path_buf(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            dict,
        })
    }

    /// Load the record, first writing an empty skeleton if it does not exist.
    pub fn open_or_init(path: &Path) -> Result<Self, RecordError> {
        if !path.exists() {
            info!(path = %path.display(), "Initializing empty preference record");
            let skeleton = Self {
                path: path.to_path_buf(),
                dict: Dictionary::new(),
            };
            skeleton.save()?;
        }
        Self::load(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, key: &str) -> bool {
        self.dict.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.dict.get(key).and_then(Value::as_string)
    }

    pub fn set_string(&mut self, key: &str, value: impl Into<String>) {
        self.dict.insert(key.to_string(), Value::String(value.into()));
    }

    /// String elements of an array value; non-string elements are skipped.
    pub fn string_array(&self, key: &str) -> Vec<String> {
        self.dict
            .get(key)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn set_string_array(&mut self, key: &str, values: &[String]) {
        let array = values.iter().cloned().map(Value::String).collect();
        self.dict.insert(key.to_string(), Value::Array(array));
    }

    /// Store a string map as a nested dictionary, or remove the key if empty.
    ///
    /// An empty map never produces an empty dictionary value.
    pub fn set_or_remove_string_map(&mut self, key: &str, values: &BTreeMap<String, String>) {
        if values.is_empty() {
            self.dict.remove(key);
            return;
        }
        let mut nested = Dictionary::new();
        for (k, v) in values {
            nested.insert(k.clone(), Value::String(v.clone()));
        }
        self.dict.insert(key.to_string(), Value::Dictionary(nested));
    }

    /// Atomically replace the on-disk record with the in-memory contents.
    pub fn save(&self) -> Result<(), RecordError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| RecordError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.staging_path();
        let result = self.write_staging(&tmp).and_then(|()| {
            std::fs::rename(&tmp, &self.path).map_err(|source| RecordError::Io {
                path: self.path.clone(),
                source,
            })
        });
        if result.is_err() {
            let _ = std::fs::remove_file(&tmp);
        }
        result?;
        debug!(path = %self.path.display(), keys = self.dict.len(), "Saved preference record");
        Ok(())
    }

    /// Write and sync the staging file, carrying over the current mode.
    ///
    /// A record that does not exist yet is created owner-only.
    fn write_staging(&self, tmp: &Path) -> Result<(), RecordError> {
        let io_err = |source| RecordError::Io {
            path: tmp.to_path_buf(),
            source,
        };
        let existing = std::fs::metadata(&self.path).ok().map(|m| m.permissions());

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(NEW_RECORD_MODE);
        let mut file = options.open(tmp).map_err(io_err)?;
        if let Some(permissions) = existing {
            file.set_permissions(permissions).map_err(io_err)?;
        }

        Value::Dictionary(self.dict.clone())
            .to_writer_xml(&mut file)
            .map_err(|source| RecordError::Write {
                path: tmp.to_path_buf(),
                source,
            })?;
        file.sync_all().map_err(io_err)
    }

    fn staging_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "record".to_string());
        self.path
            .with_file_name(format!(".{name}.{}.tmp", std::process::id()))
    }
}

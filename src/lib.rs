//! Privilege-separated Prometheus exporter for certmonger.
//!
//! A privileged supervisor reads certificate request state from certmonger over
//! the system bus and hands point-in-time [`Snapshot`]s to an unprivileged,
//! network-facing worker, which renders them as Prometheus gauges.

pub mod bus;
pub mod collector;
pub mod config;
pub mod error;
pub mod ipc;
pub mod metrics;
pub mod notify;
pub mod supervisor;
pub mod worker;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

pub use collector::{BusSnapshotCollector, SnapshotSource};
pub use error::{ExporterError, RecordError};
pub use metrics::MetricsMapper;

/// Storage backend certmonger keeps a tracked certificate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StorageType {
    File,
    Nssdb,
}

/// Where a certificate lives. Only NSS databases have a nickname and token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertStorage {
    File {
        path: String,
    },
    Nssdb {
        database: String,
        nickname: String,
        token: String,
    },
}

impl CertStorage {
    pub fn storage_type(&self) -> StorageType {
        match self {
            CertStorage::File { .. } => StorageType::File,
            CertStorage::Nssdb { .. } => StorageType::Nssdb,
        }
    }

    pub fn location(&self) -> &str {
        match self {
            CertStorage::File { path } => path,
            CertStorage::Nssdb { database, .. } => database,
        }
    }

    pub fn nickname(&self) -> &str {
        match self {
            CertStorage::File { .. } => "",
            CertStorage::Nssdb { nickname, .. } => nickname,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            CertStorage::File { .. } => "",
            CertStorage::Nssdb { token, .. } => token,
        }
    }
}

/// One certificate tracked by certmonger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub nickname: String,
    pub ca: String,
    pub storage: CertStorage,
    /// State machine state, e.g. `MONITORING`.
    pub status: String,
    pub ca_error: bool,
    /// `None` when certmonger did not keep the key generation date.
    pub key_generated_date: Option<i64>,
    pub key_issued_count: u64,
    pub last_checked: i64,
    pub not_valid_after: i64,
    pub not_valid_before: i64,
    pub stuck: bool,
}

impl RequestRecord {
    /// Values for the six identity labels, in [`metrics::IDENTITY_LABELS`] order.
    pub fn identity(&self) -> [String; 6] {
        [
            self.nickname.clone(),
            self.ca.clone(),
            self.storage.storage_type().to_string(),
            self.storage.location().to_string(),
            self.storage.nickname().to_string(),
            self.storage.token().to_string(),
        ]
    }
}

/// A point-in-time capture of every tracked request plus service health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// `None` when the service manager could not be asked.
    pub service_enabled: Option<bool>,
    pub bus_reachable: bool,
    pub requests: Vec<RequestRecord>,
}

impl Snapshot {
    pub fn unreachable() -> Self {
        Snapshot {
            service_enabled: None,
            bus_reachable: false,
            requests: Vec::new(),
        }
    }
}

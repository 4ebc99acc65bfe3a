//! Turns certmonger's object graph into a flat [`Snapshot`].
//!
//! Request enumeration is all-or-nothing: a transport failure anywhere empties
//! the request list and marks the bus unreachable. A malformed record is logged
//! and skipped without affecting the others.

use std::collections::HashSet;
use std::str::FromStr;

use tracing::{debug, error, warn};

use crate::bus::{
    ObjectBus, PropertyValue, CA_INTERFACE, CERTMONGER_SERVICE, REQUEST_INTERFACE,
    SYSTEMD_SERVICE, SYSTEMD_UNIT_INTERFACE,
};
use crate::error::{BusError, RecordError};
use crate::{CertStorage, RequestRecord, Snapshot, StorageType};

pub const CERTMONGER_UNIT: &str = "certmonger.service";

const REQUESTS_PREFIX: &str = "/org/fedorahosted/certmonger/requests/";
const CAS_PREFIX: &str = "/org/fedorahosted/certmonger/cas/";

/// Anything that can produce a fresh snapshot on demand.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

pub struct BusSnapshotCollector<B> {
    bus: B,
}

impl<B: ObjectBus> BusSnapshotCollector<B> {
    pub fn new(bus: B) -> Self {
        BusSnapshotCollector { bus }
    }

    pub fn collect(&self) -> Snapshot {
        let service_enabled = match self.service_enabled() {
            Ok(enabled) => Some(enabled),
            Err(e) => {
                error!(error = %e, "Failed to query {} state", CERTMONGER_UNIT);
                None
            }
        };

        let requests = match self.collect_requests() {
            Ok(requests) => Some(requests),
            Err(e) => {
                error!(error = %e, "Failed to enumerate certmonger requests");
                None
            }
        };

        // An unreachable snapshot never carries records.
        let requests = requests.filter(|_| service_enabled.is_some());
        let snapshot = Snapshot {
            service_enabled,
            bus_reachable: requests.is_some(),
            requests: requests.unwrap_or_default(),
        };
        debug!(
            requests = snapshot.requests.len(),
            reachable = snapshot.bus_reachable,
            "Collected snapshot"
        );
        snapshot
    }

    /// Whether `certmonger.service` is enabled. A missing unit is reported as
    /// disabled, not as an error.
    pub fn service_enabled(&self) -> Result<bool, BusError> {
        let Some(unit) = self.bus.get_unit(CERTMONGER_UNIT)? else {
            warn!("{} not found, is certmonger installed?", CERTMONGER_UNIT);
            return Ok(false);
        };
        match self
            .bus
            .get_property(SYSTEMD_SERVICE, &unit, SYSTEMD_UNIT_INTERFACE, "UnitFileState")?
        {
            PropertyValue::Str(state) => Ok(state == "enabled"),
            other => Err(BusError::InvalidReply {
                details: format!("UnitFileState is a {}", other.kind()),
            }),
        }
    }

    fn collect_requests(&self) -> Result<Vec<RequestRecord>, BusError> {
        let paths = self.bus.list_requests()?;
        let mut records = Vec::with_capacity(paths.len());
        let mut seen = HashSet::new();

        for path in &paths {
            match self.read_request(path) {
                Ok(record) => {
                    if seen.insert(record.identity()) {
                        records.push(record);
                    } else {
                        error!(request = %path, nickname = %record.nickname, "Skipping duplicate request");
                    }
                }
                Err(RecordError::Bus(e)) if e.is_transport() => return Err(e),
                Err(e) => error!(request = %path, error = %e, "Skipping request"),
            }
        }
        Ok(records)
    }

    pub fn read_request(&self, path: &str) -> Result<RequestRecord, RecordError> {
        let ca_path = ca_object_path(&self.request_path(path, "ca")?);
        let ca = match self.bus.get_property(CERTMONGER_SERVICE, &ca_path, CA_INTERFACE, "nickname")? {
            PropertyValue::Str(nickname) => nickname,
            _ => return Err(unexpected("nickname", "string")),
        };

        let storage_type = self.request_str(path, "cert-storage")?;
        let storage = match StorageType::from_str(&storage_type) {
            Ok(StorageType::File) => CertStorage::File {
                path: self.request_str(path, "cert-file")?,
            },
            Ok(StorageType::Nssdb) => CertStorage::Nssdb {
                database: self.request_str(path, "cert-database")?,
                nickname: self.request_str(path, "cert-nickname")?,
                token: self.request_str(path, "cert-token")?,
            },
            Err(strum::ParseError::VariantNotFound) => {
                return Err(RecordError::UnknownStorageType {
                    path: path.to_string(),
                    value: storage_type,
                })
            }
        };

        let key_issued_count = self.request_int(path, "key-issued-count")?;

        Ok(RequestRecord {
            nickname: self.request_str(path, "nickname")?,
            ca,
            storage,
            status: self.request_str(path, "status")?,
            ca_error: self.ca_error(path)?,
            key_generated_date: self.key_generated_date(path)?,
            key_issued_count: u64::try_from(key_issued_count).map_err(|_| {
                RecordError::OutOfRange {
                    property: "key-issued-count".to_string(),
                    value: key_issued_count,
                }
            })?,
            last_checked: self.request_int(path, "last-checked")?,
            not_valid_after: self.request_int(path, "not-valid-after")?,
            not_valid_before: self.request_int(path, "not-valid-before")?,
            stuck: self.request_bool(path, "stuck")?,
        })
    }

    fn request_property(&self, path: &str, name: &str) -> Result<PropertyValue, BusError> {
        self.bus
            .get_property(CERTMONGER_SERVICE, path, REQUEST_INTERFACE, name)
    }

    fn request_str(&self, path: &str, name: &str) -> Result<String, RecordError> {
        match self.request_property(path, name)? {
            PropertyValue::Str(s) => Ok(s),
            _ => Err(unexpected(name, "string")),
        }
    }

    fn request_path(&self, path: &str, name: &str) -> Result<String, RecordError> {
        match self.request_property(path, name)? {
            PropertyValue::Path(p) | PropertyValue::Str(p) => Ok(p),
            _ => Err(unexpected(name, "object path")),
        }
    }

    fn request_int(&self, path: &str, name: &str) -> Result<i64, RecordError> {
        match self.request_property(path, name)? {
            PropertyValue::Int(n) => Ok(n),
            _ => Err(unexpected(name, "integer")),
        }
    }

    fn request_bool(&self, path: &str, name: &str) -> Result<bool, RecordError> {
        match self.request_property(path, name)? {
            PropertyValue::Bool(b) => Ok(b),
            _ => Err(unexpected(name, "boolean")),
        }
    }

    // certmonger reports the CA's error message here; empty means no error.
    fn ca_error(&self, path: &str) -> Result<bool, RecordError> {
        match self.request_property(path, "ca-error")? {
            PropertyValue::Str(message) => Ok(!message.is_empty()),
            PropertyValue::Bool(b) => Ok(b),
            _ => Err(unexpected("ca-error", "string")),
        }
    }

    // Not kept for every certificate; zero or missing means "not reported".
    fn key_generated_date(&self, path: &str) -> Result<Option<i64>, RecordError> {
        match self.request_property(path, "key-generated-date") {
            Ok(PropertyValue::Int(date)) => Ok(Some(date).filter(|&d| d > 0)),
            Ok(_) => Err(unexpected("key-generated-date", "integer")),
            Err(BusError::NoSuchProperty { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl<B: ObjectBus> SnapshotSource for BusSnapshotCollector<B> {
    fn snapshot(&self) -> Snapshot {
        self.collect()
    }
}

/// Maps a request's `ca` property onto the CA namespace.
///
/// Some certmonger releases hand out the CA path under `requests/` instead of
/// `cas/` (RHEL-29246); reading the CA interface there finds nothing.
pub fn ca_object_path(raw: &str) -> String {
    match raw.strip_prefix(REQUESTS_PREFIX) {
        Some(rest) => format!("{}{}", CAS_PREFIX, rest),
        None => raw.to_string(),
    }
}

fn unexpected(property: &str, expected: &'static str) -> RecordError {
    RecordError::UnexpectedType {
        property: property.to_string(),
        expected,
    }
}

//! System bus access.
//!
//! [`ObjectBus`] is the narrow slice of the bus the collector needs: enumerate
//! certmonger requests, read single properties, and look up a systemd unit.
//! [`dbus::SystemBus`] implements it on top of zbus.

pub mod dbus;
#[cfg(test)]
pub(crate) mod fake;

use crate::error::BusError;

pub const CERTMONGER_SERVICE: &str = "org.fedorahosted.certmonger";
pub const CERTMONGER_OBJECT: &str = "/org/fedorahosted/certmonger";
pub const CERTMONGER_INTERFACE: &str = "org.fedorahosted.certmonger";
pub const REQUEST_INTERFACE: &str = "org.fedorahosted.certmonger.request";
pub const CA_INTERFACE: &str = "org.fedorahosted.certmonger.ca";

pub const SYSTEMD_SERVICE: &str = "org.freedesktop.systemd1";
pub const SYSTEMD_MANAGER_OBJECT: &str = "/org/freedesktop/systemd1";
pub const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
pub const SYSTEMD_UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";

/// A property value as read off the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Str(String),
    Path(String),
    Bool(bool),
    Int(i64),
}

impl PropertyValue {
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Str(_) => "string",
            PropertyValue::Path(_) => "object path",
            PropertyValue::Bool(_) => "boolean",
            PropertyValue::Int(_) => "integer",
        }
    }
}

pub trait ObjectBus: Send + Sync {
    /// Object paths of every request certmonger currently tracks.
    fn list_requests(&self) -> Result<Vec<String>, BusError>;

    fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, BusError>;

    /// Object path of a systemd unit, or `None` when systemd has no such unit.
    fn get_unit(&self, name: &str) -> Result<Option<String>, BusError>;
}

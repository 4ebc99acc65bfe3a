//! [`ObjectBus`] over the D-Bus system bus.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, warn};
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{DynamicDeserialize, DynamicType, OwnedObjectPath, OwnedValue, Value};

use super::{
    ObjectBus, PropertyValue, CERTMONGER_INTERFACE, CERTMONGER_OBJECT, CERTMONGER_SERVICE,
    SYSTEMD_MANAGER_INTERFACE, SYSTEMD_MANAGER_OBJECT, SYSTEMD_SERVICE,
};
use crate::error::BusError;

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// System bus session, connected on first use and dropped after a transport
/// failure so the next call reconnects.
#[derive(Default)]
pub struct SystemBus {
    connection: Mutex<Option<Connection>>,
}

impl SystemBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection(&self) -> Result<Connection, BusError> {
        let mut guard = self.connection.lock().map_err(|_| BusError::Transport {
            details: "bus connection lock poisoned".to_string(),
        })?;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }
        let connection = Connection::system().map_err(|e| BusError::Transport {
            details: e.to_string(),
        })?;
        debug!("Connected to the system bus");
        *guard = Some(connection.clone());
        Ok(connection)
    }

    fn call<B, R>(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        body: &B,
    ) -> Result<R, zbus::Error>
    where
        B: Serialize + DynamicType,
        R: for<'d> DynamicDeserialize<'d>,
    {
        let connection = self.connection().map_err(|e| zbus::Error::Failure(e.to_string()))?;
        let proxy = Proxy::new(&connection, service, path, interface)?;
        proxy.call(method, body)
    }

    fn checked<T>(&self, result: Result<T, BusError>) -> Result<T, BusError> {
        if let Err(e) = &result {
            if e.is_transport() {
                warn!(error = %e, "Dropping system bus connection");
                if let Ok(mut guard) = self.connection.lock() {
                    *guard = None;
                }
            }
        }
        result
    }
}

impl ObjectBus for SystemBus {
    fn list_requests(&self) -> Result<Vec<String>, BusError> {
        let result = self
            .call::<_, Vec<OwnedObjectPath>>(
                CERTMONGER_SERVICE,
                CERTMONGER_OBJECT,
                CERTMONGER_INTERFACE,
                "get_requests",
                &(),
            )
            .map(|paths| paths.iter().map(|p| p.as_str().to_string()).collect())
            .map_err(|e| classify(e, CERTMONGER_OBJECT, None));
        self.checked(result)
    }

    fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, BusError> {
        let result = self
            .call::<_, OwnedValue>(service, path, PROPERTIES_INTERFACE, "Get", &(interface, property))
            .map_err(|e| classify(e, path, Some(property)))
            .and_then(property_value);
        self.checked(result)
    }

    fn get_unit(&self, name: &str) -> Result<Option<String>, BusError> {
        let result = match self.call::<_, OwnedObjectPath>(
            SYSTEMD_SERVICE,
            SYSTEMD_MANAGER_OBJECT,
            SYSTEMD_MANAGER_INTERFACE,
            "GetUnit",
            &(name,),
        ) {
            Ok(path) => Ok(Some(path.as_str().to_string())),
            Err(zbus::Error::MethodError(error_name, _, _)) if error_name.as_str() == NO_SUCH_UNIT => {
                Ok(None)
            }
            Err(e) => Err(classify(e, SYSTEMD_MANAGER_OBJECT, None)),
        };
        self.checked(result)
    }
}

/// Error names that mean the bus or the peer is gone, not that one object
/// rejected the call.
const TRANSPORT_ERRORS: &[&str] = &[
    "org.freedesktop.DBus.Error.ServiceUnknown",
    "org.freedesktop.DBus.Error.NameHasNoOwner",
    "org.freedesktop.DBus.Error.NoReply",
    "org.freedesktop.DBus.Error.Timeout",
    "org.freedesktop.DBus.Error.TimedOut",
    "org.freedesktop.DBus.Error.Disconnected",
    "org.freedesktop.DBus.Error.NoServer",
    "org.freedesktop.DBus.Error.NoNetwork",
    "org.freedesktop.DBus.Error.LimitsExceeded",
];

fn classify(err: zbus::Error, path: &str, property: Option<&str>) -> BusError {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            classify_reply(name.as_str(), message.unwrap_or_default(), path, property)
        }
        zbus::Error::InvalidReply | zbus::Error::Variant(_) => BusError::InvalidReply {
            details: err.to_string(),
        },
        other => BusError::Transport {
            details: other.to_string(),
        },
    }
}

/// Maps an error reply from a live peer.
fn classify_reply(name: &str, message: String, path: &str, property: Option<&str>) -> BusError {
    match (name, property) {
        (name, _) if TRANSPORT_ERRORS.contains(&name) => BusError::Transport {
            details: format!("{}: {}", name, message),
        },
        ("org.freedesktop.DBus.Error.UnknownObject", _)
        | ("org.freedesktop.DBus.Error.UnknownMethod", _) => BusError::NoSuchObject {
            path: path.to_string(),
        },
        ("org.freedesktop.DBus.Error.UnknownProperty", Some(property))
        | ("org.freedesktop.DBus.Error.InvalidArgs", Some(property)) => BusError::NoSuchProperty {
            path: path.to_string(),
            property: property.to_string(),
        },
        _ => BusError::MethodFailed {
            path: path.to_string(),
            name: name.to_string(),
            message,
        },
    }
}

fn property_value(value: OwnedValue) -> Result<PropertyValue, BusError> {
    let converted = match &*value {
        Value::Str(s) => PropertyValue::Str(s.as_str().to_string()),
        Value::ObjectPath(p) => PropertyValue::Path(p.as_str().to_string()),
        Value::Bool(b) => PropertyValue::Bool(*b),
        Value::U8(n) => PropertyValue::Int(i64::from(*n)),
        Value::I16(n) => PropertyValue::Int(i64::from(*n)),
        Value::U16(n) => PropertyValue::Int(i64::from(*n)),
        Value::I32(n) => PropertyValue::Int(i64::from(*n)),
        Value::U32(n) => PropertyValue::Int(i64::from(*n)),
        Value::I64(n) => PropertyValue::Int(*n),
        Value::U64(n) => PropertyValue::Int(i64::try_from(*n).map_err(|_| {
            BusError::InvalidReply {
                details: format!("integer {} out of range", n),
            }
        })?),
        other => {
            return Err(BusError::InvalidReply {
                details: format!("unsupported property value {:?}", other),
            })
        }
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &str = "/org/fedorahosted/certmonger/requests/Request1";

    #[test]
    fn test_error_reply_from_live_peer_is_not_transport() {
        for name in [
            "org.freedesktop.DBus.Error.UnknownInterface",
            "org.freedesktop.DBus.Error.AccessDenied",
            "org.fedorahosted.certmonger.Error",
        ] {
            let err = classify_reply(name, "nope".to_string(), REQUEST, Some("ca"));
            assert!(!err.is_transport(), "{} classified as transport", name);
            assert!(matches!(err, BusError::MethodFailed { .. }));
        }
    }

    #[test]
    fn test_unreachable_peer_is_transport() {
        for name in [
            "org.freedesktop.DBus.Error.ServiceUnknown",
            "org.freedesktop.DBus.Error.NameHasNoOwner",
            "org.freedesktop.DBus.Error.NoReply",
            "org.freedesktop.DBus.Error.Disconnected",
        ] {
            assert!(classify_reply(name, String::new(), REQUEST, None).is_transport());
        }
    }

    #[test]
    fn test_missing_object_and_property() {
        assert_eq!(
            classify_reply("org.freedesktop.DBus.Error.UnknownObject", String::new(), REQUEST, None),
            BusError::NoSuchObject {
                path: REQUEST.to_string()
            }
        );
        assert_eq!(
            classify_reply(
                "org.freedesktop.DBus.Error.UnknownProperty",
                String::new(),
                REQUEST,
                Some("stuck")
            ),
            BusError::NoSuchProperty {
                path: REQUEST.to_string(),
                property: "stuck".to_string()
            }
        );
    }

    #[test]
    fn test_library_errors() {
        assert!(classify(zbus::Error::Failure("socket closed".to_string()), REQUEST, None).is_transport());
        assert!(matches!(
            classify(zbus::Error::InvalidReply, REQUEST, None),
            BusError::InvalidReply { .. }
        ));
    }
}

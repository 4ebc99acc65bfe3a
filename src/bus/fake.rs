use std::collections::HashMap;

use super::{ObjectBus, PropertyValue, CA_INTERFACE, CERTMONGER_SERVICE, REQUEST_INTERFACE};
use crate::error::BusError;

/// In-memory bus used in tests to script objects and failures.
#[derive(Default)]
pub(crate) struct FakeBus {
    requests: Vec<String>,
    properties: HashMap<(String, String, String), PropertyValue>,
    property_errors: HashMap<(String, String, String), BusError>,
    units: HashMap<String, String>,
    unit_error: Option<BusError>,
    list_error: Option<BusError>,
}

impl FakeBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_request(mut self, path: &str, props: &[(&str, PropertyValue)]) -> Self {
        self.requests.push(path.to_string());
        for (name, value) in props {
            self = self.with_property(path, REQUEST_INTERFACE, name, value.clone());
        }
        self
    }

    pub(crate) fn with_ca(self, path: &str, nickname: &str) -> Self {
        self.with_property(
            path,
            CA_INTERFACE,
            "nickname",
            PropertyValue::Str(nickname.to_string()),
        )
    }

    pub(crate) fn with_property(
        mut self,
        path: &str,
        interface: &str,
        name: &str,
        value: PropertyValue,
    ) -> Self {
        self.properties.insert(
            (path.to_string(), interface.to_string(), name.to_string()),
            value,
        );
        self
    }

    pub(crate) fn failing_property(
        mut self,
        path: &str,
        interface: &str,
        name: &str,
        err: BusError,
    ) -> Self {
        self.property_errors.insert(
            (path.to_string(), interface.to_string(), name.to_string()),
            err,
        );
        self
    }

    pub(crate) fn with_unit(mut self, name: &str, path: &str, file_state: &str) -> Self {
        self.units.insert(name.to_string(), path.to_string());
        self.with_property(
            path,
            super::SYSTEMD_UNIT_INTERFACE,
            "UnitFileState",
            PropertyValue::Str(file_state.to_string()),
        )
    }

    pub(crate) fn failing_units(mut self, err: BusError) -> Self {
        self.unit_error = Some(err);
        self
    }

    pub(crate) fn failing_requests(mut self, err: BusError) -> Self {
        self.list_error = Some(err);
        self
    }
}

impl ObjectBus for FakeBus {
    fn list_requests(&self) -> Result<Vec<String>, BusError> {
        match &self.list_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.requests.clone()),
        }
    }

    fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, BusError> {
        if service == CERTMONGER_SERVICE {
            if let Some(err) = &self.list_error {
                return Err(err.clone());
            }
        }
        let key = (path.to_string(), interface.to_string(), property.to_string());
        if let Some(err) = self.property_errors.get(&key) {
            return Err(err.clone());
        }
        self.properties
            .get(&key)
            .cloned()
            .ok_or_else(|| BusError::NoSuchProperty {
                path: path.to_string(),
                property: property.to_string(),
            })
    }

    fn get_unit(&self, name: &str) -> Result<Option<String>, BusError> {
        if let Some(err) = &self.unit_error {
            return Err(err.clone());
        }
        Ok(self.units.get(name).cloned())
    }
}

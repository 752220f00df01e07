//! Syntax checks for bus names, object paths, interfaces and members.
//!
//! The grammar is the standard message-bus one; the checks delegate to
//! `zbus::names` and `zbus::zvariant` so both sides agree on it.

use zbus::names::{BusName, InterfaceName, MemberName};
use zbus::zvariant::ObjectPath;

use crate::error::BusError;

fn invalid(what: &str, value: &str, err: impl std::fmt::Display) -> BusError {
    BusError::InvalidArgument(format!("invalid {} '{}': {}", what, value, err))
}

pub fn bus_name(name: &str) -> Result<(), BusError> {
    BusName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("bus name", name, e))
}

pub fn object_path(path: &str) -> Result<(), BusError> {
    ObjectPath::try_from(path)
        .map(drop)
        .map_err(|e| invalid("object path", path, e))
}

pub fn interface(name: &str) -> Result<(), BusError> {
    InterfaceName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("interface name", name, e))
}

pub fn member(name: &str) -> Result<(), BusError> {
    MemberName::try_from(name)
        .map(drop)
        .map_err(|e| invalid("member name", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_names() {
        assert!(bus_name("org.freedesktop.DBus").is_ok());
        assert!(bus_name(":1.42").is_ok());
        assert!(bus_name("").is_err());
        assert!(bus_name("no_dots").is_err());
        assert!(bus_name("org..double").is_err());
    }

    #[test]
    fn test_object_paths() {
        assert!(object_path("/").is_ok());
        assert!(object_path("/org/busloop/Echo").is_ok());
        assert!(object_path("relative/path").is_err());
        assert!(object_path("/trailing/").is_err());
        assert!(object_path("/has-dash").is_err());
    }

    #[test]
    fn test_interfaces_and_members() {
        assert!(interface("org.busloop.Echo").is_ok());
        assert!(interface("Echo").is_err());
        assert!(member("Echo").is_ok());
        assert!(member("with.dot").is_err());
    }

    #[test]
    fn test_error_message_names_the_value() {
        let err = object_path("bad").unwrap_err();
        assert!(err.to_string().contains("'bad'"));
    }
}

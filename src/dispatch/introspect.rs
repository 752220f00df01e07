//! Introspection XML synthesized from the handler table.

use std::fmt::Write;

use super::{DispatchError, Router};
use crate::codec::signature;
use crate::message::{INTROSPECTABLE, PEER};

const HEADER: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\
\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n\
<node>\n";

fn standard_interfaces() -> String {
    format!(
        "  <interface name=\"{INTROSPECTABLE}\">\n\
         \x20   <method name=\"Introspect\">\n\
         \x20     <arg name=\"xml_data\" type=\"s\" direction=\"out\"/>\n\
         \x20   </method>\n\
         \x20 </interface>\n\
         \x20 <interface name=\"{PEER}\">\n\
         \x20   <method name=\"Ping\"/>\n\
         \x20   <method name=\"GetMachineId\">\n\
         \x20     <arg name=\"machine_uuid\" type=\"s\" direction=\"out\"/>\n\
         \x20   </method>\n\
         \x20 </interface>\n"
    )
}

fn push_args(xml: &mut String, sig: Option<&str>, direction: &str) {
    let Some(sig) = sig else {
        return;
    };
    // Signatures are checked when handlers are registered.
    let types = signature::parse(sig).unwrap_or_default();
    for ty in types {
        let _ = writeln!(
            xml,
            "      <arg type=\"{}\" direction=\"{}\"/>",
            ty, direction
        );
    }
}

/// Describe the object at `path`: its registered interfaces, the standard
/// ones, and the next level of child nodes.
pub fn introspect(router: &Router, path: &str) -> Result<String, DispatchError> {
    let children = router.children(path);
    let interfaces = router.interfaces(path);
    if interfaces.is_none() && children.is_empty() {
        return Err(DispatchError::UnknownObject {
            path: path.to_string(),
        });
    }

    let mut xml = String::from(HEADER);
    for (interface, methods) in interfaces.into_iter().flatten() {
        let _ = writeln!(xml, "  <interface name=\"{}\">", interface);
        for (name, entry) in methods {
            let _ = writeln!(xml, "    <method name=\"{}\">", name);
            push_args(&mut xml, entry.input.as_deref(), "in");
            push_args(&mut xml, entry.output.as_deref(), "out");
            xml.push_str("    </method>\n");
        }
        xml.push_str("  </interface>\n");
    }

    xml.push_str(&standard_interfaces());

    for child in children {
        let _ = writeln!(xml, "  <node name=\"{}\"/>", child);
    }
    xml.push_str("</node>\n");
    Ok(xml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MethodEntry;

    fn entry() -> MethodEntry {
        MethodEntry::new(|_| async { Ok(vec![]) })
    }

    #[test]
    fn test_two_interfaces_no_children() {
        let mut router = Router::default();
        router.add_method(
            "/org/example",
            "org.example.A",
            "Len",
            entry().input("s").output("i"),
        );
        router.add_method("/org/example", "org.example.B", "Reset", entry());

        let xml = introspect(&router, "/org/example").unwrap();
        assert!(xml.starts_with("<!DOCTYPE node PUBLIC"));
        assert!(xml.contains("<interface name=\"org.example.A\">"));
        assert!(xml.contains("<interface name=\"org.example.B\">"));
        assert_eq!(xml.matches("direction=\"in\"").count(), 1);
        assert!(xml.contains("<arg type=\"s\" direction=\"in\"/>"));
        assert!(xml.contains("<arg type=\"i\" direction=\"out\"/>"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Introspectable\">"));
        assert!(xml.contains("<interface name=\"org.freedesktop.DBus.Peer\">"));
        assert!(!xml.contains("<node name="));
        assert!(xml.ends_with("</node>\n"));
    }

    #[test]
    fn test_one_arg_per_complete_type() {
        let mut router = Router::default();
        router.add_method("/a", "org.example.A", "M", entry().input("sa{sv}(ii)"));
        let xml = introspect(&router, "/a").unwrap();
        assert!(xml.contains("<arg type=\"a{sv}\" direction=\"in\"/>"));
        assert!(xml.contains("<arg type=\"(ii)\" direction=\"in\"/>"));
        assert_eq!(xml.matches("direction=\"in\"").count(), 3);
    }

    #[test]
    fn test_child_nodes() {
        let mut router = Router::default();
        router.add_method("/org/example", "org.example.A", "M", entry());
        router.add_method("/org/example/one", "org.example.A", "M", entry());
        router.add_method("/org/example/two/deep", "org.example.A", "M", entry());

        let xml = introspect(&router, "/org/example").unwrap();
        assert!(xml.contains("  <node name=\"one\"/>\n"));
        assert!(xml.contains("  <node name=\"two\"/>\n"));
        assert!(!xml.contains("deep"));

        // Intermediate paths list children only.
        let root = introspect(&router, "/").unwrap();
        assert!(root.contains("<node name=\"org\"/>"));
        assert!(!root.contains("org.example.A"));
    }

    #[test]
    fn test_unknown_path() {
        let router = Router::default();
        assert!(matches!(
            introspect(&router, "/nowhere"),
            Err(DispatchError::UnknownObject { .. })
        ));
    }
}

//! OVF environment documents
//!
//! The hypervisor injects guest properties as an XML document following the
//! DMTF OVF environment schema:
//!
//! ```xml
//! <Environment xmlns:oe="http://schemas.dmtf.org/ovf/environment/1">
//!   <PropertySection>
//!     <Property oe:key="instance-id" oe:value="iid-1"/>
//!   </PropertySection>
//! </Environment>
//! ```

use crate::network::NetworkConfig;
use crate::{DatasourceError, Metadata};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

/// Namespace of the `key`/`value` attributes on `Property` elements
pub const OVF_ENV_NAMESPACE: &str = "http://schemas.dmtf.org/ovf/environment/1";

/// File names an OVF environment may be stored under, in lookup order
pub const OVF_ENV_FILENAMES: [&str; 4] = ["ovf-env.xml", "ovf_env.xml", "OVF_ENV.XML", "OVF-ENV.XML"];

const METADATA_PROPS: [&str; 4] = ["seedfrom", "local-hostname", "public-keys", "instance-id"];
const CONFIG_PROPS: [&str; 1] = ["password"];
const NETWORK_PROP: &str = "network-config";

/// Data extracted from an OVF environment
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OvfEnvironment {
    pub metadata: Metadata,
    pub userdata: Option<Vec<u8>>,
    pub config: Metadata,
}

impl OvfEnvironment {
    /// The embedded network configuration, when one was extracted
    pub fn network_config(&self) -> Option<NetworkConfig> {
        match self.metadata.get(NETWORK_PROP) {
            Some(Value::Null) | None => None,
            Some(value) => Some(NetworkConfig::Document(value.clone())),
        }
    }
}

#[derive(PartialEq)]
enum SectionState {
    NotSeen,
    Inside,
    Done,
}

/// Extract the properties of the first `PropertySection` of the document
pub fn properties(contents: &str) -> Result<BTreeMap<String, String>, DatasourceError> {
    let mut reader = Reader::from_str(contents);
    reader.config_mut().trim_text(true);

    // In-scope `xmlns:prefix` declarations, one frame per open element
    let mut scopes: Vec<Vec<(Vec<u8>, String)>> = Vec::new();
    let mut depth = 0usize;
    let mut root_seen = false;
    let mut root_has_children = false;
    let mut section = SectionState::NotSeen;
    let mut props = BTreeMap::new();

    loop {
        let event = reader.read_event().map_err(malformed)?;
        let (element, is_empty) = match event {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::End(_) => {
                scopes.pop();
                depth = depth.saturating_sub(1);
                if depth == 1 && section == SectionState::Inside {
                    section = SectionState::Done;
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        scopes.push(namespace_declarations(&element)?);
        let local_name = element.local_name();
        let local_name = local_name.as_ref();

        match depth {
            0 => {
                if root_seen || local_name != b"Environment" {
                    return Err(DatasourceError::MalformedDocument("No Environment Node".into()));
                }
                root_seen = true;
            }
            1 => {
                root_has_children = true;
                if local_name == b"PropertySection" && section == SectionState::NotSeen {
                    section = if is_empty {
                        SectionState::Done
                    } else {
                        SectionState::Inside
                    };
                }
            }
            2 if section == SectionState::Inside && local_name == b"Property" => {
                let (key, value) = property_attributes(&element, &scopes)?;
                props.insert(key, value);
            }
            _ => {}
        }

        if is_empty {
            scopes.pop();
        } else {
            depth += 1;
        }
    }

    if !root_seen {
        return Err(DatasourceError::MalformedDocument("No Environment Node".into()));
    }
    if !root_has_children {
        return Err(DatasourceError::MalformedDocument("No Child Nodes".into()));
    }
    if section == SectionState::NotSeen {
        return Err(DatasourceError::MalformedDocument("No 'PropertySection's".into()));
    }

    Ok(props)
}

fn malformed(err: impl std::fmt::Display) -> DatasourceError {
    DatasourceError::MalformedDocument(err.to_string())
}

fn namespace_declarations(element: &BytesStart<'_>) -> Result<Vec<(Vec<u8>, String)>, DatasourceError> {
    let mut decls = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(malformed)?;
        if let Some(prefix) = attr.key.as_ref().strip_prefix(b"xmlns:") {
            let uri = attr.unescape_value().map_err(malformed)?;
            decls.push((prefix.to_vec(), uri.into_owned()));
        }
    }
    Ok(decls)
}

fn resolve_prefix<'a>(prefix: &[u8], scopes: &'a [Vec<(Vec<u8>, String)>]) -> Option<&'a str> {
    scopes
        .iter()
        .rev()
        .flat_map(|frame| frame.iter())
        .find(|(p, _)| p.as_slice() == prefix)
        .map(|(_, uri)| uri.as_str())
}

fn property_attributes(
    element: &BytesStart<'_>,
    scopes: &[Vec<(Vec<u8>, String)>],
) -> Result<(String, String), DatasourceError> {
    let mut key = None;
    let mut value = None;
    let mut bare_key = None;
    let mut bare_value = None;

    for attr in element.attributes() {
        let attr = attr.map_err(malformed)?;
        let name = attr.key.as_ref();
        let (prefix, local) = match name.iter().position(|&b| b == b':') {
            Some(idx) => (Some(&name[..idx]), &name[idx + 1..]),
            None => (None, name),
        };
        let text = attr.unescape_value().map_err(malformed)?.into_owned();

        match prefix {
            Some(b"xmlns") => {}
            Some(p) if resolve_prefix(p, scopes) == Some(OVF_ENV_NAMESPACE) => match local {
                b"key" => key = Some(text),
                b"value" => value = Some(text),
                _ => {}
            },
            Some(_) => {}
            None => match local {
                b"key" => bare_key = Some(text),
                b"value" => bare_value = Some(text),
                _ => {}
            },
        }
    }

    match (key.or(bare_key), value.or(bare_value)) {
        (Some(k), Some(v)) => Ok((k, v)),
        _ => Err(DatasourceError::MalformedDocument(
            "Property without key or value".into(),
        )),
    }
}

/// Split OVF properties into metadata, config and user-data
pub fn read_ovf_environment(
    contents: &str,
    read_network: bool,
) -> Result<OvfEnvironment, DatasourceError> {
    let props = properties(contents)?;
    let mut env = OvfEnvironment::default();

    for (prop, val) in props {
        let prop = if prop == "hostname" {
            "local-hostname".to_string()
        } else {
            prop
        };

        if METADATA_PROPS.contains(&prop.as_str()) {
            env.metadata.insert(prop, Value::String(val));
        } else if CONFIG_PROPS.contains(&prop.as_str()) {
            env.config.insert(prop, Value::String(val));
        } else if prop == NETWORK_PROP && read_network {
            match decode_network_config(&val) {
                Ok(Some(network)) => {
                    env.metadata.insert(prop, network);
                }
                Ok(None) => {}
                Err(e) => debug!("Ignore network-config in wrong format: {}", e),
            }
        } else if prop == "user-data" {
            env.userdata = Some(decode_base64(&val).unwrap_or_else(|_| val.into_bytes()));
        }
    }

    Ok(env)
}

/// Base64 that may have been line-wrapped. Attribute value normalisation
/// turns the line breaks into spaces, so all ASCII whitespace is dropped.
fn decode_base64(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = encoded.split_ascii_whitespace().collect();
    STANDARD.decode(compact.as_bytes())
}

/// Decode a base64 `network-config` property and return its `network` key
fn decode_network_config(encoded: &str) -> Result<Option<Value>, DatasourceError> {
    let decoded =
        decode_base64(encoded).map_err(|e| DatasourceError::ParseFailure(e.to_string()))?;
    let text = String::from_utf8(decoded).map_err(|e| DatasourceError::ParseFailure(e.to_string()))?;
    if text.trim().is_empty() {
        return Ok(None);
    }
    let doc: Value = serde_yaml::from_str(&text)?;
    Ok(doc.get("network").filter(|v| !v.is_null()).cloned())
}

/// Find the first OVF environment file in `dir`, returning its file name and
/// contents
pub async fn find_ovf_env(dir: &Path) -> Option<(String, String)> {
    for name in OVF_ENV_FILENAMES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        match fs::read_to_string(&path).await {
            Ok(contents) => return Some((name.to_string(), contents)),
            Err(e) => warn!("Failed loading ovf file {}: {}", path.display(), e),
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env_xml(props: &[(&str, &str)]) -> String {
        let mut xml = String::from(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Environment xmlns="http://schemas.dmtf.org/ovf/environment/1"
             xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
             oe:id="">
  <PlatformSection>
    <Kind>VMware ESXi</Kind>
  </PlatformSection>
  <PropertySection>
"#,
        );
        for (k, v) in props {
            xml.push_str(&format!("    <Property oe:key=\"{}\" oe:value=\"{}\"/>\n", k, v));
        }
        xml.push_str("  </PropertySection>\n</Environment>\n");
        xml
    }

    #[test]
    fn test_properties() {
        let xml = env_xml(&[("instance-id", "iid-1"), ("hostname", "host1")]);
        let props = properties(&xml).unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props["instance-id"], "iid-1");
        assert_eq!(props["hostname"], "host1");
    }

    #[test]
    fn test_missing_property_section() {
        let xml = r#"<Environment xmlns:oe="http://schemas.dmtf.org/ovf/environment/1">
  <PlatformSection><Kind>VMware</Kind></PlatformSection>
</Environment>"#;
        let err = properties(xml).unwrap_err();
        assert!(matches!(err, DatasourceError::MalformedDocument(ref m) if m.contains("PropertySection")));
    }

    #[test]
    fn test_wrong_root() {
        let err = properties("<Envelope><PropertySection/></Envelope>").unwrap_err();
        assert!(matches!(err, DatasourceError::MalformedDocument(_)));
    }

    #[test]
    fn test_no_children() {
        let err = properties("<Environment/>").unwrap_err();
        assert!(matches!(err, DatasourceError::MalformedDocument(ref m) if m == "No Child Nodes"));
    }

    #[test]
    fn test_only_first_section_and_direct_children() {
        let xml = r#"<Environment xmlns:x="http://schemas.dmtf.org/ovf/environment/1">
  <PropertySection>
    <Property x:key="a" x:value="1"/>
    <Nested><Property x:key="b" x:value="2"/></Nested>
  </PropertySection>
  <PropertySection>
    <Property x:key="c" x:value="3"/>
  </PropertySection>
</Environment>"#;
        let props = properties(xml).unwrap();
        assert_eq!(props.len(), 1);
        assert_eq!(props["a"], "1");
    }

    #[test]
    fn test_foreign_namespace_is_not_a_key() {
        let xml = r#"<Environment xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
             xmlns:ve="http://www.vmware.com/schema/ovfenv">
  <PropertySection>
    <Property ve:key="wrong" oe:key="right" oe:value="v"/>
  </PropertySection>
</Environment>"#;
        let props = properties(xml).unwrap();
        assert_eq!(props["right"], "v");
        assert!(!props.contains_key("wrong"));
    }

    #[test]
    fn test_read_ovf_environment_buckets() {
        let ud = STANDARD.encode("#cloud-config\nhostname: x\n");
        let xml = env_xml(&[
            ("hostname", "host1"),
            ("instance-id", "iid-1"),
            ("password", "secret"),
            ("seedfrom", "/var/seed/"),
            ("user-data", &ud),
            ("unrelated", "ignored"),
        ]);

        let env = read_ovf_environment(&xml, false).unwrap();
        assert_eq!(env.metadata["local-hostname"], Value::String("host1".into()));
        assert_eq!(env.metadata["instance-id"], Value::String("iid-1".into()));
        assert_eq!(env.metadata["seedfrom"], Value::String("/var/seed/".into()));
        assert_eq!(env.config["password"], Value::String("secret".into()));
        assert_eq!(env.userdata.as_deref(), Some(&b"#cloud-config\nhostname: x\n"[..]));
        assert!(!env.metadata.contains_key("unrelated"));
    }

    #[test]
    fn test_raw_userdata_when_not_base64() {
        let xml = env_xml(&[("user-data", "not base64!")]);
        let env = read_ovf_environment(&xml, false).unwrap();
        assert_eq!(env.userdata.as_deref(), Some(&b"not base64!"[..]));
    }

    #[test]
    fn test_network_config_round_trip() {
        let doc = "network:\n  version: 2\n  ethernets:\n    nics:\n      match:\n        name: ens*\n      dhcp4: yes\n";
        let xml = env_xml(&[("network-config", &STANDARD.encode(doc))]);

        let env = read_ovf_environment(&xml, true).unwrap();
        let original: Value = serde_yaml::from_str(doc).unwrap();
        assert_eq!(
            env.network_config(),
            Some(NetworkConfig::Document(original["network"].clone()))
        );

        // Without network extraction the property is dropped
        let env = read_ovf_environment(&xml, false).unwrap();
        assert!(env.network_config().is_none());
    }

    #[test]
    fn test_wrapped_base64_properties() {
        let lines = "  - echo one line of user data\n".repeat(4);
        let ud = STANDARD.encode(format!("#cloud-config\nruncmd:\n{}", lines));
        let (head, tail) = ud.split_at(76);
        let wrapped_ud = format!("{} {}", head, tail);

        let doc = STANDARD
            .encode("network:\n  version: 2\n  ethernets:\n    nics:\n      dhcp4: true\n");
        let (head, tail) = doc.split_at(40);
        let wrapped_doc = format!("{}\t {}", head, tail);

        let xml = env_xml(&[("user-data", &wrapped_ud), ("network-config", &wrapped_doc)]);
        let env = read_ovf_environment(&xml, true).unwrap();

        let userdata = String::from_utf8(env.userdata.clone().unwrap()).unwrap();
        assert!(userdata.starts_with("#cloud-config\nruncmd:"));
        let Some(NetworkConfig::Document(network)) = env.network_config() else {
            panic!("expected network document");
        };
        assert_eq!(network["version"], Value::from(2));
    }

    #[test]
    fn test_bad_network_config_is_ignored() {
        let xml = env_xml(&[("network-config", "%%%"), ("instance-id", "iid-2")]);
        let env = read_ovf_environment(&xml, true).unwrap();
        assert!(env.network_config().is_none());
        assert_eq!(env.metadata["instance-id"], Value::String("iid-2".into()));
    }

    #[tokio::test]
    async fn test_find_ovf_env_order() {
        let temp = TempDir::new().unwrap();
        assert!(find_ovf_env(temp.path()).await.is_none());

        std::fs::write(temp.path().join("OVF-ENV.XML"), "upper").unwrap();
        std::fs::write(temp.path().join("ovf_env.xml"), "underscore").unwrap();

        let (name, contents) = find_ovf_env(temp.path()).await.unwrap();
        assert_eq!(name, "ovf_env.xml");
        assert_eq!(contents, "underscore");
    }
}

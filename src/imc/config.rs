//! Typed view of a VMware customization config

use super::config_file::ConfigFile;
use crate::DatasourceError;

const HOSTNAME: &str = "NETWORK|HOSTNAME";
const DOMAINNAME: &str = "NETWORK|DOMAINNAME";
const TIMEZONE: &str = "DATETIME|TIMEZONE";
const UTC: &str = "DATETIME|UTC";
const LOCALE: &str = "DATETIME|LOCALE";
const PASS: &str = "PASSWORD|-PASS";
const RESETPASS: &str = "PASSWORD|RESET";
const MARKERID: &str = "MISC|MARKER-ID";
const DEFAULT_RUN_POST_SCRIPT: &str = "MISC|DEFAULT-RUN-POST-CUST-SCRIPT";
const POST_GC_STATUS: &str = "MISC|POST-GC-STATUS";
const CUSTOM_SCRIPT: &str = "CUSTOM-SCRIPT|SCRIPT-NAME";
const CLOUDINIT_META_DATA: &str = "CLOUDINIT|METADATA";
const CLOUDINIT_USER_DATA: &str = "CLOUDINIT|USERDATA";
const NICS: &str = "NIC-CONFIG|NICS";
const DNS_NAMESERVER: &str = "DNS|NAMESERVER|";
const DNS_SUFFIX: &str = "DNS|SUFFIX|";

/// Static IPv4 settings of a NIC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticIpv4 {
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateways: Vec<String>,
}

/// One static IPv6 address of a NIC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticIpv6 {
    pub ip: String,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
}

/// One `[NICn]` section
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NicDescriptor {
    /// Section name, e.g. `NIC1`
    pub name: String,
    /// Lower-cased MAC address
    pub mac: String,
    pub primary: bool,
    pub onboot: bool,
    pub bootproto: Option<String>,
    pub ipv4_mode: Option<String>,
    pub ipv4: StaticIpv4,
    pub ipv6: Vec<StaticIpv6>,
}

impl NicDescriptor {
    fn from_config_file(cf: &ConfigFile, name: &str) -> Result<Self, DatasourceError> {
        let key = |k: &str| format!("{}|{}", name, k);
        let get = |k: &str| cf.get(&key(k)).filter(|v| !v.is_empty()).map(String::from);

        let mac = get("MACADDR")
            .ok_or_else(|| {
                DatasourceError::ParseFailure(format!("{} has no MACADDR", name))
            })?
            .to_lowercase();

        let gateways = get("GATEWAY")
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let ipv6_count = cf.count_with_prefix(&key("IPv6ADDR|"));
        let mut ipv6 = Vec::with_capacity(ipv6_count);
        for i in 1..=ipv6_count {
            if let Some(ip) = get(&format!("IPv6ADDR|{}", i)) {
                ipv6.push(StaticIpv6 {
                    ip,
                    netmask: get(&format!("IPv6NETMASK|{}", i)),
                    gateway: get(&format!("IPv6GATEWAY|{}", i)),
                });
            }
        }

        Ok(Self {
            name: name.to_string(),
            mac,
            primary: is_true(get("PRIMARY").as_deref()),
            onboot: is_true(get("ONBOOT").as_deref()),
            bootproto: get("BOOTPROTO").map(|b| b.to_lowercase()),
            ipv4_mode: get("IPv4_MODE").map(|m| m.to_lowercase()),
            ipv4: StaticIpv4 {
                ip: get("IPADDR"),
                netmask: get("NETMASK"),
                gateways,
            },
            ipv6,
        })
    }

    /// Static IPv4 addressing requested
    pub fn is_static(&self) -> bool {
        self.bootproto.as_deref() == Some("static")
    }
}

fn is_true(value: Option<&str>) -> bool {
    matches!(
        value.map(str::to_lowercase).as_deref(),
        Some("yes") | Some("true")
    )
}

/// Parsed customization config. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomizationConfig {
    pub host_name: Option<String>,
    pub domain_name: Option<String>,
    pub timezone: Option<String>,
    pub utc: Option<String>,
    pub locale: Option<String>,
    pub admin_password: Option<String>,
    pub reset_password: bool,
    pub marker_id: Option<String>,
    pub custom_script_name: Option<String>,
    pub default_run_post_script: bool,
    pub post_gc_status: bool,
    pub meta_data_name: Option<String>,
    pub user_data_name: Option<String>,
    pub nics: Vec<NicDescriptor>,
    pub name_servers: Vec<String>,
    pub dns_suffixes: Vec<String>,
}

impl CustomizationConfig {
    pub fn from_config_file(cf: &ConfigFile) -> Result<Self, DatasourceError> {
        let get = |k: &str| cf.get(k).filter(|v| !v.is_empty()).map(String::from);

        let nics = match get(NICS) {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|name| NicDescriptor::from_config_file(cf, name))
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        Ok(Self {
            host_name: get(HOSTNAME),
            domain_name: get(DOMAINNAME),
            timezone: get(TIMEZONE),
            utc: get(UTC),
            locale: get(LOCALE),
            admin_password: get(PASS),
            reset_password: yes_no(cf, RESETPASS)?,
            marker_id: get(MARKERID),
            custom_script_name: get(CUSTOM_SCRIPT),
            default_run_post_script: yes_no(cf, DEFAULT_RUN_POST_SCRIPT)?,
            post_gc_status: yes_no(cf, POST_GC_STATUS)?,
            meta_data_name: get(CLOUDINIT_META_DATA),
            user_data_name: get(CLOUDINIT_USER_DATA),
            nics,
            name_servers: numbered(cf, DNS_NAMESERVER),
            dns_suffixes: numbered(cf, DNS_SUFFIX),
        })
    }

    /// Parse `cust.cfg` contents directly
    pub fn parse(content: &str) -> Result<Self, DatasourceError> {
        Self::from_config_file(&ConfigFile::parse(content)?)
    }

    /// `host[.domain]`, if a host name is set
    pub fn fqdn(&self) -> Option<String> {
        let host = self.host_name.as_deref()?;
        Some(match self.domain_name.as_deref() {
            Some(domain) => format!("{}.{}", host, domain),
            None => host.to_string(),
        })
    }
}

/// `yes`/`no` flag, `no` when absent
fn yes_no(cf: &ConfigFile, key: &str) -> Result<bool, DatasourceError> {
    match cf.get(key).map(str::to_lowercase).as_deref() {
        None | Some("") | Some("no") => Ok(false),
        Some("yes") => Ok(true),
        Some(other) => Err(DatasourceError::ParseFailure(format!(
            "'{}' should be 'yes' or 'no', got '{}'",
            key, other
        ))),
    }
}

/// Values of `prefix1`, `prefix2`, ... in order
fn numbered(cf: &ConfigFile, prefix: &str) -> Vec<String> {
    (1..=cf.count_with_prefix(prefix))
        .filter_map(|i| cf.get(&format!("{}{}", prefix, i)))
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect()
}

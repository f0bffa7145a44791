//! Translate IMC NIC descriptors into network config v1

use super::config::NicDescriptor;
use crate::DatasourceError;
use crate::network::SystemDevices;
use crate::network::v1::{
    netmask_to_prefix, ConfigItem, NetworkConfigV1, PhysicalConfig, RouteConfigV1, SubnetConfig,
};
use crate::state::OvfPaths;
use std::net::Ipv4Addr;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Metric for routes derived from gateways of non-primary NICs
const NON_PRIMARY_ROUTE_METRIC: u32 = 10000;

const INTERFACES_HEADER: &str =
    "# DO NOT EDIT THIS FILE BY HAND -- AUTOMATICALLY GENERATED BY cloud-init";

/// Builds the network configuration for a set of customization NICs
#[derive(Debug, Clone)]
pub struct NicConfigurator {
    nics: Vec<NicDescriptor>,
    system_devices: Option<SystemDevices>,
    has_primary: bool,
}

impl NicConfigurator {
    /// With `system_devices`, NICs are matched to devices by MAC. Without,
    /// each NIC keeps its section name as device name.
    pub fn new(
        nics: Vec<NicDescriptor>,
        system_devices: Option<SystemDevices>,
    ) -> Result<Self, DatasourceError> {
        let primaries: Vec<&str> = nics
            .iter()
            .filter(|n| n.primary)
            .map(|n| n.name.as_str())
            .collect();
        if primaries.len() > 1 {
            return Err(DatasourceError::ParseFailure(format!(
                "There can only be one primary nic, found: {}",
                primaries.join(", ")
            )));
        }

        Ok(Self {
            has_primary: !primaries.is_empty(),
            nics,
            system_devices,
        })
    }

    /// One `physical` record per NIC
    pub fn generate(&self) -> Result<Vec<ConfigItem>, DatasourceError> {
        self.nics.iter().map(|nic| self.gen_one_nic(nic)).collect()
    }

    /// Records wrapped as a version 1 document with a trailing nameserver entry
    pub fn network_config(
        &self,
        nameservers: &[String],
        search: &[String],
    ) -> Result<NetworkConfigV1, DatasourceError> {
        Ok(NetworkConfigV1::from_records(
            self.generate()?,
            nameservers,
            search,
        ))
    }

    fn device_name(&self, nic: &NicDescriptor) -> Result<String, DatasourceError> {
        match &self.system_devices {
            Some(devices) => devices.get(&nic.mac).cloned().ok_or_else(|| {
                DatasourceError::ParseFailure(format!(
                    "No known device has MACADDR: {}",
                    nic.mac
                ))
            }),
            None => Ok(nic.name.clone()),
        }
    }

    fn gen_one_nic(&self, nic: &NicDescriptor) -> Result<ConfigItem, DatasourceError> {
        let name = self.device_name(nic)?;
        debug!("Configuring {} ({})", name, nic.mac);

        let mut subnets = vec![self.gen_ipv4(nic)?];
        subnets.extend(gen_ipv6(nic));

        Ok(ConfigItem::Physical(PhysicalConfig {
            name,
            mac_address: Some(nic.mac.clone()),
            subnets,
        }))
    }

    fn gen_ipv4(&self, nic: &NicDescriptor) -> Result<SubnetConfig, DatasourceError> {
        let mut subnet = SubnetConfig {
            control: nic.onboot.then(|| "auto".to_string()),
            ..Default::default()
        };

        if nic.ipv4_mode.as_deref() == Some("disabled") {
            subnet.subnet_type = "manual".to_string();
            return Ok(subnet);
        }

        if !nic.is_static() {
            subnet.subnet_type = "dhcp".to_string();
            return Ok(subnet);
        }

        subnet.subnet_type = "static".to_string();
        subnet.address = nic.ipv4.ip.clone();
        subnet.netmask = nic.ipv4.netmask.clone();

        if nic.primary {
            subnet.gateway = nic.ipv4.gateways.first().cloned();
        } else if !self.has_primary {
            subnet.routes = gen_ipv4_routes(nic)?;
        }

        Ok(subnet)
    }
}

/// Routes for gateways of a NIC when no NIC is marked primary
fn gen_ipv4_routes(nic: &NicDescriptor) -> Result<Vec<RouteConfigV1>, DatasourceError> {
    let Some(netmask) = nic.ipv4.netmask.as_deref() else {
        return Ok(Vec::new());
    };
    let prefix = netmask_to_prefix(netmask)?;

    let routes = nic
        .ipv4
        .gateways
        .iter()
        .filter_map(|gateway| {
            let Ok(addr) = gateway.parse::<Ipv4Addr>() else {
                warn!("Ignoring invalid gateway '{}' on {}", gateway, nic.name);
                return None;
            };
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix)).unwrap_or(0);
            let network = Ipv4Addr::from(u32::from(addr) & mask);
            Some(RouteConfigV1 {
                destination: Some(format!("{}/{}", network, prefix)),
                gateway: Some(gateway.clone()),
                metric: Some(NON_PRIMARY_ROUTE_METRIC),
            })
        })
        .collect();
    Ok(routes)
}

fn gen_ipv6(nic: &NicDescriptor) -> Vec<SubnetConfig> {
    nic.ipv6
        .iter()
        .map(|addr| SubnetConfig {
            subnet_type: "static6".to_string(),
            address: Some(addr.ip.clone()),
            netmask: addr.netmask.clone(),
            gateway: addr.gateway.clone(),
            ..Default::default()
        })
        .collect()
}

/// Prepare the guest's own network configuration for the new NICs.
///
/// Only Debian-family guests need this: the stock `interfaces` file is kept
/// once as `interfaces.before_vmware_customization` and replaced with one
/// that sources `interfaces.d`, then stale DHCP state is cleared.
pub async fn configure(os_family: Option<&str>, paths: &OvfPaths) -> Result<(), DatasourceError> {
    if os_family != Some("debian") {
        info!("Debian OS not detected. Skipping the configure step");
        return Ok(());
    }

    let dir = paths.etc_network();
    let interfaces = dir.join("interfaces");
    let original = dir.join("interfaces.before_vmware_customization");

    if !fs::try_exists(&original).await? && fs::try_exists(&interfaces).await? {
        fs::rename(&interfaces, &original).await?;
    }

    fs::create_dir_all(&dir).await?;
    let content = [
        INTERFACES_HEADER,
        "source /etc/network/interfaces.d/*",
        "source-directory /etc/network/interfaces.d",
    ]
    .join("\n");
    fs::write(&interfaces, content).await?;

    clear_dhcp(paths).await
}

async fn clear_dhcp(paths: &OvfPaths) -> Result<(), DatasourceError> {
    info!("Clearing DHCP leases");

    // pkill exits 1 when nothing matched
    match Command::new("pkill").arg("dhclient").output().await {
        Ok(out) if matches!(out.status.code(), Some(0) | Some(1)) => {}
        Ok(out) => warn!("pkill dhclient exited with {:?}", out.status.code()),
        Err(e) => warn!("Failed to run pkill: {}", e),
    }

    let lease_dir = paths.dhcp_lease_dir();
    let mut entries = match fs::read_dir(&lease_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            debug!("Removing lease file {}", entry.path().display());
            fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imc::config::{CustomizationConfig, StaticIpv4, StaticIpv6};
    use tempfile::TempDir;

    fn nic(name: &str, mac: &str) -> NicDescriptor {
        NicDescriptor {
            name: name.into(),
            mac: mac.into(),
            onboot: true,
            bootproto: Some("dhcp".into()),
            ..Default::default()
        }
    }

    fn static_nic(name: &str, mac: &str, primary: bool) -> NicDescriptor {
        NicDescriptor {
            primary,
            bootproto: Some("static".into()),
            ipv4: StaticIpv4 {
                ip: Some("10.20.87.154".into()),
                netmask: Some("255.255.252.0".into()),
                gateways: vec!["10.20.87.253".into(), "10.20.87.105".into()],
            },
            ..nic(name, mac)
        }
    }

    fn physical(item: &ConfigItem) -> &PhysicalConfig {
        match item {
            ConfigItem::Physical(p) => p,
            other => panic!("expected physical record, got {:?}", other),
        }
    }

    #[test]
    fn test_dhcp_nic_by_section_name() {
        let conf = NicConfigurator::new(vec![nic("NIC1", "00:50:56:a6:8c:08")], None).unwrap();
        let records = conf.generate().unwrap();
        let p = physical(&records[0]);
        assert_eq!(p.name, "NIC1");
        assert_eq!(p.mac_address.as_deref(), Some("00:50:56:a6:8c:08"));
        assert_eq!(p.subnets.len(), 1);
        assert_eq!(p.subnets[0].subnet_type, "dhcp");
        assert_eq!(p.subnets[0].control.as_deref(), Some("auto"));
    }

    #[test]
    fn test_device_name_from_system_devices() {
        let devices = SystemDevices::from([("00:50:56:a6:8c:08".to_string(), "ens192".to_string())]);
        let conf =
            NicConfigurator::new(vec![nic("NIC1", "00:50:56:a6:8c:08")], Some(devices)).unwrap();
        assert_eq!(physical(&conf.generate().unwrap()[0]).name, "ens192");
    }

    #[test]
    fn test_unknown_mac_fails() {
        let conf =
            NicConfigurator::new(vec![nic("NIC1", "00:50:56:a6:8c:08")], Some(SystemDevices::new()))
                .unwrap();
        assert!(conf.generate().is_err());
    }

    #[test]
    fn test_two_primary_nics_fail() {
        let nics = vec![
            static_nic("NIC1", "00:50:56:a6:8c:08", true),
            static_nic("NIC2", "00:50:56:a6:5a:de", true),
        ];
        assert!(NicConfigurator::new(nics, None).is_err());
    }

    #[test]
    fn test_primary_static_nic_gets_gateway() {
        let conf =
            NicConfigurator::new(vec![static_nic("NIC1", "00:50:56:a6:8c:08", true)], None).unwrap();
        let records = conf.generate().unwrap();
        let subnet = &physical(&records[0]).subnets[0];
        assert_eq!(subnet.subnet_type, "static");
        assert_eq!(subnet.address.as_deref(), Some("10.20.87.154"));
        assert_eq!(subnet.netmask.as_deref(), Some("255.255.252.0"));
        assert_eq!(subnet.gateway.as_deref(), Some("10.20.87.253"));
        assert!(subnet.routes.is_empty());
    }

    #[test]
    fn test_gateways_become_routes_without_primary() {
        let conf =
            NicConfigurator::new(vec![static_nic("NIC1", "00:50:56:a6:8c:08", false)], None)
                .unwrap();
        let records = conf.generate().unwrap();
        let subnet = &physical(&records[0]).subnets[0];
        assert!(subnet.gateway.is_none());
        assert_eq!(
            subnet.routes,
            vec![
                RouteConfigV1 {
                    destination: Some("10.20.84.0/22".into()),
                    gateway: Some("10.20.87.253".into()),
                    metric: Some(10000),
                },
                RouteConfigV1 {
                    destination: Some("10.20.84.0/22".into()),
                    gateway: Some("10.20.87.105".into()),
                    metric: Some(10000),
                },
            ]
        );
    }

    #[test]
    fn test_bad_netmask_fails_route_generation() {
        let mut n = static_nic("NIC1", "00:50:56:a6:8c:08", false);
        n.ipv4.netmask = Some("64".into());
        let err = NicConfigurator::new(vec![n], None).unwrap().generate().unwrap_err();
        assert!(matches!(err, DatasourceError::ParseFailure(ref m) if m.contains("'64'")));
    }

    #[test]
    fn test_non_primary_nic_next_to_primary_has_no_routes() {
        let nics = vec![
            static_nic("NIC1", "00:50:56:a6:8c:08", true),
            static_nic("NIC2", "00:50:56:a6:5a:de", false),
        ];
        let records = NicConfigurator::new(nics, None).unwrap().generate().unwrap();
        let subnet = &physical(&records[1]).subnets[0];
        assert!(subnet.gateway.is_none());
        assert!(subnet.routes.is_empty());
    }

    #[test]
    fn test_ipv4_disabled_is_manual() {
        let mut n = static_nic("NIC1", "00:50:56:a6:8c:08", true);
        n.ipv4_mode = Some("disabled".into());
        n.onboot = false;
        let records = NicConfigurator::new(vec![n], None).unwrap().generate().unwrap();
        let subnet = &physical(&records[0]).subnets[0];
        assert_eq!(subnet.subnet_type, "manual");
        assert!(subnet.control.is_none());
        assert!(subnet.address.is_none());
    }

    #[test]
    fn test_ipv6_subnets() {
        let mut n = nic("NIC1", "00:50:56:a6:8c:08");
        n.ipv6 = vec![
            StaticIpv6 {
                ip: "fc00:10:20:87::154".into(),
                netmask: Some("64".into()),
                gateway: Some("fc00:10:20:87::253".into()),
            },
            StaticIpv6 {
                ip: "fc00:10:20:88::154".into(),
                netmask: Some("64".into()),
                gateway: None,
            },
        ];
        let records = NicConfigurator::new(vec![n], None).unwrap().generate().unwrap();
        let subnets = &physical(&records[0]).subnets;
        assert_eq!(subnets.len(), 3);
        assert_eq!(subnets[1].subnet_type, "static6");
        assert_eq!(subnets[1].gateway.as_deref(), Some("fc00:10:20:87::253"));
        assert_eq!(subnets[2].address.as_deref(), Some("fc00:10:20:88::154"));
        assert!(subnets[2].gateway.is_none());
    }

    #[test]
    fn test_network_config_from_parsed_file() {
        let conf = CustomizationConfig::parse(
            "[NIC-CONFIG]\nNICS = NIC1\n[NIC1]\nMACADDR = 00:50:56:a6:8c:08\nBOOTPROTO = dhcp\n[DNS]\nNAMESERVER|1 = 10.20.145.1\n",
        )
        .unwrap();
        let doc = NicConfigurator::new(conf.nics.clone(), None)
            .unwrap()
            .network_config(&conf.name_servers, &conf.dns_suffixes)
            .unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.config.len(), 2);
        assert!(matches!(doc.config[1], ConfigItem::Nameserver(_)));
    }

    #[tokio::test]
    async fn test_configure_skips_other_families() {
        let tmp = TempDir::new().unwrap();
        let paths = OvfPaths::with_root(tmp.path());
        configure(Some("redhat"), &paths).await.unwrap();
        assert!(!paths.etc_network().exists());
    }

    #[tokio::test]
    async fn test_configure_debian_preserves_original_once() {
        let tmp = TempDir::new().unwrap();
        let paths = OvfPaths::with_root(tmp.path());
        let dir = paths.etc_network();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("interfaces"), "auto lo\n").unwrap();

        configure(Some("debian"), &paths).await.unwrap();
        configure(Some("debian"), &paths).await.unwrap();

        let original =
            std::fs::read_to_string(dir.join("interfaces.before_vmware_customization")).unwrap();
        assert_eq!(original, "auto lo\n");
        let current = std::fs::read_to_string(dir.join("interfaces")).unwrap();
        assert!(current.contains("source-directory /etc/network/interfaces.d"));
    }
}

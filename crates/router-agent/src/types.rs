//! Command payloads exchanged with the management plane.

use common::{Error, Result};
use configtree::{Action, InterfaceRole};
use ha::HaStatus;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Network category of an interface, kept as sent.
///
/// Only `Private` gets the private inbound policy. Anything else, a missing
/// category included, is treated as public.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Category(String);

impl Category {
    pub const PRIVATE: &'static str = "Private";

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn role(&self) -> InterfaceRole {
        if self.0 == Self::PRIVATE {
            InterfaceRole::Private
        } else {
            InterfaceRole::Public
        }
    }
}

impl From<&str> for Category {
    fn from(category: &str) -> Self {
        Self(category.to_string())
    }
}

/// One interface in a `configure-nic` command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InterfaceSpec {
    #[serde(alias = "Mac")]
    pub mac: String,
    pub ip: String,
    pub netmask: String,
    pub gateway: String,
    pub category: Category,
    #[serde(rename = "l2type")]
    pub l2_type: String,
    pub physical_interface: String,
    pub vni: u32,
    pub firewall_default_action: String,
}

impl InterfaceSpec {
    pub fn address(&self) -> Result<IpAddr> {
        parse_ip(&self.ip)
    }

    pub fn prefix_len(&self) -> Result<u8> {
        prefix_len(&self.netmask)
    }

    /// Default action of both rulesets; reject unless stated otherwise
    pub fn default_action(&self) -> Action {
        if self.firewall_default_action.trim().is_empty() {
            return Action::Reject;
        }
        self.firewall_default_action.parse().unwrap_or(Action::Reject)
    }

    /// Link alias describing the overlay, `None` without an L2 type
    pub fn link_alias(&self) -> Option<String> {
        if self.l2_type.is_empty() {
            return None;
        }
        let mut alias = format!("l2type:{};", self.l2_type);
        alias.push_str(&format!("category:{};", self.category.as_str()));
        if !self.physical_interface.is_empty() {
            alias.push_str(&format!("physicalInterface:{};", self.physical_interface));
        }
        alias.push_str(&format!("vni:{};", self.vni));
        Some(alias)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigureNicCmd {
    pub nics: Vec<InterfaceSpec>,
}

/// Identifies an interface by hardware address
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NicRef {
    #[serde(alias = "Mac")]
    pub mac: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoveNicCmd {
    pub nics: Vec<NicRef>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NicDefaultAction {
    #[serde(alias = "Mac")]
    pub mac: String,
    pub firewall_default_action: String,
}

impl NicDefaultAction {
    /// `reject` rejects, anything else accepts
    pub fn action(&self) -> Action {
        if self.firewall_default_action == "reject" {
            Action::Reject
        } else {
            Action::Accept
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultActionCmd {
    pub nics: Vec<NicDefaultAction>,
}

/// A virtual IP to move with the master role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VipSpec {
    pub nic_mac: String,
    pub nic_vip: String,
    pub netmask: String,
    pub category: Category,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnableHaCmd {
    /// Advertisement interval in seconds
    pub keepalive: u32,
    /// Hardware address of the heartbeat interface
    pub heartbeat_nic: String,
    pub local_ip: String,
    pub peer_ip: String,
    pub monitors: Vec<String>,
    pub vips: Vec<VipSpec>,
}

/// Settings pushed once by the management plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitConfig {
    #[serde(rename = "restartDnsmasqAfterNumberOfSIGUSER1")]
    pub restart_dnsmasq_after_number_of_sigusr1: u32,
    pub uuid: String,
    /// Address the management plane calls back from
    pub callback_ip: Option<IpAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub uuid: String,
    pub version: String,
    pub ha_status: HaStatus,
    pub healthy: bool,
    pub health_detail: String,
}

/// Reply envelope of every command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReply {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub body: Option<serde_json::Value>,
}

impl CommandReply {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            body: None,
        }
    }

    pub fn with_body(body: serde_json::Value) -> Self {
        Self {
            success: true,
            error: None,
            body: Some(body),
        }
    }

    pub fn failure(error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            body: None,
        }
    }
}

pub fn parse_ip(ip: &str) -> Result<IpAddr> {
    ip.trim()
        .parse()
        .map_err(|_| Error::config(format!("invalid IP address: {:?}", ip)))
}

/// Prefix length from a dotted netmask or a bare prefix length
pub fn prefix_len(netmask: &str) -> Result<u8> {
    let netmask = netmask.trim();
    if let Ok(prefix) = netmask.parse::<u8>() {
        if prefix <= 128 {
            return Ok(prefix);
        }
    }
    let mask: Ipv4Addr = netmask
        .parse()
        .map_err(|_| Error::config(format!("invalid netmask: {:?}", netmask)))?;
    ipnetwork::ipv4_mask_to_prefix(mask)
        .map_err(|e| Error::config(format!("invalid netmask {}: {}", netmask, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_interface_spec() {
        let spec: InterfaceSpec = serde_json::from_value(json!({
            "Mac": "52:54:00:12:34:56",
            "ip": "10.0.0.5",
            "netmask": "255.255.255.0",
            "gateway": "10.0.0.1",
            "category": "Public",
            "l2type": "VxlanNetwork",
            "physicalInterface": "eth0",
            "vni": 100,
            "firewallDefaultAction": "accept"
        }))
        .unwrap();

        assert_eq!(spec.mac, "52:54:00:12:34:56");
        assert_eq!(spec.address().unwrap(), "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(spec.prefix_len().unwrap(), 24);
        assert_eq!(spec.category.role(), InterfaceRole::Public);
        assert_eq!(spec.default_action(), Action::Accept);
        assert_eq!(
            spec.link_alias().as_deref(),
            Some("l2type:VxlanNetwork;category:Public;physicalInterface:eth0;vni:100;")
        );
    }

    #[test]
    fn test_interface_spec_defaults() {
        let spec: InterfaceSpec = serde_json::from_value(json!({
            "mac": "52:54:00:12:34:56",
            "ip": "10.0.0.5",
            "netmask": "255.255.255.0",
            "category": "Management"
        }))
        .unwrap();

        assert_eq!(spec.category.as_str(), "Management");
        assert_eq!(spec.category.role(), InterfaceRole::Public);
        assert_eq!(spec.default_action(), Action::Reject);
        assert_eq!(spec.link_alias(), None);

        let overlay = InterfaceSpec {
            l2_type: "VlanNetwork".to_string(),
            vni: 7,
            ..spec
        };
        assert_eq!(
            overlay.link_alias().as_deref(),
            Some("l2type:VlanNetwork;category:Management;vni:7;")
        );
    }

    #[test]
    fn test_missing_category_is_public() {
        let spec: InterfaceSpec = serde_json::from_value(json!({
            "mac": "52:54:00:12:34:56",
            "ip": "10.0.0.5",
            "netmask": "255.255.255.0"
        }))
        .unwrap();

        assert_eq!(spec.category.as_str(), "");
        assert_eq!(spec.category.role(), InterfaceRole::Public);

        let private: InterfaceSpec =
            serde_json::from_value(json!({"mac": "m", "category": "Private"})).unwrap();
        assert_eq!(private.category.role(), InterfaceRole::Private);
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len("255.255.255.0").unwrap(), 24);
        assert_eq!(prefix_len("255.255.0.0").unwrap(), 16);
        assert_eq!(prefix_len("64").unwrap(), 64);
        assert!(prefix_len("255.0.255.0").is_err());
        assert!(prefix_len("garbage").is_err());
    }

    #[test]
    fn test_default_action_command() {
        let reject = NicDefaultAction {
            mac: String::new(),
            firewall_default_action: "reject".to_string(),
        };
        let other = NicDefaultAction {
            mac: String::new(),
            firewall_default_action: "drop".to_string(),
        };
        assert_eq!(reject.action(), Action::Reject);
        assert_eq!(other.action(), Action::Accept);
    }

    #[test]
    fn test_decode_enable_ha() {
        let cmd: EnableHaCmd = serde_json::from_value(json!({
            "keepalive": 2,
            "heartbeatNic": "52:54:00:00:00:02",
            "localIp": "10.1.0.2",
            "peerIp": "",
            "monitors": ["10.0.0.1"],
            "vips": [{"nicMac": "52:54:00:00:00:01", "nicVip": "10.0.0.100",
                      "netmask": "255.255.255.0", "category": "Private"}]
        }))
        .unwrap();
        assert_eq!(cmd.keepalive, 2);
        assert_eq!(cmd.vips.len(), 1);
        assert_eq!(cmd.vips[0].nic_vip, "10.0.0.100");
    }

    #[test]
    fn test_reply_serialization() {
        assert_eq!(serde_json::to_value(CommandReply::ok()).unwrap(), json!({"success": true}));
        assert_eq!(
            serde_json::to_value(CommandReply::failure("boom")).unwrap(),
            json!({"success": false, "error": "boom"})
        );

        let ping = PingResponse {
            uuid: "u".to_string(),
            version: "1.0".to_string(),
            ha_status: HaStatus::NoHa,
            healthy: true,
            health_detail: String::new(),
        };
        let reply = CommandReply::with_body(serde_json::to_value(&ping).unwrap());
        assert_eq!(
            serde_json::to_value(reply).unwrap(),
            json!({"success": true, "uuid": "u", "version": "1.0", "haStatus": "NoHa",
                   "healthy": true, "healthDetail": ""})
        );
    }

    #[test]
    fn test_decode_init() {
        let init: InitConfig = serde_json::from_value(json!({
            "restartDnsmasqAfterNumberOfSIGUSER1": 10,
            "uuid": "abc"
        }))
        .unwrap();
        assert_eq!(init.restart_dnsmasq_after_number_of_sigusr1, 10);
        assert_eq!(init.callback_ip, None);
    }
}

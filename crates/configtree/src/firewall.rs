//! Per-interface firewall policy on top of the configuration tree.
//!
//! Every interface owns two rulesets: `<nic>.in` for forwarded traffic
//! entering through it and `<nic>.local` for traffic addressed to the
//! appliance itself.

use crate::tree::{ConfigTree, Node, split_words};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::{debug, info};

/// First rule number used for front (operator-visible) rules
pub const FRONT_RULE_START: u32 = 1;

/// First rule number used for rules placed behind the front rules
pub const BEHIND_RULE_START: u32 = 4000;

/// Catch-all rule accepting new connections on the `in` ruleset
pub const NEW_STATE_RULE_NUMBER: u32 = 9999;

const TAG_SECONDARY_IP: &str = "agent:secondary-ip:";
const TAG_HEARTBEAT: &str = "agent:ha-heartbeat";

/// Traffic direction a ruleset filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Forwarded traffic entering through the interface
    In,
    /// Traffic destined to the appliance
    Local,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::In, Direction::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Local => "local",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule or default action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Accept,
    Reject,
    Drop,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Accept => f.write_str("accept"),
            Action::Reject => f.write_str("reject"),
            Action::Drop => f.write_str("drop"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(Action::Accept),
            "reject" => Ok(Action::Reject),
            "drop" => Ok(Action::Drop),
            other => Err(format!("unknown firewall action: {}", other)),
        }
    }
}

/// Connection tracking states a rule can match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Established,
    Related,
    Invalid,
    New,
}

impl ConnState {
    fn as_str(&self) -> &'static str {
        match self {
            ConnState::Established => "established",
            ConnState::Related => "related",
            ConnState::Invalid => "invalid",
            ConnState::New => "new",
        }
    }
}

/// Role of an interface; private networks get a more permissive inbound policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceRole {
    Private,
    Public,
}

/// Purpose tag identifying a rule group across re-applications.
///
/// Stored in the rule description and parsed back for comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleTag {
    /// Exception letting traffic reach a secondary (virtual) address
    SecondaryIp(IpAddr),
    /// Exception letting heartbeat traffic from the peer in
    HeartbeatPeer,
}

impl RuleTag {
    pub fn description(&self) -> String {
        match self {
            RuleTag::SecondaryIp(ip) => format!("{}{}", TAG_SECONDARY_IP, ip),
            RuleTag::HeartbeatPeer => TAG_HEARTBEAT.to_string(),
        }
    }

    pub fn parse(description: &str) -> Option<Self> {
        if description == TAG_HEARTBEAT {
            return Some(RuleTag::HeartbeatPeer);
        }
        description
            .strip_prefix(TAG_SECONDARY_IP)
            .and_then(|ip| ip.parse().ok())
            .map(RuleTag::SecondaryIp)
    }
}

/// Structured identity of a tagged rule group
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub interface: String,
    pub direction: Direction,
    pub tag: RuleTag,
}

/// Where a new rule is numbered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Behind,
    Number(u32),
}

/// A single firewall rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    pub action: Action,
    pub tag: Option<RuleTag>,
    pub protocol: Option<String>,
    pub source_address: Option<String>,
    pub destination_address: Option<String>,
    pub destination_port: Option<u16>,
    pub states: Vec<ConnState>,
}

impl FirewallRule {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            tag: None,
            protocol: None,
            source_address: None,
            destination_address: None,
            destination_port: None,
            states: Vec::new(),
        }
    }

    pub fn tag(mut self, tag: RuleTag) -> Self {
        self.tag = Some(tag);
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn source(mut self, address: impl ToString) -> Self {
        self.source_address = Some(address.to_string());
        self
    }

    pub fn destination(mut self, address: impl ToString) -> Self {
        self.destination_address = Some(address.to_string());
        self
    }

    pub fn destination_port(mut self, port: u16) -> Self {
        self.destination_port = Some(port);
        self
    }

    pub fn states(mut self, states: &[ConnState]) -> Self {
        self.states = states.to_vec();
        self
    }

    /// Statements of this rule relative to its `rule <n>` node
    pub fn statements(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        if let Some(tag) = &self.tag {
            out.push(vec!["description".to_string(), tag.description()]);
        }
        out.push(vec!["action".to_string(), self.action.to_string()]);
        for state in &self.states {
            out.push(vec![
                "state".to_string(),
                state.as_str().to_string(),
                "enable".to_string(),
            ]);
        }
        if let Some(protocol) = &self.protocol {
            out.push(vec!["protocol".to_string(), protocol.clone()]);
        }
        if let Some(source) = &self.source_address {
            out.push(words(&["source", "address", source]));
        }
        if let Some(destination) = &self.destination_address {
            out.push(words(&["destination", "address", destination]));
        }
        if let Some(port) = self.destination_port {
            out.push(words(&["destination", "port", &port.to_string()]));
        }
        out
    }
}

/// What `configure_interface` needs to know about an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePolicy {
    pub address: IpAddr,
    pub role: InterfaceRole,
    pub default_action: Action,
}

/// Composes per-interface firewall statements into a [`ConfigTree`].
#[derive(Debug, Clone)]
pub struct FirewallPolicyBuilder {
    management_interface: String,
    ssh_port: u16,
}

impl FirewallPolicyBuilder {
    pub fn new(management_interface: impl Into<String>, ssh_port: u16) -> Self {
        Self {
            management_interface: management_interface.into(),
            ssh_port,
        }
    }

    pub fn management_interface(&self) -> &str {
        &self.management_interface
    }

    /// Emit the baseline policy of an interface. Returns whether anything changed.
    pub fn configure_interface(
        &self,
        tree: &mut ConfigTree,
        interface: &str,
        policy: &InterfacePolicy,
    ) -> bool {
        let address = policy.address;
        let mut changed = false;

        changed |= self.insert_rule(
            tree,
            interface,
            Direction::Local,
            Placement::Front,
            &FirewallRule::new(Action::Accept)
                .states(&[ConnState::Established, ConnState::Related])
                .destination(address),
        );
        changed |= self.insert_rule(
            tree,
            interface,
            Direction::Local,
            Placement::Front,
            &FirewallRule::new(Action::Accept)
                .protocol("icmp")
                .destination(address),
        );

        let inbound_states: &[ConnState] = match policy.role {
            InterfaceRole::Private => &[
                ConnState::Established,
                ConnState::Related,
                ConnState::Invalid,
                ConnState::New,
            ],
            InterfaceRole::Public => &[ConnState::Established, ConnState::Related],
        };
        changed |= self.insert_rule(
            tree,
            interface,
            Direction::In,
            Placement::Behind,
            &FirewallRule::new(Action::Accept).states(inbound_states),
        );
        changed |= self.insert_rule(
            tree,
            interface,
            Direction::In,
            Placement::Behind,
            &FirewallRule::new(Action::Accept).protocol("icmp"),
        );
        changed |= self.insert_rule(
            tree,
            interface,
            Direction::In,
            Placement::Number(NEW_STATE_RULE_NUMBER),
            &FirewallRule::new(Action::Accept).states(&[ConnState::New]),
        );

        // ssh is only reachable through the management interface
        let ssh_action = if interface == self.management_interface {
            Action::Accept
        } else {
            Action::Reject
        };
        changed |= self.insert_rule(
            tree,
            interface,
            Direction::Local,
            Placement::Front,
            &FirewallRule::new(ssh_action)
                .protocol("tcp")
                .destination(address)
                .destination_port(self.ssh_port),
        );

        for direction in Direction::ALL {
            changed |= self.set_default_action(tree, interface, direction, policy.default_action);
            changed |= self.attach(tree, interface, direction);
        }
        changed
    }

    /// Insert an untagged rule unless an identical rule already exists,
    /// or a tagged rule unless its tag is already present.
    pub fn insert_rule(
        &self,
        tree: &mut ConfigTree,
        interface: &str,
        direction: Direction,
        placement: Placement,
        rule: &FirewallRule,
    ) -> bool {
        match &rule.tag {
            Some(tag) => {
                let key = RuleKey {
                    interface: interface.to_string(),
                    direction,
                    tag: tag.clone(),
                };
                if find_tagged_rule(tree, &key).is_some() {
                    return false;
                }
            }
            None => {
                if find_identical_rule(tree, interface, direction, rule).is_some() {
                    return false;
                }
            }
        }
        write_rule(tree, interface, direction, placement, rule)
    }

    /// Insert a group of rules sharing one tag, unless the tag is already present.
    pub fn insert_tagged_group(
        &self,
        tree: &mut ConfigTree,
        key: &RuleKey,
        rules: &[FirewallRule],
    ) -> bool {
        if let Some(number) = find_tagged_rule(tree, key) {
            debug!(interface = %key.interface, direction = %key.direction, number, "Tagged rule already present");
            return false;
        }

        let mut changed = false;
        for rule in rules {
            let rule = rule.clone().tag(key.tag.clone());
            changed |= write_rule(tree, &key.interface, key.direction, Placement::Front, &rule);
        }
        changed
    }

    /// Accept established/related and icmp traffic to a secondary address.
    pub fn add_secondary_ip_exception(
        &self,
        tree: &mut ConfigTree,
        interface: &str,
        address: IpAddr,
    ) -> bool {
        let key = RuleKey {
            interface: interface.to_string(),
            direction: Direction::Local,
            tag: RuleTag::SecondaryIp(address),
        };
        let rules = [
            FirewallRule::new(Action::Accept)
                .states(&[ConnState::Established, ConnState::Related])
                .destination(address),
            FirewallRule::new(Action::Accept)
                .protocol("icmp")
                .destination(address),
        ];
        let added = self.insert_tagged_group(tree, &key, &rules);
        self.attach(tree, interface, Direction::Local) || added
    }

    /// Accept vrrp traffic from the peer on the heartbeat interface.
    pub fn add_heartbeat_exception(
        &self,
        tree: &mut ConfigTree,
        interface: &str,
        peer: IpAddr,
    ) -> bool {
        let key = RuleKey {
            interface: interface.to_string(),
            direction: Direction::Local,
            tag: RuleTag::HeartbeatPeer,
        };
        let rule = FirewallRule::new(Action::Accept).protocol("vrrp").source(peer);
        self.replace_tagged_group(tree, &key, &[rule])
    }

    /// Like [`insert_tagged_group`](Self::insert_tagged_group), but a present
    /// group whose rules differ from `rules` is deleted and written again.
    pub fn replace_tagged_group(
        &self,
        tree: &mut ConfigTree,
        key: &RuleKey,
        rules: &[FirewallRule],
    ) -> bool {
        let existing = find_tagged_rules(tree, key);
        if existing.is_empty() {
            return self.insert_tagged_group(tree, key, rules);
        }

        let current = existing.len() == rules.len()
            && rules.iter().all(|rule| {
                let rule = rule.clone().tag(key.tag.clone());
                find_identical_rule(tree, &key.interface, key.direction, &rule)
                    .is_some_and(|number| existing.contains(&number))
            });
        if current {
            return false;
        }

        info!(
            interface = %key.interface,
            direction = %key.direction,
            "Replacing stale tagged rules"
        );
        let ruleset = ruleset_path(&key.interface, key.direction);
        for number in existing {
            tree.delete(&format!("{} rule {}", ruleset, number));
        }
        self.insert_tagged_group(tree, key, rules);
        true
    }

    pub fn set_default_action(
        &self,
        tree: &mut ConfigTree,
        interface: &str,
        direction: Direction,
        action: Action,
    ) -> bool {
        tree.set_value(
            &format!("{} default-action", ruleset_path(interface, direction)),
            &action.to_string(),
        )
    }

    /// Bind the interface's ruleset for `direction` to the interface.
    pub fn attach(&self, tree: &mut ConfigTree, interface: &str, direction: Direction) -> bool {
        tree.set_value(
            &format!("interfaces ethernet {} firewall {} name", interface, direction),
            &ruleset_name(interface, direction),
        )
    }

    /// Delete both rulesets of an interface wholesale.
    pub fn remove_interface_firewall(&self, tree: &mut ConfigTree, interface: &str) -> bool {
        let mut removed = false;
        for direction in Direction::ALL {
            removed |= tree.delete(&ruleset_path(interface, direction));
        }
        removed
    }
}

/// `eth1` + `local` -> `eth1.local`
pub fn ruleset_name(interface: &str, direction: Direction) -> String {
    format!("{}.{}", interface, direction)
}

fn ruleset_path(interface: &str, direction: Direction) -> String {
    format!("firewall name {}", ruleset_name(interface, direction))
}

fn rules_of<'a>(
    tree: &'a ConfigTree,
    interface: &str,
    direction: Direction,
) -> Option<&'a Node> {
    tree.get(&format!("{} rule", ruleset_path(interface, direction)))
}

/// Number of the first rule carrying the key's tag, if any
pub fn find_tagged_rule(tree: &ConfigTree, key: &RuleKey) -> Option<u32> {
    find_tagged_rules(tree, key).first().copied()
}

/// Numbers of every rule carrying the key's tag
pub fn find_tagged_rules(tree: &ConfigTree, key: &RuleKey) -> Vec<u32> {
    let Some(rules) = rules_of(tree, &key.interface, key.direction) else {
        return Vec::new();
    };
    rules
        .children()
        .filter(|(_, rule)| {
            rule.child("description")
                .and_then(Node::value)
                .and_then(RuleTag::parse)
                .is_some_and(|tag| tag == key.tag)
        })
        .filter_map(|(number, _)| number.parse().ok())
        .collect()
}

/// Number of an existing rule whose statements equal `rule`'s, if any
pub fn find_identical_rule(
    tree: &ConfigTree,
    interface: &str,
    direction: Direction,
    rule: &FirewallRule,
) -> Option<u32> {
    let mut wanted = rule.statements();
    wanted.sort();

    rules_of(tree, interface, direction)?
        .children()
        .find(|(_, existing)| {
            let mut statements = existing.statements();
            statements.sort();
            statements == wanted
        })
        .and_then(|(number, _)| number.parse().ok())
}

fn next_free_number(tree: &ConfigTree, interface: &str, direction: Direction, start: u32) -> u32 {
    let used: Vec<u32> = rules_of(tree, interface, direction)
        .map(|rules| rules.child_names().filter_map(|n| n.parse().ok()).collect())
        .unwrap_or_default();

    let mut number = start;
    while used.contains(&number) {
        number += 1;
    }
    number
}

fn write_rule(
    tree: &mut ConfigTree,
    interface: &str,
    direction: Direction,
    placement: Placement,
    rule: &FirewallRule,
) -> bool {
    let number = match placement {
        Placement::Front => next_free_number(tree, interface, direction, FRONT_RULE_START),
        Placement::Behind => next_free_number(tree, interface, direction, BEHIND_RULE_START),
        Placement::Number(number) => {
            // An explicitly numbered rule replaces whatever held the number
            tree.delete(&format!("{} rule {}", ruleset_path(interface, direction), number));
            number
        }
    };

    let prefix = split_words(&format!("{} rule {}", ruleset_path(interface, direction), number));
    let mut changed = false;
    for statement in rule.statements() {
        let mut path = prefix.clone();
        path.extend(statement);
        changed |= tree.set_words(path);
    }
    debug!(interface, direction = %direction, number, "Inserted firewall rule");
    changed
}

fn words(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

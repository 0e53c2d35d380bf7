//! IP allow/deny lists.
//!
//! # Responsibilities
//! - Parse the string lists of a [`RuleSet`] into fast matchers
//! - Answer whitelist, operator-block and port questions for one snapshot
//!
//! # Design Decisions
//! - Exact addresses go in a hash set, CIDR ranges in a short list
//! - Unparseable entries are skipped and reported, never fatal
//! - IPv4-mapped IPv6 addresses are matched as IPv4

use std::collections::HashSet;
use std::net::IpAddr;

use ipnet::IpNet;

use crate::config::schema::RuleSet;

/// Set of addresses and networks.
#[derive(Debug, Clone, Default)]
pub struct IpMatcher {
    hosts: HashSet<IpAddr>,
    networks: Vec<IpNet>,
}

impl IpMatcher {
    /// Build from textual entries. Returns the matcher and the entries that
    /// could not be parsed.
    pub fn parse<'a, I>(entries: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut matcher = Self::default();
        let mut invalid = Vec::new();

        for raw in entries {
            let entry = raw.trim();
            if let Ok(ip) = entry.parse::<IpAddr>() {
                matcher.hosts.insert(ip.to_canonical());
            } else if let Ok(net) = entry.parse::<IpNet>() {
                let net = net.trunc();
                if net.prefix_len() == net.max_prefix_len() {
                    matcher.hosts.insert(net.addr().to_canonical());
                } else {
                    matcher.networks.push(net);
                }
            } else {
                invalid.push(entry.to_string());
            }
        }

        (matcher, invalid)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        self.hosts.contains(&ip) || self.networks.iter().any(|net| net.contains(&ip))
    }

    pub fn len(&self) -> usize {
        self.hosts.len() + self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lookup index derived from one [`RuleSet`].
#[derive(Debug, Clone, Default)]
pub struct ParsedRules {
    whitelist: IpMatcher,
    /// Operator blocks only; auto-block entries are tracked by the auto-blocker.
    blocked: IpMatcher,
    allowed_ports: HashSet<u16>,
    /// Entries that failed to parse, kept for the reload log.
    pub invalid: Vec<String>,
}

impl ParsedRules {
    pub fn from_rules(rules: &RuleSet) -> Self {
        let (whitelist, mut invalid) = IpMatcher::parse(rules.whitelist.iter().map(String::as_str));

        let operator_blocks = rules
            .blocked_ips
            .iter()
            .filter(|ip| !rules.auto_block_expiry.contains_key(ip.as_str()))
            .map(String::as_str);
        let (blocked, bad_blocks) = IpMatcher::parse(operator_blocks);
        invalid.extend(bad_blocks);

        let allowed_ports = rules
            .allowed_ports
            .iter()
            .filter_map(|&p| u16::try_from(p).ok())
            .filter(|&p| p != 0)
            .collect();

        Self {
            whitelist,
            blocked,
            allowed_ports,
            invalid,
        }
    }

    pub fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.whitelist.contains(ip)
    }

    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocked.contains(ip)
    }

    pub fn is_port_allowed(&self, port: u16) -> bool {
        self.allowed_ports.contains(&port)
    }

    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }

    pub fn whitelist_count(&self) -> usize {
        self.whitelist.len()
    }
}

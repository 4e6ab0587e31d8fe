// src/core/access.rs

//! IP/CIDR + password access control for incoming connections.
//!
//! Rules are evaluated in configuration order; the first match wins. A
//! rule with both a network list and a password requires both to match.
//! No match means blocked.

use crate::config::AccessConfig;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Access granted to a downstream connection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    /// Connection is refused outright.
    Blocked,
    /// Receives everything; writes other than `demand=` and FRDP are
    /// dropped.
    Observer,
    Full,
}

impl AccessLevel {
    pub fn can_write(self) -> bool {
        self == AccessLevel::Full
    }

    pub fn has_access(self) -> bool {
        self != AccessLevel::Blocked
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Blocked => "blocked",
            AccessLevel::Observer => "observer",
            AccessLevel::Full => "full",
        }
    }
}

/// One parsed access rule.
#[derive(Debug, Clone)]
pub struct AccessRule {
    pub display_name: String,
    /// `None` means the rule matched `ANY` address.
    networks: Option<Vec<IpNet>>,
    password: Option<String>,
    pub level: AccessLevel,
}

impl AccessRule {
    fn matches(&self, ip: IpAddr, password: Option<&str>) -> bool {
        let ip_ok = match &self.networks {
            None => true,
            Some(networks) => networks.iter().any(|net| net.contains(&ip)),
        };
        let password_ok = match &self.password {
            None => true,
            Some(required) => password == Some(required.as_str()),
        };
        ip_ok && password_ok
    }
}

/// The ordered rule list, parsed once from configuration.
#[derive(Debug, Clone, Default)]
pub struct AccessList {
    rules: Vec<AccessRule>,
}

impl AccessList {
    /// Builds the list from validated config. Invalid CIDRs were already
    /// rejected by `Config::validate`, so a parse failure here is an
    /// invariant break; the offending element is skipped.
    pub fn from_config(rules: &[AccessConfig]) -> Self {
        let parsed = rules
            .iter()
            .map(|rule| {
                let any = rule.match_ipv4.iter().any(|n| n == "ANY");
                let networks = if any || rule.match_ipv4.is_empty() {
                    None
                } else {
                    Some(
                        rule.match_ipv4
                            .iter()
                            .filter_map(|n| n.parse::<IpNet>().ok())
                            .collect(),
                    )
                };
                AccessRule {
                    display_name: rule.display_name.clone(),
                    networks,
                    password: rule.match_password.clone(),
                    level: rule.level,
                }
            })
            .collect();
        Self { rules: parsed }
    }

    /// Evaluates the rules for a remote address and an optional password
    /// received via FRDP AUTH. Returns the first matching rule.
    pub fn evaluate(&self, ip: IpAddr, password: Option<&str>) -> Option<&AccessRule> {
        self.rules.iter().find(|rule| rule.matches(ip, password))
    }

    /// Convenience wrapper returning `Blocked` when nothing matches.
    pub fn level_for(&self, ip: IpAddr, password: Option<&str>) -> (AccessLevel, Option<&str>) {
        match self.evaluate(ip, password) {
            Some(rule) => (rule.level, Some(rule.display_name.as_str())),
            None => (AccessLevel::Blocked, None),
        }
    }

    /// True if any rule can be satisfied by a password. When a new
    /// connection matches no rule but password rules exist, it is parked
    /// unauthenticated so a later FRDP AUTH can still grant access.
    pub fn has_password_rules(&self) -> bool {
        self.rules.iter().any(|rule| rule.password.is_some())
    }
}

use frankenrouter::config::AccessConfig;
use frankenrouter::core::access::{AccessLevel, AccessList};
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn rule(name: &str, networks: &[&str], password: Option<&str>, level: AccessLevel) -> AccessConfig {
    AccessConfig {
        display_name: name.to_string(),
        match_ipv4: networks.iter().map(|s| s.to_string()).collect(),
        match_password: password.map(|s| s.to_string()),
        level,
    }
}

#[test]
fn ip_only_rule_matches_by_network() {
    let list = AccessList::from_config(&[rule(
        "LAN",
        &["192.168.42.0/24"],
        None,
        AccessLevel::Full,
    )]);
    let (level, name) = list.level_for(ip("192.168.42.8"), None);
    assert_eq!(level, AccessLevel::Full);
    assert_eq!(name, Some("LAN"));

    let (level, _) = list.level_for(ip("10.0.0.1"), None);
    assert_eq!(level, AccessLevel::Blocked);
}

#[test]
fn first_match_wins() {
    let list = AccessList::from_config(&[
        rule("blocked host", &["192.168.42.8/32"], None, AccessLevel::Blocked),
        rule("LAN", &["192.168.42.0/24"], None, AccessLevel::Full),
    ]);
    let (level, _) = list.level_for(ip("192.168.42.8"), None);
    assert_eq!(level, AccessLevel::Blocked);
    let (level, _) = list.level_for(ip("192.168.42.9"), None);
    assert_eq!(level, AccessLevel::Full);
}

#[test]
fn any_matches_every_address() {
    let list = AccessList::from_config(&[rule("open", &["ANY"], None, AccessLevel::Observer)]);
    let (level, _) = list.level_for(ip("8.8.8.8"), None);
    assert_eq!(level, AccessLevel::Observer);
}

#[test]
fn password_rule_requires_the_password() {
    let list = AccessList::from_config(&[rule(
        "remote",
        &["127.0.0.1/32"],
        Some("s3cret"),
        AccessLevel::Full,
    )]);

    // Right address, no password: no match.
    let (level, _) = list.level_for(ip("127.0.0.1"), None);
    assert_eq!(level, AccessLevel::Blocked);

    // Right address, wrong password: no match.
    let (level, _) = list.level_for(ip("127.0.0.1"), Some("wrong"));
    assert_eq!(level, AccessLevel::Blocked);

    // Both right: full access.
    let (level, _) = list.level_for(ip("127.0.0.1"), Some("s3cret"));
    assert_eq!(level, AccessLevel::Full);

    // Right password, wrong address: no match.
    let (level, _) = list.level_for(ip("10.1.1.1"), Some("s3cret"));
    assert_eq!(level, AccessLevel::Blocked);

    assert!(list.has_password_rules());
}

#[test]
fn password_only_rule_ignores_address() {
    let list = AccessList::from_config(&[rule("anyone with the key", &[], Some("k3y"), AccessLevel::Full)]);
    let (level, _) = list.level_for(ip("203.0.113.7"), Some("k3y"));
    assert_eq!(level, AccessLevel::Full);
    let (level, _) = list.level_for(ip("203.0.113.7"), None);
    assert_eq!(level, AccessLevel::Blocked);
}

#[test]
fn no_password_rules_means_no_waiting() {
    let list = AccessList::from_config(&[rule("LAN", &["192.168.0.0/16"], None, AccessLevel::Full)]);
    assert!(!list.has_password_rules());
}

#[test]
fn levels_have_expected_capabilities() {
    assert!(AccessLevel::Full.can_write());
    assert!(!AccessLevel::Observer.can_write());
    assert!(AccessLevel::Observer.has_access());
    assert!(!AccessLevel::Blocked.has_access());
}

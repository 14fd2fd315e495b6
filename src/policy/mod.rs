use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use log::trace;
use regex::Regex;
use serde::Deserialize;

use crate::bgp::{Community, Origin};
use crate::rib::RouteAttributes;

/// Terminal decision of a policy evaluation
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PolicyAction {
    Accept,
    Reject,
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PolicyAction::Accept => write!(f, "accept"),
            PolicyAction::Reject => write!(f, "reject"),
        }
    }
}

/// A single match condition; all conditions of a rule must hold
#[derive(Clone, Debug)]
pub enum Match {
    /// Exact prefix, or any more-specific within the bounds
    Prefix {
        prefix: IpNetwork,
        min_length: Option<u8>,
        max_length: Option<u8>,
    },
    AsPathRegex(Regex),
    AsPathLength { at_most: u32 },
    Community(String),
    NextHop(IpAddr),
    LocalPref(u32),
    MultiExitDisc(u32),
    Origin(Origin),
}

impl Match {
    fn matches(&self, prefix: &IpNetwork, attributes: &RouteAttributes) -> bool {
        match self {
            Match::Prefix {
                prefix: target,
                min_length,
                max_length,
            } => {
                let length_ok = min_length.map(|min| prefix.prefix() >= min).unwrap_or(true)
                    && max_length.map(|max| prefix.prefix() <= max).unwrap_or(true);
                let contained = match (min_length, max_length) {
                    // Exact match when no bounds given
                    (None, None) => prefix == target,
                    _ => target.contains(prefix.ip()) && prefix.prefix() >= target.prefix(),
                };
                contained && length_ok
            }
            Match::AsPathRegex(regex) => regex.is_match(&attributes.as_path.to_string()),
            Match::AsPathLength { at_most } => attributes.as_path.length() <= *at_most,
            Match::Community(pattern) => attributes.communities.matches(pattern),
            Match::NextHop(next_hop) => attributes.next_hop == *next_hop,
            Match::LocalPref(value) => attributes.local_pref == Some(*value),
            Match::MultiExitDisc(value) => attributes.med == Some(*value),
            Match::Origin(origin) => attributes.origin == *origin,
        }
    }
}

/// An action applied when a rule fires; Accept/Reject stop evaluation
#[derive(Clone, Debug)]
pub enum Action {
    Accept,
    Reject,
    SetLocalPref(u32),
    SetMultiExitDisc(u32),
    SetNextHop(IpAddr),
    PrependAsPath { asn: u32, count: u8 },
    AddCommunity(Community),
    RemoveCommunity(Community),
    SetCommunities(Vec<Community>),
}

#[derive(Clone, Debug, Default)]
pub struct Rule {
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
}

/// An ordered first-match-fires rule chain with a default action.
/// Applied on import (before Adj-RIB-In) and export (after Loc-RIB).
#[derive(Clone, Debug)]
pub struct Policy {
    pub name: String,
    pub rules: Vec<Rule>,
    pub default_action: PolicyAction,
}

impl Policy {
    /// The implicit policy: accept everything untouched
    pub fn permit_all() -> Arc<Policy> {
        Arc::new(Policy {
            name: "permit-all".to_string(),
            rules: vec![],
            default_action: PolicyAction::Accept,
        })
    }

    /// Evaluate against a route; on accept, returns the (possibly
    /// rewritten) attributes. A rejected route leaves no partial state.
    pub fn evaluate(
        &self,
        prefix: &IpNetwork,
        attributes: &RouteAttributes,
    ) -> Option<RouteAttributes> {
        for (index, rule) in self.rules.iter().enumerate() {
            if !rule.matches.iter().all(|m| m.matches(prefix, attributes)) {
                continue;
            }
            trace!("Policy {} rule #{} fired for {}", self.name, index, prefix);
            let mut rewritten = attributes.clone();
            for action in &rule.actions {
                match action {
                    Action::Accept => return Some(rewritten),
                    Action::Reject => return None,
                    Action::SetLocalPref(value) => rewritten.local_pref = Some(*value),
                    Action::SetMultiExitDisc(value) => rewritten.med = Some(*value),
                    Action::SetNextHop(next_hop) => rewritten.next_hop = *next_hop,
                    Action::PrependAsPath { asn, count } => {
                        rewritten.as_path.prepend(*asn, *count)
                    }
                    Action::AddCommunity(community) => rewritten.communities.push(*community),
                    Action::RemoveCommunity(community) => {
                        rewritten.communities.remove(*community)
                    }
                    Action::SetCommunities(communities) => {
                        rewritten.communities.0 = communities.clone();
                    }
                }
            }
            // The first matching rule decides; fall to its implicit accept
            return Some(rewritten);
        }
        match self.default_action {
            PolicyAction::Accept => Some(attributes.clone()),
            PolicyAction::Reject => None,
        }
    }
}

/// Config-file (toml) representation of a policy
#[derive(Clone, Debug, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    #[serde(default = "default_action_accept")]
    pub default_action: String,
    #[serde(default = "Vec::new")]
    pub rules: Vec<RuleSpec>,
}

fn default_action_accept() -> String {
    "accept".to_string()
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RuleSpec {
    // Matches
    pub prefix: Option<String>,
    pub prefix_min_length: Option<u8>,
    pub prefix_max_length: Option<u8>,
    pub as_path_regex: Option<String>,
    pub as_path_max_length: Option<u32>,
    pub community: Option<String>,
    pub next_hop: Option<IpAddr>,
    pub local_pref: Option<u32>,
    pub multi_exit_disc: Option<u32>,
    pub origin: Option<String>,
    // Actions
    #[serde(default = "Vec::new")]
    pub actions: Vec<String>,
}

impl PolicySpec {
    pub fn build(&self) -> io::Result<Policy> {
        let invalid =
            |reason: String| io::Error::new(io::ErrorKind::InvalidInput, reason);
        let default_action = match self.default_action.to_lowercase().as_str() {
            "accept" => PolicyAction::Accept,
            "reject" => PolicyAction::Reject,
            other => {
                return Err(invalid(format!("Unsupported default action: '{}'", other)));
            }
        };
        let mut rules = Vec::with_capacity(self.rules.len());
        for spec in &self.rules {
            rules.push(spec.build()?);
        }
        Ok(Policy {
            name: self.name.clone(),
            rules,
            default_action,
        })
    }
}

impl RuleSpec {
    fn build(&self) -> io::Result<Rule> {
        let invalid =
            |reason: String| io::Error::new(io::ErrorKind::InvalidInput, reason);
        let mut matches = Vec::new();
        if let Some(prefix) = &self.prefix {
            matches.push(Match::Prefix {
                prefix: prefix
                    .parse()
                    .map_err(|err| invalid(format!("Invalid prefix '{}': {}", prefix, err)))?,
                min_length: self.prefix_min_length,
                max_length: self.prefix_max_length,
            });
        }
        if let Some(pattern) = &self.as_path_regex {
            matches.push(Match::AsPathRegex(Regex::new(pattern).map_err(|err| {
                invalid(format!("Invalid as-path regex '{}': {}", pattern, err))
            })?));
        }
        if let Some(at_most) = self.as_path_max_length {
            matches.push(Match::AsPathLength { at_most });
        }
        if let Some(community) = &self.community {
            matches.push(Match::Community(community.clone()));
        }
        if let Some(next_hop) = self.next_hop {
            matches.push(Match::NextHop(next_hop));
        }
        if let Some(local_pref) = self.local_pref {
            matches.push(Match::LocalPref(local_pref));
        }
        if let Some(med) = self.multi_exit_disc {
            matches.push(Match::MultiExitDisc(med));
        }
        if let Some(origin) = &self.origin {
            let origin = match origin.to_lowercase().as_str() {
                "igp" => Origin::Igp,
                "egp" => Origin::Egp,
                "incomplete" => Origin::Incomplete,
                other => return Err(invalid(format!("Unsupported origin: '{}'", other))),
            };
            matches.push(Match::Origin(origin));
        }

        let mut actions = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            actions.push(parse_action(action)?);
        }
        Ok(Rule { matches, actions })
    }
}

/// Parse "verb" or "verb arg" action strings from the config file
fn parse_action(action: &str) -> io::Result<Action> {
    let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidInput, reason);
    let mut parts = action.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next();
    let parsed = match (verb.as_str(), arg) {
        ("accept", None) => Action::Accept,
        ("reject", None) => Action::Reject,
        ("set-local-pref", Some(value)) => Action::SetLocalPref(
            value
                .parse()
                .map_err(|_| invalid(format!("Invalid local-pref: '{}'", value)))?,
        ),
        ("set-med", Some(value)) => Action::SetMultiExitDisc(
            value
                .parse()
                .map_err(|_| invalid(format!("Invalid MED: '{}'", value)))?,
        ),
        ("set-next-hop", Some(value)) => Action::SetNextHop(
            value
                .parse()
                .map_err(|_| invalid(format!("Invalid next-hop: '{}'", value)))?,
        ),
        ("prepend-as-path", Some(value)) => {
            let (asn, count) = match value.split_once('x') {
                Some((asn, count)) => (
                    asn.parse()
                        .map_err(|_| invalid(format!("Invalid ASN: '{}'", asn)))?,
                    count
                        .parse()
                        .map_err(|_| invalid(format!("Invalid count: '{}'", count)))?,
                ),
                None => (
                    value
                        .parse()
                        .map_err(|_| invalid(format!("Invalid ASN: '{}'", value)))?,
                    1,
                ),
            };
            Action::PrependAsPath { asn, count }
        }
        ("add-community", Some(value)) => Action::AddCommunity(Community::try_from(value)?),
        ("remove-community", Some(value)) => Action::RemoveCommunity(Community::try_from(value)?),
        ("set-community", Some(value)) => {
            Action::SetCommunities(vec![Community::try_from(value)?])
        }
        _ => return Err(invalid(format!("Unsupported action: '{}'", action))),
    };
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::AsPath;

    fn attributes(as_path: Vec<u32>) -> RouteAttributes {
        RouteAttributes {
            origin: Origin::Igp,
            as_path: AsPath::from_sequence(as_path),
            next_hop: "192.0.2.2".parse().unwrap(),
            local_pref: None,
            med: None,
            atomic_aggregate: false,
            aggregator: None,
            communities: Default::default(),
            originator_id: None,
            cluster_list: vec![],
        }
    }

    fn prefix(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_reject() {
        let policy = Policy {
            name: "deny".into(),
            rules: vec![],
            default_action: PolicyAction::Reject,
        };
        assert!(policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002]))
            .is_none());
    }

    #[test]
    fn test_first_match_fires_and_stops() {
        let policy = Policy {
            name: "lp".into(),
            rules: vec![
                Rule {
                    matches: vec![Match::Prefix {
                        prefix: prefix("203.0.113.0/24"),
                        min_length: None,
                        max_length: None,
                    }],
                    actions: vec![Action::SetLocalPref(200)],
                },
                Rule {
                    matches: vec![],
                    actions: vec![Action::SetLocalPref(50)],
                },
            ],
            default_action: PolicyAction::Accept,
        };
        let result = policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002]))
            .unwrap();
        assert_eq!(result.local_pref, Some(200));
        // A non-matching prefix falls to the catch-all rule
        let result = policy
            .evaluate(&prefix("198.51.100.0/24"), &attributes(vec![65002]))
            .unwrap();
        assert_eq!(result.local_pref, Some(50));
    }

    #[test]
    fn test_reject_action_drops_route() {
        let policy = Policy {
            name: "no-long-paths".into(),
            rules: vec![Rule {
                matches: vec![Match::AsPathRegex(Regex::new("65666").unwrap())],
                actions: vec![Action::Reject],
            }],
            default_action: PolicyAction::Accept,
        };
        assert!(policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002, 65666]))
            .is_none());
        assert!(policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002]))
            .is_some());
    }

    #[test]
    fn test_prefix_length_range() {
        let policy = Policy {
            name: "range".into(),
            rules: vec![Rule {
                matches: vec![Match::Prefix {
                    prefix: prefix("10.0.0.0/8"),
                    min_length: Some(16),
                    max_length: Some(24),
                }],
                actions: vec![Action::Reject],
            }],
            default_action: PolicyAction::Accept,
        };
        assert!(policy
            .evaluate(&prefix("10.1.0.0/16"), &attributes(vec![]))
            .is_none());
        // Too specific: outside the range, accepted by default
        assert!(policy
            .evaluate(&prefix("10.1.1.1/32"), &attributes(vec![]))
            .is_some());
        // Different supernet entirely
        assert!(policy
            .evaluate(&prefix("192.168.0.0/16"), &attributes(vec![]))
            .is_some());
    }

    #[test]
    fn test_prepend_and_community_actions() {
        let policy = Policy {
            name: "prepend".into(),
            rules: vec![Rule {
                matches: vec![],
                actions: vec![
                    Action::PrependAsPath {
                        asn: 65001,
                        count: 2,
                    },
                    Action::AddCommunity(Community::new(65001, 666)),
                ],
            }],
            default_action: PolicyAction::Accept,
        };
        let result = policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002]))
            .unwrap();
        assert_eq!(result.as_path.length(), 3);
        assert!(result.communities.contains(Community::new(65001, 666)));
    }

    #[test]
    fn test_spec_builds() {
        let spec = PolicySpec {
            name: "from-config".into(),
            default_action: "reject".into(),
            rules: vec![RuleSpec {
                prefix: Some("203.0.113.0/24".into()),
                actions: vec!["set-local-pref 200".into(), "accept".into()],
                ..RuleSpec::default()
            }],
        };
        let policy = spec.build().unwrap();
        assert_eq!(policy.default_action, PolicyAction::Reject);
        assert_eq!(policy.rules.len(), 1);
        let result = policy
            .evaluate(&prefix("203.0.113.0/24"), &attributes(vec![65002]))
            .unwrap();
        assert_eq!(result.local_pref, Some(200));
    }

    #[test]
    fn test_bad_action_rejected() {
        assert!(parse_action("frobnicate 12").is_err());
        assert!(parse_action("set-local-pref abc").is_err());
    }
}

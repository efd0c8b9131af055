//! Turns `docker inspect` output into a [`ContainerRecord`].
//!
//! The transformation is pure: every field the Engine API may omit is
//! treated as empty, so a partially populated inspect response still yields
//! a usable (possibly empty) record.

use std::collections::{BTreeMap, BTreeSet};

use bollard::models::ContainerInspectResponse;

use crate::types::{ContainerRecord, NetworkBinding};

/// Conventions used to recognise the reverse proxy and the hostnames it
/// claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRules {
    /// Image prefix identifying the proxy container, e.g. `traefik:`.
    pub image_prefix: String,
    /// Label holding the proxy routing rule.
    pub rule_label: String,
    /// Prefix of a rule value that lists hostnames, e.g. `Host:`.
    pub rule_prefix: String,
}

impl Default for ProxyRules {
    fn default() -> Self {
        Self {
            image_prefix: "traefik:".into(),
            rule_label: "traefik.frontend.rule".into(),
            rule_prefix: "Host:".into(),
        }
    }
}

/// Builds the record for container `id` from its inspect response.
pub fn extract_record(
    id: &str,
    detail: &ContainerInspectResponse,
    rules: &ProxyRules,
) -> ContainerRecord {
    let config = detail.config.as_ref();
    let hostname = config
        .and_then(|c| c.hostname.as_deref())
        .unwrap_or_default();
    let name = detail
        .name
        .as_deref()
        .unwrap_or_default()
        .trim_start_matches('/');
    let image = config.and_then(|c| c.image.as_deref()).unwrap_or_default();

    let mut implicit = BTreeSet::new();
    for domain in [name, hostname] {
        if !domain.is_empty() {
            implicit.insert(domain.to_string());
        }
    }

    let mut networks = Vec::new();
    if let Some(settings) = &detail.network_settings {
        // Ordered by network name so the record never depends on map order.
        let scoped: BTreeMap<_, _> = settings.networks.iter().flatten().collect();
        for (network, endpoint) in scoped {
            let aliases = endpoint.aliases.as_deref().unwrap_or_default();
            if aliases.is_empty() {
                continue;
            }
            let mut domains = implicit.clone();
            domains.extend(aliases.iter().filter(|a| !a.is_empty()).cloned());
            networks.push(NetworkBinding {
                ip: endpoint.ip_address.clone().unwrap_or_default(),
                name: network.clone(),
                domains,
            });
        }

        if let Some(ip) = settings.ip_address.as_deref().filter(|ip| !ip.is_empty()) {
            networks.push(NetworkBinding {
                ip: ip.to_string(),
                name: String::new(),
                domains: implicit.clone(),
            });
        }
    }

    let labels = config.and_then(|c| c.labels.as_ref());
    let proxy_claimed_hostnames = labels
        .and_then(|labels| labels.get(&rules.rule_label))
        .map(|rule| parse_host_rule(rule, &rules.rule_prefix))
        .unwrap_or_default();

    ContainerRecord {
        id: id.to_string(),
        networks,
        proxy_claimed_hostnames,
        is_proxy: image.starts_with(&rules.image_prefix),
    }
}

/// Parses a `Host:a.example,b.example` routing rule into its hostnames.
/// Rules of any other shape claim nothing.
pub fn parse_host_rule(rule: &str, prefix: &str) -> BTreeSet<String> {
    let Some(hosts) = rule.strip_prefix(prefix) else {
        return BTreeSet::new();
    };
    hosts
        .split(',')
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
        .collect()
}

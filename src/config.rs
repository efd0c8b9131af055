use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::extract::ProxyRules;

/// Synchronize running docker container IPs with the host's hosts file.
#[derive(Debug, Default, Parser, Serialize)]
#[command(version, about)]
pub struct Cli {
    /// The docker socket to listen for docker events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<String>,

    /// The hosts file to sync the containers with.
    #[arg(value_name = "FILE")]
    #[serde(rename = "hosts_file", skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub socket: String,
    pub hosts_file: PathBuf,
    pub proxy_image_prefix: String,
    pub proxy_rule_label: String,
    pub proxy_rule_prefix: String,
    pub reconnect_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let rules = ProxyRules::default();
        Self {
            socket: "/var/run/docker.sock".into(),
            hosts_file: "/etc/hosts".into(),
            proxy_image_prefix: rules.image_prefix,
            proxy_rule_label: rules.rule_label,
            proxy_rule_prefix: rules.rule_prefix,
            reconnect_delay_secs: 2,
        }
    }
}

impl Config {
    /// Defaults, then `hoster.toml`, `hoster.json`, `HOSTER_*` variables and
    /// finally command line arguments, later sources winning.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("hoster.toml"))
            .merge(Json::file("hoster.json"))
            .merge(Env::prefixed("HOSTER_"))
            .merge(Serialized::defaults(cli))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    pub fn proxy_rules(&self) -> ProxyRules {
        ProxyRules {
            image_prefix: self.proxy_image_prefix.clone(),
            rule_label: self.proxy_rule_label.clone(),
            rule_prefix: self.proxy_rule_prefix.clone(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

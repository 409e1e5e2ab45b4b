use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the schedscope agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Time between sample cycles. Minimum 10 ms. Default: 200 ms.
    #[serde(default = "default_sampling_interval", with = "humantime_serde")]
    pub sampling_interval: Duration,

    /// Samples kept in the in-memory ring. Default: 3000.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Maximum process-table size scanned per cycle. Default: 3000.
    #[serde(default = "default_max_procs")]
    pub max_procs: usize,

    /// Probability per cycle of running an identity-cache prune pass.
    /// Default: 0.001.
    #[serde(default = "default_prune_chance")]
    pub prune_chance: f64,

    /// Usernames to sample, comma/space separated. Empty samples everyone.
    #[serde(default)]
    pub user_filter: String,

    /// PIDs to sample, comma/space separated. Empty samples everything.
    #[serde(default)]
    pub pid_filter: String,

    /// Query endpoint configuration.
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often to log usage statistics. Zero disables. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Query endpoint configuration. The endpoint serves samples to local
/// clients only, so the host must be a loopback address.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Bind host. Default: "127.0.0.1".
    #[serde(default = "default_rpc_host")]
    pub host: String,

    /// Bind port. Default: 1971.
    #[serde(default = "default_rpc_port")]
    pub port: u16,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_sampling_interval() -> Duration {
    Duration::from_millis(200)
}

fn default_ring_capacity() -> usize {
    3000
}

fn default_max_procs() -> usize {
    3000
}

fn default_prune_chance() -> f64 {
    0.001
}

fn default_rpc_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    1971
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            sampling_interval: default_sampling_interval(),
            ring_capacity: default_ring_capacity(),
            max_procs: default_max_procs(),
            prune_chance: default_prune_chance(),
            user_filter: String::new(),
            pid_filter: String::new(),
            rpc: RpcConfig::default(),
            health: HealthConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            host: default_rpc_host(),
            port: default_rpc_port(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.sampling_interval < Duration::from_millis(10) {
            bail!("the minimum sampling interval is 10ms");
        }

        if self.ring_capacity == 0 {
            bail!("ring_capacity must be positive");
        }

        if self.max_procs == 0 {
            bail!("max_procs must be positive");
        }

        if !(0.0..=1.0).contains(&self.prune_chance) {
            bail!("prune_chance must be within [0, 1]");
        }

        let host: IpAddr = self
            .rpc
            .host
            .parse()
            .with_context(|| format!("invalid rpc host: {}", self.rpc.host))?;
        if !host.is_loopback() {
            bail!("the query endpoint binds to loopback only, got {host}");
        }

        Ok(())
    }

    /// Identity-cache expiry horizon: a PID unseen for a full ring rotation
    /// is eligible for pruning.
    pub fn identity_expiry(&self) -> Duration {
        self.sampling_interval * self.ring_capacity as u32
    }
}

// --- Sampling filters ---

/// Splits a comma/space separated list into its non-empty items.
fn split_list(s: &str) -> Vec<&str> {
    s.split([',', ' '])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Maps username -> UID from `/etc/passwd`-shaped content
/// (`name:password:uid:gid:...`, comments allowed).
pub fn parse_passwd_users(content: &str) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() >= 3 {
            if let Ok(uid) = parts[2].parse::<u32>() {
                map.insert(parts[0].to_string(), uid);
            }
        }
    }
    map
}

/// Optional user/PID restriction of the sampled process set. Empty filters
/// match everything; both lists are kept sorted for binary search.
#[derive(Debug, Default, Clone)]
pub struct Filters {
    users: Vec<u32>,
    pids: Vec<u32>,
}

impl Filters {
    /// Builds filters from the config strings, resolving usernames through
    /// `/etc/passwd`. An unknown username is a configuration error.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let users = if cfg.user_filter.is_empty() {
            Vec::new()
        } else {
            let passwd = std::fs::read_to_string("/etc/passwd")
                .context("reading /etc/passwd for the user filter")?;
            Self::resolve_users(&cfg.user_filter, &parse_passwd_users(&passwd))?
        };

        let pids = Self::parse_pids(&cfg.pid_filter)?;

        Ok(Self::from_parts(users, pids))
    }

    /// Assembles filters from already-resolved lists.
    pub fn from_parts(mut users: Vec<u32>, mut pids: Vec<u32>) -> Self {
        users.sort_unstable();
        pids.sort_unstable();
        Self { users, pids }
    }

    fn resolve_users(list: &str, passwd: &HashMap<String, u32>) -> Result<Vec<u32>> {
        split_list(list)
            .into_iter()
            .map(|name| {
                passwd
                    .get(name)
                    .copied()
                    .with_context(|| format!("unknown user in user_filter: {name}"))
            })
            .collect()
    }

    fn parse_pids(list: &str) -> Result<Vec<u32>> {
        split_list(list)
            .into_iter()
            .map(|p| {
                p.parse::<u32>()
                    .with_context(|| format!("invalid pid in pid_filter: {p}"))
            })
            .collect()
    }

    /// True when `pid` passes the PID restriction.
    pub fn pid_match(&self, pid: u32) -> bool {
        self.pids.is_empty() || self.pids.binary_search(&pid).is_ok()
    }

    /// True when `uid` passes the user restriction.
    pub fn user_match(&self, uid: u32) -> bool {
        self.users.is_empty() || self.users.binary_search(&uid).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.sampling_interval, Duration::from_millis(200));
        assert_eq!(cfg.ring_capacity, 3000);
        assert_eq!(cfg.max_procs, 3000);
        assert_eq!(cfg.prune_chance, 0.001);
        assert_eq!(cfg.rpc.host, "127.0.0.1");
        assert_eq!(cfg.rpc.port, 1971);
        assert_eq!(cfg.health.addr, ":9090");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_overrides() {
        let yaml = "\
sampling_interval: 50ms
ring_capacity: 100
pid_filter: \"1, 2 3\"
rpc:
  port: 2020
";
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.sampling_interval, Duration::from_millis(50));
        assert_eq!(cfg.ring_capacity, 100);
        assert_eq!(cfg.rpc.port, 2020);
        assert_eq!(cfg.rpc.host, "127.0.0.1");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_fast_interval() {
        let cfg = Config {
            sampling_interval: Duration::from_millis(9),
            ..Config::default()
        };
        let err = cfg.validate().expect_err("must fail");
        assert!(err.to_string().contains("10ms"));
    }

    #[test]
    fn test_validate_rejects_non_loopback() {
        let cfg = Config {
            rpc: RpcConfig {
                host: "0.0.0.0".to_string(),
                port: 1971,
            },
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            rpc: RpcConfig {
                host: "::1".to_string(),
                port: 1971,
            },
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prune_chance() {
        let cfg = Config {
            prune_chance: 1.5,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_identity_expiry() {
        let cfg = Config {
            sampling_interval: Duration::from_millis(200),
            ring_capacity: 10,
            ..Config::default()
        };
        assert_eq!(cfg.identity_expiry(), Duration::from_secs(2));
    }

    #[test]
    fn test_parse_passwd_users() {
        let content = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
# comment
svc:x:1500:1500::/home/svc:/bin/bash
";
        let map = parse_passwd_users(content);
        assert_eq!(map.get("root"), Some(&0));
        assert_eq!(map.get("svc"), Some(&1500));
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn test_filters_empty_match_all() {
        let f = Filters::default();
        assert!(f.pid_match(1));
        assert!(f.user_match(12345));
    }

    #[test]
    fn test_pid_filter_matches_listed_only() {
        let f = Filters::from_parts(vec![], vec![30, 10, 20]);
        assert!(f.pid_match(10));
        assert!(f.pid_match(30));
        assert!(!f.pid_match(15));
    }

    #[test]
    fn test_user_filter_resolution() {
        let mut passwd = HashMap::new();
        passwd.insert("alice".to_string(), 1001);
        passwd.insert("bob".to_string(), 1002);

        let users = Filters::resolve_users("alice, bob", &passwd).expect("resolve");
        let f = Filters::from_parts(users, vec![]);
        assert!(f.user_match(1001));
        assert!(f.user_match(1002));
        assert!(!f.user_match(0));

        assert!(Filters::resolve_users("mallory", &passwd).is_err());
    }

    #[test]
    fn test_pid_filter_rejects_garbage() {
        assert!(Filters::parse_pids("12,abc").is_err());
        assert_eq!(Filters::parse_pids("5 6,7").expect("parse"), vec![5, 6, 7]);
    }
}

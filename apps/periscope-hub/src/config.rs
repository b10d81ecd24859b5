use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: IpAddr,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    pub ended_retention_seconds: u64,
    pub sweep_interval_seconds: u64,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PERISCOPE_HUB_PORT").unwrap_or(defaults.port),
            bind: env_parse("PERISCOPE_HUB_BIND").unwrap_or(defaults.bind),
            heartbeat_interval_seconds: env_parse("PERISCOPE_HEARTBEAT_INTERVAL")
                .unwrap_or(defaults.heartbeat_interval_seconds),
            heartbeat_timeout_seconds: env_parse("PERISCOPE_HEARTBEAT_TIMEOUT")
                .unwrap_or(defaults.heartbeat_timeout_seconds),
            ended_retention_seconds: env_parse("PERISCOPE_ENDED_RETENTION")
                .unwrap_or(defaults.ended_retention_seconds),
            sweep_interval_seconds: env_parse("PERISCOPE_SWEEP_INTERVAL")
                .unwrap_or(defaults.sweep_interval_seconds),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn ended_retention(&self) -> Duration {
        Duration::from_secs(self.ended_retention_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            heartbeat_interval_seconds: 60,
            heartbeat_timeout_seconds: 600, // 10 minutes
            ended_retention_seconds: 3600,
            sweep_interval_seconds: 300,
        }
    }
}

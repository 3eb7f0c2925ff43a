//! ITR configuration
//!
//! Runtime tunables for workers plus the textual form of static map-cache
//! entries accepted on the command line.

use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv6Net;
use thiserror::Error;

use crate::map_cache::{DEFAULT_PUNT_INTERVAL, MapCacheConfig, PKT_BUFFER_CAPACITY, Rloc};
use crate::punt::PUNT_CHANNEL_CAPACITY;

/// Default capture poll deadline
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait between EID registry lookups at worker startup
pub const DEFAULT_EID_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Log one send error out of this many per worker
pub const SEND_ERROR_LOG_EVERY: u64 = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected <iid>/<prefix>=<rloc>[,<priority>[,<weight>]], got {0:?}")]
    Syntax(String),
    #[error("invalid instance ID {0:?}")]
    InvalidIid(String),
    #[error("invalid EID prefix {0:?}")]
    InvalidPrefix(String),
    #[error("invalid RLOC address {0:?}")]
    InvalidRloc(String),
    #[error("invalid priority or weight {0:?}")]
    InvalidNumber(String),
}

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct ItrConfig {
    /// Upper bound on one capture poll; also bounds terminate latency
    pub poll_interval: Duration,
    /// Wait between registry lookups while an interface has no EIDs
    pub eid_retry_interval: Duration,
    /// Minimum time between punts for one unresolved entry
    pub punt_interval: Duration,
    /// Capacity of the punt channel
    pub punt_capacity: usize,
    /// Packets buffered per unresolved entry
    pub buffer_capacity: usize,
    /// Source address of outer IPv6 headers
    pub ipv6_source: Option<Ipv6Addr>,
}

impl Default for ItrConfig {
    fn default() -> Self {
        ItrConfig {
            poll_interval: DEFAULT_POLL_INTERVAL,
            eid_retry_interval: DEFAULT_EID_RETRY_INTERVAL,
            punt_interval: DEFAULT_PUNT_INTERVAL,
            punt_capacity: PUNT_CHANNEL_CAPACITY,
            buffer_capacity: PKT_BUFFER_CAPACITY,
            ipv6_source: None,
        }
    }
}

impl ItrConfig {
    pub fn map_cache_config(&self) -> MapCacheConfig {
        MapCacheConfig {
            buffer_capacity: self.buffer_capacity,
            punt_interval: self.punt_interval,
        }
    }

    /// Outer IPv6 source, `::` when none is configured.
    pub fn ipv6_source_or_unspecified(&self) -> Ipv6Addr {
        self.ipv6_source.unwrap_or(Ipv6Addr::UNSPECIFIED)
    }
}

/// A map-cache entry given on the command line.
///
/// Syntax: `<iid>/<prefix>=<rloc>[,<priority>[,<weight>]]`, for example
/// `42/fd00::/64=192.0.2.1,1,100`. A prefix without a length is a host
/// route. Priority and weight default to 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMapping {
    pub iid: u32,
    pub prefix: Ipv6Net,
    pub rloc: IpAddr,
    pub priority: u8,
    pub weight: u8,
}

impl StaticMapping {
    pub fn to_rloc(&self) -> Rloc {
        Rloc::new(self.rloc, self.priority, self.weight)
    }
}

impl FromStr for StaticMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::Syntax(s.to_string()))?;
        let (iid, prefix) = key
            .split_once('/')
            .ok_or_else(|| ConfigError::Syntax(s.to_string()))?;

        let iid: u32 = iid
            .parse()
            .map_err(|_| ConfigError::InvalidIid(iid.to_string()))?;
        if iid > 0x00ff_ffff {
            return Err(ConfigError::InvalidIid(iid.to_string()));
        }

        let prefix = if prefix.contains('/') {
            prefix
                .parse::<Ipv6Net>()
                .map_err(|_| ConfigError::InvalidPrefix(prefix.to_string()))?
        } else {
            prefix
                .parse::<Ipv6Addr>()
                .map(Ipv6Net::from)
                .map_err(|_| ConfigError::InvalidPrefix(prefix.to_string()))?
        };

        let mut fields = value.split(',');
        let rloc = fields.next().unwrap_or_default();
        let rloc: IpAddr = rloc
            .parse()
            .map_err(|_| ConfigError::InvalidRloc(rloc.to_string()))?;

        let mut number = |default: u8| -> Result<u8, ConfigError> {
            match fields.next() {
                Some(v) => v
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber(v.to_string())),
                None => Ok(default),
            }
        };
        let priority = number(1)?;
        let weight = number(1)?;
        if fields.next().is_some() {
            return Err(ConfigError::Syntax(s.to_string()));
        }

        Ok(StaticMapping {
            iid,
            prefix: prefix.trunc(),
            rloc,
            priority,
            weight,
        })
    }
}

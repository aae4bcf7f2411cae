use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use derive_more::{Display, From, Into};
use thiserror::Error;

use crate::program::Address;
use crate::time::Duration;

/// An address reduced to cache-line granularity (tag and set bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into, Display)]
#[display(fmt = "{:#x}", _0)]
pub struct TagSet(pub u64);

/// Error type returned when a cache configuration cannot be read or
/// describes an impossible geometry.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read cache configuration {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache configuration lacks the {0} field")]
    Missing(&'static str),
    #[error("invalid {field} {value:?} in cache configuration")]
    Invalid { field: &'static str, value: String },
    #[error("{field} must be a power of two, got {value}")]
    NotPowerOfTwo { field: &'static str, value: u64 },
    #[error("associativity must be at least one")]
    ZeroAssociativity,
}

/// The geometry and timing of one cache level.
///
/// Configurations are read from a whitespace-separated record of five
/// integers: number of sets, associativity, line size in bytes, hit
/// latency and miss latency (both in cycles).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    sets: usize,
    assoc: usize,
    line_size: u64,
    hit_latency: Duration,
    miss_latency: Duration,
    line_bits: u32,
    set_mask: u64,
}

impl CacheConfig {
    pub fn new(
        sets: usize,
        assoc: usize,
        line_size: u64,
        hit_latency: Duration,
        miss_latency: Duration,
    ) -> Result<Self, ConfigError> {
        if !sets.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "number of sets",
                value: sets as u64,
            });
        }
        if !line_size.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                field: "line size",
                value: line_size,
            });
        }
        if assoc == 0 {
            return Err(ConfigError::ZeroAssociativity);
        }
        Ok(CacheConfig {
            sets,
            assoc,
            line_size,
            hit_latency,
            miss_latency,
            line_bits: line_size.trailing_zeros(),
            set_mask: sets as u64 - 1,
        })
    }

    /// Read a configuration record from `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        text.parse()
    }

    pub fn sets(&self) -> usize {
        self.sets
    }

    pub fn associativity(&self) -> usize {
        self.assoc
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    pub fn hit_latency(&self) -> Duration {
        self.hit_latency
    }

    pub fn miss_latency(&self) -> Duration {
        self.miss_latency
    }

    /// The cache line an address belongs to.
    pub fn tagset(&self, addr: Address) -> TagSet {
        TagSet(addr >> self.line_bits)
    }

    /// The cache set a line maps to.
    pub fn set_of(&self, line: TagSet) -> usize {
        (line.0 & self.set_mask) as usize
    }

    /// The cache set an address maps to.
    pub fn set_index(&self, addr: Address) -> usize {
        self.set_of(self.tagset(addr))
    }
}

impl FromStr for CacheConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let mut next = |field: &'static str| -> Result<u64, ConfigError> {
            let token = fields.next().ok_or(ConfigError::Missing(field))?;
            token.parse().map_err(|_| ConfigError::Invalid {
                field,
                value: token.to_owned(),
            })
        };
        let sets = next("number of sets")?;
        let assoc = next("associativity")?;
        let line_size = next("line size")?;
        let hit = next("hit latency")?;
        let miss = next("miss latency")?;
        CacheConfig::new(sets as usize, assoc as usize, line_size, hit, miss)
    }
}

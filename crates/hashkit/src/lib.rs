//! Key hashing and server distribution for sharded cache pools.
//!
//! A pool names one of twelve hash functions and one of three distributions.
//! The distribution precomputes a [`Continuum`] over the live servers; every
//! forwarded request hashes its routing key and dispatches through the
//! continuum to a server index.

use std::fmt;
use std::str::FromStr;

pub mod hashes;

mod continuum;
pub use continuum::{hash_key, Continuum, Seed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hash {
    OneAtATime,
    Md5,
    Crc16,
    Crc32,
    Crc32a,
    Fnv1_64,
    Fnv1a_64,
    Fnv1_32,
    Fnv1a_32,
    Hsieh,
    Murmur,
    Jenkins,
}

impl Default for Hash {
    fn default() -> Self {
        Hash::Fnv1a_64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distribution {
    Ketama,
    Modula,
    Random,
}

impl Default for Distribution {
    fn default() -> Self {
        Distribution::Ketama
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown hash function {0:?}")]
pub struct UnknownHash(pub String);

#[derive(Debug, thiserror::Error)]
#[error("unknown distribution {0:?}")]
pub struct UnknownDistribution(pub String);

impl FromStr for Hash {
    type Err = UnknownHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "one_at_a_time" => Hash::OneAtATime,
            "md5" => Hash::Md5,
            "crc16" => Hash::Crc16,
            "crc32" => Hash::Crc32,
            "crc32a" => Hash::Crc32a,
            "fnv1_64" => Hash::Fnv1_64,
            "fnv1a_64" => Hash::Fnv1a_64,
            "fnv1_32" => Hash::Fnv1_32,
            "fnv1a_32" => Hash::Fnv1a_32,
            "hsieh" => Hash::Hsieh,
            "murmur" => Hash::Murmur,
            "jenkins" => Hash::Jenkins,
            _ => return Err(UnknownHash(s.to_string())),
        })
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hash::OneAtATime => "one_at_a_time",
            Hash::Md5 => "md5",
            Hash::Crc16 => "crc16",
            Hash::Crc32 => "crc32",
            Hash::Crc32a => "crc32a",
            Hash::Fnv1_64 => "fnv1_64",
            Hash::Fnv1a_64 => "fnv1a_64",
            Hash::Fnv1_32 => "fnv1_32",
            Hash::Fnv1a_32 => "fnv1a_32",
            Hash::Hsieh => "hsieh",
            Hash::Murmur => "murmur",
            Hash::Jenkins => "jenkins",
        };
        f.write_str(name)
    }
}

impl FromStr for Distribution {
    type Err = UnknownDistribution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ketama" => Distribution::Ketama,
            "modula" => Distribution::Modula,
            "random" => Distribution::Random,
            _ => return Err(UnknownDistribution(s.to_string())),
        })
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Distribution::Ketama => "ketama",
            Distribution::Modula => "modula",
            Distribution::Random => "random",
        })
    }
}

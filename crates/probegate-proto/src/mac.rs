//! Hardware address parsing and canonical formatting
//!
//! Probes report their MAC in whatever format the platform gives them
//! (`AA-BB-CC-DD-EE-FF`, `aabb.ccdd.eeff`, ...). Everything stored or
//! compared uses the canonical lower-case colon-separated form.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced when parsing a MAC address
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MacError {
    #[error("MAC address is empty")]
    Empty,

    #[error("Invalid MAC address length: {0} hex digits (expected 12)")]
    InvalidLength(usize),

    #[error("Invalid character '{0}' in MAC address")]
    InvalidCharacter(char),
}

/// A 48-bit hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Lower-case hex without separators (`aabbccddeeff`)
    pub fn compact(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(MacError::Empty);
        }

        let mut nibbles = Vec::with_capacity(12);
        for c in trimmed.chars() {
            match c {
                ':' | '-' | '.' => continue,
                c => match c.to_digit(16) {
                    Some(n) => nibbles.push(n as u8),
                    None => return Err(MacError::InvalidCharacter(c)),
                },
            }
        }

        if nibbles.len() != 12 {
            return Err(MacError::InvalidLength(nibbles.len()));
        }

        let mut octets = [0u8; 6];
        for (i, pair) in nibbles.chunks(2).enumerate() {
            octets[i] = (pair[0] << 4) | pair[1];
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(mac.octets(), [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    }

    #[test]
    fn test_parse_normalizes_formats() {
        for raw in [
            "AA:BB:CC:DD:EE:FF",
            "aa-bb-cc-dd-ee-ff",
            "aabb.ccdd.eeff",
            "AABBCCDDEEFF",
            "  aa:bb:cc:dd:ee:ff\n",
        ] {
            let mac: MacAddress = raw.parse().unwrap();
            assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff", "input {:?}", raw);
        }
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!("".parse::<MacAddress>(), Err(MacError::Empty));
        assert_eq!(
            "aa:bb:cc".parse::<MacAddress>(),
            Err(MacError::InvalidLength(6))
        );
        assert_eq!(
            "aa:bb:cc:dd:ee:gg".parse::<MacAddress>(),
            Err(MacError::InvalidCharacter('g'))
        );
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_compact() {
        let mac: MacAddress = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(mac.compact(), "112233445566");
    }

    #[test]
    fn test_serde_as_string() {
        let mac: MacAddress = "AA-BB-CC-DD-EE-01".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:01\"");

        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);

        assert!(serde_json::from_str::<MacAddress>("\"nope\"").is_err());
    }
}

//! Bus addressing

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ProtocolError;

/// The 2-byte address a TWC picks at random on startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TwcId(pub [u8; 2]);

impl TwcId {
    pub const fn new(hi: u8, lo: u8) -> Self {
        Self([hi, lo])
    }

    /// Pick a fresh random address
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self([rng.gen(), rng.gen()])
    }

    /// Pick a fresh random address different from `avoid`
    pub fn reroll(avoid: TwcId) -> Self {
        loop {
            let id = Self::random();
            if id != avoid {
                return id;
            }
        }
    }

    pub fn bytes(&self) -> [u8; 2] {
        self.0
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        Self([bytes[0], bytes[1]])
    }
}

impl fmt::Display for TwcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}{:02X}", self.0[0], self.0[1])
    }
}

impl FromStr for TwcId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 4 || !s.is_ascii() {
            return Err(ProtocolError::InvalidLength(s.len()));
        }
        let hi = u8::from_str_radix(&s[..2], 16).map_err(|_| ProtocolError::InvalidLength(s.len()))?;
        let lo = u8::from_str_radix(&s[2..], 16).map_err(|_| ProtocolError::InvalidLength(s.len()))?;
        Ok(Self([hi, lo]))
    }
}

impl Serialize for TwcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TwcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Random per-device byte sent with linkready frames
pub fn random_sign() -> u8 {
    rand::thread_rng().gen()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let id = TwcId::new(0x11, 0x22);
        assert_eq!(id.to_string(), "1122");
        assert_eq!("1122".parse::<TwcId>().unwrap(), id);
        assert_eq!("ab0f".parse::<TwcId>().unwrap(), TwcId::new(0xAB, 0x0F));
        assert!("12345".parse::<TwcId>().is_err());
        assert!("zz00".parse::<TwcId>().is_err());
    }

    #[test]
    fn test_reroll_differs() {
        let id = TwcId::new(0x77, 0x77);
        for _ in 0..50 {
            assert_ne!(TwcId::reroll(id), id);
        }
    }
}

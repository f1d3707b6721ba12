//! 64-bit XBee node addresses.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is too long ({0} chars)")]
    TooLong(usize),

    #[error("Address is too short ({0} chars)")]
    TooShort(usize),
}

/// The IEEE 64-bit address of a node on the radio network.
///
/// Parsed leniently from text: every non-hex character is treated as a
/// separator, and between 1 and 16 hex digits must remain. Displayed in the
/// canonical `[00:13:A2:00:40:0A:0B:0C]!` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XBeeAddress(u64);

impl XBeeAddress {
    /// The broadcast address, also accepted as the literal `broadcast`.
    pub const BROADCAST: XBeeAddress = XBeeAddress(0xFFFF);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Parses a command target, accepting the `broadcast` alias.
    pub fn parse_target(text: &str) -> Result<Self, AddressError> {
        if text == "broadcast" {
            Ok(Self::BROADCAST)
        } else {
            text.parse()
        }
    }

    /// The address as a bus topic segment, e.g. `0013A200400A0B0C`.
    pub fn topic_segment(&self) -> String {
        format!("{:016X}", self.0)
    }
}

impl FromStr for XBeeAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(char::is_ascii_hexdigit).collect();
        match digits.len() {
            0 => Err(AddressError::TooShort(0)),
            n if n > 16 => Err(AddressError::TooLong(n)),
            _ => u64::from_str_radix(&digits, 16)
                .map(XBeeAddress)
                .map_err(|_| AddressError::TooLong(digits.len())),
        }
    }
}

impl From<u64> for XBeeAddress {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for XBeeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, byte) in self.0.to_be_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        f.write_str("]!")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separators_are_ignored_and_case_normalized() {
        let expected = "[00:13:A2:00:40:0A:0B:0C]!";
        for text in [
            "0013a200400a0b0c",
            "00:13:A2:00:40:0A:0B:0C",
            "[00:13:a2:00:40:0a:0b:0c]!",
            "00-13-a2-00 40-0a-0b-0c",
        ] {
            assert_eq!(text.parse::<XBeeAddress>().unwrap().to_string(), expected);
        }
    }

    #[test]
    fn short_values_are_zero_padded() {
        let addr: XBeeAddress = "ffff".parse().unwrap();
        assert_eq!(addr, XBeeAddress::BROADCAST);
        assert_eq!(addr.to_string(), "[00:00:00:00:00:00:FF:FF]!");
        assert_eq!(addr.topic_segment(), "000000000000FFFF");
    }

    #[test]
    fn digit_count_is_bounded() {
        assert_eq!(
            "0013A200400A0B0C0".parse::<XBeeAddress>(),
            Err(AddressError::TooLong(17))
        );
        assert_eq!("[]!".parse::<XBeeAddress>(), Err(AddressError::TooShort(0)));
        assert_eq!(
            XBeeAddress::parse_target("broadcast"),
            Ok(XBeeAddress::BROADCAST)
        );
    }
}

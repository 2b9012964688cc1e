//! CONNACK return codes
//!
//! v3.1.1 uses return codes 0-5, v5.0 uses reason codes where anything
//! at or above 0x80 is a refusal. Both fit in one byte, so the code is kept
//! raw and interpreted on demand.

use std::fmt;

/// Result of a CONNECT as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnectReturnCode(pub u8);

impl ConnectReturnCode {
    pub const ACCEPTED: Self = Self(0x00);

    /// Check if the broker accepted the connection
    #[inline]
    pub fn is_success(self) -> bool {
        self.0 == 0x00
    }

    pub fn code(self) -> u8 {
        self.0
    }

    fn describe(self) -> &'static str {
        match self.0 {
            0x00 => "connection accepted",
            0x01 => "unacceptable protocol version",
            0x02 => "identifier rejected",
            0x03 => "server unavailable",
            0x04 => "bad user name or password",
            0x05 => "not authorized",
            0x80 => "unspecified error",
            0x81 => "malformed packet",
            0x82 => "protocol error",
            0x83 => "implementation specific error",
            0x84 => "unsupported protocol version",
            0x85 => "client identifier not valid",
            0x86 => "bad user name or password",
            0x87 => "not authorized",
            0x88 => "server unavailable",
            0x89 => "server busy",
            0x8A => "banned",
            0x8C => "bad authentication method",
            0x97 => "quota exceeded",
            0x9C => "use another server",
            0x9D => "server moved",
            0x9F => "connection rate exceeded",
            _ => "unknown return code",
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.describe(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted() {
        assert!(ConnectReturnCode::ACCEPTED.is_success());
        assert!(!ConnectReturnCode(0x05).is_success());
        assert!(!ConnectReturnCode(0x87).is_success());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            ConnectReturnCode(0x04).to_string(),
            "bad user name or password (0x04)"
        );
        assert_eq!(ConnectReturnCode(0x89).to_string(), "server busy (0x89)");
    }
}

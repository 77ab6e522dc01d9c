//! Tag UID normalisation.
//!
//! Textual UIDs arrive from configuration in several shapes (`74-10-37-94`,
//! `74:10:37:94`, `74 10 37 94`, any case). They are parsed once here into an
//! ordered byte sequence; everything else in the crate compares bytes and
//! prints the canonical upper-case, hyphen-separated form.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Longest UID any supported protocol produces (ISO14443A triple size).
pub const MAX_UID_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UidError {
    #[error("UID must not be empty")]
    Empty,

    #[error("UID part '{part}' must be exactly 2 hex digits")]
    BadLength { part: String },

    #[error("UID part '{part}' is not valid hexadecimal")]
    BadHex { part: String },

    #[error("UID has {len} bytes, at most {MAX_UID_LEN} are allowed")]
    TooLong { len: usize },
}

/// Unique identifier of a contactless tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(Vec<u8>);

impl Uid {
    /// Wrap raw bytes read from a chip.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UidError> {
        if bytes.is_empty() {
            return Err(UidError::Empty);
        }
        if bytes.len() > MAX_UID_LEN {
            return Err(UidError::TooLong { len: bytes.len() });
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Parse a textual UID into its byte form.
pub fn parse(text: &str) -> Result<Uid, UidError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(UidError::Empty);
    }

    let bytes = trimmed
        .split(|c: char| c == '-' || c == ':' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            if part.len() != 2 {
                return Err(UidError::BadLength {
                    part: part.to_string(),
                });
            }
            u8::from_str_radix(part, 16).map_err(|_| UidError::BadHex {
                part: part.to_string(),
            })
        })
        .collect::<Result<Vec<u8>, UidError>>()?;

    Uid::from_bytes(&bytes)
}

impl FromStr for Uid {
    type Err = UidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hyphen_colon_and_space_forms() {
        let expected = Uid(vec![0x74, 0x10, 0x37, 0x94]);
        assert_eq!(parse("74-10-37-94").unwrap(), expected);
        assert_eq!(parse("74:10:37:94").unwrap(), expected);
        assert_eq!(parse("74 10 37 94").unwrap(), expected);
        assert_eq!(parse("  74-10-37-94\n").unwrap(), expected);
    }

    #[test]
    fn parsing_is_case_insensitive_and_display_is_canonical() {
        let uid = parse("de:ad:be:ef").unwrap();
        assert_eq!(uid.to_string(), "DE-AD-BE-EF");
        assert_eq!(parse(&uid.to_string()).unwrap(), uid);
    }

    #[test]
    fn rejects_malformed_parts() {
        assert_eq!(parse(""), Err(UidError::Empty));
        assert_eq!(parse(" - "), Err(UidError::Empty));
        assert_eq!(
            parse("74-1-37"),
            Err(UidError::BadLength {
                part: "1".to_string()
            })
        );
        assert_eq!(
            parse("74-ZZ-37"),
            Err(UidError::BadHex {
                part: "ZZ".to_string()
            })
        );
        assert_eq!(
            parse("01-02-03-04-05-06-07-08-09-0A-0B"),
            Err(UidError::TooLong { len: 11 })
        );
    }

    #[test]
    fn serde_uses_text_form() {
        let uid: Uid = serde_json::from_str("\"04:a2:2b:1c:5e:80:00\"").unwrap();
        assert_eq!(uid.len(), 7);
        assert_eq!(serde_json::to_string(&uid).unwrap(), "\"04-A2-2B-1C-5E-80-00\"");
        assert!(serde_json::from_str::<Uid>("\"04-XY\"").is_err());
    }
}

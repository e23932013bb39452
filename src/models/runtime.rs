use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Raised for any runtime value that is not a `"<n> mins"` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid runtime format")]
pub struct InvalidRuntimeFormat;

/// A movie's running time in whole minutes, carried over the wire as
/// `"<n> mins"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Runtime(pub i32);

impl Runtime {
    pub fn minutes(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mins", self.0)
    }
}

impl FromStr for Runtime {
    type Err = InvalidRuntimeFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(' ').collect();
        if parts.len() != 2 || parts[1] != "mins" {
            return Err(InvalidRuntimeFormat);
        }
        parts[0]
            .parse::<i32>()
            .map(Runtime)
            .map_err(|_| InvalidRuntimeFormat)
    }
}

impl Serialize for Runtime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct RuntimeVisitor;

impl<'de> Visitor<'de> for RuntimeVisitor {
    type Value = Runtime;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a string of the form \"<n> mins\"")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Runtime, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, _: i64) -> Result<Runtime, E> {
        Err(E::custom(InvalidRuntimeFormat))
    }

    fn visit_u64<E: de::Error>(self, _: u64) -> Result<Runtime, E> {
        Err(E::custom(InvalidRuntimeFormat))
    }

    fn visit_f64<E: de::Error>(self, _: f64) -> Result<Runtime, E> {
        Err(E::custom(InvalidRuntimeFormat))
    }

    fn visit_bool<E: de::Error>(self, _: bool) -> Result<Runtime, E> {
        Err(E::custom(InvalidRuntimeFormat))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Runtime, E> {
        Err(E::custom(InvalidRuntimeFormat))
    }
}

impl<'de> Deserialize<'de> for Runtime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(RuntimeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_round_trip() {
        let runtime: Runtime = serde_json::from_str(r#""102 mins""#).unwrap();
        assert_eq!(runtime, Runtime(102));
        assert_eq!(serde_json::to_string(&runtime).unwrap(), r#""102 mins""#);
    }

    #[test]
    fn test_rejects_malformed_runtime() {
        for raw in [r#""102""#, r#""102 minutes""#, r#""abc mins""#, r#""102  mins""#, "102", "null"] {
            let err = serde_json::from_str::<Runtime>(raw).unwrap_err();
            assert!(
                err.to_string().starts_with("invalid runtime format"),
                "{raw}: {err}"
            );
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!("7 mins".parse::<Runtime>(), Ok(Runtime(7)));
        assert_eq!("7mins".parse::<Runtime>(), Err(InvalidRuntimeFormat));
    }
}

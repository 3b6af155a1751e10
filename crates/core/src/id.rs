//! Strongly-typed identifiers carried through the pipeline.
//!
//! Job and trace ids are produced by upstream publishers, so they are opaque
//! strings rather than UUIDs. The only rules enforced here are the ones every
//! downstream key depends on: non-empty, bounded, no whitespace or control
//! characters (they end up in broker subjects, pub/sub channel names and
//! database keys).

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upper bound on identifier length, in bytes.
pub const MAX_ID_LEN: usize = 256;

/// Identifier of a job (the resumability and dedup key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

/// Distributed trace identifier supplied with a job request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TraceId(String);

fn validate(name: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() {
        return Err(CoreError::invalid_id(format!("{name}: empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CoreError::invalid_id(format!(
            "{name}: longer than {MAX_ID_LEN} bytes"
        )));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::invalid_id(format!(
            "{name}: contains whitespace or control characters"
        )));
    }
    Ok(())
}

macro_rules! impl_string_id {
    ($t:ident, $name:literal) => {
        impl $t {
            /// Validate and wrap an identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                validate($name, &value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $t {
            type Error = CoreError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$t> for String {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

impl_string_id!(JobId, "JobId");
impl_string_id!(TraceId, "TraceId");

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_empty_and_whitespace_ids() {
        assert!(JobId::new("").is_err());
        assert!(JobId::new("job 1").is_err());
        assert!(TraceId::new("trace\n").is_err());
        assert!(JobId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn serde_goes_through_validation() {
        let ok: JobId = serde_json::from_str("\"J1\"").unwrap();
        assert_eq!(ok.as_str(), "J1");
        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"J1\"");

        let err = serde_json::from_str::<JobId>("\"\"");
        assert!(err.is_err());
    }

    proptest! {
        #[test]
        fn accepted_ids_display_unchanged(s in "[A-Za-z0-9_.:-]{1,64}") {
            let id = JobId::new(s.clone()).unwrap();
            prop_assert_eq!(id.to_string(), s);
        }
    }
}

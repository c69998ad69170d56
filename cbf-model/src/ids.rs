use crate::error::{ModelError, Result};
use std::fmt;
use std::str::FromStr;

macro_rules! bounded_id {
    ($(#[$meta:meta])* $name:ident, $repr:ty, $label:literal, $min:expr, $max:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "serde",
            derive(serde::Serialize, serde::Deserialize),
            serde(try_from = "i64", into = "i64")
        )]
        pub struct $name($repr);

        impl $name {
            pub const MIN: $repr = $min;
            pub const MAX: $repr = $max;

            pub fn new(value: $repr) -> Result<Self> {
                if (Self::MIN..=Self::MAX).contains(&value) {
                    Ok(Self(value))
                } else {
                    Err(ModelError::InvalidId(format!(
                        "{} {} outside {}..={}",
                        $label,
                        value,
                        Self::MIN,
                        Self::MAX
                    )))
                }
            }

            pub fn get(&self) -> $repr {
                self.0
            }
        }

        impl TryFrom<i64> for $name {
            type Error = ModelError;

            fn try_from(value: i64) -> Result<Self> {
                let narrowed = <$repr>::try_from(value).map_err(|_| {
                    ModelError::InvalidId(format!("{} {}", $label, value))
                })?;
                Self::new(narrowed)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> i64 {
                i64::from(value.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

bounded_id!(
    /// Subarray identifier, 1-based.
    SubarrayId, u8, "subarray", 1, 16
);

bounded_id!(
    /// Frequency slice processor identifier.
    FspId, u8, "fsp", 1, 27
);

bounded_id!(
    /// Channelizer (VCC) unit identifier.
    VccId, u8, "vcc", 1, 197
);

/// Scan identifier carried by `Scan` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanId(pub u64);

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dish receptor identifier such as `SKA001` or `MKT063`.
///
/// SKA dishes are numbered 001..=133, MeerKAT dishes 000..=063.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "String", into = "String")
)]
pub struct ReceptorId(String);

impl ReceptorId {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = || ModelError::InvalidId(format!("receptor {raw:?}"));

        let (prefix, digits) = raw.split_at_checked(3).ok_or_else(invalid)?;
        if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let number: u16 = digits.parse().map_err(|_| invalid())?;
        let in_range = match prefix {
            "SKA" => (1..=133).contains(&number),
            "MKT" => number <= 63,
            _ => false,
        };
        if !in_range {
            return Err(invalid());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ReceptorId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ReceptorId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ReceptorId> for String {
    fn from(value: ReceptorId) -> String {
        value.0
    }
}

impl fmt::Display for ReceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

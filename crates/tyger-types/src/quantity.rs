//! Kubernetes-style resource quantities (spec §4.3: cpu/memory/gpu requests).
//!
//! A [`Quantity`] is stored as a rational `numerator / 10^scale` in base
//! units, matching the suffix table below, so that `"100m"` and `"0.1"`
//! compare equal without floating point.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, TygerError};

/// A parsed resource quantity, e.g. `500m` CPU or `2Gi` memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Quantity {
    /// Value in milli-units (`1` == `0.001` base unit), matching the `m`
    /// suffix's granularity, the finest the wire format supports.
    milli: i64,
}

const KI: i64 = 1024;
const MI: i64 = KI * 1024;
const GI: i64 = MI * 1024;
const TI: i64 = GI * 1024;

const SUFFIXES: &[(&str, i64)] = &[
    ("Ti", TI * 1000),
    ("Gi", GI * 1000),
    ("Mi", MI * 1000),
    ("Ki", KI * 1000),
    ("T", 1_000_000_000_000 * 1000),
    ("G", 1_000_000_000 * 1000),
    ("M", 1_000_000 * 1000),
    ("K", 1_000 * 1000),
    ("m", 1),
];

impl Quantity {
    pub fn from_milli(milli: i64) -> Self {
        Self { milli }
    }

    pub fn zero() -> Self {
        Self { milli: 0 }
    }

    pub fn as_milli(self) -> i64 {
        self.milli
    }

    /// Value as a base-unit `f64`, for display or logging only — never for
    /// comparisons.
    pub fn as_base_units(self) -> f64 {
        self.milli as f64 / 1000.0
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.milli.cmp(&other.milli)
    }
}

impl FromStr for Quantity {
    type Err = TygerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TygerError::new(ErrorKind::Invalid, "empty quantity"));
        }

        for (suffix, milli_per_unit) in SUFFIXES {
            if let Some(number) = s.strip_suffix(suffix) {
                let value: f64 = number.parse().map_err(|_| {
                    TygerError::new(ErrorKind::Invalid, format!("invalid quantity `{s}`"))
                })?;
                return Ok(Self {
                    milli: (value * *milli_per_unit as f64).round() as i64,
                });
            }
        }

        let value: f64 = s
            .parse()
            .map_err(|_| TygerError::new(ErrorKind::Invalid, format!("invalid quantity `{s}`")))?;
        Ok(Self {
            milli: (value * 1000.0).round() as i64,
        })
    }
}

impl TryFrom<String> for Quantity {
    type Error = TygerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Quantity> for String {
    fn from(q: Quantity) -> Self {
        q.to_string()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.milli % 1000 != 0 {
            return write!(f, "{}m", self.milli);
        }
        let units = self.milli / 1000;
        for (suffix, milli_per_unit) in SUFFIXES {
            if *suffix == "m" {
                continue;
            }
            let units_per = milli_per_unit / 1000;
            if units_per > 1 && units % units_per == 0 {
                return write!(f, "{}{}", units / units_per, suffix);
            }
        }
        write!(f, "{units}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_milli_suffix() {
        assert_eq!("500m".parse::<Quantity>().unwrap().as_milli(), 500);
    }

    #[test]
    fn parses_binary_suffix() {
        let q: Quantity = "2Gi".parse().unwrap();
        assert_eq!(q.as_milli(), 2 * 1_073_741_824 * 1000);
    }

    #[test]
    fn bare_number_is_base_units() {
        assert_eq!("4".parse::<Quantity>().unwrap().as_milli(), 4000);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Quantity>().is_err());
        assert!("banana".parse::<Quantity>().is_err());
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        let small: Quantity = "100m".parse().unwrap();
        let large: Quantity = "2".parse().unwrap();
        assert!(small < large);
    }

    #[test]
    fn round_trips_through_display() {
        let q: Quantity = "2Gi".parse().unwrap();
        let round_tripped: Quantity = q.to_string().parse().unwrap();
        assert_eq!(q, round_tripped);
    }
}

use anyhow::{format_err, Result};
use std::{fmt, str::FromStr};

/// A pool size as `zpool get size` reports it: a number followed by a unit letter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PoolCapacity {
    pub(crate) value: f64,
    pub(crate) unit: char,
}

impl PoolCapacity {
    /// `pct` percent of this capacity, rounded to two decimals, in the same unit.
    pub(crate) fn percentage_of(&self, pct: f64) -> String {
        let scaled = (self.value * pct / 100.0 * 100.0).round() / 100.0;
        format!("{}{}", format_decimal(scaled), self.unit)
    }
}

impl FromStr for PoolCapacity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let unit = s
            .chars()
            .last()
            .filter(|c| c.is_ascii_alphabetic())
            .ok_or_else(|| format_err!("pool size {:?} has no unit suffix", s))?;
        let number = &s[..s.len() - unit.len_utf8()];
        let value: f64 = number
            .parse()
            .map_err(|e| format_err!("pool size {:?} is not a number: {}", s, e))?;
        if !value.is_finite() {
            return Err(format_err!("pool size {:?} is not finite", s));
        }

        Ok(Self { value, unit })
    }
}

impl fmt::Display for PoolCapacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", format_decimal(self.value), self.unit)
    }
}

// Shortest float rendering, but never without a decimal point.
fn format_decimal(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let c: PoolCapacity = "237.33G".parse().unwrap();
        assert_eq!(c.value, 237.33);
        assert_eq!(c.unit, 'G');

        let c: PoolCapacity = " 1.81T\n".parse().unwrap();
        assert_eq!(c.unit, 'T');
        assert_eq!(c.to_string(), "1.81T");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<PoolCapacity>().is_err());
        assert!("512".parse::<PoolCapacity>().is_err());
        assert!("lotsG".parse::<PoolCapacity>().is_err());
    }

    #[test]
    fn test_parse_rejects_non_finite() {
        assert!("infG".parse::<PoolCapacity>().is_err());
        assert!("-infT".parse::<PoolCapacity>().is_err());
        assert!("NaNG".parse::<PoolCapacity>().is_err());
    }

    #[test]
    fn test_percentage_of() {
        let c: PoolCapacity = "100G".parse().unwrap();
        assert_eq!(c.percentage_of(15.0), "15.0G");

        let c: PoolCapacity = "237.33G".parse().unwrap();
        assert_eq!(c.percentage_of(15.0), "35.6G");

        let c: PoolCapacity = "1.81T".parse().unwrap();
        assert_eq!(c.percentage_of(15.0), "0.27T");
    }
}

//! The short shared secret of a drop.
//!
//! Every drop carries one 6-digit value. It keys the cloak codec and can
//! double as the direct-transport handshake token.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CloakError;

/// Smallest valid secret.
pub const SECRET_MIN: u32 = 100_000;

/// Largest valid secret.
pub const SECRET_MAX: u32 = 999_999;

/// A 6-digit drop secret in `[100000, 999999]`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(u32);

impl Secret {
    /// Draw a fresh secret uniformly from the 900,000 valid values.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut rand::thread_rng())
    }

    /// Draw a secret from a caller-supplied generator.
    pub fn generate_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self(rng.gen_range(SECRET_MIN..=SECRET_MAX))
    }

    /// Wrap an existing value.
    ///
    /// # Errors
    ///
    /// Returns [`CloakError::InvalidSecret`] when `value` is not six digits.
    pub fn new(value: u32) -> Result<Self, CloakError> {
        if !(SECRET_MIN..=SECRET_MAX).contains(&value) {
            return Err(CloakError::InvalidSecret(format!(
                "{value} is outside {SECRET_MIN}..={SECRET_MAX}"
            )));
        }
        Ok(Self(value))
    }

    /// Numeric value, as stored in the rendezvous record.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The six ASCII digits.
    #[must_use]
    pub fn to_digits(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        let mut v = self.0;
        for slot in out.iter_mut().rev() {
            *slot = b'0' + (v % 10) as u8;
            v /= 10;
        }
        out
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(******)")
    }
}

impl FromStr for Secret {
    type Err = CloakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CloakError::InvalidSecret(format!("{s:?} is not six digits")));
        }
        let value: u32 = s
            .parse()
            .map_err(|e| CloakError::InvalidSecret(format!("{e}")))?;
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_generate_in_range() {
        for _ in 0..10_000 {
            let s = Secret::generate();
            assert!((SECRET_MIN..=SECRET_MAX).contains(&s.value()));
        }
    }

    #[test]
    fn test_generate_uniform_buckets() {
        // 90 buckets of 10,000 values each, 2,000 expected hits per bucket.
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut buckets = [0u32; 90];
        let samples = 180_000;
        for _ in 0..samples {
            let v = Secret::generate_with(&mut rng).value();
            buckets[((v - SECRET_MIN) / 10_000) as usize] += 1;
        }
        for (i, &count) in buckets.iter().enumerate() {
            assert!(
                (1_700..=2_300).contains(&count),
                "bucket {i} has {count} hits"
            );
        }
    }

    #[test]
    fn test_bounds_reachable() {
        assert_eq!(Secret::new(SECRET_MIN).unwrap().to_string(), "100000");
        assert_eq!(Secret::new(SECRET_MAX).unwrap().to_string(), "999999");
        assert!(Secret::new(SECRET_MIN - 1).is_err());
        assert!(Secret::new(SECRET_MAX + 1).is_err());
    }

    #[test]
    fn test_parse() {
        let s: Secret = "482913".parse().unwrap();
        assert_eq!(s.value(), 482_913);
        assert_eq!(&s.to_digits(), b"482913");

        assert!("12345".parse::<Secret>().is_err());
        assert!("012345".parse::<Secret>().is_err());
        assert!("12a456".parse::<Secret>().is_err());
    }

    #[test]
    fn test_debug_redacted() {
        let s = Secret::new(123_456).unwrap();
        assert!(!format!("{s:?}").contains("123456"));
    }
}

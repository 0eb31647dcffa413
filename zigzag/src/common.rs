use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Unrolling factor of a loop. Spatial unrollings may be fractional when a layer dimension is
/// not divisible by the operational array dimension it is mapped onto.
pub type UnrollFactor = f64;

/// A single loop: the dimension it iterates over and its trip count.
pub type Loop = (LayerDim, UnrollFactor);

/// Loops of one operand grouped per architectural level, innermost level first.
pub type LevelLoops = Vec<Vec<Loop>>;

/// Per-operand [LevelLoops].
pub type MappingDict = IndexMap<LayerOperand, LevelLoops>;

/// Loop sizes keyed by layer dimension.
pub type LoopSizes = IndexMap<LayerDim, UnrollFactor>;

/// The precision key of the final (fully accumulated) output.
pub const FINAL_OUTPUT_KEY: &str = "O_final";

macro_rules! interned_name {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

interned_name!(
    /// A loop dimension of a layer, such as `K` or `OX`. Names are upper case.
    LayerDim
);

interned_name!(
    /// An operand of a layer equation, such as `W`, `I` or `O`.
    LayerOperand
);

interned_name!(
    /// A named dimension of an operational array, such as `D1`.
    OaDim
);

impl LayerDim {
    pub fn new(name: &str) -> Self {
        LayerDim(Arc::from(name.to_ascii_uppercase()))
    }

    /// The virtual dimension carrying the data-size part of a decoupled partially relevant loop.
    pub fn r_version(&self) -> Self {
        LayerDim(Arc::from(format!("{}_r", self.0)))
    }

    /// The virtual dimension carrying the data-reuse part of a decoupled partially relevant loop.
    pub fn ir_version(&self) -> Self {
        LayerDim(Arc::from(format!("{}_ir", self.0)))
    }
}

impl From<&str> for LayerDim {
    fn from(value: &str) -> Self {
        LayerDim::new(value)
    }
}

impl LayerOperand {
    pub fn new(name: &str) -> Self {
        LayerOperand(Arc::from(name))
    }

    pub fn final_output() -> Self {
        LayerOperand::new(FINAL_OUTPUT_KEY)
    }
}

impl From<&str> for LayerOperand {
    fn from(value: &str) -> Self {
        LayerOperand::new(value)
    }
}

impl OaDim {
    pub fn new(name: &str) -> Self {
        OaDim(Arc::from(name))
    }
}

impl From<&str> for OaDim {
    fn from(value: &str) -> Self {
        OaDim::new(value)
    }
}

/// The operand slots of a memory hierarchy. Layer operands are bound to these through a layer's
/// memory operand links.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemoryOperand {
    I1,
    I2,
    O,
}

impl MemoryOperand {
    pub fn is_output(&self) -> bool {
        matches!(self, MemoryOperand::O)
    }
}

/// Returns the prime factors of `n` in ascending order, with repetition.
///
/// Returns an empty vector for `n <= 1`.
pub fn prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        while n % p == 0 {
            factors.push(p);
            n /= p;
        }
        p += 1;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Returns all divisors of `n` in ascending order.
pub fn divisors(n: u64) -> Vec<u64> {
    let mut low = Vec::new();
    let mut high = Vec::new();
    let mut d = 1;
    while d * d <= n {
        if n % d == 0 {
            low.push(d);
            if d != n / d {
                high.push(n / d);
            }
        }
        d += 1;
    }
    low.extend(high.into_iter().rev());
    low
}

/// Rounds to the nearest integer, resolving ties to the even neighbour.
pub fn round_half_even(x: f64) -> f64 {
    x.round_ties_even()
}

/// Rounds to `digits` decimals, resolving ties to the even neighbour.
pub fn round_to(x: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (x * scale).round_ties_even() / scale
}

/// Rounds a product of unrolling factors to an integer count, absorbing floating-point noise
/// from fractional unrollings first.
pub fn round_count(x: f64) -> u64 {
    let r = round_half_even(round_to(x, 3));
    if r <= 0.0 {
        0
    } else {
        r as u64
    }
}

pub fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// `n!`, saturating at [u128::MAX].
pub fn factorial(n: u64) -> u128 {
    (1..=u128::from(n)).fold(1u128, |acc, k| acc.saturating_mul(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_layer_dim_is_upper_case() {
        assert_eq!(LayerDim::new("ox").as_str(), "OX");
        assert_eq!(LayerDim::new("ix").r_version().as_str(), "IX_r");
        assert_eq!(LayerDim::new("IX").ir_version().as_str(), "IX_ir");
    }

    #[test]
    fn test_memory_operand_parses_from_str() {
        assert_eq!("I2".parse::<MemoryOperand>().unwrap(), MemoryOperand::I2);
        assert_eq!(MemoryOperand::O.to_string(), "O");
        assert!("I3".parse::<MemoryOperand>().is_err());
    }

    #[test]
    fn test_divisors_small() {
        assert_eq!(divisors(1), vec![1]);
        assert_eq!(divisors(12), vec![1, 2, 3, 4, 6, 12]);
        assert_eq!(divisors(49), vec![1, 7, 49]);
    }

    #[test]
    fn test_rounding_is_bankers() {
        assert_eq!(round_half_even(2.5), 2.0);
        assert_eq!(round_half_even(3.5), 4.0);
        assert_eq!(round_count(63.9999999), 64);
        assert_eq!(round_count(0.5), 0);
    }

    proptest! {
        #[test]
        fn test_prime_factors_multiply_back(n in 1u64..100_000) {
            let factors = prime_factors(n);
            prop_assert_eq!(factors.iter().product::<u64>(), n);
            prop_assert!(factors.windows(2).all(|w| w[0] <= w[1]));
            for f in factors {
                prop_assert_eq!(prime_factors(f), vec![f]);
            }
        }

        #[test]
        fn test_divisors_all_divide(n in 1u64..10_000) {
            let ds = divisors(n);
            prop_assert!(ds.iter().all(|d| n % d == 0));
            prop_assert_eq!(ds.first().copied(), Some(1));
            prop_assert_eq!(ds.last().copied(), Some(n));
        }
    }
}

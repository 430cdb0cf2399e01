//! Helpers for generating structured random values in tests.

use arbitrary::{Arbitrary, Unstructured};
use rand::{rngs::StdRng, RngCore, SeedableRng};

/// Default entropy pool size; enough for the larger block types.
const ARB_GEN_LEN: usize = 1 << 16;

/// Deterministic generator of `Arbitrary` values.
pub struct ArbitraryGenerator {
    buf: Vec<u8>,
    off: usize,
}

impl Default for ArbitraryGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArbitraryGenerator {
    pub fn new() -> Self {
        Self::new_with_size(ARB_GEN_LEN)
    }

    pub fn new_with_size(n: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0x636f6e636c617665);
        let mut buf = vec![0; n];
        rng.fill_bytes(&mut buf);
        Self { buf, off: 0 }
    }

    pub fn generate<'a, T: Arbitrary<'a>>(&'a mut self) -> T {
        let mut u = Unstructured::new(&self.buf[self.off..]);
        let v = T::arbitrary(&mut u).expect("test: generate arbitrary");
        self.off += self.buf.len() - self.off - u.len();
        v
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_generates_distinct_values() {
        let mut gen = ArbitraryGenerator::new();
        let a: [u8; 16] = gen.generate();
        let b: [u8; 16] = gen.generate();
        assert_ne!(a, b);
    }
}

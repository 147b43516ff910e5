//! Request id allocation.

use spawnd_common::constants::REQUEST_ID_BITS;

/// Hands out request ids in `1..2^REQUEST_ID_BITS`, wrapping around and
/// skipping ids still in use.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    last: u32,
    modulus: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::with_modulus(1 << REQUEST_ID_BITS)
    }
}

impl IdAllocator {
    pub(crate) const fn with_modulus(modulus: u32) -> Self {
        Self { last: 0, modulus }
    }

    /// Returns the next id for which `in_use` is `false`, or `None` if every
    /// id is taken.
    pub fn allocate(&mut self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        for _ in 1..self.modulus {
            self.last = (self.last + 1) % self.modulus;
            if self.last == 0 {
                self.last = 1;
            }
            if !in_use(self.last) {
                return Some(self.last);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_and_increments() {
        let mut ids = IdAllocator::default();
        assert_eq!(ids.allocate(|_| false), Some(1));
        assert_eq!(ids.allocate(|_| false), Some(2));
    }

    #[test]
    fn wraps_around_skipping_zero() {
        let mut ids = IdAllocator::with_modulus(4);
        let got: Vec<_> = (0..5).filter_map(|_| ids.allocate(|_| false)).collect();
        assert_eq!(got, [1, 2, 3, 1, 2]);
    }

    #[test]
    fn skips_ids_in_use() {
        let mut ids = IdAllocator::with_modulus(8);
        assert_eq!(ids.allocate(|id| id < 4), Some(4));
        assert_eq!(ids.allocate(|_| true), None);
    }
}

//! Sequence ids handed out at admission.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// Largest sequence id before wrapping back to 1.
pub const MAX_SEQUENCE: u32 = i32::MAX as u32;

/// Identifier assigned to a task when it is admitted. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(NonZeroU32);

impl SequenceId {
    /// The first id of a fresh generator.
    pub const FIRST: Self = Self(NonZeroU32::MIN);

    /// Wrap a raw value. Returns `None` for 0 or values above [`MAX_SEQUENCE`].
    #[must_use]
    pub fn new(raw: u32) -> Option<Self> {
        if raw > MAX_SEQUENCE {
            return None;
        }
        NonZeroU32::new(raw).map(Self)
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic sequence counter wrapping within `[1, 2^31 - 1]`.
///
/// Not synchronized; the detector keeps it under its own mutex.
#[derive(Debug, Default, Clone)]
pub struct SequenceGenerator {
    last: u32,
}

impl SequenceGenerator {
    /// Start a generator whose first id is 1.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Start a generator whose next id follows `last`.
    #[must_use]
    pub const fn starting_after(last: u32) -> Self {
        Self { last }
    }

    /// Draw the next id.
    pub fn next_id(&mut self) -> SequenceId {
        let candidate = self.last.wrapping_add(1);
        let id = SequenceId::new(candidate).unwrap_or(SequenceId::FIRST);
        self.last = id.get();
        id
    }

    /// Forget all issued ids.
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_strictly_increase() {
        let mut generator = SequenceGenerator::new();
        let ids: Vec<u32> = (0..100).map(|_| generator.next_id().get()).collect();
        assert_eq!(ids[0], 1);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn test_wraps_to_one_after_max() {
        let mut generator = SequenceGenerator::starting_after(MAX_SEQUENCE - 1);
        assert_eq!(generator.next_id().get(), MAX_SEQUENCE);
        assert_eq!(generator.next_id().get(), 1);
        assert_eq!(generator.next_id().get(), 2);
    }

    #[test]
    fn test_out_of_range_start_wraps() {
        let mut generator = SequenceGenerator::starting_after(u32::MAX);
        assert_eq!(generator.next_id(), SequenceId::FIRST);

        let mut generator = SequenceGenerator::starting_after(MAX_SEQUENCE + 10);
        assert_eq!(generator.next_id(), SequenceId::FIRST);
    }

    #[test]
    fn test_zero_is_not_a_sequence_id() {
        assert!(SequenceId::new(0).is_none());
        assert!(SequenceId::new(MAX_SEQUENCE + 1).is_none());
        assert_eq!(SequenceId::new(7).map(SequenceId::get), Some(7));
    }

    #[test]
    fn test_reset() {
        let mut generator = SequenceGenerator::new();
        generator.next_id();
        generator.next_id();
        generator.reset();
        assert_eq!(generator.next_id(), SequenceId::FIRST);
    }
}

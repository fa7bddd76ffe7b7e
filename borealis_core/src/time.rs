//!
//! Instants and durations
//!
//! The transport layer does not read any clock. The application timestamps incoming frames and
//! chooses transmission deadlines for outgoing transfers, and the library only stores and
//! compares those values.
//!

use core::fmt::Debug;

/// A point in time, as measured by some caller-provided clock
///
/// Implementations must be monotonic in the sense that comparing two instants from the same
/// clock is meaningful.
pub trait Instant: Clone + Debug {
    /// The duration between two instants
    type Duration: Clone + PartialOrd + Debug;

    /// Returns the duration between `earlier` and this instant, or a zero duration if `earlier`
    /// is actually later than this instant
    fn duration_since(&self, earlier: &Self) -> Self::Duration;
}

impl<const NOM: u32, const DENOM: u32> Instant for fugit::Instant<u32, NOM, DENOM> {
    type Duration = fugit::Duration<u32, NOM, DENOM>;

    fn duration_since(&self, earlier: &Self) -> Self::Duration {
        self.checked_duration_since(*earlier)
            .unwrap_or_else(|| Self::Duration::from_ticks(0))
    }
}

impl<const NOM: u32, const DENOM: u32> Instant for fugit::Instant<u64, NOM, DENOM> {
    type Duration = fugit::Duration<u64, NOM, DENOM>;

    fn duration_since(&self, earlier: &Self) -> Self::Duration {
        self.checked_duration_since(*earlier)
            .unwrap_or_else(|| Self::Duration::from_ticks(0))
    }
}

/// A 32-bit instant with microsecond resolution
pub type Microseconds32 = fugit::Instant<u32, 1, 1_000_000>;

/// A 64-bit instant with microsecond resolution
///
/// This will not overflow during any realistic mission.
pub type Microseconds64 = fugit::Instant<u64, 1, 1_000_000>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duration_since_saturates() {
        let earlier = Microseconds64::from_ticks(100);
        let later = Microseconds64::from_ticks(350);
        assert_eq!(later.duration_since(&earlier).ticks(), 250);
        assert_eq!(earlier.duration_since(&later).ticks(), 0);
    }
}

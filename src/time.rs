/// Microseconds per time unit (TU), as defined by 802.11.
pub const TU_MICROS: u32 = 1024;

/// Longest delay (in TU) that can be expressed unambiguously in the 16-bit
/// wrapping time domain. Anything further away is treated as being in the
/// past.
pub const DELAY_MAX: u16 = 0x7fff;

/// An instant in the wrapping 16-bit TU time domain.
///
/// Comparisons are modular: `a` is before `b` iff the forward distance from
/// `a` to `b` is at most [DELAY_MAX]. This stays correct across counter
/// wraparound as long as compared instants are less than [DELAY_MAX] apart.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeTu(pub u16);

impl TimeTu {
    pub const fn add(self, delta: u16) -> Self {
        Self(self.0.wrapping_add(delta))
    }
    pub const fn sub(self, delta: u16) -> Self {
        Self(self.0.wrapping_sub(delta))
    }
    /// Modular "strictly earlier than" comparison.
    pub const fn is_before(self, other: Self) -> bool {
        self.0.wrapping_sub(other.0) > DELAY_MAX
    }
    /// Whether this instant has been reached at time `now`.
    pub const fn is_past(self, now: Self) -> bool {
        !now.is_before(self)
    }
}

/// The single hardware compare timer the software timer service multiplexes.
///
/// `arm` replaces any previously programmed compare value. The hardware is
/// expected to raise the timer event (via [crate::sync::EventFlags]) when the
/// free-running TU counter matches the programmed value.
pub trait TimerHw {
    fn now(&self) -> TimeTu;
    fn arm(&self, at: TimeTu);
    fn disable(&self);
}

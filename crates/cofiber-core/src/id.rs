//! Fiber identifier type and identity allocation

use core::fmt;

/// Unique identifier for a fiber
///
/// Identities are unique among the fibers currently registered with one
/// scheduler. Zero is reserved as the "no fiber" sentinel and is never issued.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u32);

impl FiberId {
    /// Sentinel value indicating no fiber
    pub const NONE: FiberId = FiberId(0);

    /// Create a new FiberId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        FiberId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a real fiber identity
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }

    /// Convert to Option
    #[inline]
    pub const fn to_option(self) -> Option<FiberId> {
        if self.is_none() {
            None
        } else {
            Some(self)
        }
    }
}

impl From<u32> for FiberId {
    #[inline]
    fn from(id: u32) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u32 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "FiberId(NONE)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        FiberId::NONE
    }
}

/// Two-mode fiber identity allocator
///
/// Hands out identities `1, 2, 3, ...` from a plain counter. Once the counter
/// has issued `max`, it wraps back to 1 and switches permanently to probing
/// mode, where each candidate is checked against the caller's occupancy test
/// and skipped while still in use.
///
/// Not synchronized: the scheduler calls it under its own lock.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    /// Next candidate identity
    next: u32,

    /// Largest identity that may be issued
    max: u32,

    /// Set after the first wraparound
    probing: bool,
}

impl IdAllocator {
    /// Allocator covering the full `1..=u32::MAX` range
    pub const fn new() -> Self {
        Self::with_max(u32::MAX)
    }

    /// Allocator covering `1..=max`
    ///
    /// A `max` of 0 is treated as 1.
    pub const fn with_max(max: u32) -> Self {
        Self {
            next: 1,
            max: if max == 0 { 1 } else { max },
            probing: false,
        }
    }

    /// Largest identity this allocator issues
    #[inline]
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Whether the allocator has wrapped and now probes for free identities
    #[inline]
    pub fn is_probing(&self) -> bool {
        self.probing
    }

    /// Allocate an identity
    ///
    /// `in_use` reports whether an identity still belongs to a registered
    /// fiber; it is only consulted after the first wraparound. Returns `None`
    /// when every identity in `1..=max` is in use.
    pub fn allocate<F>(&mut self, in_use: F) -> Option<FiberId>
    where
        F: Fn(FiberId) -> bool,
    {
        if !self.probing {
            let id = self.advance();
            return Some(FiberId::new(id));
        }

        // Linear probe, at most one full lap
        for _ in 0..self.max {
            let id = FiberId::new(self.advance());
            if !in_use(id) {
                return Some(id);
            }
        }
        None
    }

    /// Return the current candidate and move the cursor, wrapping at `max`
    fn advance(&mut self) -> u32 {
        let id = self.next;
        if id >= self.max {
            self.next = 1;
            self.probing = true;
        } else {
            self.next = id + 1;
        }
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

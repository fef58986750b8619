//! Fiber lifecycle state

use core::fmt;

/// Lifecycle state of a fiber
///
/// ```text
/// New -> Running <-> Sleeping -> Waking -> Running
///          |
///          v
///       Exited -> Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Created, stack not yet materialized
    New = 0,

    /// Schedulable or currently executing
    Running = 1,

    /// Voluntarily suspended, parked in the sleeping table
    Sleeping = 2,

    /// Woken while asleep; promoted to Running when the scheduler next sees it
    Waking = 3,

    /// Body returned, awaiting cleanup
    Exited = 4,

    /// Cleanup complete, entry removable
    Dead = 5,
}

impl FiberState {
    /// States a fiber in the run queue may legally be in
    #[inline]
    pub const fn is_queueable(&self) -> bool {
        matches!(self, FiberState::New | FiberState::Running | FiberState::Waking)
    }

    /// Body has finished (cleanup pending or done)
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Exited | FiberState::Dead)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::New,
            1 => FiberState::Running,
            2 => FiberState::Sleeping,
            3 => FiberState::Waking,
            4 => FiberState::Exited,
            _ => FiberState::Dead,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FiberState::New => "new",
            FiberState::Running => "running",
            FiberState::Sleeping => "sleeping",
            FiberState::Waking => "waking",
            FiberState::Exited => "exited",
            FiberState::Dead => "dead",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queueable_states() {
        assert!(FiberState::New.is_queueable());
        assert!(FiberState::Running.is_queueable());
        assert!(FiberState::Waking.is_queueable());
        assert!(!FiberState::Sleeping.is_queueable());
    }

    #[test]
    fn test_terminated_states() {
        assert!(FiberState::Exited.is_terminated());
        assert!(FiberState::Dead.is_terminated());
        assert!(!FiberState::Running.is_terminated());
    }

    #[test]
    fn test_u8_conversion() {
        for state in [
            FiberState::New,
            FiberState::Running,
            FiberState::Sleeping,
            FiberState::Waking,
            FiberState::Exited,
            FiberState::Dead,
        ] {
            assert_eq!(FiberState::from(u8::from(state)), state);
        }
    }
}

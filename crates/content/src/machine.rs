//! The two-state yield machine, free of any document side effects.

use resilink_core::yield_state::YieldMode;

/// Outcome of a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed { from: YieldMode, to: YieldMode },
    /// Already in the requested mode.
    NoOp,
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Changed { .. })
    }
}

/// ACTIVE/YIELDING plus the reason of the last real transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct YieldMachine {
    mode: YieldMode,
    reason: Option<String>,
}

impl YieldMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> YieldMode {
        self.mode
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn is_yielding(&self) -> bool {
        self.mode == YieldMode::Yielding
    }

    pub fn suspend(&mut self, reason: &str) -> Transition {
        self.transition(YieldMode::Yielding, reason)
    }

    pub fn resume(&mut self, reason: &str) -> Transition {
        self.transition(YieldMode::Active, reason)
    }

    pub fn toggle(&mut self, reason: &str) -> Transition {
        let enable = !self.is_yielding();
        self.set(enable, reason)
    }

    pub fn set(&mut self, enable: bool, reason: &str) -> Transition {
        if enable {
            self.suspend(reason)
        } else {
            self.resume(reason)
        }
    }

    fn transition(&mut self, to: YieldMode, reason: &str) -> Transition {
        if self.mode == to {
            return Transition::NoOp;
        }
        let from = self.mode;
        self.mode = to;
        self.reason = Some(reason.to_string());
        Transition::Changed { from, to }
    }
}

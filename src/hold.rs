//! Hold-to-activate state machine.
//!
//! A short press on the rewind/advance key seeks by the selected step; a
//! press held past the hold delay switches the video to slow-motion or
//! fast-forward until release, then puts back the exact pre-hold rate.
//!
//! Each direction runs one machine with three states:
//!
//! ```text
//!  Idle --press--> Scheduled --timer--> Active
//!   ^                 |                   |
//!   +----release------+ (tap)             |
//!   +----release--------------------------+ (restore)
//! ```
//!
//! A press while Scheduled or Active is a no-op. The machine never touches
//! the host; the caller arms and clears timers and applies the outcomes.

use crate::constants::{approx_eq, constants};
use crate::host::{NodeId, TimerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HoldKind {
  /// Held advance key.
  FastForward,
  /// Held rewind key.
  SlowMotion,
}

impl HoldKind {
  pub fn label(self) -> &'static str {
    match self {
      HoldKind::FastForward => "fast-forward",
      HoldKind::SlowMotion => "slow-motion",
    }
  }

  /// Target rate for an active hold, clamped to the kind's range.
  pub fn target_rate(self, fast_forward_speed: f64, slow_motion_speed: f64) -> f64 {
    match self {
      HoldKind::FastForward => fast_forward_speed.clamp(1.0, 16.0),
      HoldKind::SlowMotion => slow_motion_speed.clamp(0.1, 1.0),
    }
  }
}

/// Seek to perform when the key is released before the hold activates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingTap {
  pub video: NodeId,
  pub seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum HoldState {
  #[default]
  Idle,
  Scheduled {
    video: NodeId,
    pre_rate: f64,
    timer: TimerId,
    tap: PendingTap,
  },
  Active {
    video: NodeId,
    pre_rate: f64,
    target: f64,
  },
}

/// What the caller must do after a key release.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Release {
  Nothing,
  /// Released before activation: cancel `timer` and seek.
  Tap { timer: TimerId, tap: PendingTap },
  /// Released while active: put `rate` back on `video`.
  Restore { video: NodeId, rate: f64 },
}

#[derive(Debug, Default)]
pub struct HoldMachine {
  state: HoldState,
}

impl HoldMachine {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn state(&self) -> HoldState {
    self.state
  }

  pub fn is_idle(&self) -> bool {
    self.state == HoldState::Idle
  }

  /// Key-down. `arm` is only called when the machine accepts the press.
  /// Returns `false` when a hold is already in flight.
  pub fn press(&mut self, video: NodeId, pre_rate: f64, seconds: f64, arm: impl FnOnce() -> TimerId) -> bool {
    if !self.is_idle() {
      return false;
    }
    let timer = arm();
    self.state = HoldState::Scheduled { video, pre_rate, timer, tap: PendingTap { video, seconds } };
    true
  }

  /// Hold delay elapsed. Returns the video to switch to `target` when `id`
  /// is the armed timer; stale timers are ignored.
  pub fn fire(&mut self, id: TimerId, target: f64) -> Option<NodeId> {
    match self.state {
      HoldState::Scheduled { video, pre_rate, timer, .. } if timer == id => {
        self.state = HoldState::Active { video, pre_rate, target };
        Some(video)
      }
      _ => None,
    }
  }

  /// Record the rate actually applied on activation (after clamping).
  pub fn set_applied_target(&mut self, applied: f64) {
    if let HoldState::Active { target, .. } = &mut self.state {
      *target = applied;
    }
  }

  /// Key-up.
  pub fn release(&mut self) -> Release {
    match std::mem::take(&mut self.state) {
      HoldState::Idle => Release::Nothing,
      HoldState::Scheduled { timer, tap, .. } => Release::Tap { timer, tap },
      HoldState::Active { video, pre_rate, .. } => Release::Restore { video, rate: pre_rate },
    }
  }

  /// Drop any hold on `video` without restoring anything. Returns the
  /// timer the caller must clear.
  pub fn cancel_for(&mut self, video: NodeId) -> Option<TimerId> {
    let held = match self.state {
      HoldState::Scheduled { video: v, .. } | HoldState::Active { video: v, .. } => v == video,
      HoldState::Idle => false,
    };
    if held { self.cancel() } else { None }
  }

  /// Drop whatever is in flight. Returns the timer the caller must clear.
  pub fn cancel(&mut self) -> Option<TimerId> {
    match std::mem::take(&mut self.state) {
      HoldState::Scheduled { timer, .. } => Some(timer),
      _ => None,
    }
  }

  /// Target of the active hold, if any.
  pub fn active_target(&self) -> Option<f64> {
    match self.state {
      HoldState::Active { target, .. } => Some(target),
      _ => None,
    }
  }

  /// `true` when `rate` is the active hold's own rate write.
  pub fn is_own_rate(&self, rate: f64) -> bool {
    self.active_target().is_some_and(|target| approx_eq(rate, target, constants().hold_target_tolerance))
  }
}

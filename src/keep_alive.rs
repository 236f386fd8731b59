//! Server keep-alive policy and the idle-shutdown timer.
//!
//! The first keep-alive a client sends always replaces the server's startup
//! default, even if it is lower. Later values only ever raise it, so one
//! client cannot cut short a lifetime another client asked for.

use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// How long the server stays up without connections.
///
/// Ordered from shortest to longest lifetime: `SingleShot < Idle(_) < Forever`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeepAlive {
   /// Stop once the first connection has been served.
   SingleShot,
   /// Stop after this long with no active connections.
   Idle(Duration),
   /// Never stop because of idleness.
   Forever,
}

impl KeepAlive {
   /// Maps the wire representation (whole seconds) onto a lifetime: zero is
   /// single-shot and negative values never expire.
   pub const fn from_secs(secs: i64) -> Self {
      match secs {
         0 => Self::SingleShot,
         s if s < 0 => Self::Forever,
         s => Self::Idle(Duration::from_secs(s as u64)),
      }
   }

   /// Parses a keep-alive argument value. Returns `None` for anything that
   /// is not an integer.
   pub fn parse(value: &str) -> Option<Self> {
      value.trim().parse::<i64>().ok().map(Self::from_secs)
   }

   pub const fn stop_after_first_connection(self) -> bool {
      matches!(self, Self::SingleShot)
   }

   pub const fn is_finite(self) -> bool {
      matches!(self, Self::Idle(_))
   }

   pub const fn idle_duration(self) -> Option<Duration> {
      match self {
         Self::Idle(d) => Some(d),
         _ => None,
      }
   }
}

impl fmt::Display for KeepAlive {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::SingleShot => f.write_str("single-shot"),
         Self::Idle(d) => write!(f, "{d:?}"),
         Self::Forever => f.write_str("forever"),
      }
   }
}

#[derive(Debug)]
struct ArmedTimer {
   id:    u64,
   token: CancellationToken,
}

#[derive(Debug)]
struct PolicyState {
   high_water_mark: KeepAlive,
   is_default:      bool,
   armed:           Option<ArmedTimer>,
   next_timer_id:   u64,
}

/// Keep-alive high-water mark plus the (at most one) armed idle timer.
///
/// All state lives behind one mutex so that arming can be made conditional on
/// state owned elsewhere (the connection count) without a second lock.
#[derive(Debug)]
pub struct KeepAlivePolicy {
   state: Mutex<PolicyState>,
}

impl KeepAlivePolicy {
   pub fn new(initial: KeepAlive) -> Self {
      Self {
         state: Mutex::new(PolicyState {
            high_water_mark: initial,
            is_default:      true,
            armed:           None,
            next_timer_id:   0,
         }),
      }
   }

   pub fn current(&self) -> KeepAlive {
      self.state.lock().high_water_mark
   }

   /// True until the first client keep-alive has been applied.
   pub fn is_default(&self) -> bool {
      self.state.lock().is_default
   }

   pub fn is_armed(&self) -> bool {
      self.state.lock().armed.is_some()
   }

   /// Applies a client-requested keep-alive and returns the resulting mark.
   ///
   /// Must not be called while the idle timer is armed.
   pub fn set_keep_alive(&self, value: KeepAlive) -> KeepAlive {
      let mut state = self.state.lock();
      debug_assert!(state.armed.is_none(), "keep-alive changed while the idle timer is armed");

      if state.is_default {
         state.high_water_mark = value;
         state.is_default = false;
      } else if value > state.high_water_mark {
         state.high_water_mark = value;
      }

      tracing::debug!(requested = %value, current = %state.high_water_mark, "keep-alive updated");
      state.high_water_mark
   }

   /// Arms the idle timer unless one is already armed or the current mark
   /// has no finite idle duration.
   pub fn arm(&self) -> Option<IdleTimer> {
      self.arm_when(|| true)
   }

   /// Like [`KeepAlivePolicy::arm`], but only arms when `condition` holds.
   /// `condition` runs under the policy lock.
   pub fn arm_when(&self, condition: impl FnOnce() -> bool) -> Option<IdleTimer> {
      let mut state = self.state.lock();
      if state.armed.is_some() {
         return None;
      }
      let duration = state.high_water_mark.idle_duration()?;
      if !condition() {
         return None;
      }

      state.next_timer_id += 1;
      let id = state.next_timer_id;
      let token = CancellationToken::new();
      state.armed = Some(ArmedTimer { id, token: token.clone() });
      tracing::debug!(timer = id, secs = duration.as_secs_f64(), "idle timer armed");
      Some(IdleTimer { id, duration, token })
   }

   /// Cancels and clears the armed timer. Returns whether one was armed.
   pub fn cancel(&self) -> bool {
      let Some(timer) = self.state.lock().armed.take() else {
         return false;
      };
      timer.token.cancel();
      tracing::debug!(timer = timer.id, "idle timer cancelled");
      true
   }

   /// Retires a timer whose duration elapsed.
   ///
   /// Returns `true` only if `id` is still the armed timer and `condition`
   /// holds under the lock; a `false` result means the fire is stale.
   pub fn expire(&self, id: u64, condition: impl FnOnce() -> bool) -> bool {
      let mut state = self.state.lock();
      match &state.armed {
         Some(timer) if timer.id == id => {
            state.armed = None;
            condition()
         },
         _ => false,
      }
   }
}

/// Handle to an armed idle timer.
#[derive(Debug)]
pub struct IdleTimer {
   id:       u64,
   duration: Duration,
   token:    CancellationToken,
}

impl IdleTimer {
   pub const fn id(&self) -> u64 {
      self.id
   }

   pub const fn duration(&self) -> Duration {
      self.duration
   }

   /// Resolves `true` once the duration has elapsed, or `false` if the timer
   /// was cancelled first.
   pub async fn elapsed(&self) -> bool {
      tokio::select! {
         biased;
         () = self.token.cancelled() => false,
         () = time::sleep(self.duration) => true,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn wire_seconds_map_to_lifetimes() {
      assert_eq!(KeepAlive::from_secs(0), KeepAlive::SingleShot);
      assert_eq!(KeepAlive::from_secs(-1), KeepAlive::Forever);
      assert_eq!(KeepAlive::from_secs(30), KeepAlive::Idle(Duration::from_secs(30)));
      assert_eq!(KeepAlive::parse(" 45 "), Some(KeepAlive::Idle(Duration::from_secs(45))));
      assert_eq!(KeepAlive::parse("soon"), None);
   }

   #[test]
   fn display_keeps_sub_second_precision() {
      assert_eq!(KeepAlive::Idle(Duration::from_millis(500)).to_string(), "500ms");
      assert_eq!(KeepAlive::Idle(Duration::from_secs(600)).to_string(), "600s");
      assert_eq!(KeepAlive::SingleShot.to_string(), "single-shot");
      assert_eq!(KeepAlive::Forever.to_string(), "forever");
   }

   #[test]
   fn lifetimes_are_ordered_by_length() {
      let short = KeepAlive::Idle(Duration::from_secs(1));
      let long = KeepAlive::Idle(Duration::from_secs(100));
      assert!(KeepAlive::SingleShot < short);
      assert!(short < long);
      assert!(long < KeepAlive::Forever);
   }

   #[test]
   fn expire_ignores_stale_ids() {
      let policy = KeepAlivePolicy::new(KeepAlive::Idle(Duration::from_secs(60)));
      let first = policy.arm().unwrap();
      assert!(policy.cancel());
      let second = policy.arm().unwrap();

      assert!(!policy.expire(first.id(), || true));
      assert!(policy.is_armed());
      assert!(policy.expire(second.id(), || true));
      assert!(!policy.is_armed());
   }
}

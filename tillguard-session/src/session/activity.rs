//! Activity tracking
//!
//! Interaction signals extend the session, at most once per throttle window.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Interaction signal types that count as user activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySignal {
    PointerDown,
    PointerMove,
    KeyDown,
    Scroll,
    TouchStart,
    Click,
}

impl ActivitySignal {
    pub const ALL: [ActivitySignal; 6] = [
        ActivitySignal::PointerDown,
        ActivitySignal::PointerMove,
        ActivitySignal::KeyDown,
        ActivitySignal::Scroll,
        ActivitySignal::TouchStart,
        ActivitySignal::Click,
    ];

    /// DOM event name the dashboard listens for
    pub fn event_name(&self) -> &'static str {
        match self {
            ActivitySignal::PointerDown => "pointerdown",
            ActivitySignal::PointerMove => "pointermove",
            ActivitySignal::KeyDown => "keydown",
            ActivitySignal::Scroll => "scroll",
            ActivitySignal::TouchStart => "touchstart",
            ActivitySignal::Click => "click",
        }
    }
}

impl std::fmt::Display for ActivitySignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.event_name())
    }
}

impl std::str::FromStr for ActivitySignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActivitySignal::ALL
            .into_iter()
            .find(|signal| signal.event_name() == s.trim().to_lowercase())
            .ok_or_else(|| format!("Unknown activity signal: {}", s))
    }
}

/// At most one acquisition per window
#[derive(Debug, Clone)]
pub struct Throttle {
    window: Duration,
    last: Option<DateTime<Utc>>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        match self.last {
            Some(last) if now - last < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Registration flag plus throttle, owned by the session manager
#[derive(Debug)]
pub struct ActivityTracker {
    registered: AtomicBool,
    throttle: Mutex<Throttle>,
}

impl ActivityTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            registered: AtomicBool::new(false),
            throttle: Mutex::new(Throttle::new(window)),
        }
    }

    /// Start accepting signals. Returns `false` if already registered.
    pub fn register(&self) -> bool {
        let newly = !self.registered.swap(true, Ordering::SeqCst);
        if newly {
            debug!("Activity tracker registered");
        }
        newly
    }

    /// Stop accepting signals and forget the last extension.
    /// Returns `false` if already deregistered.
    pub fn deregister(&self) -> bool {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return false;
        }

        self.throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        debug!("Activity tracker deregistered");
        true
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Whether this signal should extend the session
    pub fn should_extend(&self, signal: ActivitySignal, now: DateTime<Utc>) -> bool {
        if !self.is_registered() {
            debug!(%signal, "Dropping activity signal, tracker not registered");
            return false;
        }

        let acquired = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(now);

        if !acquired {
            debug!(%signal, "Activity signal throttled");
        }
        acquired
    }
}

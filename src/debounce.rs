//! Button debouncing.
//!
//! A press is accepted on a released -> pressed transition, unless it comes
//! within `window` of the previously accepted press. Holding the button never
//! produces more than one press. The machine only looks at the sequence of
//! (level, timestamp) observations, so feeding it polled samples or
//! interrupt edges gives the same result.

use crate::hw::Level;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DebounceState {
    Idle,
    /// A press was just accepted.
    Pressed,
    /// Button still held after an accepted press.
    Suppressed,
}

#[derive(Clone, Debug)]
pub struct Debouncer {
    pressed_level: Level,
    window: Duration,
    enabled: bool,
    state: DebounceState,
    last_level: Option<Level>,
    last_accepted: Option<Instant>,
}

impl Debouncer {
    pub fn new(pressed_level: Level, window: Duration) -> Self {
        Self {
            pressed_level,
            window,
            enabled: true,
            state: DebounceState::Idle,
            last_level: None,
            last_accepted: None,
        }
    }

    /// Seed with the level read when the input is armed. A button that is
    /// already held doesn't count as pressed.
    pub fn prime(&mut self, level: Level) {
        self.last_level = Some(level);
        self.state = if level == self.pressed_level {
            DebounceState::Suppressed
        } else {
            DebounceState::Idle
        };
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Feed one observation. Returns true when a press is accepted.
    pub fn update(&mut self, level: Level, now: Instant) -> bool {
        if !self.enabled {
            self.last_level = Some(level);
            return false;
        }

        let pressed = level == self.pressed_level;
        let rising = pressed && self.last_level.is_some_and(|l| l != self.pressed_level);
        self.last_level = Some(level);

        match self.state {
            DebounceState::Idle if rising => {
                let settled = self
                    .last_accepted
                    .map(|at| now.saturating_duration_since(at) >= self.window)
                    .unwrap_or(true);
                if settled {
                    self.last_accepted = Some(now);
                    self.state = DebounceState::Pressed;
                    return true;
                }
            }
            DebounceState::Pressed | DebounceState::Suppressed if !pressed => {
                self.state = DebounceState::Idle;
            }
            DebounceState::Pressed => {
                self.state = DebounceState::Suppressed;
            }
            _ => {}
        }
        false
    }
}

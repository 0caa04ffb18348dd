//! GPIO access.
//!
//! Everything above this module talks to hardware through [`Gpio`],
//! [`OutputLine`] and [`InputLine`], so the relay core and the debouncing
//! logic run the same way against real lines and against [`sim::SimGpio`].

pub mod sim;
pub mod sysfs;

use crate::consts::Pin;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Electrical level of a line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }

    pub fn inverted(self) -> Self {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Bias resistor requested for an input line.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Pull {
    Up,
    Down,
}

impl Pull {
    pub fn from_pull_up(pull_up: bool) -> Self {
        if pull_up {
            Pull::Up
        } else {
            Pull::Down
        }
    }

    /// Level the line idles at; a press drives it to the opposite one.
    pub fn released_level(self) -> Level {
        match self {
            Pull::Up => Level::High,
            Pull::Down => Level::Low,
        }
    }

    pub fn pressed_level(self) -> Level {
        self.released_level().inverted()
    }
}

/// A timestamped level change reported by an edge-capable input.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Edge {
    pub level: Level,
    pub at: Instant,
}

pub trait OutputLine: Send {
    fn pin(&self) -> Pin;
    fn write(&mut self, level: Level) -> anyhow::Result<()>;
}

pub trait InputLine: Send {
    fn pin(&self) -> Pin;
    fn read(&mut self) -> anyhow::Result<Level>;

    /// Stream of level changes, for backends with interrupt support.
    /// `None` means the line can only be polled.
    fn edges(&mut self) -> Option<mpsc::UnboundedReceiver<Edge>> {
        None
    }
}

/// Opens lines. Dropping a returned line releases it.
pub trait Gpio: Send + Sync {
    fn output(&self, pin: Pin) -> anyhow::Result<Box<dyn OutputLine>>;
    fn input(&self, pin: Pin, pull: Pull) -> anyhow::Result<Box<dyn InputLine>>;
}

use crate::consts::Pin;
use crate::hw::{Level, OutputLine};
use tracing::{debug, warn};

/// Electrical level that switches the relay on.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Polarity {
    ActiveLow,
    ActiveHigh,
}

impl Polarity {
    pub fn from_active_low(active_low: bool) -> Self {
        if active_low {
            Polarity::ActiveLow
        } else {
            Polarity::ActiveHigh
        }
    }

    pub fn level(self, on: bool) -> Level {
        match (self, on) {
            (Polarity::ActiveLow, true) | (Polarity::ActiveHigh, false) => Level::Low,
            (Polarity::ActiveLow, false) | (Polarity::ActiveHigh, true) => Level::High,
        }
    }
}

/// A relay driven by one output line.
///
/// The line is switched off when the relay is created and again when it is
/// dropped, so a relay never outlives its owner in the ON state.
pub struct RelayOutput {
    line: Box<dyn OutputLine>,
    polarity: Polarity,
}

impl RelayOutput {
    pub fn new(line: Box<dyn OutputLine>, polarity: Polarity) -> anyhow::Result<Self> {
        let mut relay = Self { line, polarity };
        relay.off()?;
        Ok(relay)
    }

    pub fn pin(&self) -> Pin {
        self.line.pin()
    }

    pub fn on(&mut self) -> anyhow::Result<()> {
        self.line.write(self.polarity.level(true))
    }

    pub fn off(&mut self) -> anyhow::Result<()> {
        self.line.write(self.polarity.level(false))
    }
}

impl Drop for RelayOutput {
    fn drop(&mut self) {
        match self.off() {
            Ok(()) => debug!("GPIO {} released", self.pin()),
            Err(e) => warn!("Unable to switch off GPIO {} on release: {:?}", self.pin(), e),
        }
    }
}

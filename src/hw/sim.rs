//! In-memory GPIO used for `--gpio sim` and by the tests.
//!
//! Input levels are driven with [`SimGpio::set_level`]; every write to an
//! output line is recorded so callers can count hardware writes.

use super::{Edge, Gpio, InputLine, Level, OutputLine, Pull};
use crate::consts::Pin;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct PinState {
    level: Option<Level>,
    writes: Vec<Level>,
    fail_writes: bool,
    open_lines: usize,
    subscribers: Vec<mpsc::UnboundedSender<Edge>>,
}

#[derive(Clone, Default)]
pub struct SimGpio {
    pins: Arc<Mutex<HashMap<Pin, PinState>>>,
}

impl SimGpio {
    pub fn new() -> Self {
        Self::default()
    }

    fn pins(&self) -> MutexGuard<'_, HashMap<Pin, PinState>> {
        self.pins.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drive an input line, as a button would.
    pub fn set_level(&self, pin: Pin, level: Level) {
        let mut pins = self.pins();
        let state = pins.entry(pin).or_default();
        if state.level == Some(level) {
            return;
        }
        state.level = Some(level);
        let edge = Edge {
            level,
            at: Instant::now(),
        };
        state.subscribers.retain(|tx| tx.send(edge).is_ok());
    }

    pub fn level(&self, pin: Pin) -> Option<Level> {
        self.pins().get(&pin).and_then(|s| s.level)
    }

    /// All levels written to an output line since the start.
    pub fn writes(&self, pin: Pin) -> Vec<Level> {
        self.pins()
            .get(&pin)
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    pub fn write_count(&self, pin: Pin) -> usize {
        self.pins().get(&pin).map(|s| s.writes.len()).unwrap_or(0)
    }

    /// Make writes to `pin` fail until called again with `false`.
    pub fn fail_writes(&self, pin: Pin, fail: bool) {
        self.pins().entry(pin).or_default().fail_writes = fail;
    }

    pub fn is_open(&self, pin: Pin) -> bool {
        self.pins().get(&pin).map(|s| s.open_lines > 0).unwrap_or(false)
    }
}

impl Gpio for SimGpio {
    fn output(&self, pin: Pin) -> anyhow::Result<Box<dyn OutputLine>> {
        self.pins().entry(pin).or_default().open_lines += 1;
        Ok(Box::new(SimLine {
            pin,
            gpio: self.clone(),
        }))
    }

    fn input(&self, pin: Pin, pull: Pull) -> anyhow::Result<Box<dyn InputLine>> {
        let mut pins = self.pins();
        let state = pins.entry(pin).or_default();
        state.open_lines += 1;
        if state.level.is_none() {
            state.level = Some(pull.released_level());
        }
        Ok(Box::new(SimLine {
            pin,
            gpio: self.clone(),
        }))
    }
}

struct SimLine {
    pin: Pin,
    gpio: SimGpio,
}

impl OutputLine for SimLine {
    fn pin(&self) -> Pin {
        self.pin
    }

    fn write(&mut self, level: Level) -> anyhow::Result<()> {
        let mut pins = self.gpio.pins();
        let state = pins.entry(self.pin).or_default();
        if state.fail_writes {
            anyhow::bail!("simulated write failure on GPIO {}", self.pin);
        }
        state.level = Some(level);
        state.writes.push(level);
        Ok(())
    }
}

impl InputLine for SimLine {
    fn pin(&self) -> Pin {
        self.pin
    }

    fn read(&mut self) -> anyhow::Result<Level> {
        self.gpio
            .level(self.pin)
            .ok_or_else(|| anyhow::anyhow!("GPIO {} was never configured", self.pin))
    }

    fn edges(&mut self) -> Option<mpsc::UnboundedReceiver<Edge>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.gpio
            .pins()
            .entry(self.pin)
            .or_default()
            .subscribers
            .push(tx);
        Some(rx)
    }
}

impl Drop for SimLine {
    fn drop(&mut self) {
        let mut pins = self.gpio.pins();
        if let Some(state) = pins.get_mut(&self.pin) {
            state.open_lines = state.open_lines.saturating_sub(1);
            if state.open_lines == 0 {
                state.subscribers.clear();
            }
        }
    }
}

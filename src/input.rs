//! Input tasks: one per armed button, reading a line and sending debounced
//! presses to the router.

use crate::consts::Pin;
use crate::debounce::Debouncer;
use crate::hw::{Gpio, InputLine, Pull};
use crate::router::ButtonId;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Sample the line every `poll_interval`.
    #[default]
    Poll,
    /// React to edges if the backend reports them; falls back to polling.
    Edge,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InputSpec {
    pub pin: Pin,
    pub pull: Pull,
    pub debounce: Duration,
    pub poll_interval: Duration,
    pub mode: InputMode,
}

/// Accepted button press.
#[derive(Clone, Debug)]
pub struct Press {
    pub button: ButtonId,
    pub at: Instant,
}

/// Open the input line and start watching it.
///
/// Opening may block (sysfs export waits for udev), so it runs on the
/// blocking pool. The line is owned by the returned task: aborting the task
/// releases it.
pub async fn spawn(
    gpio: Arc<dyn Gpio>,
    button: ButtonId,
    spec: &InputSpec,
    presses: mpsc::Sender<Press>,
) -> anyhow::Result<JoinHandle<()>> {
    let (pin, pull) = (spec.pin, spec.pull);
    let name = button.to_string();
    let (mut line, initial) = tokio::task::spawn_blocking(move || {
        let mut line = gpio
            .input(pin, pull)
            .with_context(|| format!("Unable to open {} on GPIO {}", name, pin))?;
        let initial = line
            .read()
            .with_context(|| format!("Unable to read {} on GPIO {}", name, pin))?;
        anyhow::Ok((line, initial))
    })
    .await
    .context("GPIO open task failed")??;

    let mut debouncer = Debouncer::new(spec.pull.pressed_level(), spec.debounce);
    debouncer.prime(initial);

    let edges = match spec.mode {
        InputMode::Edge => {
            let edges = line.edges();
            if edges.is_none() {
                info!("{}: GPIO {} has no edge support, polling instead", button, spec.pin);
            }
            edges
        }
        InputMode::Poll => None,
    };

    let handle = match edges {
        Some(edges) => tokio::spawn(watch_edges(line, edges, debouncer, button, presses)),
        None => tokio::spawn(poll(line, spec.poll_interval, debouncer, button, presses)),
    };
    Ok(handle)
}

async fn poll(
    mut line: Box<dyn InputLine>,
    interval: Duration,
    mut debouncer: Debouncer,
    button: ButtonId,
    presses: mpsc::Sender<Press>,
) {
    debug!("{}: polling GPIO {} every {:?}", button, line.pin(), interval);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failing = false;

    loop {
        ticker.tick().await;
        let level = match line.read() {
            Ok(level) => {
                if failing {
                    info!("{}: GPIO {} readable again", button, line.pin());
                    failing = false;
                }
                level
            }
            Err(e) => {
                // Keep polling; report only the first failure of a streak.
                if !failing {
                    warn!("{}: error reading GPIO {}: {:?}", button, line.pin(), e);
                    failing = true;
                }
                continue;
            }
        };

        let now = Instant::now();
        if debouncer.update(level, now) {
            let press = Press {
                button: button.clone(),
                at: now,
            };
            if presses.send(press).await.is_err() {
                // Router is gone.
                break;
            }
        }
    }
    debug!("{}: poll task finishing", button);
}

async fn watch_edges(
    line: Box<dyn InputLine>,
    mut edges: mpsc::UnboundedReceiver<crate::hw::Edge>,
    mut debouncer: Debouncer,
    button: ButtonId,
    presses: mpsc::Sender<Press>,
) {
    debug!("{}: watching edges on GPIO {}", button, line.pin());
    while let Some(edge) = edges.recv().await {
        if debouncer.update(edge.level, edge.at) {
            let press = Press {
                button: button.clone(),
                at: edge.at,
            };
            if presses.send(press).await.is_err() {
                break;
            }
        }
    }
    debug!("{}: edge task finishing on GPIO {}", button, line.pin());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimGpio;
    use crate::hw::Level;

    fn spec(mode: InputMode) -> InputSpec {
        InputSpec {
            pin: 26,
            pull: Pull::Up,
            debounce: Duration::from_millis(300),
            poll_interval: Duration::from_millis(10),
            mode,
        }
    }

    async fn bounce(gpio: &SimGpio, pin: Pin) {
        for _ in 0..20 {
            gpio.set_level(pin, Level::Low);
            tokio::time::sleep(Duration::from_millis(1)).await;
            gpio.set_level(pin, Level::High);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        gpio.set_level(pin, Level::Low);
    }

    async fn count_presses(mode: InputMode) -> usize {
        let gpio = SimGpio::new();
        let (tx, mut rx) = mpsc::channel(8);
        let task = spawn(Arc::new(gpio.clone()), ButtonId::Relay(1), &spec(mode), tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        bounce(&gpio, 26).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        gpio.set_level(26, Level::High);
        tokio::time::sleep(Duration::from_millis(50)).await;

        task.abort();
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    #[tokio::test(start_paused = true)]
    async fn polled_input_reports_single_press() {
        assert_eq!(count_presses(InputMode::Poll).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn edge_input_reports_single_press() {
        assert_eq!(count_presses(InputMode::Edge).await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborting_task_releases_line() {
        let gpio = SimGpio::new();
        let (tx, _rx) = mpsc::channel(8);
        let task = spawn(Arc::new(gpio.clone()), ButtonId::Reset, &spec(InputMode::Poll), tx)
            .await
            .unwrap();
        assert!(gpio.is_open(26));
        task.abort();
        let _ = task.await;
        assert!(!gpio.is_open(26));
    }
}

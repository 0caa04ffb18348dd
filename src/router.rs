//! Physical buttons.
//!
//! Every enabled binding gets its own input task (see [`crate::input`]);
//! accepted presses from all of them arrive on one channel and a single
//! dispatch task turns them into relay triggers, relay resets or audio clips.

use crate::audio::AudioDispatcher;
use crate::consts::{AudioIdx, RelayIdx};
use crate::coordinator::{Coordinator, Error};
use crate::hw::Gpio;
use crate::input::{self, InputSpec, Press};
use crate::stats::Stats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ButtonId {
    /// Entry of the multi-button table.
    Relay(u8),
    /// Legacy single relay button.
    Single,
    Reset,
    Audio(AudioIdx),
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ButtonId::Relay(n) => write!(f, "button-{}", n),
            ButtonId::Single => write!(f, "button"),
            ButtonId::Reset => write!(f, "reset"),
            ButtonId::Audio(n) => write!(f, "audio-{}", n),
        }
    }
}

impl Serialize for ButtonId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "target")]
pub enum Action {
    Trigger(RelayIdx),
    /// Cancel a running trigger.
    Reset(RelayIdx),
    Audio(AudioIdx),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub id: ButtonId,
    pub input: InputSpec,
    pub action: Action,
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct BindingStatus {
    pub id: ButtonId,
    pub pin: u8,
    pub action: Action,
    pub enabled: bool,
    /// Input task is running.
    pub active: bool,
}

struct Armed {
    binding: Binding,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Bindings {
    all: Vec<Binding>,
    armed: BTreeMap<ButtonId, Armed>,
}

type Actions = Arc<RwLock<BTreeMap<ButtonId, Action>>>;

pub struct ButtonRouter {
    gpio: Arc<dyn Gpio>,
    bindings: Mutex<Bindings>,
    actions: Actions,
    presses: mpsc::Sender<Press>,
    dispatcher: JoinHandle<()>,
    stats: Stats,
}

async fn dispatch(
    mut presses: mpsc::Receiver<Press>,
    actions: Actions,
    coordinator: Coordinator,
    audio: Arc<AudioDispatcher>,
    stats: Stats,
) {
    while let Some(press) = presses.recv().await {
        let action = actions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&press.button)
            .cloned();
        let action = match action {
            Some(action) => action,
            None => {
                debug!("Press from disarmed {}, ignoring", press.button);
                continue;
            }
        };
        stats.record_press(&press.button);

        match action {
            Action::Trigger(relay) => {
                info!("Physical button {} pressed for Relay {}", press.button, relay);
                match coordinator.trigger(relay) {
                    Ok(_) => {}
                    Err(e @ Error::ResourceExhausted { .. }) => {
                        warn!("{}: {}", press.button, e);
                    }
                    Err(e) => {
                        error!("{}: unable to trigger relay {}: {}", press.button, relay, e);
                        stats.record_error();
                    }
                }
            }
            Action::Reset(relay) => {
                info!("Reset button pressed, cancelling Relay {}", relay);
                if let Err(e) = coordinator.cancel(relay) {
                    error!("Reset of relay {} failed: {}", relay, e);
                    stats.record_error();
                }
            }
            Action::Audio(id) => {
                info!("Audio button {} pressed", id);
                if let Err(e) = audio.play(id) {
                    warn!("Audio button {}: {}", id, e);
                }
            }
        }
    }
    debug!("Button dispatcher finishing");
}

impl ButtonRouter {
    /// Start the dispatcher. No buttons are armed until [`Self::rearm`].
    pub fn new(
        gpio: Arc<dyn Gpio>,
        coordinator: Coordinator,
        audio: Arc<AudioDispatcher>,
        stats: Stats,
    ) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let actions: Actions = Default::default();
        let dispatcher = tokio::spawn(dispatch(
            rx,
            actions.clone(),
            coordinator,
            audio,
            stats.clone(),
        ));
        Self {
            gpio,
            bindings: Mutex::new(Bindings::default()),
            actions,
            presses: tx,
            dispatcher,
            stats,
        }
    }

    /// Apply a new set of bindings.
    ///
    /// Bindings that changed or disappeared are torn down (their lines
    /// released) before new inputs are opened; unchanged ones keep running.
    /// Returns the bindings that could not be armed.
    pub async fn rearm(&self, bindings: Vec<Binding>) -> Vec<(ButtonId, anyhow::Error)> {
        let mut state = self.bindings.lock().await;
        let desired: BTreeMap<ButtonId, &Binding> = bindings
            .iter()
            .filter(|b| b.enabled)
            .map(|b| (b.id.clone(), b))
            .collect();

        let stale: Vec<ButtonId> = state
            .armed
            .iter()
            .filter(|(id, armed)| desired.get(*id) != Some(&&armed.binding))
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(armed) = state.armed.remove(&id) {
                armed.task.abort();
                // Wait until the task (and with it the line) is dropped.
                let _ = armed.task.await;
                info!("{} disarmed (GPIO {})", id, armed.binding.input.pin);
            }
        }

        let mut failures = Vec::new();
        for (id, binding) in &desired {
            if state.armed.contains_key(id) {
                continue;
            }
            match input::spawn(
                self.gpio.clone(),
                (*id).clone(),
                &binding.input,
                self.presses.clone(),
            )
            .await
            {
                Ok(task) => {
                    info!(
                        "{} initialized on GPIO {} for {:?}",
                        id, binding.input.pin, binding.action
                    );
                    state.armed.insert(
                        (*id).clone(),
                        Armed {
                            binding: (*binding).clone(),
                            task,
                        },
                    );
                }
                Err(e) => {
                    error!("Failed to setup {}: {:?}", id, e);
                    self.stats.record_error();
                    failures.push(((*id).clone(), e));
                }
            }
        }

        *self.actions.write().unwrap_or_else(|e| e.into_inner()) = state
            .armed
            .iter()
            .map(|(id, armed)| (id.clone(), armed.binding.action.clone()))
            .collect();
        state.all = bindings;
        failures
    }

    pub async fn bindings(&self) -> Vec<BindingStatus> {
        let state = self.bindings.lock().await;
        state
            .all
            .iter()
            .map(|b| BindingStatus {
                id: b.id.clone(),
                pin: b.input.pin,
                action: b.action.clone(),
                enabled: b.enabled,
                active: state.armed.contains_key(&b.id),
            })
            .collect()
    }

    /// Stop all input tasks and the dispatcher.
    pub async fn shutdown(&self) {
        let mut state = self.bindings.lock().await;
        for (id, armed) in std::mem::take(&mut state.armed) {
            armed.task.abort();
            let _ = armed.task.await;
            debug!("{} stopped", id);
        }
        self.actions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.dispatcher.abort();
        info!("Button router stopped");
    }
}

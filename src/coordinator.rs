//! Relay trigger coordination.
//!
//! A trigger switches a relay on and arms a timer that switches it back off
//! after the configured duration. All bookkeeping (live triggers, the number of
//! simultaneously active relays, hardware writes) happens under a single lock,
//! so HTTP handlers, button tasks and timers can call in concurrently.
//!
//! Each trigger gets a generation number. The release timer captures it when
//! armed and does nothing if, by the time it fires, the relay was already
//! released (or re-triggered) through another path.

use crate::consts::{Pin, RelayIdx, MAX_TRIGGER_DURATION};
use crate::hw::Gpio;
use crate::relay::{Polarity, RelayOutput};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown relay {0}")]
    UnknownRelay(RelayIdx),

    #[error("too many active relays ({active} of {max})")]
    ResourceExhausted { active: usize, max: usize },

    #[error("hardware failure on relay {relay}: {message}")]
    Hardware { relay: RelayIdx, message: String },

    #[error(
        "trigger duration must be greater than zero and at most {max}s",
        max = MAX_TRIGGER_DURATION.as_secs()
    )]
    InvalidDuration,

    #[error("relay controller is shutting down")]
    ShuttingDown,
}

fn valid_duration(duration: Duration) -> bool {
    !duration.is_zero() && duration <= MAX_TRIGGER_DURATION
}

impl Error {
    fn hardware(relay: RelayIdx, err: anyhow::Error) -> Self {
        Error::Hardware {
            relay,
            message: format!("{:#}", err),
        }
    }
}

/// Static description of a relay, as loaded from the configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RelaySpec {
    pub id: RelayIdx,
    pub pin: Pin,
    pub name: String,
    pub polarity: Polarity,
    pub duration: Duration,
}

/// Admin-editable relay attributes. `None` keeps the current value.
#[derive(Clone, Debug, Default)]
pub struct RelayUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Triggered {
    pub relay: RelayIdx,
    /// Configured duration in seconds.
    pub duration: f64,
    /// The relay was running already; nothing changed.
    pub already_active: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct Cancelled {
    pub relay: RelayIdx,
    /// `false` when the relay was idle and the call was a no-op.
    pub released: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Triggered,
    Expired,
    Cancelled,
    Shutdown,
}

/// Relay switched on or off.
#[derive(Clone, Debug, Serialize)]
pub struct RelayEvent {
    pub relay: RelayIdx,
    pub on: bool,
    pub reason: Reason,
    /// The OFF write failed; the relay may still be energized.
    pub fault: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelayState {
    On,
    Off,
    /// Last hardware write failed; the line level is not known.
    Unknown,
}

#[derive(Clone, Debug, Serialize)]
pub struct RelayStatus {
    pub name: String,
    pub active: bool,
    pub state: RelayState,
    pub gpio_pin: Pin,
    pub duration: f64,
    /// Seconds until the auto-release, for active relays.
    pub remaining: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SystemStatus {
    pub active_count: usize,
    pub max_concurrent: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub relays: BTreeMap<RelayIdx, RelayStatus>,
    pub system: SystemStatus,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Health {
    Ok,
    Unknown,
}

struct TriggerRecord {
    generation: u64,
    expires_at: Instant,
    timer: AbortHandle,
}

struct Slot {
    name: String,
    duration: Duration,
    output: RelayOutput,
    health: Health,
    generation: u64,
    record: Option<TriggerRecord>,
}

struct State {
    slots: BTreeMap<RelayIdx, Slot>,
    active_count: usize,
    max_concurrent: usize,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<RelayEvent>,
    runtime: Handle,
}

/// Owns the relays. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A panicking caller must not leave the relays unmanageable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, relay: RelayIdx, on: bool, reason: Reason, fault: bool) {
        // No subscribers is fine.
        let _ = self.events.send(RelayEvent {
            relay,
            on,
            reason,
            fault,
        });
    }

    /// Release path shared by expiry, cancel and shutdown. Returns false if
    /// there was nothing to release.
    fn release(
        &self,
        relay: RelayIdx,
        slot: &mut Slot,
        active_count: &mut usize,
        reason: Reason,
    ) -> bool {
        let record = match slot.record.take() {
            Some(record) => record,
            None => return false,
        };
        if reason != Reason::Expired {
            record.timer.abort();
        }
        slot.generation += 1;

        let fault = match slot.output.off() {
            Ok(()) => false,
            Err(e) => {
                // The budget is still returned; a stuck counter would block
                // every other relay.
                error!(relay, "Unable to switch relay off: {:?}", e);
                slot.health = Health::Unknown;
                true
            }
        };
        *active_count = active_count.saturating_sub(1);

        info!(relay, ?reason, "Relay {} turned OFF", relay);
        self.emit(relay, false, reason, fault);
        true
    }

    fn expire(&self, relay: RelayIdx, generation: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let slot = match state.slots.get_mut(&relay) {
            Some(slot) => slot,
            None => return,
        };
        match &slot.record {
            Some(record) if record.generation == generation => {}
            _ => {
                debug!(relay, generation, "Stale release timer, ignoring");
                return;
            }
        }
        self.release(relay, slot, &mut state.active_count, Reason::Expired);
    }
}

impl Coordinator {
    /// Open all relay lines (switched off) and build the coordinator.
    ///
    /// Must be called from within a tokio runtime; release timers are spawned
    /// on it.
    pub fn new(gpio: &dyn Gpio, relays: &[RelaySpec], max_concurrent: usize) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("Relay coordinator needs a tokio runtime")?;

        let mut slots = BTreeMap::new();
        for spec in relays {
            if !valid_duration(spec.duration) {
                anyhow::bail!("Relay {} has an invalid trigger duration {:?}", spec.id, spec.duration);
            }
            let line = gpio
                .output(spec.pin)
                .with_context(|| format!("Unable to open relay {} on GPIO {}", spec.id, spec.pin))?;
            // Lines opened so far get switched off again when `slots` drops.
            let output = RelayOutput::new(line, spec.polarity)
                .with_context(|| format!("Unable to switch off relay {}", spec.id))?;
            debug!("Initialized relay {} on GPIO {}", spec.id, spec.pin);

            let slot = Slot {
                name: spec.name.clone(),
                duration: spec.duration,
                output,
                health: Health::Ok,
                generation: 0,
                record: None,
            };
            if slots.insert(spec.id, slot).is_some() {
                anyhow::bail!("Relay {} configured twice", spec.id);
            }
        }

        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    slots,
                    active_count: 0,
                    max_concurrent,
                    closed: false,
                }),
                events,
                runtime,
            }),
        })
    }

    /// Switch a relay on for its configured duration.
    ///
    /// Triggering an active relay is a no-op reported with
    /// `already_active`. When the concurrency budget is used up the call fails
    /// without touching the hardware.
    pub fn trigger(&self, relay: RelayIdx) -> Result<Triggered, Error> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        let slot = state
            .slots
            .get_mut(&relay)
            .ok_or(Error::UnknownRelay(relay))?;

        if slot.record.is_some() {
            info!(relay, "Relay {} is already active", relay);
            return Ok(Triggered {
                relay,
                duration: slot.duration.as_secs_f64(),
                already_active: true,
            });
        }

        if state.active_count >= state.max_concurrent {
            warn!(
                relay,
                "Max concurrent triggers reached ({}), rejecting relay {}",
                state.max_concurrent,
                relay
            );
            return Err(Error::ResourceExhausted {
                active: state.active_count,
                max: state.max_concurrent,
            });
        }

        let duration = slot.duration;
        let expires_at = Instant::now()
            .checked_add(duration)
            .ok_or(Error::InvalidDuration)?;

        if slot.health == Health::Unknown {
            slot.output
                .off()
                .map_err(|e| Error::hardware(relay, e))?;
            slot.health = Health::Ok;
            info!(relay, "Relay {} reconciled to OFF", relay);
        }

        if let Err(e) = slot.output.on() {
            error!(relay, "Unable to switch relay on: {:?}", e);
            slot.health = Health::Unknown;
            return Err(Error::hardware(relay, e));
        }

        slot.generation += 1;
        let generation = slot.generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let timer = self.inner.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(relay, generation);
            }
        });
        slot.record = Some(TriggerRecord {
            generation,
            expires_at,
            timer: timer.abort_handle(),
        });
        state.active_count += 1;

        info!(
            relay,
            "Relay {} (GPIO {}) turned ON for {:?}",
            relay,
            slot.output.pin(),
            duration
        );
        self.inner.emit(relay, true, Reason::Triggered, false);

        Ok(Triggered {
            relay,
            duration: duration.as_secs_f64(),
            already_active: false,
        })
    }

    /// Switch a relay off before its timer does. Idle relays are a no-op,
    /// unless the last write failed: then OFF is written again.
    pub fn cancel(&self, relay: RelayIdx) -> Result<Cancelled, Error> {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        let slot = state
            .slots
            .get_mut(&relay)
            .ok_or(Error::UnknownRelay(relay))?;
        let released = self
            .inner
            .release(relay, slot, &mut state.active_count, Reason::Cancelled);
        if !released {
            if slot.health == Health::Unknown {
                slot.output
                    .off()
                    .map_err(|e| Error::hardware(relay, e))?;
                slot.health = Health::Ok;
                info!(relay, "Relay {} reconciled to OFF", relay);
            } else {
                debug!(relay, "Relay {} already idle", relay);
            }
        }
        Ok(Cancelled { relay, released })
    }

    pub fn status(&self) -> Status {
        let state = self.inner.lock();
        let now = Instant::now();
        let relays = state
            .slots
            .iter()
            .map(|(&id, slot)| {
                let active = slot.record.is_some();
                let relay_state = match (slot.health, active) {
                    (Health::Unknown, _) => RelayState::Unknown,
                    (Health::Ok, true) => RelayState::On,
                    (Health::Ok, false) => RelayState::Off,
                };
                let remaining = slot
                    .record
                    .as_ref()
                    .map(|r| r.expires_at.saturating_duration_since(now).as_secs_f64());
                let status = RelayStatus {
                    name: slot.name.clone(),
                    active,
                    state: relay_state,
                    gpio_pin: slot.output.pin(),
                    duration: slot.duration.as_secs_f64(),
                    remaining,
                };
                (id, status)
            })
            .collect();

        Status {
            relays,
            system: SystemStatus {
                active_count: state.active_count,
                max_concurrent: state.max_concurrent,
            },
        }
    }

    /// Update name and/or duration. A running trigger keeps its armed timer.
    pub fn reconfigure(&self, relay: RelayIdx, update: RelayUpdate) -> Result<(), Error> {
        if update.duration.is_some_and(|d| !valid_duration(d)) {
            return Err(Error::InvalidDuration);
        }
        let mut state = self.inner.lock();
        let slot = state
            .slots
            .get_mut(&relay)
            .ok_or(Error::UnknownRelay(relay))?;
        if let Some(name) = update.name {
            slot.name = name;
        }
        if let Some(duration) = update.duration {
            slot.duration = duration;
        }
        info!(relay, "Relay {} reconfigured: {:?} {:?}", relay, slot.name, slot.duration);
        Ok(())
    }

    /// Change the concurrency budget. Lowering it below the number of active
    /// relays releases nothing; new triggers fail until enough expire.
    pub fn set_max_concurrent(&self, max: usize) {
        let mut state = self.inner.lock();
        if state.max_concurrent != max {
            info!("Max concurrent triggers: {} -> {}", state.max_concurrent, max);
            state.max_concurrent = max;
        }
    }

    pub fn relay_ids(&self) -> Vec<RelayIdx> {
        self.inner.lock().slots.keys().copied().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    /// Switch every relay off, drop pending timers and refuse new triggers.
    pub fn shutdown(&self) {
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        state.closed = true;
        let mut released = 0;
        for (&relay, slot) in state.slots.iter_mut() {
            if self
                .inner
                .release(relay, slot, &mut state.active_count, Reason::Shutdown)
            {
                released += 1;
            }
            if slot.health == Health::Unknown {
                if let Err(e) = slot.output.off() {
                    error!(relay, "Relay {} still in unknown state on shutdown: {:?}", relay, e);
                }
            }
        }
        info!("Relay controller stopped, released {} active relays", released);
    }
}

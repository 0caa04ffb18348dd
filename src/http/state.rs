use crate::audio::{AudioDispatcher, ClipPlayer};
use crate::config::{ConfigStore, Settings};
use crate::coordinator::{Coordinator, RelayUpdate};
use crate::hw::Gpio;
use crate::router::ButtonRouter;
use crate::stats::Stats;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// The running gate, shared by the HTTP handlers and the MQTT bridge.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub buttons: Arc<ButtonRouter>,
    pub audio: Arc<AudioDispatcher>,
    pub stats: Stats,
    pub config: Arc<Mutex<ConfigStore>>,
}

impl AppState {
    /// Open the relays, start audio and arm the buttons described by `store`.
    pub async fn start(
        gpio: Arc<dyn Gpio>,
        player: Arc<dyn ClipPlayer>,
        store: ConfigStore,
    ) -> anyhow::Result<Self> {
        let settings = store.settings()?;
        let coordinator = Coordinator::new(gpio.as_ref(), &settings.relays, settings.max_concurrent)?;
        let stats = Stats::new();
        stats.collect(coordinator.subscribe());

        let audio = Arc::new(AudioDispatcher::new(
            player,
            settings.audio_enabled,
            settings.clips.clone(),
            stats.clone(),
        ));
        let buttons = Arc::new(ButtonRouter::new(
            gpio,
            coordinator.clone(),
            audio.clone(),
            stats.clone(),
        ));
        let failures = buttons.rearm(settings.bindings.clone()).await;
        if !failures.is_empty() {
            warn!("{} button(s) could not be armed", failures.len());
        }
        info!(
            "Initialized {} relays, max {} concurrent",
            settings.relays.len(),
            settings.max_concurrent
        );

        Ok(Self {
            coordinator,
            buttons,
            audio,
            stats,
            config: Arc::new(Mutex::new(store)),
        })
    }

    /// Push freshly validated settings into the running components.
    ///
    /// Returns true if some of the changes (relay pins, added relays, audio
    /// on/off) only take effect after a restart.
    pub async fn apply(&self, settings: &Settings) -> bool {
        let status = self.coordinator.status();
        let mut restart = settings.relays.len() != status.relays.len();

        for relay in &settings.relays {
            let Some(current) = status.relays.get(&relay.id) else {
                restart = true;
                continue;
            };
            if current.gpio_pin != relay.pin {
                restart = true;
            }
            let update = RelayUpdate {
                name: Some(relay.name.clone()),
                duration: Some(relay.duration),
            };
            if let Err(e) = self.coordinator.reconfigure(relay.id, update) {
                warn!("Unable to update relay {}: {}", relay.id, e);
            }
        }
        self.coordinator.set_max_concurrent(settings.max_concurrent);

        self.audio.set_clips(settings.clips.clone());
        if settings.audio_enabled != self.audio.is_enabled() {
            restart = true;
        }
        self.buttons.rearm(settings.bindings.clone()).await;
        restart
    }

    /// Stop buttons, audio and relays, in that order.
    pub async fn shutdown(&self) {
        self.buttons.shutdown().await;
        self.audio.stop_all().await;
        self.coordinator.shutdown();
    }
}

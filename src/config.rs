//! Configuration file.
//!
//! The file keeps the JSON layout used by existing installations. Keys
//! missing from the file take their defaults; a missing file is created with
//! the defaults. YAML is accepted when the file name ends in `.yml`/`.yaml`.
//!
//! [`ConfigStore`] keeps the raw document (so unknown keys survive a save and
//! the admin API can show it verbatim) and validates it into [`Settings`].

use crate::audio::{self, AudioClip, DEFAULT_CHANNEL};
use crate::consts::{AudioIdx, Pin, RelayIdx, MAX_TRIGGER_DURATION};
use crate::coordinator::RelaySpec;
use crate::hw::Pull;
use crate::input::{InputMode, InputSpec};
use crate::relay::Polarity;
use crate::router::{Action, Binding, ButtonId};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_DURATION: f64 = 0.5;
const DEFAULT_DEBOUNCE: f64 = 0.3;
const DEFAULT_POLL: f64 = 0.01;
const DEFAULT_VOLUME: u8 = 80;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown configuration section {0:?}")]
    UnknownSection(String),

    #[error("settings for {0:?} must be an object")]
    NotAnObject(String),

    #[error("invalid configuration: {0}")]
    Malformed(String),

    #[error("no relays configured")]
    NoRelays,

    #[error("max_concurrent_triggers must be at least 1")]
    InvalidMaxConcurrent,

    #[error(
        "trigger duration of relay {0} must be greater than zero and at most {max}s",
        max = MAX_TRIGGER_DURATION.as_secs()
    )]
    InvalidDuration(RelayIdx),

    #[error("{what} refers to unknown relay {relay}")]
    UnknownRelay { what: String, relay: RelayIdx },

    #[error("{0} is enabled but has no pin")]
    MissingPin(String),

    #[error("GPIO {pin} is used by both {first} and {second}")]
    PinConflict {
        pin: Pin,
        first: String,
        second: String,
    },

    #[error("invalid {what}: {value}")]
    InvalidTiming { what: String, value: f64 },

    #[error("invalid audio button key {0:?}, expected buttonN")]
    InvalidAudioButton(String),
}

fn default_true() -> bool {
    true
}

fn default_debounce() -> f64 {
    DEFAULT_DEBOUNCE
}

fn default_volume() -> u8 {
    DEFAULT_VOLUME
}

fn default_target_relay() -> RelayIdx {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub active_low: bool,
    pub trigger_durations: BTreeMap<RelayIdx, f64>,
    pub max_concurrent_triggers: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            active_low: true,
            trigger_durations: (1..=8).map(|id| (id, DEFAULT_DURATION)).collect(),
            max_concurrent_triggers: 3,
        }
    }
}

/// Single relay button from older installations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyButton {
    pub enabled: bool,
    pub button_pin: Pin,
    pub relay_number: RelayIdx,
    pub pull_up: bool,
    pub debounce_time: f64,
    pub poll_interval: f64,
}

impl Default for LegacyButton {
    fn default() -> Self {
        Self {
            enabled: false,
            button_pin: 26,
            relay_number: 1,
            pull_up: true,
            debounce_time: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ButtonEntry {
    pub pin: Pin,
    pub relay: RelayIdx,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiButtonSettings {
    pub enabled: bool,
    pub buttons: BTreeMap<u8, ButtonEntry>,
    pub pull_up: bool,
    pub debounce_time: f64,
    pub poll_interval: f64,
    pub input_mode: InputMode,
}

impl Default for MultiButtonSettings {
    fn default() -> Self {
        let pins = [26, 5, 6, 12, 20, 21, 7, 8];
        Self {
            enabled: true,
            buttons: (1..=8)
                .zip(pins)
                .map(|(id, pin)| {
                    (
                        id,
                        ButtonEntry {
                            pin,
                            relay: id,
                            enabled: true,
                        },
                    )
                })
                .collect(),
            pull_up: true,
            debounce_time: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL,
            input_mode: InputMode::Poll,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetButton {
    pub enabled: bool,
    pub pin: Option<Pin>,
    pub pull_up: bool,
    pub debounce_time: f64,
    pub poll_interval: f64,
    #[serde(default = "default_target_relay")]
    pub target_relay: RelayIdx,
}

impl Default for ResetButton {
    fn default() -> Self {
        Self {
            enabled: true,
            pin: Some(16),
            pull_up: true,
            debounce_time: DEFAULT_DEBOUNCE,
            poll_interval: DEFAULT_POLL,
            target_relay: default_target_relay(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioButton {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<Pin>,
    #[serde(default)]
    pub audio_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default = "default_true")]
    pub pull_up: bool,
    #[serde(default = "default_debounce")]
    pub debounce_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<f64>,
    /// Clips on the same channel cut each other off.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AudioButtons {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub buttons: BTreeMap<String, AudioButton>,
}

impl Default for AudioButtons {
    fn default() -> Self {
        let defaults = [
            (13, "doorbell", "Doorbell", 70, true),
            (19, "notification", "Notification", 60, true),
            (9, "chime", "Chime", 65, true),
            (10, "alert", "Alert", 75, true),
            (11, "melody", "Melody", 60, true),
            // GPIO 2 and 3 have fixed pull-up resistors on the board.
            (2, "warning", "Warning", 80, false),
            (3, "success", "Success", 70, false),
        ];
        Self {
            enabled: true,
            buttons: defaults
                .iter()
                .enumerate()
                .map(|(i, (pin, file, name, volume, pull_up))| {
                    (
                        format!("button{}", i + 1),
                        AudioButton {
                            pin: Some(*pin),
                            audio_file: format!("audio/{}.mp3", file),
                            name: Some(name.to_string()),
                            volume: *volume,
                            pull_up: *pull_up,
                            debounce_time: DEFAULT_DEBOUNCE,
                            poll_interval: None,
                            channel: None,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub log_level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub relay_pins: BTreeMap<RelayIdx, Pin>,
    pub relay_names: BTreeMap<RelayIdx, String>,
    pub relay_settings: RelaySettings,
    pub button_settings: LegacyButton,
    pub multi_button_settings: MultiButtonSettings,
    pub reset_button: ResetButton,
    pub audio_buttons: AudioButtons,
    pub server: ServerSettings,
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        let pins = [17, 18, 27, 22, 23, 24, 25, 4];
        Self {
            relay_pins: (1..=8).zip(pins).collect(),
            relay_names: (1..=8).map(|id| (id, format!("Relay {}", id))).collect(),
            relay_settings: RelaySettings::default(),
            button_settings: LegacyButton::default(),
            multi_button_settings: MultiButtonSettings::default(),
            reset_button: ResetButton::default(),
            audio_buttons: AudioButtons::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Validated, strongly typed view of the configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    pub relays: Vec<RelaySpec>,
    pub max_concurrent: usize,
    pub bindings: Vec<Binding>,
    pub clips: Vec<AudioClip>,
    pub audio_enabled: bool,
    /// Relay cancelled by the reset button and `/reset`.
    pub reset_target: RelayIdx,
    pub server: ServerSettings,
    pub log_level: String,
}

fn seconds(value: f64, what: &str, allow_zero: bool) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidTiming {
        what: what.to_string(),
        value,
    };
    if !(value > 0.0 || (allow_zero && value == 0.0)) {
        return Err(invalid());
    }
    // Rejects NaN, infinity and values too large for a Duration.
    Duration::try_from_secs_f64(value).map_err(|_| invalid())
}

fn input_spec(
    what: &str,
    pin: Pin,
    pull_up: bool,
    debounce: f64,
    poll: f64,
    mode: InputMode,
) -> Result<InputSpec, ConfigError> {
    Ok(InputSpec {
        pin,
        pull: Pull::from_pull_up(pull_up),
        debounce: seconds(debounce, &format!("{} debounce_time", what), true)?,
        poll_interval: seconds(poll, &format!("{} poll_interval", what), false)?,
        mode,
    })
}

/// Tracks GPIO ownership while validating.
#[derive(Default)]
struct PinMap(HashMap<Pin, String>);

impl PinMap {
    fn claim(&mut self, pin: Pin, owner: String) -> Result<(), ConfigError> {
        if let Some(first) = self.0.get(&pin) {
            return Err(ConfigError::PinConflict {
                pin,
                first: first.clone(),
                second: owner,
            });
        }
        self.0.insert(pin, owner);
        Ok(())
    }
}

impl Config {
    fn check_relay(&self, what: impl Into<String>, relay: RelayIdx) -> Result<(), ConfigError> {
        if self.relay_pins.contains_key(&relay) {
            Ok(())
        } else {
            Err(ConfigError::UnknownRelay {
                what: what.into(),
                relay,
            })
        }
    }

    fn relays(&self, pins: &mut PinMap) -> Result<Vec<RelaySpec>, ConfigError> {
        if self.relay_pins.is_empty() {
            return Err(ConfigError::NoRelays);
        }
        let polarity = Polarity::from_active_low(self.relay_settings.active_low);
        let mut relays = Vec::with_capacity(self.relay_pins.len());
        for (&id, &pin) in &self.relay_pins {
            pins.claim(pin, format!("relay {}", id))?;
            let secs = self
                .relay_settings
                .trigger_durations
                .get(&id)
                .copied()
                .unwrap_or(DEFAULT_DURATION);
            let duration = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|d| !d.is_zero() && *d <= MAX_TRIGGER_DURATION)
                .ok_or(ConfigError::InvalidDuration(id))?;
            relays.push(RelaySpec {
                id,
                pin,
                name: self
                    .relay_names
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| format!("Relay {}", id)),
                polarity,
                duration,
            });
        }
        Ok(relays)
    }

    fn relay_buttons(&self, pins: &mut PinMap) -> Result<Vec<Binding>, ConfigError> {
        let multi = &self.multi_button_settings;
        let legacy = &self.button_settings;
        let mut bindings = Vec::new();

        if multi.enabled {
            for (&n, button) in &multi.buttons {
                let id = ButtonId::Relay(n);
                if button.enabled {
                    self.check_relay(id.to_string(), button.relay)?;
                    pins.claim(button.pin, id.to_string())?;
                }
                bindings.push(Binding {
                    input: input_spec(
                        "multi_button_settings",
                        button.pin,
                        multi.pull_up,
                        multi.debounce_time,
                        multi.poll_interval,
                        multi.input_mode,
                    )?,
                    id,
                    action: Action::Trigger(button.relay),
                    enabled: button.enabled,
                });
            }
        } else if legacy.enabled {
            self.check_relay("button_settings", legacy.relay_number)?;
            pins.claim(legacy.button_pin, ButtonId::Single.to_string())?;
            bindings.push(Binding {
                id: ButtonId::Single,
                input: input_spec(
                    "button_settings",
                    legacy.button_pin,
                    legacy.pull_up,
                    legacy.debounce_time,
                    legacy.poll_interval,
                    InputMode::Poll,
                )?,
                action: Action::Trigger(legacy.relay_number),
                enabled: true,
            });
        }
        Ok(bindings)
    }

    fn reset_binding(&self, pins: &mut PinMap) -> Result<Option<Binding>, ConfigError> {
        let reset = &self.reset_button;
        let pin = match (reset.pin, reset.enabled) {
            (Some(pin), _) => pin,
            (None, true) => return Err(ConfigError::MissingPin("reset_button".to_string())),
            (None, false) => return Ok(None),
        };
        if reset.enabled {
            pins.claim(pin, ButtonId::Reset.to_string())?;
        }
        Ok(Some(Binding {
            id: ButtonId::Reset,
            input: input_spec(
                "reset_button",
                pin,
                reset.pull_up,
                reset.debounce_time,
                reset.poll_interval,
                self.multi_button_settings.input_mode,
            )?,
            action: Action::Reset(reset.target_relay),
            enabled: reset.enabled,
        }))
    }

    fn audio(&self, pins: &mut PinMap) -> Result<(Vec<AudioClip>, Vec<Binding>), ConfigError> {
        let audio = &self.audio_buttons;
        let mut clips = Vec::new();
        let mut bindings = Vec::new();

        for (key, button) in &audio.buttons {
            let id: AudioIdx = key
                .strip_prefix("button")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| ConfigError::InvalidAudioButton(key.clone()))?;
            let clip = AudioClip {
                id,
                name: button
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("Sound {}", id)),
                path: PathBuf::from(&button.audio_file),
                volume: button.volume.min(100),
                channel: button
                    .channel
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            };

            if let Some(pin) = button.pin {
                let label = ButtonId::Audio(id).to_string();
                let mut enabled = audio.enabled;
                if enabled {
                    if let Err(e) = audio::validate(&clip.path) {
                        warn!("{} disabled due to invalid audio file: {}", label, e);
                        enabled = false;
                    }
                }
                if enabled {
                    pins.claim(pin, label.clone())?;
                }
                bindings.push(Binding {
                    id: ButtonId::Audio(id),
                    input: input_spec(
                        &label,
                        pin,
                        button.pull_up,
                        button.debounce_time,
                        button
                            .poll_interval
                            .unwrap_or(self.multi_button_settings.poll_interval),
                        self.multi_button_settings.input_mode,
                    )?,
                    action: Action::Audio(id),
                    enabled,
                });
            }
            clips.push(clip);
        }
        Ok((clips, bindings))
    }

    /// Validate into [`Settings`].
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        if self.relay_settings.max_concurrent_triggers == 0 {
            return Err(ConfigError::InvalidMaxConcurrent);
        }
        let mut pins = PinMap::default();
        let relays = self.relays(&mut pins)?;
        self.check_relay("reset_button", self.reset_button.target_relay)?;

        let mut bindings = self.relay_buttons(&mut pins)?;
        bindings.extend(self.reset_binding(&mut pins)?);
        let (clips, audio_bindings) = self.audio(&mut pins)?;
        bindings.extend(audio_bindings);

        Ok(Settings {
            relays,
            max_concurrent: self.relay_settings.max_concurrent_triggers,
            bindings,
            clips,
            audio_enabled: self.audio_buttons.enabled,
            reset_target: self.reset_button.target_relay,
            server: self.server.clone(),
            log_level: self.logging.log_level.clone(),
        })
    }
}

/// Merge `update` into `base`, recursing into objects present on both sides.
fn deep_merge(base: &mut Value, update: Value) {
    match (base, update) {
        (Value::Object(base), Value::Object(update)) => {
            for (key, value) in update {
                match base.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value)
                    }
                    _ => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, update) => *base = update,
    }
}

/// Rewrite a file that only has the single-button section into the
/// multi-button layout. Returns true if something changed.
fn migrate_legacy(user: &mut Value) -> Result<bool, ConfigError> {
    let Some(doc) = user.as_object_mut() else {
        return Ok(false);
    };
    if doc.contains_key("multi_button_settings") {
        return Ok(false);
    }
    let Some(legacy) = doc.get_mut("button_settings") else {
        return Ok(false);
    };
    let old: LegacyButton = serde_json::from_value(legacy.clone())
        .map_err(|e| ConfigError::Malformed(format!("button_settings: {}", e)))?;

    // Default buttons stay listed but off; merging defaults would otherwise
    // bring all of them back enabled.
    let mut multi = MultiButtonSettings::default();
    for button in multi.buttons.values_mut() {
        button.enabled = false;
    }
    multi.enabled = old.enabled;
    multi.pull_up = old.pull_up;
    multi.debounce_time = old.debounce_time;
    multi.poll_interval = old.poll_interval;
    if old.enabled {
        multi.buttons.insert(
            1,
            ButtonEntry {
                pin: old.button_pin,
                relay: old.relay_number,
                enabled: true,
            },
        );
        if let Some(legacy) = legacy.as_object_mut() {
            legacy.insert("enabled".to_string(), Value::Bool(false));
        }
    }

    let multi = serde_json::to_value(multi).map_err(|e| ConfigError::Malformed(e.to_string()))?;
    doc.insert("multi_button_settings".to_string(), multi);
    Ok(true)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yml") | Some("yaml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

fn parse(text: &str, format: Format) -> anyhow::Result<Value> {
    Ok(match format {
        Format::Json => serde_json::from_str(text)?,
        Format::Yaml => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(text)?;
            serde_json::to_value(yaml)?
        }
    })
}

fn from_value(raw: &Value) -> Result<Config, ConfigError> {
    Config::deserialize(raw).map_err(|e| ConfigError::Malformed(e.to_string()))
}

pub struct ConfigStore {
    path: PathBuf,
    format: Format,
    raw: Value,
}

impl ConfigStore {
    /// Load the configuration file, creating it with defaults when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let format = Format::of(&path);
        let defaults = serde_json::to_value(Config::default())?;

        if !path.exists() {
            let store = Self {
                path,
                format,
                raw: defaults,
            };
            store.save()?;
            info!("No config file found, wrote defaults to {}", store.path.display());
            return Ok(store);
        }

        let text = fs::read_to_string(&path)
            .with_context(|| format!("Unable to read {}", path.display()))?;
        let mut user =
            parse(&text, format).with_context(|| format!("Unable to parse {}", path.display()))?;
        let migrated = migrate_legacy(&mut user)?;

        let mut raw = defaults;
        deep_merge(&mut raw, user);
        from_value(&raw)?;

        let store = Self { path, format, raw };
        if migrated {
            info!("Migrated single button settings in {}", store.path.display());
            store.save()?;
        }
        info!("Configuration loaded from {}", store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn config(&self) -> Result<Config, ConfigError> {
        from_value(&self.raw)
    }

    pub fn settings(&self) -> Result<Settings, ConfigError> {
        self.config()?.settings()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let text = match self.format {
            Format::Json => serde_json::to_string_pretty(&self.raw)?,
            Format::Yaml => serde_yaml::to_string(&self.raw)?,
        };
        fs::write(&self.path, text)
            .with_context(|| format!("Unable to write {}", self.path.display()))
    }

    /// Deep-merge `settings` into one top-level section, validate the result
    /// and persist it. Nothing changes if validation fails.
    pub fn update_section(&mut self, section: &str, settings: Value) -> anyhow::Result<Settings> {
        let mut raw = self.raw.clone();
        let target = raw
            .get_mut(section)
            .ok_or_else(|| ConfigError::UnknownSection(section.to_string()))?;
        if !settings.is_object() || !target.is_object() {
            return Err(ConfigError::NotAnObject(section.to_string()).into());
        }
        deep_merge(target, settings);

        let validated = from_value(&raw)?.settings()?;
        let previous = std::mem::replace(&mut self.raw, raw);
        if let Err(e) = self.save() {
            self.raw = previous;
            return Err(e);
        }
        info!("Configuration updated: {}", section);
        Ok(validated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::open(&path).unwrap();
        assert!(path.exists());

        let settings = store.settings().unwrap();
        assert_eq!(settings.relays.len(), 8);
        assert_eq!(settings.relays[0].pin, 17);
        assert_eq!(settings.relays[0].polarity, Polarity::ActiveLow);
        assert_eq!(settings.relays[7].duration, Duration::from_millis(500));
        assert_eq!(settings.max_concurrent, 3);
        assert_eq!(settings.reset_target, 1);
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.clips.len(), 7);

        let relay_buttons = settings
            .bindings
            .iter()
            .filter(|b| matches!(b.id, ButtonId::Relay(_)))
            .count();
        assert_eq!(relay_buttons, 8);
        let reset = settings
            .bindings
            .iter()
            .find(|b| b.id == ButtonId::Reset)
            .unwrap();
        assert_eq!(reset.input.pin, 16);
        assert_eq!(reset.action, Action::Reset(1));
        // Default clips don't exist here, so their buttons stay off.
        assert!(settings
            .bindings
            .iter()
            .filter(|b| matches!(b.id, ButtonId::Audio(_)))
            .all(|b| !b.enabled));

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["relay_pins"]["1"], 17);
    }

    #[test]
    fn partial_file_takes_defaults_for_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"relay_settings": {"max_concurrent_triggers": 2, "trigger_durations": {"3": 2.5}},
                "relay_names": {"1": "Gate"},
                "server": {"port": 8080, "debug": true}}"#,
        );
        let store = ConfigStore::open(&path).unwrap();
        let settings = store.settings().unwrap();
        assert_eq!(settings.max_concurrent, 2);
        assert_eq!(settings.relays[0].name, "Gate");
        assert_eq!(settings.relays[1].name, "Relay 2");
        assert_eq!(settings.relays[2].duration, Duration::from_millis(2500));
        assert_eq!(settings.relays[3].duration, Duration::from_millis(500));
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.host, "0.0.0.0");
        // Keys this program doesn't use are kept.
        assert_eq!(store.raw()["server"]["debug"], true);
    }

    #[test]
    fn legacy_button_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.json",
            r#"{"button_settings": {"enabled": true, "button_pin": 21, "relay_number": 4,
                 "pull_up": false, "debounce_time": 0.2, "poll_interval": 0.02}}"#,
        );
        let store = ConfigStore::open(&path).unwrap();
        let settings = store.settings().unwrap();

        let enabled: Vec<&Binding> = settings
            .bindings
            .iter()
            .filter(|b| b.enabled && matches!(b.id, ButtonId::Relay(_)))
            .collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, ButtonId::Relay(1));
        assert_eq!(enabled[0].input.pin, 21);
        assert_eq!(enabled[0].input.pull, Pull::Down);
        assert_eq!(enabled[0].input.debounce, Duration::from_millis(200));
        assert_eq!(enabled[0].action, Action::Trigger(4));
        assert!(!settings.bindings.iter().any(|b| b.id == ButtonId::Single));

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["multi_button_settings"]["buttons"]["1"]["pin"], 21);
        assert_eq!(written["button_settings"]["enabled"], false);
    }

    #[test]
    fn single_button_used_when_multi_disabled() {
        let config: Config = serde_json::from_value(json!({
            "button_settings": {"enabled": true, "button_pin": 26, "relay_number": 2},
            "multi_button_settings": {"enabled": false}
        }))
        .unwrap();
        let settings = config.settings().unwrap();
        let single = settings
            .bindings
            .iter()
            .find(|b| b.id == ButtonId::Single)
            .unwrap();
        assert_eq!(single.action, Action::Trigger(2));
        assert_eq!(single.input.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn validation_errors() {
        let mut config = Config::default();
        config.relay_settings.trigger_durations.insert(2, 0.0);
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidDuration(2))
        ));

        let mut config = Config::default();
        config.multi_button_settings.buttons.get_mut(&3).unwrap().relay = 9;
        assert!(matches!(
            config.settings(),
            Err(ConfigError::UnknownRelay { relay: 9, .. })
        ));

        let mut config = Config::default();
        config.reset_button.pin = Some(17);
        assert!(matches!(
            config.settings(),
            Err(ConfigError::PinConflict { pin: 17, .. })
        ));

        let mut config = Config::default();
        config.relay_settings.max_concurrent_triggers = 0;
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidMaxConcurrent)
        ));

        for huge in [1e30, f64::INFINITY, f64::NAN, 2.0 * 86400.0] {
            let mut config = Config::default();
            config.relay_settings.trigger_durations.insert(1, huge);
            assert!(matches!(
                config.settings(),
                Err(ConfigError::InvalidDuration(1))
            ));
        }

        let mut config = Config::default();
        config.multi_button_settings.poll_interval = 0.0;
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidTiming { .. })
        ));

        let mut config = Config::default();
        config.multi_button_settings.debounce_time = 1e30;
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidTiming { .. })
        ));

        // Disabled buttons may share pins.
        let mut config = Config::default();
        config.multi_button_settings.buttons.get_mut(&2).unwrap().enabled = false;
        config.multi_button_settings.buttons.get_mut(&2).unwrap().pin = 26;
        assert!(config.settings().is_ok());
    }

    #[test]
    fn update_section_merges_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::open(&path).unwrap();

        let settings = store
            .update_section(
                "relay_settings",
                json!({"trigger_durations": {"1": 3.0}, "max_concurrent_triggers": 5}),
            )
            .unwrap();
        assert_eq!(settings.max_concurrent, 5);
        assert_eq!(settings.relays[0].duration, Duration::from_secs(3));
        assert_eq!(settings.relays[1].duration, Duration::from_millis(500));

        let reopened = ConfigStore::open(&path).unwrap();
        assert_eq!(reopened.raw(), store.raw());
        assert_eq!(reopened.settings().unwrap().max_concurrent, 5);
    }

    #[test]
    fn rejected_update_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut store = ConfigStore::open(&path).unwrap();
        let before = store.raw().clone();

        let err = store
            .update_section("relay_settings", json!({"trigger_durations": {"1": -1}}))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidDuration(1))
        ));
        let err = store.update_section("nonsense", json!({})).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnknownSection(_))
        ));
        assert!(store.update_section("server", json!(5)).is_err());

        assert_eq!(store.raw(), &before);
        assert_eq!(ConfigStore::open(&path).unwrap().raw(), &before);
    }

    #[test]
    fn yaml_files_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.yaml",
            "relay_pins:\n  1: 5\n  2: 6\nrelay_settings:\n  active_low: false\nmulti_button_settings:\n  enabled: false\nreset_button:\n  enabled: false\n",
        );
        let store = ConfigStore::open(&path).unwrap();
        let settings = store.settings().unwrap();
        // Defaults fill in relays 3..8.
        assert_eq!(settings.relays.len(), 8);
        assert_eq!(settings.relays[0].pin, 5);
        assert_eq!(settings.relays[0].polarity, Polarity::ActiveHigh);

        store.save().unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(serde_yaml::from_str::<serde_yaml::Value>(&text).is_ok());
    }

    #[test]
    fn audio_buttons_with_valid_files_are_armed() {
        let dir = tempfile::tempdir().unwrap();
        let clip = write(&dir, "bell.ogg", "OggS");
        let mut config = Config::default();
        config.audio_buttons.buttons.clear();
        config.audio_buttons.buttons.insert(
            "button4".to_string(),
            AudioButton {
                pin: Some(13),
                audio_file: clip.to_string_lossy().into_owned(),
                name: None,
                volume: 150,
                pull_up: true,
                debounce_time: 0.3,
                poll_interval: None,
                channel: Some("door".to_string()),
            },
        );

        let settings = config.settings().unwrap();
        assert_eq!(settings.clips[0].id, 4);
        assert_eq!(settings.clips[0].name, "Sound 4");
        assert_eq!(settings.clips[0].volume, 100);
        assert_eq!(settings.clips[0].channel, "door");
        let binding = settings
            .bindings
            .iter()
            .find(|b| b.id == ButtonId::Audio(4))
            .unwrap();
        assert!(binding.enabled);
        assert_eq!(binding.action, Action::Audio(4));

        let copy = config.audio_buttons.buttons["button4"].clone();
        config
            .audio_buttons
            .buttons
            .insert("doorbell".to_string(), copy);
        assert!(matches!(
            config.settings(),
            Err(ConfigError::InvalidAudioButton(_))
        ));
    }
}

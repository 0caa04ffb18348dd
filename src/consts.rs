/// Relay index as used in the configuration and on the HTTP API. `0` is
/// never configured.
pub type RelayIdx = u8;
/// Audio button index (`buttonN` in the configuration).
pub type AudioIdx = u8;
/// GPIO line number (BCM numbering on a Raspberry Pi).
pub type Pin = u8;

/// Software version
pub const GATE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GATE_NAME: &str = "relay-gate";
pub const GATE_URL: &str = env!("CARGO_PKG_HOMEPAGE");

pub const HA_DISCOVERY_TOPIC: &str = "homeassistant";
pub const HA_CONTROL_TOPIC: &str = "relaygate";

/// Extensions the audio backends are able to play.
pub const AUDIO_EXTENSIONS: [&str; 5] = ["mp3", "wav", "ogg", "flac", "m4a"];

/// Above this many recorded errors `/health` reports a degraded state.
pub const HEALTH_ERROR_THRESHOLD: u64 = 100;

/// Longest accepted trigger duration.
pub const MAX_TRIGGER_DURATION: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

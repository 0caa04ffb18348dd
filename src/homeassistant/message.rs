use super::discovery;
use crate::consts::{self, RelayIdx};

/// Things we sent to HA.
#[derive(Debug)]
pub enum Outgoing {
    /// Subscribe to a new topic given as argument. Not a real message.
    Subscribe(String),
    /// Mark the gate as online; sent once after connecting.
    Initial,
    /// Discovery message, sent to
    /// <discovery_prefix>/device/<device>/config
    DiscoveryDevice(discovery::Discovery),
    /// Relay switched on or off.
    RelayState { relay: RelayIdx, on: bool },
}

/// Things HA sents to us (like: trigger switch)
#[derive(Debug, PartialEq)]
pub enum Incoming {
    /// ON triggers the relay for its configured duration, OFF cancels it.
    SetRelay { relay: RelayIdx, on: bool },
}

pub fn command_topic(device: &str, relay: RelayIdx) -> String {
    format!("{}/{}/relay/{}/set", consts::HA_CONTROL_TOPIC, device, relay)
}

pub fn state_topic(device: &str, relay: RelayIdx) -> String {
    format!("{}/{}/relay/{}/state", consts::HA_CONTROL_TOPIC, device, relay)
}

pub fn availability_topic(device: &str) -> String {
    format!("{}/{}/status", consts::HA_CONTROL_TOPIC, device)
}

/// Subscription filter matching every relay command of `device`.
pub fn command_filter(device: &str) -> String {
    format!("{}/{}/relay/+/set", consts::HA_CONTROL_TOPIC, device)
}

impl Incoming {
    /// Decode a publish received on a command topic of `device`.
    pub fn parse(device: &str, topic: &str, payload: &[u8]) -> Result<Self, String> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [prefix, dev, "relay", relay, "set"] = parts[..] else {
            return Err(format!("Unknown topic {}", topic));
        };
        if prefix != consts::HA_CONTROL_TOPIC || dev != device {
            return Err(format!("Topic {} is not ours", topic));
        }
        let relay = relay
            .parse::<RelayIdx>()
            .map_err(|_| format!("Relay index is not a 0-255 number: {}", relay))?;
        let on = match payload {
            b"ON" => true,
            b"OFF" => false,
            other => {
                return Err(format!(
                    "Unexpected payload {:?} for relay {}",
                    String::from_utf8_lossy(other),
                    relay
                ))
            }
        };
        Ok(Incoming::SetRelay { relay, on })
    }
}

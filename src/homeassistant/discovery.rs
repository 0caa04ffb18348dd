use super::message;
use crate::consts::{self, RelayIdx};
use crate::coordinator::Status;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

/// Device identifier
#[derive(Serialize, Debug, Default)]
pub struct DeviceId {
    pub name: String,
    pub identifiers: Vec<String>,
    pub manufacturer: String,
}

/// Discovery origin - this software identifier.
#[derive(Serialize, Debug, Default)]
pub struct Origin {
    name: String,
    sw_version: String,
    support_url: String,
}

/// Represents a component - a part of Device defined by Discovery
#[derive(Serialize, Debug)]
pub struct Component {
    pub name: String,
    pub platform: String,
    /// Changes icon; outlet or switch
    pub device_class: String,
    pub unique_id: String,
    pub command_topic: String,
    pub state_topic: String,
    pub availability_topic: String,
}

impl Component {
    pub fn new_switch(name: &str, device: &str, relay: RelayIdx) -> Self {
        Self {
            name: name.to_string(),
            platform: "switch".to_string(),
            device_class: "switch".to_string(),
            unique_id: format!("{}-{}-{}", consts::GATE_NAME, device, relay),
            command_topic: message::command_topic(device, relay),
            state_topic: message::state_topic(device, relay),
            availability_topic: message::availability_topic(device),
        }
    }
}

// With device discovery the config topic is
// <discovery_prefix>/device/<object_id>/config
#[derive(Serialize, Debug)]
pub struct Discovery {
    pub device: DeviceId,
    pub origin: Origin,

    pub components: BTreeMap<String, Component>,
}

impl Discovery {
    pub fn serialize(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Describe every relay as a switch of one device.
pub fn new_device(device: &str, status: &Status) -> Discovery {
    let origin = Origin {
        name: consts::GATE_NAME.to_string(),
        sw_version: consts::GATE_VERSION.to_string(),
        support_url: consts::GATE_URL.to_string(),
    };

    let device_id = DeviceId {
        name: device.to_string(),
        identifiers: vec![format!("{}-{}", consts::GATE_NAME, device)],
        manufacturer: "smartenough".to_string(),
    };

    let names: HashSet<&str> = status.relays.values().map(|r| r.name.as_str()).collect();
    if names.len() != status.relays.len() {
        warn!("Duplicated relay names, Home Assistant entities may be confusing");
    }

    let components = status
        .relays
        .iter()
        .map(|(&relay, info)| {
            (
                format!("relay{}", relay),
                Component::new_switch(&info.name, device, relay),
            )
        })
        .collect();

    Discovery {
        origin,
        device: device_id,
        components,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{RelayState, RelayStatus, SystemStatus};

    fn relay(name: &str, pin: u8) -> RelayStatus {
        RelayStatus {
            name: name.to_string(),
            active: false,
            state: RelayState::Off,
            gpio_pin: pin,
            duration: 0.5,
            remaining: None,
        }
    }

    #[test]
    fn one_switch_per_relay() {
        let status = Status {
            relays: [(1, relay("Gate", 17)), (2, relay("Garage", 18))]
                .into_iter()
                .collect(),
            system: SystemStatus {
                active_count: 0,
                max_concurrent: 3,
            },
        };
        let discovery = new_device("porch", &status);
        assert_eq!(discovery.device.identifiers, vec!["relay-gate-porch"]);
        assert_eq!(discovery.components.len(), 2);

        let gate = &discovery.components["relay1"];
        assert_eq!(gate.name, "Gate");
        assert_eq!(gate.command_topic, "relaygate/porch/relay/1/set");
        assert_eq!(gate.state_topic, "relaygate/porch/relay/1/state");
        assert_eq!(gate.unique_id, "relay-gate-porch-1");

        let json: serde_json::Value =
            serde_json::from_str(&discovery.serialize().unwrap()).unwrap();
        assert_eq!(json["components"]["relay2"]["platform"], "switch");
        assert_eq!(json["origin"]["name"], "relay-gate");
    }
}

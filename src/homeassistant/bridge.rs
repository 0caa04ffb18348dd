//! Relays exposed to Home Assistant: commands from MQTT go to the
//! coordinator, relay events go back as switch states.

use super::{discovery, message, HomeAssistant, Incoming, Outgoing};
use crate::coordinator::{Coordinator, Error};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Act on one command. Errors are reported, never fatal.
pub fn handle(coordinator: &Coordinator, msg: Incoming) {
    match msg {
        Incoming::SetRelay { relay, on: true } => match coordinator.trigger(relay) {
            Ok(t) if t.already_active => info!("MQTT: relay {} already active", relay),
            Ok(t) => info!("MQTT: relay {} on for {}s", relay, t.duration),
            Err(e @ Error::ResourceExhausted { .. }) => warn!("MQTT: relay {}: {}", relay, e),
            Err(e) => warn!("MQTT: unable to trigger relay {}: {}", relay, e),
        },
        Incoming::SetRelay { relay, on: false } => match coordinator.cancel(relay) {
            Ok(c) => info!("MQTT: relay {} cancelled (released: {})", relay, c.released),
            Err(e) => warn!("MQTT: unable to cancel relay {}: {}", relay, e),
        },
    }
}

/// Publish the current state of every relay.
async fn publish_states(ha: &HomeAssistant, coordinator: &Coordinator) -> anyhow::Result<()> {
    for (&relay, info) in &coordinator.status().relays {
        ha.send(Outgoing::RelayState {
            relay,
            on: info.active,
        })
        .await?;
    }
    Ok(())
}

/// Register the relays with Home Assistant and keep both sides in sync until
/// the connection closes.
pub async fn run(ha: HomeAssistant, device: &str, coordinator: Coordinator) -> anyhow::Result<()> {
    // Subscribe first so no change slips between the snapshot and the stream.
    let mut events = coordinator.subscribe();
    let status = coordinator.status();

    ha.send(Outgoing::Subscribe(message::command_filter(device)))
        .await?;
    ha.send(Outgoing::DiscoveryDevice(discovery::new_device(device, &status)))
        .await?;
    ha.send(Outgoing::Initial).await?;
    publish_states(&ha, &coordinator).await?;
    info!("Home Assistant bridge running for {} relays", status.relays.len());

    let ha = Arc::new(ha);
    let ha_sender = ha.clone();
    let state_source = coordinator.clone();
    let task_states = async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let msg = Outgoing::RelayState {
                        relay: event.relay,
                        on: event.on,
                    };
                    if ha_sender.send(msg).await.is_err() {
                        // The other end died.
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Bridge missed {} relay events, republishing states", missed);
                    if publish_states(&ha_sender, &state_source).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Relay->MQTT task finishing");
    };

    let task_commands = async move {
        while let Some(msg) = ha.recv().await {
            handle(&coordinator, msg);
        }
        info!("MQTT->Relay task finishing");
    };

    // Either side ending means the bridge is done.
    tokio::select! {
        _ = task_states => {}
        _ = task_commands => {}
    }
    Ok(())
}

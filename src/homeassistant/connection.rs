use super::message::{self, Incoming, Outgoing};
use crate::consts;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS};
use rumqttc::{Event, Packet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::{sync::Mutex, task};

use tracing::{debug, error, info, warn};

pub struct Initiator {
    client: AsyncClient,
    event_loop: EventLoop,
    device: String,
}

/// HA interfacing via MQTT
pub struct HomeAssistant {
    /// Outgoing event queue: things we sent to HA.
    outgoing: mpsc::Sender<Outgoing>,
    /// Incoming event queue: commands read from HA.
    incoming: Mutex<mpsc::Receiver<Incoming>>,
}

impl Initiator {
    pub async fn new(
        device: &str,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Self> {
        let id = format!("{}-{}", consts::GATE_NAME, device);
        let mut mqttoptions = MqttOptions::new(id, host, port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !username.is_empty() {
            mqttoptions.set_credentials(username, password);
        }
        mqttoptions.set_last_will(LastWill::new(
            message::availability_topic(device),
            "offline",
            QoS::AtLeastOnce,
            true,
        ));

        let (client, mut event_loop) = AsyncClient::new(mqttoptions, 10);

        // Fail early if parameters are invalid.
        if let Err(e) = event_loop.poll().await {
            warn!("Initial connection to MQTT failed. Check connection parameters");
            anyhow::bail!("Unable to contact MQTT at {}:{}: {}", host, port, e);
        }

        Ok(Initiator {
            client,
            event_loop,
            device: device.to_string(),
        })
    }

    async fn receiver(
        mut event_loop: EventLoop,
        client: AsyncClient,
        device: String,
        queue: mpsc::Sender<Incoming>,
    ) {
        loop {
            let notification = event_loop.poll().await;
            let result = match notification {
                Ok(Event::Incoming(Packet::Publish(msg))) => {
                    info!("RX message to {} with payload '{:?}'", msg.topic, msg.payload);
                    match Incoming::parse(&device, &msg.topic, &msg.payload) {
                        Ok(message) => queue.send(message).await,
                        Err(reason) => {
                            warn!("{} - ignoring", reason);
                            continue;
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Session is not persistent; subscribe again after a reconnect.
                    info!("Connected to MQTT");
                    if let Err(e) =
                        client.try_subscribe(message::command_filter(&device), QoS::AtLeastOnce)
                    {
                        error!("Unable to subscribe to relay commands: {:?}", e);
                    }
                    continue;
                }
                Ok(Event::Outgoing(_))
                | Ok(Event::Incoming(Packet::PingResp))
                | Ok(Event::Incoming(Packet::SubAck(_)))
                | Ok(Event::Incoming(Packet::PubAck(_))) => {
                    // Silence common messages
                    continue;
                }
                Ok(other) => {
                    debug!("Received other message = {:?}", other);
                    continue;
                }
                Err(e) => {
                    warn!("MQTT connection error: {}. Retrying", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            if result.is_err() {
                error!("Error while sending received message to queue: {:?}. Quitting loop", result);
                return;
            }
        }
    }

    async fn sender(client: AsyncClient, device: String, mut queue: mpsc::Receiver<Outgoing>) {
        while let Some(command) = queue.recv().await {
            let result = match command {
                Outgoing::Subscribe(topic) => client.subscribe(&topic, QoS::AtLeastOnce).await,
                Outgoing::Initial => {
                    client
                        .publish(
                            message::availability_topic(&device),
                            QoS::AtLeastOnce,
                            true,
                            "online",
                        )
                        .await
                }
                Outgoing::DiscoveryDevice(msg) => {
                    let object_id = msg
                        .device
                        .identifiers
                        .first()
                        .map(String::as_str)
                        .unwrap_or(&device);
                    let topic = format!(
                        "{}/device/{}/config",
                        consts::HA_DISCOVERY_TOPIC,
                        object_id
                    );
                    let payload = match msg.serialize() {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("Unable to serialize discovery message: {}", e);
                            continue;
                        }
                    };
                    debug!("Sending discovery payload to {}: {}", topic, payload);
                    client.publish(topic, QoS::AtLeastOnce, true, payload).await
                }
                Outgoing::RelayState { relay, on } => {
                    let payload = if on { "ON" } else { "OFF" };
                    client
                        .publish(
                            message::state_topic(&device, relay),
                            QoS::AtLeastOnce,
                            true,
                            payload,
                        )
                        .await
                }
            };
            if let Err(e) = result {
                // Client request queue is gone: the event loop died.
                error!("Unable to send MQTT request: {:?}. Quitting loop", e);
                return;
            }
        }
    }

    pub async fn start(self) -> HomeAssistant {
        let (out_sender, out_receiver) = mpsc::channel::<Outgoing>(10);
        let (in_sender, in_receiver) = mpsc::channel::<Incoming>(10);
        task::spawn(Self::receiver(
            self.event_loop,
            self.client.clone(),
            self.device.clone(),
            in_sender,
        ));
        task::spawn(Self::sender(self.client, self.device, out_receiver));

        HomeAssistant {
            outgoing: out_sender,
            incoming: Mutex::new(in_receiver),
        }
    }
}

impl HomeAssistant {
    /// Receive incoming message (from MQTT). None means the HA reading loop
    /// finished.
    pub async fn recv(&self) -> Option<Incoming> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await
    }

    pub async fn send(&self, msg: Outgoing) -> anyhow::Result<()> {
        self.outgoing.send(msg).await?;
        Ok(())
    }

    /// Queues without a broker behind them.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::Sender<Incoming>, mpsc::Receiver<Outgoing>) {
        let (out_sender, out_receiver) = mpsc::channel::<Outgoing>(10);
        let (in_sender, in_receiver) = mpsc::channel::<Incoming>(10);
        let ha = HomeAssistant {
            outgoing: out_sender,
            incoming: Mutex::new(in_receiver),
        };
        (ha, in_sender, out_receiver)
    }
}

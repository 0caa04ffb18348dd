use crate::consts::RelayIdx;
use crate::coordinator::{Reason, RelayEvent};
use crate::router::ButtonId;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

struct Counters {
    started_at: DateTime<Local>,
    total_triggers: u64,
    relay_triggers: BTreeMap<RelayIdx, u64>,
    button_presses: BTreeMap<String, u64>,
    last_trigger: Option<DateTime<Local>>,
    audio_plays: u64,
    errors: u64,
}

/// Usage counters shown on the admin endpoints.
#[derive(Clone)]
pub struct Stats {
    counters: Arc<Mutex<Counters>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatsSnapshot {
    pub started_at: String,
    pub uptime: String,
    pub uptime_secs: i64,
    pub total_triggers: u64,
    pub relay_triggers: BTreeMap<RelayIdx, u64>,
    pub button_presses: BTreeMap<String, u64>,
    pub last_trigger: Option<String>,
    pub audio_plays: u64,
    pub errors: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Mutex::new(Counters {
                started_at: Local::now(),
                total_triggers: 0,
                relay_triggers: BTreeMap::new(),
                button_presses: BTreeMap::new(),
                last_trigger: None,
                audio_plays: 0,
                errors: 0,
            })),
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_trigger(&self, relay: RelayIdx) {
        let mut c = self.counters();
        c.total_triggers += 1;
        *c.relay_triggers.entry(relay).or_default() += 1;
        c.last_trigger = Some(Local::now());
    }

    pub fn record_press(&self, button: &ButtonId) {
        *self.counters().button_presses.entry(button.to_string()).or_default() += 1;
    }

    pub fn record_audio_play(&self) {
        self.counters().audio_plays += 1;
    }

    pub fn record_error(&self) {
        self.counters().errors += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let c = self.counters();
        let uptime = Local::now().signed_duration_since(c.started_at);
        let secs = uptime.num_seconds();
        StatsSnapshot {
            started_at: c.started_at.to_rfc3339(),
            uptime: format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60),
            uptime_secs: secs,
            total_triggers: c.total_triggers,
            relay_triggers: c.relay_triggers.clone(),
            button_presses: c.button_presses.clone(),
            last_trigger: c.last_trigger.map(|t| t.to_rfc3339()),
            audio_plays: c.audio_plays,
            errors: c.errors,
        }
    }

    /// Count relay activations and failed releases from the coordinator's
    /// event stream.
    pub fn collect(&self, mut events: broadcast::Receiver<RelayEvent>) -> JoinHandle<()> {
        let stats = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.reason == Reason::Triggered => {
                        stats.record_trigger(event.relay)
                    }
                    Ok(event) if event.fault => stats.record_error(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Statistics missed {} relay events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = Stats::new();
        stats.record_trigger(1);
        stats.record_trigger(1);
        stats.record_trigger(3);
        stats.record_press(&ButtonId::Relay(1));
        stats.record_press(&ButtonId::Reset);
        stats.record_audio_play();
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_triggers, 3);
        assert_eq!(snapshot.relay_triggers[&1], 2);
        assert_eq!(snapshot.button_presses["button-1"], 1);
        assert_eq!(snapshot.button_presses["reset"], 1);
        assert_eq!(snapshot.audio_plays, 1);
        assert_eq!(snapshot.errors, 1);
        assert!(snapshot.last_trigger.is_some());
    }

    #[tokio::test]
    async fn collector_counts_only_activations() {
        let stats = Stats::new();
        let (tx, rx) = broadcast::channel(8);
        let task = stats.collect(rx);
        for (on, reason, fault) in [
            (true, Reason::Triggered, false),
            (false, Reason::Expired, false),
            (true, Reason::Triggered, false),
            (false, Reason::Cancelled, false),
        ] {
            tx.send(RelayEvent {
                relay: 2,
                on,
                reason,
                fault,
            })
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.relay_triggers[&2], 2);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test]
    async fn failed_release_counts_as_error() {
        let stats = Stats::new();
        let (tx, rx) = broadcast::channel(8);
        let task = stats.collect(rx);
        tx.send(RelayEvent {
            relay: 1,
            on: false,
            reason: Reason::Expired,
            fault: true,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();
        assert_eq!(stats.snapshot().errors, 1);
    }
}

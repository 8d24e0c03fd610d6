mod sim;

use anyhow::Result;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::{env, time::Duration};
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Outputs, ReservoirSim, Sample, Scenario, SENSOR_FAULT};

const EVENTS_TOPIC: &str = "hydro/events";

// ---------------------------------------------------------------------------
// Telemetry payload
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChannelReading {
    value: f64,
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadingMsg {
    ts: i64,
    readings: BTreeMap<&'static str, ChannelReading>,
}

impl ReadingMsg {
    fn from_sample(ts: i64, s: &Sample) -> Self {
        let channels = [
            ("ph", s.ph),
            ("ec", s.ec),
            ("waterTemp", s.water_temp),
            ("airTemp", s.air_temp),
            ("humidity", s.humidity),
            ("waterLevel", s.water_level),
        ];
        let readings = channels
            .into_iter()
            .map(|(name, value)| {
                let status = if value == SENSOR_FAULT { "fault" } else { "ok" };
                (name, ChannelReading { value, status })
            })
            .collect();
        Self { ts, readings }
    }
}

// ---------------------------------------------------------------------------
// Hub events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HubEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// The slice of an `actuator_update` the simulator cares about.
#[derive(Debug, Deserialize)]
struct ActuatorState {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    status: String,
    #[serde(default)]
    direction: Option<String>,
}

/// Running set of actuators, keyed by id.
#[derive(Debug, Default)]
struct Tracker {
    running: HashMap<String, ActuatorState>,
}

impl Tracker {
    /// Fold one event payload in. Anything that is not an actuator update
    /// is ignored.
    fn observe(&mut self, payload: &[u8]) -> Result<()> {
        let event: HubEvent = serde_json::from_slice(payload)?;
        if event.kind != "actuator_update" {
            return Ok(());
        }
        let a: ActuatorState = serde_json::from_value(event.data)?;
        if a.status == "active" {
            self.running.insert(a.id.clone(), a);
        } else {
            self.running.remove(&a.id);
        }
        Ok(())
    }

    fn outputs(&self) -> Outputs {
        let mut o = Outputs::default();
        for a in self.running.values() {
            match (a.kind.as_str(), a.direction.as_deref()) {
                ("fertilizer-pump", _) => o.fertilizer_pumps += 1,
                ("pump", _) => o.irrigating = true,
                ("ph-pump", Some("up")) => o.ph_up = true,
                ("ph-pump", Some("down")) => o.ph_down = true,
                _ => {}
            }
        }
        o
    }
}

fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| "node-a".to_string());

    let sample_every_s: u64 = env::var("SAMPLE_EVERY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());
    let diurnal_period_s: f64 = env::var("SIM_DAY_S")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(86_400.0);

    let client_id = format!("hydro-node-{node_id}");
    let mut mqttoptions = MqttOptions::new(client_id, broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // The eventloop keeps the connection alive and follows hub events so
    // the simulator can react to running pumps.
    let tracker = Arc::new(Mutex::new(Tracker::default()));
    let loop_tracker = Arc::clone(&tracker);
    let loop_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = loop_client.try_subscribe(EVENTS_TOPIC, QoS::AtMostOnce) {
                        error!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == EVENTS_TOPIC => {
                    let mut t = loop_tracker.lock().unwrap_or_else(|e| e.into_inner());
                    if let Err(e) = t.observe(&p.payload) {
                        warn!("ignoring hub event: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = format!("tele/{node_id}/reading");
    info!(%topic, %scenario, "publishing simulated reservoir");

    let mut sim = ReservoirSim::new(scenario, diurnal_period_s);
    loop {
        let outputs = tracker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .outputs();
        sim.set_outputs(outputs);

        let ts = now_unix();
        let msg = ReadingMsg::from_sample(ts, &sim.sample(ts as f64));
        let payload = serde_json::to_vec(&msg)?;

        if let Err(e) = client
            .publish(&topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            error!("publish error: {e}");
        } else {
            info!(ts, "published reading");
        }

        sleep(Duration::from_secs(sample_every_s)).await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        Sample {
            ph: 6.1,
            ec: 1450.0,
            water_temp: SENSOR_FAULT,
            air_temp: 23.4,
            humidity: 58.0,
            water_level: 80.0,
        }
    }

    fn update(id: &str, kind: &str, status: &str, direction: Option<&str>) -> Vec<u8> {
        let mut data = serde_json::json!({
            "id": id, "name": id, "pin": 5, "type": kind, "status": status, "mode": "manual"
        });
        if let Some(d) = direction {
            data["direction"] = d.into();
        }
        serde_json::to_vec(&serde_json::json!({"type": "actuator_update", "data": data})).unwrap()
    }

    // -- payload ------------------------------------------------------------

    #[test]
    fn now_unix_is_recent() {
        let ts = now_unix();
        assert!(ts > 1_704_067_200, "timestamp too old: {ts}");
    }

    #[test]
    fn reading_msg_shape() {
        let json = serde_json::to_value(ReadingMsg::from_sample(1_700_000_000, &sample())).unwrap();
        assert_eq!(json["ts"], 1_700_000_000);
        let readings = json["readings"].as_object().unwrap();
        assert_eq!(readings.len(), 6);
        assert_eq!(json["readings"]["ph"]["value"], 6.1);
        assert_eq!(json["readings"]["ec"]["status"], "ok");
        assert_eq!(json["readings"]["waterTemp"]["value"], -127.0);
        assert_eq!(json["readings"]["waterTemp"]["status"], "fault");
    }

    // -- tracker ------------------------------------------------------------

    #[test]
    fn tracker_follows_actuator_updates() {
        let mut t = Tracker::default();
        t.observe(&update("fertilizer-pump-a", "fertilizer-pump", "active", None))
            .unwrap();
        t.observe(&update("fertilizer-pump-b", "fertilizer-pump", "active", None))
            .unwrap();
        t.observe(&update("irrigation-pump", "pump", "active", None))
            .unwrap();
        t.observe(&update("ph-up-pump", "ph-pump", "active", Some("up")))
            .unwrap();

        let o = t.outputs();
        assert_eq!(o.fertilizer_pumps, 2);
        assert!(o.irrigating);
        assert!(o.ph_up);
        assert!(!o.ph_down);

        t.observe(&update("fertilizer-pump-a", "fertilizer-pump", "idle", None))
            .unwrap();
        t.observe(&update("irrigation-pump", "pump", "paused", None))
            .unwrap();
        let o = t.outputs();
        assert_eq!(o.fertilizer_pumps, 1);
        assert!(!o.irrigating);
    }

    #[test]
    fn tracker_ignores_progress_events() {
        let mut t = Tracker::default();
        let progress = serde_json::json!({
            "type": "fertilizer_progress",
            "data": {"isDispensing": true, "serverTimestamp": 1}
        });
        t.observe(&serde_json::to_vec(&progress).unwrap()).unwrap();
        assert_eq!(t.outputs(), Outputs::default());
    }

    #[test]
    fn tracker_rejects_garbage() {
        let mut t = Tracker::default();
        assert!(t.observe(b"not json").is_err());
        assert!(t
            .observe(br#"{"type":"actuator_update","data":{"id":"x"}}"#)
            .is_err());
    }
}

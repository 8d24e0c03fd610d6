mod actuator;
mod arbiter;
mod checkpoint;
mod clock;
mod config;
mod db;
mod dispense;
mod dosing;
mod error;
mod events;
mod mqtt;
mod relay;
mod rules;
mod scheduler;
mod sensors;
mod state;
mod web;

use anyhow::Result;
use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, QoS};
use std::{collections::HashMap, env, path::Path, sync::Arc, time::Duration};
use tokio::sync::{broadcast, Mutex};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use actuator::{Status, StatusUpdate};
use arbiter::Arbiter;
use checkpoint::CheckpointFile;
use config::Config;
use db::Db;
use dispense::Sequencer;
use dosing::AutoDoser;
use events::Broadcaster;
use mqtt::{
    extract_actuator_id, extract_node_id, parse_command, ReadingMsg, COMMAND_TOPICS, EVENTS_TOPIC,
    READING_TOPICS,
};
use relay::RelayBoard;
use rules::RuleEngine;
use scheduler::Scheduler;
use state::{SharedState, SystemState};

/// What the MQTT loop needs to route incoming messages.
struct Hub {
    db: Db,
    shared: SharedState,
    arbiter: Arc<Arbiter>,
    relays: Arc<Mutex<RelayBoard>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:hydro.db?mode=rwc".to_string());
    let checkpoint_path = env::var("DOSING_CHECKPOINT")
        .unwrap_or_else(|_| "data/auto-dosing-state.json".to_string());

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file (seed actuators + tunables) ──────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = if Path::new(&config_path).exists() {
        config::load(&config_path)?
    } else {
        warn!(path = %config_path, "no config file, using built-in defaults");
        Config::default()
    };
    config::apply(&cfg, &db).await?;

    // The store is the source of truth for pins once seeded.
    let actuators = db.load_actuators().await?;
    if actuators.is_empty() {
        warn!("no actuators in the database");
    }
    info!(actuators = actuators.len(), "db ready");

    // ── Relay board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let mut board = RelayBoard::new(&relay::pin_map(&actuators), active_low)?;
    board.all_off();
    let relays = Arc::new(Mutex::new(board));

    // ── Shared state + control core ─────────────────────────────────
    let shared = SystemState::shared();
    shared.write().await.record_system("hub started".to_string());

    let events = Broadcaster::new();
    // Subscribe before any task can publish.
    let event_rx = events.subscribe();

    let arbiter = Arc::new(Arbiter::new(
        db.clone(),
        events.clone(),
        &cfg.interlock.irrigation_pump,
        cfg.seed(),
    ));
    let released = arbiter.recover_interlock().await;
    if released > 0 {
        warn!(released, "recovered irrigation pump left blocked by a previous run");
    }

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&arbiter),
        shared.clone(),
        cfg.schedule.utc_offset_minutes,
    ));
    let rules = Arc::new(RuleEngine::new(Arc::clone(&arbiter), shared.clone()));
    let sequencer = Arc::new(Sequencer::new(Arc::clone(&arbiter), shared.clone()));
    let checkpoint = CheckpointFile::new(checkpoint_path);
    info!(path = %checkpoint.path().display(), "auto-dosing checkpoint");
    let doser = Arc::new(AutoDoser::new(
        Arc::clone(&arbiter),
        shared.clone(),
        cfg.dosing.clone(),
        checkpoint,
    ));

    match doser.restore(clock::now()).await {
        Ok(true) => info!("auto-dosing session restored from checkpoint"),
        Ok(false) => {}
        Err(e) => warn!("auto-dosing restore failed: {e}"),
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("hydro-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 64);

    // ── Background tasks ────────────────────────────────────────────
    tokio::spawn(scheduler::run(Arc::clone(&scheduler)));
    tokio::spawn(scheduler::run_countdown(scheduler));
    tokio::spawn(rules::run(Arc::clone(&rules)));
    tokio::spawn(dosing::run(Arc::clone(&doser)));
    tokio::spawn(forward_events(
        event_rx,
        client.clone(),
        Arc::clone(&relays),
        shared.clone(),
    ));

    let app = web::AppState {
        shared: shared.clone(),
        arbiter: Arc::clone(&arbiter),
        rules,
        sequencer: Arc::clone(&sequencer),
        doser: Arc::clone(&doser),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app).await {
            error!("web: {e:#}");
        }
    });

    let hub = Hub {
        db,
        shared: shared.clone(),
        arbiter,
        relays: Arc::clone(&relays),
    };

    tokio::select! {
        _ = mqtt_loop(&hub, &client, &mut eventloop) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for shutdown signal: {e}");
            }
        }
    }

    info!("shutting down");
    doser.stop().await;
    sequencer.stop().await;
    relays.lock().await.all_off();
    Ok(())
}

// ---------------------------------------------------------------------------
// Event fan-out: relays, MQTT, event ring
// ---------------------------------------------------------------------------

async fn forward_events(
    mut rx: broadcast::Receiver<events::Event>,
    client: AsyncClient,
    relays: Arc<Mutex<RelayBoard>>,
    shared: SharedState,
) {
    // Countdown rebroadcasts repeat the same status every second; the ring
    // only records transitions.
    let mut last_status: HashMap<String, Status> = HashMap::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "events: forwarder lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        relays.lock().await.apply(&event);

        if let events::Event::ActuatorUpdate(update) = &event {
            let a = &update.actuator;
            if last_status.insert(a.id.clone(), a.status) != Some(a.status) {
                shared
                    .write()
                    .await
                    .record_actuator(format!("{} -> {:?}", a.id, a.status));
            }
        }

        match mqtt::event_payload(&event) {
            Ok(payload) => {
                // Never block relay updates on a stalled broker connection.
                if let Err(e) = client.try_publish(EVENTS_TOPIC, QoS::AtMostOnce, false, payload) {
                    warn!("events: publish failed: {e}");
                }
            }
            Err(e) => error!("events: encode failed: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// MQTT loop
// ---------------------------------------------------------------------------

async fn mqtt_loop(hub: &Hub, client: &AsyncClient, eventloop: &mut EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::Publish(p))) => {
                handle_publish(hub, &p.topic, &p.payload).await;
            }
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // Clean sessions drop subscriptions on reconnect.
                for topic in [READING_TOPICS, COMMAND_TOPICS] {
                    if let Err(e) = client.try_subscribe(topic, QoS::AtLeastOnce) {
                        error!(%topic, "mqtt subscribe failed: {e}");
                    }
                }
                let mut st = hub.shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(MqttEvent::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = hub.shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                // Fail-safe: drop every output while comms are down.
                hub.relays.lock().await.all_off();

                let mut st = hub.shared.write().await;
                st.mqtt_connected = false;
                st.record_error(format!("mqtt error: {e}"));
                drop(st);

                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

async fn handle_publish(hub: &Hub, topic: &str, payload: &[u8]) {
    if let Some(node_id) = extract_node_id(topic) {
        let snapshot = serde_json::from_slice::<ReadingMsg>(payload)
            .map_err(|e| format!("bad telemetry json: {e}"))
            .and_then(|msg| msg.into_snapshot(node_id));
        match snapshot {
            Ok(snap) => {
                info!(node = %node_id, channels = snap.readings.len(), "telemetry");
                if let Err(e) = hub.db.insert_reading(&snap).await {
                    error!(node = %node_id, "db: insert_reading failed: {e}");
                }
                hub.shared.write().await.record_reading(snap);
            }
            Err(msg) => {
                warn!(%topic, "{msg}");
                hub.shared.write().await.record_error(msg);
            }
        }
    } else if let Some(id) = extract_actuator_id(topic) {
        let status = match parse_command(payload) {
            Ok(status) => status,
            Err(msg) => {
                warn!("{msg} (use ON/OFF/PAUSE)");
                hub.shared.write().await.record_error(msg);
                return;
            }
        };
        match hub.arbiter.set_status(id, StatusUpdate::to(status)).await {
            Ok(outcome) if outcome.is_vetoed() => {
                warn!(actuator = %id, "command vetoed by pump interlock");
                hub.shared
                    .write()
                    .await
                    .record_actuator(format!("{id}: activation blocked during fertilizer dosing"));
            }
            Ok(outcome) => {
                info!(actuator = %id, status = ?outcome.actuator().status, "mqtt command applied");
            }
            Err(e) => {
                warn!(actuator = %id, "command failed: {e}");
                hub.shared.write().await.record_error(format!("{id}: {e}"));
            }
        }
    } else {
        warn!(%topic, "unhandled topic");
    }
}

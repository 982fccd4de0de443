//! The `watch` event loop: owns the engine, the socket task, HTTP calls and
//! timers, and feeds everything into the engine from one task.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use callwatch_core::{
    Command, Dial, MonitorConfig, MonitorEngine, ReconnectPlan, Resolution, SnapshotOutcome,
};
use callwatch_protocol::OperatorStatusResponse;

use crate::api::ApiClient;
use crate::commands::{parse_command, OperatorCommand, HELP};
use crate::render;
use crate::socket::{spawn_link, SocketEvent};

const SOCKET_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

enum ApiOutcome {
    Snapshot(SnapshotOutcome),
    StatusFetched {
        round_trip: u64,
        result: std::result::Result<OperatorStatusResponse, String>,
    },
    StatusUpdated(std::result::Result<OperatorStatusResponse, String>),
}

struct Session {
    engine: MonitorEngine,
    api: ApiClient,
    socket_url: String,
    socket_events: mpsc::UnboundedSender<SocketEvent>,
    api_outcomes: mpsc::UnboundedSender<ApiOutcome>,
    reconnects: mpsc::UnboundedSender<u64>,
    socket_task: Option<JoinHandle<()>>,
    snapshot_in_flight: bool,
}

pub async fn watch(config: MonitorConfig, token: String) -> Result<()> {
    let api = ApiClient::new(&config, &token)?;
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
    let (api_tx, mut api_rx) = mpsc::unbounded_channel();
    let (reconnect_tx, mut reconnect_rx) = mpsc::unbounded_channel();

    let mut session = Session {
        engine: MonitorEngine::new(&config),
        api,
        socket_url: config.socket_url.clone(),
        socket_events: socket_tx,
        api_outcomes: api_tx,
        reconnects: reconnect_tx,
        socket_task: None,
        snapshot_in_flight: false,
    };

    let dial = session.engine.connect(&token)?;
    session.dial(dial);
    session.engine.refresh_availability();

    let mut poll = interval(config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut liveness = interval(config.liveness_sample_interval());
    liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!(socket_url = %config.socket_url, api = %config.api_base_url, "Watching calls");
    println!("type 'help' for commands");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = poll.tick() => session.engine.poll_due(),
            _ = liveness.tick() => {
                session.engine.sample_liveness();
            }
            Some(event) = socket_rx.recv() => session.on_socket_event(event),
            Some(generation) = reconnect_rx.recv() => {
                if let Some(dial) = session.engine.reconnect_due(generation) {
                    session.dial(dial);
                }
            }
            Some(outcome) = api_rx.recv() => session.on_api_outcome(outcome),
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !session.on_input(&line) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, continuing without operator input");
                    stdin_open = false;
                }
                Err(err) => {
                    warn!(error = %err, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
        session.flush();
    }

    session.shutdown().await;
    Ok(())
}

impl Session {
    fn dial(&mut self, dial: Dial) {
        self.socket_task = Some(spawn_link(
            self.socket_url.clone(),
            dial,
            self.socket_events.clone(),
        ));
    }

    fn schedule_reconnect(&self, plan: ReconnectPlan) {
        debug!(generation = plan.generation, delay_ms = plan.delay.as_millis() as u64, "Reconnect scheduled");
        let reconnects = self.reconnects.clone();
        tokio::spawn(async move {
            tokio::time::sleep(plan.delay).await;
            let _ = reconnects.send(plan.generation);
        });
    }

    fn on_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Opened { generation, sink } => {
                if !self.engine.connection_opened(generation, Box::new(sink)) {
                    debug!(generation, "Ignoring stale socket open");
                }
            }
            SocketEvent::DialFailed { generation, reason } => {
                if let Some(plan) = self.engine.dial_failed(generation, &reason) {
                    self.schedule_reconnect(plan);
                }
            }
            SocketEvent::Frame { generation, text } => {
                if generation == self.engine.connection_generation() {
                    self.engine.handle_frame(&text);
                }
            }
            SocketEvent::Closed { generation, reason } => {
                if let Some(plan) = self.engine.connection_closed(generation, &reason) {
                    self.schedule_reconnect(plan);
                }
            }
        }
    }

    fn on_api_outcome(&mut self, outcome: ApiOutcome) {
        match outcome {
            ApiOutcome::Snapshot(outcome) => {
                self.snapshot_in_flight = false;
                self.engine.submit_snapshot(outcome);
            }
            ApiOutcome::StatusFetched { round_trip, result } => match result {
                Ok(response) => {
                    if self.engine.availability_fetched(round_trip, response) {
                        println!("{}", render::render_availability(self.engine.availability()));
                    }
                }
                Err(reason) => warn!(reason = %reason, "Operator status refresh failed"),
            },
            ApiOutcome::StatusUpdated(result) => match result {
                Ok(response) => {
                    self.engine.availability_updated(response);
                    println!("{}", render::render_availability(self.engine.availability()));
                }
                Err(reason) => {
                    let err = self.engine.availability_failed(reason);
                    println!("! {}", err);
                }
            },
        }
    }

    /// Returns `false` when the operator asked to leave.
    fn on_input(&mut self, line: &str) -> bool {
        let command = match parse_command(line) {
            Ok(Some(command)) => command,
            Ok(None) => return true,
            Err(message) => {
                println!("{}", message);
                return true;
            }
        };

        let now = Utc::now();
        match command {
            OperatorCommand::Calls => println!("{}", render::render_calls(&self.engine, now)),
            OperatorCommand::Queue => println!("{}", render::render_queue(&self.engine, now)),
            OperatorCommand::Inspect(call_id) => {
                let result = self.engine.inspect(&call_id, |event| {
                    if let Some(line) = render::render_inspected_event(event) {
                        println!("{}", line);
                    }
                });
                match result {
                    Ok(()) => match self.engine.transcript(&call_id) {
                        Some(transcript) => {
                            println!("{}", render::render_transcript(&call_id, transcript))
                        }
                        None => println!("following {}", call_id),
                    },
                    Err(err) => println!("! {}", err),
                }
            }
            OperatorCommand::Close => {
                if self.engine.close_inspection().is_none() {
                    println!("not following any call");
                }
            }
            OperatorCommand::Resolve {
                call_id,
                category,
                answer,
            } => {
                let mut resolution = Resolution::answer(answer);
                if let Some(category) = category {
                    resolution = resolution.saved_as(category);
                }
                if let Err(err) = self.engine.resolve_escalation(&call_id, resolution) {
                    println!("! {}", err);
                }
            }
            OperatorCommand::Status { status, message } => {
                if let Err(err) = self.engine.set_availability(status, message) {
                    println!("! {}", err);
                }
            }
            OperatorCommand::Help => println!("{}", HELP),
            OperatorCommand::Quit => return false,
        }
        true
    }

    /// Runs queued commands and prints queued notifications.
    fn flush(&mut self) {
        for command in self.engine.take_commands() {
            self.execute(command);
        }
        for notification in self.engine.take_notifications() {
            if let Some(line) = render::render_notification(&notification) {
                println!("{}", line);
            }
        }
    }

    fn execute(&mut self, command: Command) {
        let api = self.api.clone();
        let outcomes = self.api_outcomes.clone();
        match command {
            Command::FetchSnapshot { owner_key, delay } => {
                if delay.is_zero() && self.snapshot_in_flight {
                    debug!("Snapshot fetch already in flight, skipping poll");
                    return;
                }
                self.snapshot_in_flight = true;
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let outcome = api.fetch_active_calls(&owner_key).await;
                    let _ = outcomes.send(ApiOutcome::Snapshot(outcome));
                });
            }
            Command::FetchAvailability { round_trip } => {
                tokio::spawn(async move {
                    let result = api.fetch_status().await.map_err(|err| format!("{:#}", err));
                    let _ = outcomes.send(ApiOutcome::StatusFetched { round_trip, result });
                });
            }
            Command::UpdateAvailability(update) => {
                tokio::spawn(async move {
                    let result = api
                        .update_status(&update)
                        .await
                        .map_err(|err| format!("{:#}", err));
                    let _ = outcomes.send(ApiOutcome::StatusUpdated(result));
                });
            }
        }
    }

    async fn shutdown(mut self) {
        self.engine.teardown();
        for notification in self.engine.take_notifications() {
            debug!(?notification, "Dropped notification at shutdown");
        }
        // The sink was dropped by teardown; the task flushes queued
        // unsubscribes before closing.
        if let Some(task) = self.socket_task.take() {
            if tokio::time::timeout(SOCKET_DRAIN_TIMEOUT, task).await.is_err() {
                warn!("Socket task did not finish in time");
            }
        }
    }
}

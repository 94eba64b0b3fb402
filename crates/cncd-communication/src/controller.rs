//! Per-connection controller
//!
//! One controller owns one open transport and everything that contends
//! for it: the Sender streaming a loaded program, the Feeder injecting
//! ad-hoc lines, the Workflow lifecycle FSM, and the firmware dialect
//! parsing replies. All mutable state lives inside a single tokio task;
//! clients talk to it through a [`ControllerHandle`] and receive state
//! multicasts on their subscription channel. Requests, transport events,
//! and the 250 ms periodic tick are serialized by one `select!` loop, so
//! no line is ever interleaved mid-transmission and inbound events are
//! handled in wire order.

use crate::event_trigger::{EventTrigger, SystemAction};
use crate::events::Push;
use crate::feeder::Feeder;
use crate::firmware::{
    self, ControllerKind, Dialect, OpenStep, OverrideTarget, RunnerEvent, WireCommand,
};
use crate::sender::{Sender, SenderOutput};
use crate::transport::{self, ConnectionOptions, LineBuffer, Transport, TransportEvent};
use crate::workflow::{Workflow, WorkflowState};
use cncd_core::{Context, Error, EventHook, HoldReason, MacroDef, Result, WriteSource};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

const TICK_INTERVAL: Duration = Duration::from_millis(250);
const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const PARSER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const PARSER_QUERY_THROTTLE: Duration = Duration::from_millis(500);
const FINISH_IDLE_WINDOW: Duration = Duration::from_millis(500);
const FORCE_STOP_WAIT: Duration = Duration::from_millis(500);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Services and configuration a controller is spawned with.
#[derive(Debug, Default)]
pub struct ControllerDeps {
    /// User macros resolvable by `macro:run` / `macro:load`
    pub macros: Vec<MacroDef>,
    /// Configured event hooks
    pub hooks: Vec<EventHook>,
    /// Root directory for `watchdir:load`
    pub watch_root: Option<PathBuf>,
    /// Keep streaming through firmware errors
    pub ignore_errors: bool,
    /// Sink for `system` event hooks
    pub system_tx: Option<mpsc::UnboundedSender<SystemAction>>,
    /// Notified with the ident when the controller tears down
    pub closed_tx: Option<mpsc::UnboundedSender<String>>,
}

/// Requests accepted by a controller task.
#[derive(Debug)]
pub enum Request {
    /// Named command from the dispatch table
    Command {
        /// Command name (`gcode`, `sender:start`, ...)
        name: String,
        /// JSON arguments
        args: Vec<Value>,
        /// Completion callback
        reply: oneshot::Sender<Result<Value>>,
    },
    /// Raw write, passed through as-is
    Write {
        /// Data to write
        data: String,
        /// Originating writer
        source: WriteSource,
    },
    /// Line write; LF appended unless the data is a realtime byte
    Writeln {
        /// Data to write
        data: String,
        /// Originating writer
        source: WriteSource,
    },
    /// Attach a subscriber and replay current state to it
    AddSocket {
        /// Session id
        id: Uuid,
        /// Event sink
        tx: mpsc::UnboundedSender<Push>,
    },
    /// Detach a subscriber
    RemoveSocket {
        /// Session id
        id: Uuid,
    },
    /// Close the connection and tear down
    Close {
        /// Completion callback
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable handle to a running controller task.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    /// Canonical connection ident
    pub ident: String,
    /// Firmware kind
    pub kind: ControllerKind,
    tx: mpsc::Sender<Request>,
}

impl ControllerHandle {
    /// Dispatch a named command
    pub async fn command(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command {
                name: name.to_string(),
                args,
                reply,
            })
            .await
            .map_err(|_| Error::transport("controller is gone"))?;
        rx.await.map_err(|_| Error::transport("controller is gone"))?
    }

    /// Raw write
    pub async fn write(&self, data: &str, source: WriteSource) -> Result<()> {
        self.tx
            .send(Request::Write {
                data: data.to_string(),
                source,
            })
            .await
            .map_err(|_| Error::transport("controller is gone"))
    }

    /// Line write
    pub async fn writeln(&self, data: &str, source: WriteSource) -> Result<()> {
        self.tx
            .send(Request::Writeln {
                data: data.to_string(),
                source,
            })
            .await
            .map_err(|_| Error::transport("controller is gone"))
    }

    /// Attach a subscriber; current state is replayed to it in order
    pub async fn add_socket(&self, id: Uuid, tx: mpsc::UnboundedSender<Push>) -> Result<()> {
        self.tx
            .send(Request::AddSocket { id, tx })
            .await
            .map_err(|_| Error::transport("controller is gone"))
    }

    /// Detach a subscriber
    pub async fn remove_socket(&self, id: Uuid) -> Result<()> {
        self.tx
            .send(Request::RemoveSocket { id })
            .await
            .map_err(|_| Error::transport("controller is gone"))
    }

    /// Close the connection
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Request::Close { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Whether the controller task has exited
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-query de-duplication state: a query is either idle or pending
/// since some instant; a reply or a timeout returns it to idle.
#[derive(Debug, Default)]
struct QueryTracker {
    status_pending: Option<Instant>,
    parser_pending: Option<Instant>,
    last_parser_query: Option<Instant>,
}

/// The per-connection state machine.
pub struct Controller {
    ident: String,
    kind: ControllerKind,
    options: ConnectionOptions,
    dialect: Box<dyn Dialect>,
    transport: Box<dyn Transport>,
    feeder: Feeder,
    sender: Sender,
    workflow: Workflow,
    trigger: EventTrigger,
    subscribers: HashMap<Uuid, mpsc::UnboundedSender<Push>>,

    ready: bool,
    initialized: bool,
    queries: QueryTracker,
    reply_status_report: bool,
    reply_parser_state: bool,
    swallow_next_ok: bool,
    position_query_source: Option<WriteSource>,
    feeder_in_flight: bool,
    idle_since: Option<Instant>,
    pending_force_stop: Option<Instant>,

    last_feeder_status: Option<Value>,
    last_sender_status: Option<Value>,
    last_settings: Option<Value>,
    last_state: Option<Value>,

    macros: Vec<MacroDef>,
    watch_root: Option<PathBuf>,
    ignore_errors: bool,
    closed_tx: Option<mpsc::UnboundedSender<String>>,
}

impl Controller {
    /// Open a transport for `options` and spawn the controller task.
    pub async fn spawn(
        kind: ControllerKind,
        options: ConnectionOptions,
        deps: ControllerDeps,
    ) -> Result<ControllerHandle> {
        let (transport, events) = transport::open(&options).await?;
        Ok(Self::spawn_with_transport(kind, options, transport, events, deps))
    }

    /// Spawn the controller task over an already-open transport.
    pub fn spawn_with_transport(
        kind: ControllerKind,
        options: ConnectionOptions,
        transport: Box<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        deps: ControllerDeps,
    ) -> ControllerHandle {
        let ident = options.ident();
        let dialect = firmware::make_dialect(kind);
        let sender = Sender::new(dialect.streaming_mode());
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);

        let controller = Controller {
            ident: ident.clone(),
            kind,
            options,
            dialect,
            transport,
            feeder: Feeder::new(),
            sender,
            workflow: Workflow::new(),
            trigger: EventTrigger::new(deps.hooks, deps.system_tx),
            subscribers: HashMap::new(),
            ready: false,
            initialized: false,
            queries: QueryTracker::default(),
            reply_status_report: false,
            reply_parser_state: false,
            swallow_next_ok: false,
            position_query_source: None,
            feeder_in_flight: false,
            idle_since: None,
            pending_force_stop: None,
            last_feeder_status: None,
            last_sender_status: None,
            last_settings: None,
            last_state: None,
            macros: deps.macros,
            watch_root: deps.watch_root,
            ignore_errors: deps.ignore_errors,
            closed_tx: deps.closed_tx,
        };

        tokio::spawn(controller.run(rx, transport_events));

        ControllerHandle { ident, kind, tx }
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
    ) {
        tracing::info!(ident = %self.ident, kind = %self.kind, "controller started");

        // Firmware readiness handshake
        for step in self.dialect.open_sequence() {
            match step {
                OpenStep::Delay(d) => tokio::time::sleep(d).await,
                OpenStep::Send(cmd) => self.write_wire(&cmd).await,
            }
        }

        let mut linebuf = LineBuffer::new();
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                req = requests.recv() => match req {
                    Some(Request::Close { reply }) => {
                        self.teardown(None).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(req) => self.handle_request(req).await,
                    None => {
                        self.teardown(None).await;
                        break;
                    }
                },
                ev = transport_events.recv() => match ev {
                    Some(TransportEvent::Data(bytes)) => {
                        for line in linebuf.push(&bytes) {
                            self.handle_line(&line).await;
                        }
                    }
                    Some(TransportEvent::Closed(err)) => {
                        self.teardown(err).await;
                        break;
                    }
                    None => {
                        self.teardown(None).await;
                        break;
                    }
                },
                _ = tick.tick() => self.on_tick().await,
            }
        }

        tracing::info!(ident = %self.ident, "controller stopped");
    }

    async fn teardown(&mut self, err: Option<Error>) {
        if let Some(err) = &err {
            tracing::warn!(ident = %self.ident, %err, "connection lost");
            self.push("connection:error", json!({ "ident": self.ident, "error": err.to_string() }));
        }
        self.ready = false;
        self.push("connection:close", json!({ "ident": self.ident }));
        self.fire_event("connection:close").await;
        self.transport.close().await;
        if let Some(tx) = &self.closed_tx {
            let _ = tx.send(self.ident.clone());
        }
    }

    // ------------------------------------------------------------------
    // Multicast
    // ------------------------------------------------------------------

    fn push(&mut self, event: &str, payload: Value) {
        let push = Push::new(event, payload);
        self.subscribers.retain(|_, tx| tx.send(push.clone()).is_ok());
    }

    fn workflow_payload(&self) -> Value {
        json!({
            "state": self.workflow.state(),
            "reason": self.workflow.pause_reason(),
        })
    }

    fn replay(&mut self, id: Uuid) {
        let Some(tx) = self.subscribers.get(&id).cloned() else {
            return;
        };
        let mut send = |event: &str, payload: Value| {
            let _ = tx.send(Push::new(event, payload));
        };
        send("controller:type", json!(self.kind.as_str()));
        send(
            "connection:open",
            json!({ "ident": self.ident, "options": self.options }),
        );
        send("controller:settings", self.dialect.settings_snapshot());
        send("controller:state", self.dialect.state_snapshot());
        send("feeder:status", json!(self.feeder.status()));
        send("sender:status", json!(self.sender.status()));
        if self.sender.is_loaded() {
            send("sender:load", json!(self.sender.status()));
        }
        send("workflow:state", self.workflow_payload());
    }

    // ------------------------------------------------------------------
    // Wire
    // ------------------------------------------------------------------

    async fn write_wire(&mut self, cmd: &WireCommand) {
        let bytes = match cmd {
            WireCommand::Raw(bytes) => bytes.clone(),
            WireCommand::Line(line) => {
                let filtered = self.dialect.filter_outgoing(line);
                let mut bytes = filtered.into_bytes();
                bytes.push(b'\n');
                bytes
            }
        };
        if let Err(err) = self.transport.write(&bytes).await {
            // Transient failures are tolerated; a dead link surfaces as a
            // transport Closed event
            tracing::warn!(ident = %self.ident, %err, "wire write failed");
        }
    }

    async fn writeln_wire(&mut self, line: &str) {
        self.write_wire(&WireCommand::Line(line.to_string())).await;
    }

    async fn write_direct(&mut self, data: &str, source: WriteSource, append_lf: bool) {
        match data.trim() {
            "?" => self.reply_status_report = true,
            "$G" => self.reply_parser_state = true,
            "M114" => {
                self.reply_status_report = true;
                self.position_query_source = Some(source);
            }
            "M105" => self.reply_parser_state = true,
            _ => {}
        }

        if append_lf && !self.dialect.is_realtime_command(data) {
            self.writeln_wire(data).await;
        } else {
            let bytes = data.as_bytes().to_vec();
            self.write_wire(&WireCommand::Raw(bytes)).await;
        }

        if source == WriteSource::Client {
            self.push(
                "connection:write",
                json!({ "data": data, "context": { "source": source } }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Feeder / Sender driving
    // ------------------------------------------------------------------

    async fn feeder_next(&mut self) {
        if self.feeder_in_flight {
            return;
        }
        match self.feeder.next() {
            Ok(Some(data)) => {
                self.writeln_wire(&data.line).await;
                self.feeder_in_flight = true;
                self.push(
                    "connection:write",
                    json!({ "data": data.line, "context": { "source": WriteSource::Feeder } }),
                );
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(ident = %self.ident, %err, "feeder line rejected");
                self.push("connection:error", json!({ "error": err.to_string() }));
            }
        }
    }

    async fn drain_sender(&mut self) {
        if self.workflow.state() != WorkflowState::Running {
            return;
        }
        let outputs = match self.sender.next() {
            Ok(outputs) => outputs,
            Err(err) => {
                tracing::warn!(ident = %self.ident, %err, "program line rejected");
                self.workflow_pause(Some(HoldReason::Error(err.to_string())));
                return;
            }
        };
        for output in outputs {
            match output {
                SenderOutput::Data(line) => self.writeln_wire(&line).await,
                SenderOutput::Pause(reason) => self.workflow_pause(Some(reason)),
            }
        }
    }

    fn workflow_start(&mut self) {
        if self.workflow.start() {
            self.sender.rewind();
            let payload = self.workflow_payload();
            self.push("workflow:state", payload);
        }
    }

    fn workflow_stop(&mut self) {
        if self.workflow.stop() {
            self.sender.rewind();
            let payload = self.workflow_payload();
            self.push("workflow:state", payload);
        }
    }

    fn workflow_pause(&mut self, reason: Option<HoldReason>) {
        if self.workflow.pause(reason.clone()) {
            self.sender.hold(reason);
            let payload = self.workflow_payload();
            self.push("workflow:state", payload);
        }
    }

    async fn workflow_resume(&mut self) {
        if self.workflow.resume() {
            self.feeder.reset();
            self.sender.unhold();
            let payload = self.workflow_payload();
            self.push("workflow:state", payload);
            self.drain_sender().await;
        }
    }

    async fn fire_event(&mut self, event: &str) {
        let lines = self.trigger.trigger(event);
        if !lines.is_empty() {
            self.feeder.feed(&lines, Context::new());
            if self.workflow.state() != WorkflowState::Running {
                self.feeder_next().await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound lines
    // ------------------------------------------------------------------

    async fn handle_line(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let event = self.dialect.parse_line(line);
        tracing::debug!(ident = %self.ident, line, ?event, "rx");

        if self.dialect.is_ready_event(&event) {
            self.on_ready().await;
        }

        match event {
            RunnerEvent::Ok => self.on_ack(line).await,
            RunnerEvent::Error { message, raw, .. } => {
                self.on_protocol_error(&raw, &message).await;
            }
            RunnerEvent::Alarm { message, raw, .. } => {
                let text = decorate_protocol_error(&raw, &message);
                self.push("connection:read", json!({ "raw": text }));
                if self.workflow.state() == WorkflowState::Running && !self.ignore_errors {
                    self.workflow_pause(Some(HoldReason::Error(text)));
                }
            }
            RunnerEvent::Status(_) => {
                self.queries.status_pending = None;
                self.track_idle();
                if self.reply_status_report {
                    self.reply_status_report = false;
                    self.push("connection:read", json!({ "raw": line }));
                }
            }
            RunnerEvent::ParserState(_) => {
                self.queries.parser_pending = None;
                if self.reply_parser_state {
                    self.reply_parser_state = false;
                    self.push("connection:read", json!({ "raw": line }));
                }
            }
            RunnerEvent::Setting { .. } => {
                self.push("connection:read", json!({ "raw": line }));
            }
            RunnerEvent::Startup { .. } => {
                self.push("connection:read", json!({ "raw": line }));
                // A board that re-announces after boot gets re-queried
                if self.ready {
                    let requery = self.dialect.startup_requery_commands();
                    for cmd in requery {
                        self.writeln_wire(&cmd).await;
                    }
                }
            }
            RunnerEvent::QueueReport { qr, .. } => {
                self.sender.update_queue_slots(qr as usize);
                self.drain_sender().await;
            }
            RunnerEvent::Rx { .. } => {}
            RunnerEvent::Firmware { .. } => {
                self.push("connection:read", json!({ "raw": line }));
            }
            RunnerEvent::Position(_) => {
                self.queries.status_pending = None;
                // The trailing ok belongs to the M114 query, not a
                // program line
                self.swallow_next_ok = true;
                if matches!(
                    self.position_query_source.take(),
                    Some(WriteSource::Client) | Some(WriteSource::Feeder)
                ) {
                    self.push("connection:read", json!({ "raw": line }));
                }
            }
            RunnerEvent::Temperature(report) => {
                if report.ok {
                    if self.queries.parser_pending.is_some() {
                        self.queries.parser_pending = None;
                        if self.reply_parser_state {
                            self.reply_parser_state = false;
                            self.push("connection:read", json!({ "raw": line }));
                        }
                    } else {
                        // An `ok T:` produced by a program-embedded M105
                        self.on_ack(line).await;
                    }
                }
            }
            RunnerEvent::Echo { raw } => {
                self.push("connection:read", json!({ "raw": raw }));
            }
            RunnerEvent::Other { raw } => {
                self.push("connection:read", json!({ "raw": raw }));
            }
        }
    }

    async fn on_ready(&mut self) {
        self.ready = true;
        self.push("controller:ready", json!({ "ident": self.ident }));
        self.fire_event("controller:ready").await;
        if !self.initialized {
            self.initialized = true;
            for cmd in self.dialect.init_commands() {
                self.writeln_wire(&cmd).await;
            }
        }
    }

    /// Ack correlation: during Running an `ok` credits the Sender;
    /// during Paused it drains outstanding lines without emitting; any
    /// other `ok` is echoed and drives the Feeder.
    async fn on_ack(&mut self, raw: &str) {
        if self.swallow_next_ok {
            self.swallow_next_ok = false;
            return;
        }
        match self.workflow.state() {
            WorkflowState::Running => {
                if self.sender.held() && self.sender.received() + 1 >= self.sender.sent() {
                    self.sender.unhold();
                }
                self.sender.ack();
                self.drain_sender().await;
            }
            WorkflowState::Paused if self.sender.received() < self.sender.sent() => {
                self.sender.ack();
                // Held: drains the outstanding count without emitting
                self.drain_sender().await;
            }
            _ => {
                self.push("connection:read", json!({ "raw": raw }));
                self.feeder_in_flight = false;
                self.feeder_next().await;
            }
        }
    }

    async fn on_protocol_error(&mut self, raw: &str, message: &str) {
        let text = decorate_protocol_error(raw, message);
        self.push("connection:read", json!({ "raw": text }));
        if self.workflow.state() == WorkflowState::Running {
            if !self.ignore_errors {
                self.workflow_pause(Some(HoldReason::Error(text)));
            }
            // The error consumed a line slot
            self.sender.ack();
            self.drain_sender().await;
        } else {
            self.feeder_in_flight = false;
            self.feeder_next().await;
        }
    }

    fn track_idle(&mut self) {
        if self.dialect.is_idle() {
            if self.idle_since.is_none() {
                self.idle_since = Some(Instant::now());
            }
        } else {
            self.idle_since = None;
        }
    }

    // ------------------------------------------------------------------
    // Periodic tick
    // ------------------------------------------------------------------

    async fn on_tick(&mut self) {
        // State multicasts, by identity compare
        let feeder_status = json!(self.feeder.status());
        if self.last_feeder_status.as_ref() != Some(&feeder_status) {
            self.last_feeder_status = Some(feeder_status.clone());
            self.push("feeder:status", feeder_status);
        }

        let sender_status = json!(self.sender.status());
        if self.last_sender_status.as_ref() != Some(&sender_status) {
            self.last_sender_status = Some(sender_status.clone());
            self.push("sender:status", sender_status);
        }

        let settings = self.dialect.settings_snapshot();
        if self.last_settings.as_ref() != Some(&settings) {
            self.last_settings = Some(settings.clone());
            let alias = format!("{}:settings", self.kind.as_str());
            self.push("controller:settings", settings.clone());
            self.push(&alias, settings);
        }

        let state = self.dialect.state_snapshot();
        if self.last_state.as_ref() != Some(&state) {
            self.last_state = Some(state.clone());
            let alias = format!("{}:state", self.kind.as_str());
            self.push("controller:state", state.clone());
            self.push(&alias, state);
        }

        // Firmware queries, one outstanding per kind
        if self.ready {
            self.drive_queries().await;
        }

        // Deferred force-stop decision
        if let Some(since) = self.pending_force_stop {
            if since.elapsed() >= FORCE_STOP_WAIT {
                self.pending_force_stop = None;
                if self.dialect.is_hold() {
                    for cmd in self.dialect.reset_commands() {
                        self.write_wire(&cmd).await;
                    }
                }
            }
        }

        // Post-program idle detector
        if self.workflow.state() == WorkflowState::Running && self.sender.finished() {
            let finished_long_enough = self
                .sender
                .finished_at()
                .is_some_and(|t| t.elapsed() >= FINISH_IDLE_WINDOW);
            let idle_long_enough = self.dialect.is_idle()
                && self
                    .idle_since
                    .map_or(self.kind == ControllerKind::Marlin, |t| {
                        t.elapsed() >= FINISH_IDLE_WINDOW
                    });
            if finished_long_enough && idle_long_enough {
                self.command_sender_stop(false).await;
            }
        }
    }

    async fn drive_queries(&mut self) {
        let now = Instant::now();

        match self.queries.status_pending {
            None => {
                if let Some(query) = self.dialect.status_query() {
                    self.write_wire(&query).await;
                    self.queries.status_pending = Some(now);
                }
            }
            Some(since) if now.duration_since(since) > STATUS_QUERY_TIMEOUT => {
                tracing::warn!(ident = %self.ident, "status query timed out");
                self.queries.status_pending = None;
            }
            Some(_) => {}
        }

        if self.workflow.state() == WorkflowState::Idle {
            let throttled = self
                .queries
                .last_parser_query
                .is_some_and(|t| now.duration_since(t) < PARSER_QUERY_THROTTLE);
            match self.queries.parser_pending {
                None if !throttled => {
                    if let Some(query) = self.dialect.parser_state_query() {
                        self.write_wire(&query).await;
                        self.queries.parser_pending = Some(now);
                        self.queries.last_parser_query = Some(now);
                    }
                }
                Some(since) if now.duration_since(since) > PARSER_QUERY_TIMEOUT => {
                    tracing::warn!(ident = %self.ident, "parser-state query timed out");
                    self.queries.parser_pending = None;
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Command { name, args, reply } => {
                let result = self.handle_command(&name, args).await;
                let _ = reply.send(result);
            }
            Request::Write { data, source } => {
                self.write_direct(&data, source, false).await;
            }
            Request::Writeln { data, source } => {
                self.write_direct(&data, source, true).await;
            }
            Request::AddSocket { id, tx } => {
                self.subscribers.insert(id, tx);
                self.replay(id);
            }
            Request::RemoveSocket { id } => {
                self.subscribers.remove(&id);
            }
            Request::Close { .. } => unreachable!("handled in run loop"),
        }
    }

    async fn handle_command(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        match name {
            "gcode" => {
                let lines = arg_lines(&args, 0)?;
                let context = arg_context(&args, 1);
                self.feeder.feed(&lines, context);
                if self.workflow.state() != WorkflowState::Running {
                    self.feeder_next().await;
                }
                Ok(Value::Null)
            }
            "sender:load" => {
                let name = arg_str(&args, 0)?;
                let content = arg_str(&args, 1)?;
                let context = arg_context(&args, 2);
                self.sender.load(&name, &content, context);
                self.workflow_stop();
                let status = json!(self.sender.status());
                self.push("sender:load", status.clone());
                self.fire_event("sender:load").await;
                Ok(status)
            }
            "sender:unload" => {
                self.workflow_stop();
                self.sender.unload();
                self.push("sender:unload", Value::Null);
                self.fire_event("sender:unload").await;
                Ok(Value::Null)
            }
            "sender:start" => {
                if !self.sender.is_loaded() {
                    return Err(Error::validation("no program loaded"));
                }
                self.fire_event("sender:start").await;
                self.workflow_start();
                self.feeder.reset();
                self.drain_sender().await;
                Ok(Value::Null)
            }
            "sender:stop" => {
                let force = args
                    .first()
                    .and_then(|v| v.get("force"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.command_sender_stop(force).await;
                Ok(Value::Null)
            }
            "sender:pause" => {
                self.fire_event("sender:pause").await;
                self.workflow_pause(None);
                if let Some(cmd) = self.dialect.feedhold_command() {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "sender:resume" => {
                self.fire_event("sender:resume").await;
                if let Some(cmd) = self.dialect.cyclestart_command() {
                    self.write_wire(&cmd).await;
                }
                self.workflow_resume().await;
                Ok(Value::Null)
            }
            "feedhold" => {
                self.fire_event("feedhold").await;
                if let Some(cmd) = self.dialect.feedhold_command() {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "cyclestart" => {
                self.fire_event("cyclestart").await;
                if let Some(cmd) = self.dialect.cyclestart_command() {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "feeder:start" => {
                self.feeder.unhold();
                let status = json!(self.feeder.status());
                self.push("feeder:status", status);
                self.feeder_next().await;
                Ok(Value::Null)
            }
            "feeder:stop" => {
                self.feeder.reset();
                let status = json!(self.feeder.status());
                self.push("feeder:status", status);
                Ok(Value::Null)
            }
            "homing" => {
                self.fire_event("homing").await;
                if let Some(cmd) = self.dialect.homing_command() {
                    self.writeln_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "sleep" => {
                self.fire_event("sleep").await;
                if let Some(cmd) = self.dialect.sleep_command() {
                    self.writeln_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "unlock" => {
                if let Some(cmd) = self.dialect.unlock_command() {
                    self.writeln_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "reset" => {
                self.workflow_stop();
                self.feeder.reset();
                for cmd in self.dialect.reset_commands() {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "jogCancel" => {
                if let Some(cmd) = self.dialect.jog_cancel_command() {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "override:feed" | "override:spindle" | "override:rapid" => {
                let target = match name {
                    "override:feed" => OverrideTarget::Feed,
                    "override:spindle" => OverrideTarget::Spindle,
                    _ => OverrideTarget::Rapid,
                };
                let delta = args
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| Error::validation("override delta required"))? as i32;
                for cmd in self.dialect.encode_override(target, delta) {
                    self.write_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "lasertest" => {
                let power = args.first().and_then(Value::as_f64).unwrap_or(0.0);
                let duration = args.get(1).and_then(Value::as_u64).unwrap_or(0);
                let max_s = args.get(2).and_then(Value::as_f64).unwrap_or(1000.0);
                for cmd in self.dialect.lasertest_commands(power, duration, max_s) {
                    self.writeln_wire(&cmd).await;
                }
                Ok(Value::Null)
            }
            "macro:run" => {
                let id = arg_str(&args, 0)?;
                let context = arg_context(&args, 1);
                let m = self
                    .macros
                    .iter()
                    .find(|m| m.id == id)
                    .cloned()
                    .ok_or_else(|| Error::validation(format!("macro not found: {id}")))?;
                let lines: Vec<String> = m.content.lines().map(str::to_string).collect();
                self.feeder.feed(&lines, context);
                if self.workflow.state() != WorkflowState::Running {
                    self.feeder_next().await;
                }
                self.fire_event("macro:run").await;
                Ok(Value::Null)
            }
            "macro:load" => {
                let id = arg_str(&args, 0)?;
                let context = arg_context(&args, 1);
                let m = self
                    .macros
                    .iter()
                    .find(|m| m.id == id)
                    .cloned()
                    .ok_or_else(|| Error::validation(format!("macro not found: {id}")))?;
                self.sender.load(&m.name, &m.content, context);
                self.workflow_stop();
                let status = json!(self.sender.status());
                self.push("sender:load", status.clone());
                self.fire_event("macro:load").await;
                Ok(status)
            }
            "watchdir:load" => {
                let name = arg_str(&args, 0)?;
                let root = self
                    .watch_root
                    .clone()
                    .ok_or_else(|| Error::validation("no watch directory configured"))?;
                if name.contains("..") {
                    return Err(Error::validation(format!("invalid file name: {name}")));
                }
                let path = root.join(&name);
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| Error::validation(format!("cannot read {}: {e}", path.display())))?;
                self.sender.load(&name, &content, Context::new());
                self.workflow_stop();
                let status = json!(self.sender.status());
                self.push("sender:load", status.clone());
                Ok(status)
            }
            other => Err(Error::validation(format!("unknown command: {other}"))),
        }
    }

    async fn command_sender_stop(&mut self, force: bool) {
        self.fire_event("sender:stop").await;
        let was_running = self.dialect.machine_state().starts_with("Run");
        self.workflow_stop();
        if force && was_running {
            if let Some(cmd) = self.dialect.feedhold_command() {
                self.write_wire(&cmd).await;
                // Decide on the soft reset after the machine has had time
                // to enter Hold
                self.pending_force_stop = Some(Instant::now());
            }
        }
    }
}

/// Append the decoded message to the wire line, unless the line already
/// carries it (Marlin and Smoothieware errors are self-describing).
fn decorate_protocol_error(raw: &str, message: &str) -> String {
    if message.is_empty() || raw.contains(message) {
        raw.to_string()
    } else {
        format!("{raw} ({message})")
    }
}

fn arg_str(args: &[Value], index: usize) -> Result<String> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("argument {index} must be a string")))
}

fn arg_lines(args: &[Value], index: usize) -> Result<Vec<String>> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.lines().map(str::to_string).collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| Error::validation("gcode lines must be strings"))
            })
            .collect(),
        _ => Err(Error::validation("gcode argument must be a string or array")),
    }
}

fn arg_context(args: &[Value], index: usize) -> Context {
    args.get(index)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}

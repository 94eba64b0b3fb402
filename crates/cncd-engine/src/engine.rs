//! Engine: the singleton multiplexer over all controllers
//!
//! The engine owns the global `ident → controller` registry, accepts
//! authenticated client sessions, and dispatches their per-connection
//! operations. Controllers are created on the first `open` for an ident
//! and removed when their transport closes or a client closes them;
//! sessions attach and detach independently of controller lifetime, and
//! the last subscriber leaving does NOT close a connection.

use crate::auth;
use crate::session::Session;
use cncd_communication::{
    list_ports, ConnectionOptions, Controller, ControllerDeps, ControllerHandle, ControllerKind,
    Push, SystemAction,
};
use cncd_core::{Error, Result, WriteSource};
use cncd_settings::SettingsManager;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One row of the port listing returned by `getPorts`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRecord {
    /// Device path or address
    pub path: String,
    /// Manufacturer label, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    /// Whether a controller is currently bound to this port
    pub connected: bool,
}

/// The singleton multiplexer over all controllers.
pub struct Engine {
    settings: SettingsManager,
    controllers: Arc<RwLock<HashMap<String, ControllerHandle>>>,
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    system_tx: mpsc::UnboundedSender<SystemAction>,
    closed_tx: mpsc::UnboundedSender<String>,
}

impl Engine {
    /// Create the engine and start its service tasks
    pub fn new(settings: SettingsManager) -> Arc<Self> {
        let (system_tx, system_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();

        let engine = Arc::new(Self {
            settings,
            controllers: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            system_tx,
            closed_tx,
        });

        engine.clone().spawn_reaper(closed_rx);
        engine.clone().spawn_task_runner(system_rx);
        engine.clone().spawn_config_watcher();
        engine.fire_startup_hooks();

        engine
    }

    /// `startup` hooks fire once, when the daemon comes up. Only system
    /// hooks apply here; gcode hooks need an open controller.
    fn fire_startup_hooks(&self) {
        for hook in &self.settings.get().events {
            if hook.enabled
                && hook.event == "startup"
                && hook.trigger == cncd_core::TriggerKind::System
            {
                let _ = self.system_tx.send(SystemAction {
                    event: "startup".to_string(),
                    commands: hook.commands.clone(),
                });
            }
        }
    }

    /// Remove controllers from the registry when their task tears down
    fn spawn_reaper(self: Arc<Self>, mut closed_rx: mpsc::UnboundedReceiver<String>) {
        tokio::spawn(async move {
            while let Some(ident) = closed_rx.recv().await {
                if self.controllers.write().remove(&ident).is_some() {
                    tracing::info!(%ident, "controller removed from registry");
                }
                self.broadcast(Push::new(
                    "connection:change",
                    json!({ "ident": ident, "opened": false }),
                ));
            }
        });
    }

    /// Run `system` event hooks through the shell, reporting task events
    fn spawn_task_runner(self: Arc<Self>, mut system_rx: mpsc::UnboundedReceiver<SystemAction>) {
        tokio::spawn(async move {
            while let Some(action) = system_rx.recv().await {
                let task_id = Uuid::new_v4().to_string();
                self.broadcast(Push::new(
                    "task:start",
                    json!({ "taskId": task_id, "event": action.event }),
                ));

                let engine = self.clone();
                tokio::spawn(async move {
                    let result = tokio::process::Command::new("sh")
                        .arg("-c")
                        .arg(&action.commands)
                        .output()
                        .await;
                    match result {
                        Ok(output) if output.status.success() => {
                            engine.broadcast(Push::new(
                                "task:finish",
                                json!({ "taskId": task_id, "code": output.status.code() }),
                            ));
                        }
                        Ok(output) => {
                            engine.broadcast(Push::new(
                                "task:error",
                                json!({
                                    "taskId": task_id,
                                    "code": output.status.code(),
                                    "stderr": String::from_utf8_lossy(&output.stderr),
                                }),
                            ));
                        }
                        Err(e) => {
                            engine.broadcast(Push::new(
                                "task:error",
                                json!({ "taskId": task_id, "error": e.to_string() }),
                            ));
                        }
                    }
                });
            }
        });
    }

    /// Fan out `config:change` whenever the settings are updated
    fn spawn_config_watcher(self: Arc<Self>) {
        let mut rx = self.settings.subscribe();
        tokio::spawn(async move {
            while rx.recv().await.is_ok() {
                self.broadcast(Push::new("config:change", Value::Null));
            }
        });
    }

    fn broadcast(&self, event: Push) {
        for session in self.sessions.read().values() {
            session.push(event.clone());
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Authenticate and register a client session.
    ///
    /// Returns the session id and its event receiver; the `startup` event
    /// is already queued on it.
    pub fn connect(
        &self,
        token: Option<&str>,
        remote: IpAddr,
    ) -> Result<(Uuid, mpsc::UnboundedReceiver<Push>)> {
        let config = self.settings.get();
        let claims = auth::authenticate(&config.auth, token, remote)?;

        let (session, rx) = Session::new(claims, remote);
        let id = session.id;
        session.push(Push::new(
            "startup",
            json!({
                "availableControllers": ControllerKind::ALL
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>(),
            }),
        ));
        self.sessions.write().insert(id, session);
        tracing::info!(session = %id, %remote, "session connected");
        Ok((id, rx))
    }

    /// Detach a session from every controller and drop it.
    ///
    /// Controllers stay open; subscribers attach and detach independently
    /// of controller lifetime.
    pub async fn disconnect(&self, session_id: Uuid) {
        self.sessions.write().remove(&session_id);
        let handles: Vec<ControllerHandle> =
            self.controllers.read().values().cloned().collect();
        for handle in handles {
            let _ = handle.remove_socket(session_id).await;
        }
        tracing::info!(session = %session_id, "session disconnected");
    }

    fn session_tx(&self, session_id: Uuid) -> Result<mpsc::UnboundedSender<Push>> {
        self.sessions
            .read()
            .get(&session_id)
            .map(|s| s.tx.clone())
            .ok_or_else(|| Error::validation("unknown session"))
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    /// List selectable ports: enumerated serial ports, user-configured
    /// ports, and currently-bound idents, merged
    pub fn get_ports(&self) -> Vec<PortRecord> {
        let config = self.settings.get();
        let bound: Vec<String> = self.controllers.read().keys().cloned().collect();
        let is_bound =
            |path: &str| bound.iter().any(|ident| ident.contains(&format!(":{path}")));

        let mut records: Vec<PortRecord> = Vec::new();
        if let Ok(ports) = list_ports() {
            for port in ports {
                records.push(PortRecord {
                    connected: is_bound(&port.port_name),
                    path: port.port_name,
                    manufacturer: port.manufacturer,
                });
            }
        }
        for port in &config.connection.ports {
            if records.iter().any(|r| r.path == port.path) {
                continue;
            }
            records.push(PortRecord {
                connected: is_bound(&port.path),
                path: port.path.clone(),
                manufacturer: port.manufacturer.clone(),
            });
        }
        // A bound port that fell out of enumeration (e.g. USB re-plug
        // pending) still shows, marked connected
        for ident in &bound {
            if let Some(rest) = ident.strip_prefix("serial:") {
                let path = rest.split('@').next().unwrap_or(rest);
                if !records.iter().any(|r| r.path == path) {
                    records.push(PortRecord {
                        path: path.to_string(),
                        manufacturer: None,
                        connected: true,
                    });
                }
            }
        }
        records
    }

    /// Offered baud rates, defaults merged with the user list
    pub fn get_baud_rates(&self) -> Vec<u32> {
        self.settings.get().baud_rates()
    }

    /// Open (or reuse) the controller for `options` and subscribe the
    /// session to it. Returns the connection ident.
    pub async fn open(
        &self,
        session_id: Uuid,
        controller_type: &str,
        options: ConnectionOptions,
    ) -> Result<String> {
        let kind = ControllerKind::parse(controller_type)
            .ok_or_else(|| Error::validation(format!("bad controller type: {controller_type}")))?;
        let ident = options.ident();
        let tx = self.session_tx(session_id)?;

        let existing = self.controllers.read().get(&ident).cloned();
        let handle = match existing {
            Some(handle) if !handle.is_closed() => {
                if handle.kind != kind {
                    return Err(Error::validation(format!(
                        "{ident} is already open as {}",
                        handle.kind
                    )));
                }
                handle
            }
            _ => {
                let config = self.settings.get();
                let deps = ControllerDeps {
                    macros: config.macros.clone(),
                    hooks: config.events.clone(),
                    watch_root: config.watch_directory.clone(),
                    ignore_errors: config.controller.exception.ignore_errors,
                    system_tx: Some(self.system_tx.clone()),
                    closed_tx: Some(self.closed_tx.clone()),
                };
                let handle = Controller::spawn(kind, options, deps).await?;
                self.controllers
                    .write()
                    .insert(ident.clone(), handle.clone());
                self.broadcast(Push::new(
                    "connection:change",
                    json!({ "ident": ident, "opened": true }),
                ));
                handle
            }
        };

        handle.add_socket(session_id, tx).await?;
        Ok(ident)
    }

    /// Close the controller bound to `ident`
    pub async fn close(&self, ident: &str) -> Result<()> {
        let handle = self
            .controllers
            .write()
            .remove(ident)
            .ok_or_else(|| Error::validation(format!("no connection for ident: {ident}")))?;
        handle.close().await;
        Ok(())
    }

    fn handle(&self, ident: &str) -> Result<ControllerHandle> {
        self.controllers
            .read()
            .get(ident)
            .cloned()
            .ok_or_else(|| Error::validation(format!("no connection for ident: {ident}")))
    }

    /// Dispatch a named command on a controller
    pub async fn command(&self, ident: &str, cmd: &str, args: Vec<Value>) -> Result<Value> {
        self.handle(ident)?.command(cmd, args).await
    }

    /// Raw write to a controller
    pub async fn write(&self, ident: &str, data: &str) -> Result<()> {
        self.handle(ident)?.write(data, WriteSource::Client).await
    }

    /// Line write to a controller
    pub async fn writeln(&self, ident: &str, data: &str) -> Result<()> {
        self.handle(ident)?.writeln(data, WriteSource::Client).await
    }

    /// Number of live registered controllers
    pub fn controller_count(&self) -> usize {
        self.controllers.read().len()
    }
}

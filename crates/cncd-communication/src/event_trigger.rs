//! Event triggers
//!
//! Users configure reactions to named controller events (`sender:start`,
//! `controller:ready`, `homing`, ...). A reaction either feeds G-code to
//! the controller or hands a shell command line to the engine's
//! command-runner service. The trigger itself only resolves hooks; the
//! controller feeds the G-code and the engine spawns the processes.

use cncd_core::{EventHook, TriggerKind};
use tokio::sync::mpsc;

/// A shell command requested by a `system` hook, forwarded to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemAction {
    /// The event that fired
    pub event: String,
    /// Shell command line to spawn
    pub commands: String,
}

/// Maps named events to user-configured reactions.
#[derive(Debug, Default)]
pub struct EventTrigger {
    hooks: Vec<EventHook>,
    system_tx: Option<mpsc::UnboundedSender<SystemAction>>,
}

impl EventTrigger {
    /// Create a trigger over `hooks`; `system_tx` receives shell actions
    pub fn new(
        hooks: Vec<EventHook>,
        system_tx: Option<mpsc::UnboundedSender<SystemAction>>,
    ) -> Self {
        Self { hooks, system_tx }
    }

    /// Fire `event`. Returns the G-code lines to feed; system hooks are
    /// forwarded on the channel as a side effect.
    pub fn trigger(&self, event: &str) -> Vec<String> {
        let mut gcode = Vec::new();
        for hook in self.hooks.iter().filter(|h| h.enabled && h.event == event) {
            match hook.trigger {
                TriggerKind::Gcode => {
                    gcode.extend(hook.commands.lines().map(str::to_string));
                }
                TriggerKind::System => {
                    if let Some(tx) = &self.system_tx {
                        let _ = tx.send(SystemAction {
                            event: event.to_string(),
                            commands: hook.commands.clone(),
                        });
                    } else {
                        tracing::warn!(event, "system hook fired with no command runner");
                    }
                }
            }
        }
        gcode
    }
}

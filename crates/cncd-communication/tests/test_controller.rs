//! End-to-end controller scenarios over a mock transport.
//!
//! The tokio clock is paused, so handshake delays, the 250 ms tick, and
//! the 500 ms force-stop / finish-detector windows all run deterministic.

use cncd_communication::{
    ConnectionOptions, Controller, ControllerDeps, ControllerHandle, ControllerKind, Push,
    Transport, TransportEvent,
};
use cncd_core::{Result, WriteSource};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

struct MockTransport {
    written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.written.lock().unwrap().extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) {}
}

struct Harness {
    handle: ControllerHandle,
    written: Arc<Mutex<Vec<u8>>>,
    firmware_tx: mpsc::Sender<TransportEvent>,
    events: mpsc::UnboundedReceiver<Push>,
}

impl Harness {
    /// Spawn a controller over a mock transport with a subscriber
    /// already attached (its replay is drained).
    async fn new(kind: ControllerKind) -> Self {
        let written = Arc::new(Mutex::new(Vec::new()));
        let (firmware_tx, firmware_rx) = mpsc::channel(64);
        let options = ConnectionOptions::Serial {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        };
        let handle = Controller::spawn_with_transport(
            kind,
            options,
            Box::new(MockTransport {
                written: written.clone(),
            }),
            firmware_rx,
            ControllerDeps::default(),
        );

        let (tx, events) = mpsc::unbounded_channel();
        handle.add_socket(Uuid::new_v4(), tx).await.unwrap();

        let mut harness = Self {
            handle,
            written,
            firmware_tx,
            events,
        };
        harness.settle().await;
        harness.drain_events();
        harness
    }

    /// Let the controller task run (virtual time advances while idle).
    /// Long enough to cover the Grbl open-sequence delay.
    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    /// Inject one firmware reply line
    async fn reply(&self, line: &str) {
        self.firmware_tx
            .send(TransportEvent::Data(format!("{line}\n").into_bytes()))
            .await
            .unwrap();
        self.settle().await;
    }

    fn wire(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    fn wire_text(&self) -> String {
        String::from_utf8_lossy(&self.wire()).to_string()
    }

    fn clear_wire(&self) {
        self.written.lock().unwrap().clear();
    }

    fn drain_events(&mut self) -> Vec<Push> {
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }

    /// Most recent event with the given name
    fn find_event<'a>(events: &'a [Push], name: &str) -> Option<&'a Push> {
        events.iter().rev().find(|e| e.event == name)
    }
}

#[tokio::test(start_paused = true)]
async fn grbl_streaming_happy_path() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\nG0 X2\n")])
        .await
        .unwrap();
    h.clear_wire();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;

    // Both program lines fit the 128-byte window, then the trailer dwell
    assert_eq!(h.wire_text(), "G0 X1\nG0 X2\nG4 P0.5\n");

    h.reply("ok").await;
    h.reply("ok").await;
    h.reply("ok").await;

    tokio::time::advance(Duration::from_millis(300)).await;
    h.settle().await;
    let events = h.drain_events();
    let status = Harness::find_event(&events, "sender:status").expect("sender:status");
    assert_eq!(status.payload["sent"], 3);
    assert_eq!(status.payload["received"], 3);
    assert_eq!(status.payload["finished"], true);

    // Machine settles to Idle; the finish detector stops the workflow
    h.reply("<Idle|MPos:2.000,0.000,0.000>").await;
    tokio::time::advance(Duration::from_millis(700)).await;
    h.settle().await;

    let events = h.drain_events();
    let workflow = Harness::find_event(&events, "workflow:state").expect("workflow:state");
    assert_eq!(workflow.payload["state"], "idle");
}

#[tokio::test(start_paused = true)]
async fn grbl_tool_change_pauses_workflow() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\nM6\nG0 X2\n")])
        .await
        .unwrap();
    h.clear_wire();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;

    // Emission stops right after the wrapped tool change
    assert_eq!(h.wire_text(), "G0 X1\n(M6)\n");
    let events = h.drain_events();
    let workflow = Harness::find_event(&events, "workflow:state").expect("workflow:state");
    assert_eq!(workflow.payload["state"], "paused");
    assert_eq!(workflow.payload["reason"], json!({ "data": "M6" }));

    // Acks for the two outstanding lines drain counters while paused
    h.reply("ok").await;
    h.reply("ok").await;

    h.clear_wire();
    h.handle.command("sender:resume", vec![]).await.unwrap();
    h.settle().await;

    let wire = h.wire();
    assert_eq!(wire[0], b'~');
    let rest = String::from_utf8_lossy(&wire[1..]).to_string();
    assert_eq!(rest, "G0 X2\nG4 P0.5\n");
}

#[tokio::test(start_paused = true)]
async fn marlin_readiness_handshake_is_idempotent() {
    let mut h = Harness::new(ControllerKind::Marlin).await;

    // The open sequence asks for capabilities
    assert_eq!(h.wire_text(), "M115\n");
    h.clear_wire();

    h.reply("FIRMWARE_NAME:Marlin 2.0 PROTOCOL_VERSION:1.0 MACHINE_TYPE:RepRap EXTRUDER_COUNT:1")
        .await;
    let events = h.drain_events();
    assert!(Harness::find_event(&events, "controller:ready").is_some());

    // A later boot banner re-queries the firmware. Periodic M114 status
    // queries may interleave now that the controller is ready.
    h.clear_wire();
    h.reply("start").await;
    assert!(h.wire_text().contains("M115\n"));
}

#[tokio::test(start_paused = true)]
async fn marlin_program_completion_stops_workflow() {
    let mut h = Harness::new(ControllerKind::Marlin).await;

    h.reply("FIRMWARE_NAME:Marlin 2.0 PROTOCOL_VERSION:1.0").await;
    h.drain_events();

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\n")])
        .await
        .unwrap();
    h.clear_wire();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;

    // Send-response: one outstanding line; the trailer dwell waits for
    // the first ok. Periodic M114 queries may interleave on the wire.
    assert!(h.wire_text().contains("G0 X1\n"));
    assert!(!h.wire_text().contains("G4 P0.5"));

    h.reply("ok").await;
    assert!(h.wire_text().contains("G4 P0.5\n"));
    h.reply("ok").await;

    tokio::time::advance(Duration::from_millis(300)).await;
    h.settle().await;
    let events = h.drain_events();
    let status = Harness::find_event(&events, "sender:status").expect("sender:status");
    assert_eq!(status.payload["sent"], 2);
    assert_eq!(status.payload["received"], 2);
    assert_eq!(status.payload["finished"], true);

    // Marlin reports no machine state; the finish detector runs on its
    // own 500 ms window alone
    tokio::time::advance(Duration::from_millis(700)).await;
    h.settle().await;
    let events = h.drain_events();
    let workflow = Harness::find_event(&events, "workflow:state").expect("workflow:state");
    assert_eq!(workflow.payload["state"], "idle");
}

#[tokio::test(start_paused = true)]
async fn grbl_force_stop_soft_resets_only_in_hold() {
    let h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\n")])
        .await
        .unwrap();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.reply("<Run|MPos:0.000,0.000,0.000>").await;

    h.clear_wire();
    h.handle
        .command("sender:stop", vec![json!({ "force": true })])
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.wire(), vec![b'!']);

    // The machine reports Hold within the decision window
    h.reply("<Hold:0|MPos:0.000,0.000,0.000>").await;
    h.clear_wire();
    tokio::time::advance(Duration::from_millis(600)).await;
    h.settle().await;
    assert_eq!(h.wire(), vec![0x18]);

    // Stopping again outside Run changes nothing
    h.clear_wire();
    h.handle
        .command("sender:stop", vec![json!({ "force": true })])
        .await
        .unwrap();
    tokio::time::advance(Duration::from_millis(600)).await;
    h.settle().await;
    assert!(h.wire().is_empty());
}

#[tokio::test(start_paused = true)]
async fn grbl_feed_override_writes_single_bytes() {
    let h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("override:feed", vec![json!(10)])
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.wire(), vec![0x91]);

    h.clear_wire();
    h.handle
        .command("override:feed", vec![json!(0)])
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.wire(), vec![0x90]);
}

#[tokio::test(start_paused = true)]
async fn subscriber_replay_order() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\n")])
        .await
        .unwrap();
    h.drain_events();

    let (tx, mut rx) = mpsc::unbounded_channel();
    h.handle.add_socket(Uuid::new_v4(), tx).await.unwrap();
    h.settle().await;

    let mut names = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        names.push(ev.event);
    }
    assert_eq!(
        names,
        vec![
            "controller:type",
            "connection:open",
            "controller:settings",
            "controller:state",
            "feeder:status",
            "sender:status",
            "sender:load",
            "workflow:state",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn status_report_echoed_only_when_requested() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    // Unsolicited status is absorbed silently
    h.reply("<Idle|MPos:0.000,0.000,0.000>").await;
    let events = h.drain_events();
    assert!(Harness::find_event(&events, "connection:read").is_none());

    // A client `?` flags the next report for echo, once
    h.handle.writeln("?", WriteSource::Client).await.unwrap();
    h.settle().await;
    h.reply("<Idle|MPos:1.000,0.000,0.000>").await;
    let events = h.drain_events();
    let read = Harness::find_event(&events, "connection:read").expect("echo");
    assert_eq!(read.payload["raw"], "<Idle|MPos:1.000,0.000,0.000>");

    h.reply("<Idle|MPos:2.000,0.000,0.000>").await;
    let events = h.drain_events();
    assert!(Harness::find_event(&events, "connection:read").is_none());
}

#[tokio::test(start_paused = true)]
async fn idle_workflow_emits_no_program_data() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\nG0 X2\n")])
        .await
        .unwrap();
    h.clear_wire();

    // Acks and feeder traffic while Idle must not leak program lines
    h.reply("ok").await;
    h.handle
        .command("gcode", vec![json!("G92 X0")])
        .await
        .unwrap();
    h.settle().await;
    h.reply("ok").await;

    let text = h.wire_text();
    assert!(!text.contains("G0 X1"));
    assert!(text.contains("G92 X0\n"));
    let _ = h.drain_events();
}

#[tokio::test(start_paused = true)]
async fn feeder_ok_echo_and_next() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("gcode", vec![json!("G92 X0\nG0 X5")])
        .await
        .unwrap();
    h.settle().await;
    // One line at a time
    assert_eq!(h.wire_text(), "G92 X0\n");

    h.reply("ok").await;
    assert_eq!(h.wire_text(), "G92 X0\nG0 X5\n");

    let events = h.drain_events();
    let read = Harness::find_event(&events, "connection:read").expect("ok echo");
    assert_eq!(read.payload["raw"], "ok");
}

#[tokio::test(start_paused = true)]
async fn grbl_error_during_program_pauses_with_reason() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\nG0 X2\n")])
        .await
        .unwrap();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;
    h.drain_events();

    h.reply("error:22").await;
    let events = h.drain_events();
    let workflow = Harness::find_event(&events, "workflow:state").expect("workflow:state");
    assert_eq!(workflow.payload["state"], "paused");
    // The pause reason carries the decoded message alongside the code
    assert_eq!(
        workflow.payload["reason"],
        json!({ "err": "error:22 (Feed rate has not yet been set or is undefined.)" })
    );
    let read = Harness::find_event(&events, "connection:read").expect("error echo");
    assert_eq!(
        read.payload["raw"],
        "error:22 (Feed rate has not yet been set or is undefined.)"
    );
}

#[tokio::test(start_paused = true)]
async fn grbl_alarm_is_decoded_and_pauses() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\nG0 X2\n")])
        .await
        .unwrap();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;
    h.drain_events();

    h.reply("ALARM:1").await;
    let events = h.drain_events();
    let read = Harness::find_event(&events, "connection:read").expect("alarm echo");
    let echoed = read.payload["raw"].as_str().unwrap();
    assert!(echoed.starts_with("ALARM:1 (Hard limit triggered."));
    let workflow = Harness::find_event(&events, "workflow:state").expect("workflow:state");
    assert_eq!(workflow.payload["state"], "paused");
}

#[tokio::test(start_paused = true)]
async fn sender_stop_is_idempotent() {
    let mut h = Harness::new(ControllerKind::Grbl).await;

    h.handle
        .command("sender:load", vec![json!("job"), json!("G0 X1\n")])
        .await
        .unwrap();
    h.handle.command("sender:start", vec![]).await.unwrap();
    h.settle().await;

    h.handle.command("sender:stop", vec![]).await.unwrap();
    h.settle().await;
    h.drain_events();

    h.handle.command("sender:stop", vec![]).await.unwrap();
    tokio::time::advance(Duration::from_millis(300)).await;
    h.settle().await;

    let events = h.drain_events();
    // No further workflow transition on the second stop
    assert!(Harness::find_event(&events, "workflow:state").is_none());

    let status = Harness::find_event(&events, "sender:status")
        .map(|s| s.payload.clone())
        .unwrap_or(Value::Null);
    if status != Value::Null {
        assert_eq!(status["sent"], 0);
        assert_eq!(status["received"], 0);
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_command_is_a_validation_error() {
    let h = Harness::new(ControllerKind::Grbl).await;
    let err = h.handle.command("warp:drive", vec![]).await.unwrap_err();
    assert!(err.to_string().contains("unknown command"));
}

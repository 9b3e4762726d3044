use std::collections::HashMap;
use std::fs::File;
use std::io::Write;

use serde::Serialize;
use serde_json::{json, Value};

/// One recorded monitor event, exportable as a Chrome-trace instant event.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorEvent {
    pub name: String,
    pub ph: String,
    /// Timestamp in cycles.
    pub ts: u64,
    pub pid: u32,
    pub tid: u32,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, Value>,
}

/// Opaque event recorder. Nothing in the simulation reads it back; tests
/// and the driver use the counters and the exported trace.
#[derive(Default)]
pub struct Monitor {
    events: Vec<MonitorEvent>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub witems_created: u64,
    next_span_id: u64,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor::default()
    }

    fn record(&mut self, cycle: u64, name: &str, args: HashMap<String, Value>) {
        self.events.push(MonitorEvent {
            name: name.to_string(),
            ph: "i".to_string(),
            ts: cycle,
            pid: 0,
            tid: 0,
            args,
        });
    }

    pub fn create_span(&mut self, cycle: u64, component: &str, label: &str) -> u64 {
        let span_id = self.next_span_id;
        self.next_span_id += 1;
        self.record(cycle, "span", HashMap::from([
            ("span".into(), json!(span_id)),
            ("component".into(), json!(component)),
            ("label".into(), json!(label)),
        ]));
        span_id
    }

    pub fn record_message_sent(
        &mut self,
        cycle: u64,
        message_type: &str,
        ident: u32,
        src: (i32, i32),
        dst: (i32, i32),
    ) {
        self.messages_sent += 1;
        self.record(cycle, "message_sent", HashMap::from([
            ("type".into(), json!(message_type)),
            ("ident".into(), json!(ident)),
            ("src".into(), json!([src.0, src.1])),
            ("dst".into(), json!([dst.0, dst.1])),
        ]));
    }

    pub fn record_message_received(
        &mut self,
        cycle: u64,
        message_type: &str,
        ident: u32,
        at: (i32, i32),
    ) {
        self.messages_received += 1;
        self.record(cycle, "message_received", HashMap::from([
            ("type".into(), json!(message_type)),
            ("ident".into(), json!(ident)),
            ("at".into(), json!([at.0, at.1])),
        ]));
    }

    pub fn create_transaction(
        &mut self,
        cycle: u64,
        transaction_type: &str,
        ident: u32,
        tag: usize,
        src: (i32, i32),
        dst: (i32, i32),
    ) {
        self.record(cycle, "transaction", HashMap::from([
            ("type".into(), json!(transaction_type)),
            ("ident".into(), json!(ident)),
            ("tag".into(), json!(tag)),
            ("src".into(), json!([src.0, src.1])),
            ("dst".into(), json!([dst.0, dst.1])),
        ]));
    }

    pub fn complete_transaction(&mut self, cycle: u64, ident: u32, tag: usize) {
        self.record(cycle, "transaction_complete", HashMap::from([
            ("ident".into(), json!(ident)),
            ("tag".into(), json!(tag)),
        ]));
    }

    pub fn record_witem_created(&mut self, cycle: u64, ident: u32, kind: &str) {
        self.witems_created += 1;
        self.record(cycle, "witem_created", HashMap::from([
            ("ident".into(), json!(ident)),
            ("kind".into(), json!(kind)),
        ]));
    }

    pub fn create_sync_local_span(&mut self, cycle: u64, sync_ident: u32, at: (i32, i32)) {
        self.record(cycle, "sync_local_span", HashMap::from([
            ("sync_ident".into(), json!(sync_ident)),
            ("at".into(), json!([at.0, at.1])),
        ]));
    }

    pub fn record_sync_local_event(
        &mut self,
        cycle: u64,
        sync_ident: u32,
        at: (i32, i32),
        value: Option<u64>,
    ) {
        self.record(cycle, "sync_local_event", HashMap::from([
            ("sync_ident".into(), json!(sync_ident)),
            ("at".into(), json!([at.0, at.1])),
            ("value".into(), json!(value)),
        ]));
    }

    pub fn record_sync_local_complete(
        &mut self,
        cycle: u64,
        sync_ident: u32,
        at: (i32, i32),
        min_value: Option<u64>,
    ) {
        self.record(cycle, "sync_local_complete", HashMap::from([
            ("sync_ident".into(), json!(sync_ident)),
            ("at".into(), json!([at.0, at.1])),
            ("min".into(), json!(min_value)),
        ]));
    }

    pub fn n_events(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[MonitorEvent] {
        &self.events
    }

    /// Write the recorded events as a Chrome-trace JSON array.
    pub fn export_trace(&self, path: &str) -> anyhow::Result<()> {
        let mut file = File::create(path)?;
        let body = serde_json::to_string(&self.events)?;
        file.write_all(body.as_bytes())?;
        Ok(())
    }
}

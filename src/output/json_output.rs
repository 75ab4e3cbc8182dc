// NDJSON output for machine consumers

use serde_json::json;

use super::terminal::{OutcomeRecord, OutcomeStatus, RunReport};

/// JSON output manager, one event object per line
pub struct JsonOutput {
    verbose: bool,
    quiet: bool,
}

impl JsonOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        JsonOutput { verbose, quiet }
    }

    pub fn print_run_header(&self, task: &str, hosts: usize) {
        if self.quiet {
            return;
        }

        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_start",
            "task": task,
            "hosts_count": hosts,
        });

        self.emit_json(&event);
    }

    pub fn print_task_header(&self, task_name: &str) {
        if self.quiet {
            return;
        }

        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "task_start",
            "task": task_name,
        });

        self.emit_json(&event);
    }

    pub fn print_stream_line(&self, host: &str, task: &str, chunk: &str) {
        if !self.verbose || self.quiet {
            return;
        }

        for line in chunk.lines() {
            let event = json!({
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "event": "output",
                "host": host,
                "task": task,
                "line": line,
            });
            self.emit_json(&event);
        }
    }

    pub fn print_outcome(&self, outcome: &OutcomeRecord) {
        if self.quiet && outcome.status != OutcomeStatus::Failed {
            return;
        }

        let status = match outcome.status {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Skipped => "skipped",
        };

        let mut event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "outcome",
            "host": outcome.host,
            "task": outcome.task,
            "status": status,
            "duration_ms": outcome.duration.as_millis() as u64,
        });

        if let Some(error) = &outcome.error {
            event
                .as_object_mut()
                .expect("event is an object")
                .insert("error".to_string(), json!(error));
        }

        self.emit_json(&event);
    }

    pub fn print_recap(&self, report: &RunReport) {
        if self.quiet && report.success() {
            return;
        }

        let event = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "event": "run_complete",
            "succeeded": report.count(OutcomeStatus::Succeeded),
            "failed": report.count(OutcomeStatus::Failed),
            "skipped": report.count(OutcomeStatus::Skipped),
            "failed_hosts": report.failed_hosts(),
            "duration_ms": report.duration.as_millis() as u64,
            "success": report.success(),
        });

        self.emit_json(&event);
    }

    /// Emit a JSON object as a single line (NDJSON)
    fn emit_json(&self, value: &serde_json::Value) {
        if let Ok(json_str) = serde_json::to_string(value) {
            println!("{}", json_str);
        }
    }
}

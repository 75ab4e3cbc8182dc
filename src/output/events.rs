// Event channel for run progress consumers

use std::time::Duration;
use tokio::sync::mpsc;

use super::terminal::{OutcomeRecord, OutcomeStatus, RunReport};

/// Events emitted while a plan executes
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A plan started executing
    RunStart {
        task: String,
        hosts: Vec<String>,
        total_tasks: usize,
    },

    /// A task barrier opened
    TaskStart {
        task: String,
    },

    /// A task started on one host
    HostStart {
        task: String,
        host: String,
    },

    /// A (task, host) attempt finished
    Outcome {
        task: String,
        host: String,
        status: OutcomeStatus,
        duration: Duration,
    },

    /// A chunk of command output arrived from a host
    OutputChunk {
        task: String,
        host: String,
        chunk: String,
    },

    /// A failure hook is about to run on a host
    HookStart {
        task: String,
        hook: String,
        host: String,
    },

    /// The whole run finished
    RunComplete {
        report: RunReport,
    },
}

/// Cloneable sender side of the run event channel
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<RunEvent>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        EventEmitter { tx }
    }

    pub fn run_start(&self, task: String, hosts: Vec<String>, total_tasks: usize) {
        let _ = self.tx.send(RunEvent::RunStart {
            task,
            hosts,
            total_tasks,
        });
    }

    pub fn task_start(&self, task: String) {
        let _ = self.tx.send(RunEvent::TaskStart { task });
    }

    pub fn host_start(&self, task: String, host: String) {
        let _ = self.tx.send(RunEvent::HostStart { task, host });
    }

    pub fn outcome(&self, record: &OutcomeRecord) {
        let _ = self.tx.send(RunEvent::Outcome {
            task: record.task.clone(),
            host: record.host.clone(),
            status: record.status,
            duration: record.duration,
        });
    }

    pub fn output_chunk(&self, task: String, host: String, chunk: String) {
        let _ = self.tx.send(RunEvent::OutputChunk { task, host, chunk });
    }

    pub fn hook_start(&self, task: String, hook: String, host: String) {
        let _ = self.tx.send(RunEvent::HookStart { task, hook, host });
    }

    pub fn run_complete(&self, report: RunReport) {
        let _ = self.tx.send(RunEvent::RunComplete { report });
    }
}

/// Create a new run event channel
pub fn create_event_channel() -> (EventEmitter, mpsc::UnboundedReceiver<RunEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventEmitter::new(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_order() {
        let (emitter, mut rx) = create_event_channel();

        emitter.run_start("deploy".to_string(), vec!["web1".to_string()], 2);
        emitter.task_start("build".to_string());
        emitter.outcome(&OutcomeRecord::succeeded(
            "build",
            "web1",
            Duration::from_secs(1),
        ));

        assert!(matches!(rx.try_recv(), Ok(RunEvent::RunStart { .. })));
        assert!(matches!(rx.try_recv(), Ok(RunEvent::TaskStart { .. })));
        match rx.try_recv() {
            Ok(RunEvent::Outcome { task, host, status, .. }) => {
                assert_eq!(task, "build");
                assert_eq!(host, "web1");
                assert_eq!(status, OutcomeStatus::Succeeded);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_after_receiver_dropped_is_silent() {
        let (emitter, rx) = create_event_channel();
        drop(rx);
        emitter.task_start("build".to_string());
    }
}

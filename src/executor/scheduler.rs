// Plan execution: barriers, concurrency bounds, failure hooks

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use super::runner::{ProcessRunner, SharedSink};
use super::ssh::ConnectionManager;
use crate::config::Vars;
use crate::output::events::EventEmitter;
use crate::output::terminal::{OutcomeRecord, RunReport};
use crate::output::OutputWriter;
use crate::registry::Host;
use crate::tasks::compiler::CompiledPlan;
use crate::tasks::{Task, TaskMode, TaskRegistry};

/// Tuning for a single run
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on hosts executing one task at a time
    pub concurrency: usize,
    /// Default per-command deadline
    pub command_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            concurrency: 4,
            command_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl ExecutorConfig {
    pub fn new() -> Self {
        ExecutorConfig::default()
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }
}

/// Handle for requesting a graceful stop from another task or a signal
/// handler. In-flight work finishes; tasks not yet started are skipped.
#[derive(Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Runs a compiled plan against a set of hosts.
///
/// Tasks execute in plan order with a barrier between them: a task starts on
/// no host until the previous task has finished on every host. Within a task,
/// hosts fan out up to the concurrency bound.
pub struct Executor {
    tasks: Arc<TaskRegistry>,
    connections: Arc<ConnectionManager>,
    config: ExecutorConfig,
    globals: Vars,
    output: Arc<OutputWriter>,
    emitter: Option<EventEmitter>,
    cancel: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        connections: Arc<ConnectionManager>,
        config: ExecutorConfig,
    ) -> Self {
        Executor {
            tasks,
            connections,
            config,
            globals: Vars::new(),
            output: Arc::new(OutputWriter::silent()),
            emitter: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_globals(mut self, globals: Vars) -> Self {
        self.globals = globals;
        self
    }

    pub fn with_output(mut self, output: OutputWriter) -> Self {
        self.output = Arc::new(output);
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// A handle that cancels this executor's current and future runs
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            flag: self.cancel.clone(),
        }
    }

    /// Execute the plan against the resolved hosts.
    ///
    /// Failures are recorded in the report rather than returned: the first
    /// task with any failed host triggers its failure hooks on the failing
    /// hosts, then the run ends with no outcomes for the rest of the plan.
    /// Cancellation instead records the remaining work as skipped.
    pub async fn run(&self, plan: &CompiledPlan, hosts: &[Host]) -> RunReport {
        let run_start = Instant::now();
        let mut report = RunReport::new();

        let hosts: Vec<Arc<Host>> = hosts.iter().cloned().map(Arc::new).collect();
        let controller = Arc::new(Host::new("localhost").with_address("127.0.0.1"));

        self.output.print_run_header(plan.requested(), hosts.len());
        if let Some(emitter) = &self.emitter {
            emitter.run_start(
                plan.requested().to_string(),
                hosts.iter().map(|h| h.alias.clone()).collect(),
                plan.len(),
            );
        }

        for task in plan.tasks() {
            let targets = self.targets_for(task, &hosts, &controller);

            if self.cancel.load(Ordering::SeqCst) {
                for host in &targets {
                    let record = OutcomeRecord::skipped(&task.name, &host.alias);
                    self.output.print_outcome(&record);
                    if let Some(emitter) = &self.emitter {
                        emitter.outcome(&record);
                    }
                    report.record(record);
                }
                continue;
            }

            self.output.print_task_header(&task.name);
            if let Some(emitter) = &self.emitter {
                emitter.task_start(task.name.clone());
            }

            let outcomes = self.run_task_on_hosts(task, &targets).await;
            let failed: Vec<Arc<Host>> = targets
                .iter()
                .zip(&outcomes)
                .filter(|(_, o)| o.error.is_some())
                .map(|(h, _)| h.clone())
                .collect();

            for outcome in outcomes {
                report.record(outcome);
            }

            if !failed.is_empty() {
                debug!(task = %task.name, hosts = failed.len(), "task failed, running failure hooks");
                self.run_failure_hooks(task, &failed, &mut report).await;
                break;
            }
        }

        report.duration = run_start.elapsed();
        self.output.print_recap(&report);
        if let Some(emitter) = &self.emitter {
            emitter.run_complete(report.clone());
        }

        report
    }

    /// The hosts a task actually executes on, given its mode
    fn targets_for(
        &self,
        task: &Task,
        hosts: &[Arc<Host>],
        controller: &Arc<Host>,
    ) -> Vec<Arc<Host>> {
        match task.mode {
            TaskMode::Normal => hosts.to_vec(),
            TaskMode::Once => hosts.iter().take(1).cloned().collect(),
            TaskMode::Local => vec![controller.clone()],
        }
    }

    /// One barrier segment: the task fans out across its targets, bounded by
    /// the run concurrency limit and the tightest per-host max_parallel.
    async fn run_task_on_hosts(&self, task: &Arc<Task>, targets: &[Arc<Host>]) -> Vec<OutcomeRecord> {
        let bound = effective_concurrency(self.config.concurrency, targets);
        let semaphore = Arc::new(Semaphore::new(bound));
        let runner = ProcessRunner::new(self.config.command_timeout);

        let futures: Vec<_> = targets
            .iter()
            .map(|host| {
                let sem = semaphore.clone();
                let task = task.clone();
                let host = host.clone();
                let connections = self.connections.clone();
                let runner = runner.clone();
                let globals = self.globals.clone();
                let output = self.output.clone();
                let emitter = self.emitter.clone();
                let cancel = self.cancel.clone();

                async move {
                    let _permit = sem.acquire().await.unwrap();

                    // A cancellation while this host waited for the permit
                    // skips the work instead of starting it
                    if cancel.load(Ordering::SeqCst) {
                        let record = OutcomeRecord::skipped(&task.name, &host.alias);
                        output.print_outcome(&record);
                        if let Some(emitter) = &emitter {
                            emitter.outcome(&record);
                        }
                        return record;
                    }

                    if let Some(emitter) = &emitter {
                        emitter.host_start(task.name.clone(), host.alias.clone());
                    }

                    let progress = output.create_host_progress(&host.alias);
                    progress.set_message(format!("running {}", task.name));

                    let sink: SharedSink = {
                        let output = output.clone();
                        let emitter = emitter.clone();
                        let host_alias = host.alias.clone();
                        let task_name = task.name.clone();
                        Arc::new(move |chunk: &str| {
                            output.print_stream_line(&host_alias, &task_name, chunk);
                            if let Some(emitter) = &emitter {
                                emitter.output_chunk(
                                    task_name.clone(),
                                    host_alias.clone(),
                                    chunk.to_string(),
                                );
                            }
                        })
                    };

                    let ctx = ExecutionContext::new(
                        host.clone(),
                        task.name.clone(),
                        &globals,
                        connections,
                        runner,
                    )
                    .with_sink(sink);

                    let start = Instant::now();
                    let result = task.run(ctx).await;
                    let duration = start.elapsed();
                    progress.finish_and_clear();

                    let record = match result {
                        Ok(()) => OutcomeRecord::succeeded(&task.name, &host.alias, duration),
                        Err(e) => {
                            OutcomeRecord::failed(&task.name, &host.alias, e.to_string(), duration)
                        }
                    };

                    output.print_outcome(&record);
                    if let Some(emitter) = &emitter {
                        emitter.outcome(&record);
                    }
                    record
                }
            })
            .collect();

        join_all(futures).await
    }

    /// Run the failing task's failure hooks on the hosts that failed, in
    /// registration order. Hook failures are recorded but trigger nothing
    /// further.
    async fn run_failure_hooks(
        &self,
        failed_task: &Arc<Task>,
        failed_hosts: &[Arc<Host>],
        report: &mut RunReport,
    ) {
        for hook in self.tasks.failure_hooks_for(&failed_task.name) {
            for host in failed_hosts {
                if let Some(emitter) = &self.emitter {
                    emitter.hook_start(
                        failed_task.name.clone(),
                        hook.name.clone(),
                        host.alias.clone(),
                    );
                }

                let ctx = ExecutionContext::new(
                    host.clone(),
                    hook.name.clone(),
                    &self.globals,
                    self.connections.clone(),
                    ProcessRunner::new(self.config.command_timeout),
                );

                let start = Instant::now();
                let result = hook.run(ctx).await;
                let duration = start.elapsed();

                let record = match result {
                    Ok(()) => OutcomeRecord::succeeded(&hook.name, &host.alias, duration),
                    Err(e) => {
                        warn!(hook = %hook.name, host = %host.alias, error = %e, "failure hook failed");
                        OutcomeRecord::failed(&hook.name, &host.alias, e.to_string(), duration)
                    }
                };

                self.output.print_outcome(&record);
                if let Some(emitter) = &self.emitter {
                    emitter.outcome(&record);
                }
                report.record(record);
            }
        }
    }
}

/// min(run limit, tightest per-host cap), never below 1
fn effective_concurrency(limit: usize, targets: &[Arc<Host>]) -> usize {
    let host_cap = targets
        .iter()
        .filter_map(|h| h.max_parallel)
        .min()
        .unwrap_or(usize::MAX);
    limit.min(host_cap).max(1)
}

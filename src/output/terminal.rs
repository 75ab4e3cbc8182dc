// Terminal output for run progress and recaps

use std::io::IsTerminal;
use std::time::Duration;

use colored::*;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

/// Final status of one (task, host) attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// One (task, host) attempt, recorded as it completes and never mutated
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub task: String,
    pub host: String,
    pub status: OutcomeStatus,
    pub error: Option<String>,
    pub duration: Duration,
}

impl OutcomeRecord {
    pub fn succeeded(task: impl Into<String>, host: impl Into<String>, duration: Duration) -> Self {
        OutcomeRecord {
            task: task.into(),
            host: host.into(),
            status: OutcomeStatus::Succeeded,
            error: None,
            duration,
        }
    }

    pub fn failed(
        task: impl Into<String>,
        host: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        OutcomeRecord {
            task: task.into(),
            host: host.into(),
            status: OutcomeStatus::Failed,
            error: Some(error.into()),
            duration,
        }
    }

    pub fn skipped(task: impl Into<String>, host: impl Into<String>) -> Self {
        OutcomeRecord {
            task: task.into(),
            host: host.into(),
            status: OutcomeStatus::Skipped,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Accumulated outcomes for a whole run
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub outcomes: Vec<OutcomeRecord>,
    pub duration: Duration,
}

impl RunReport {
    pub fn new() -> Self {
        RunReport::default()
    }

    pub fn record(&mut self, outcome: OutcomeRecord) {
        self.outcomes.push(outcome);
    }

    pub fn success(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|o| o.status == OutcomeStatus::Failed)
    }

    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Aliases of hosts with at least one failed outcome
    pub fn failed_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self
            .outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .map(|o| o.host.as_str())
            .collect();
        hosts.sort_unstable();
        hosts.dedup();
        hosts
    }

    /// Outcomes recorded for one task
    pub fn for_task(&self, task: &str) -> Vec<&OutcomeRecord> {
        self.outcomes.iter().filter(|o| o.task == task).collect()
    }
}

/// Terminal output manager
pub struct TerminalOutput {
    multi_progress: MultiProgress,
    verbose: bool,
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = std::io::stdout().is_terminal();

        // Respect NO_COLOR (https://no-color.org/), and never color pipes
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            multi_progress: MultiProgress::new(),
            verbose,
            quiet,
            is_tty,
        }
    }

    /// Print the run header
    pub fn print_run_header(&self, task: &str, hosts: usize) {
        if self.quiet {
            return;
        }
        println!();
        println!(
            "{} {} ({} hosts)",
            "RUN".green().bold(),
            task.cyan(),
            hosts
        );
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Print a task barrier header
    pub fn print_task_header(&self, task_name: &str) {
        if self.quiet {
            return;
        }
        println!();
        println!("{} {}", "TASK".yellow().bold(), task_name);
    }

    /// Create a spinner for a host while its execution is in flight
    pub fn create_host_progress(&self, host: &str) -> ProgressBar {
        let pb = self.multi_progress.add(ProgressBar::new_spinner());

        let style = if self.is_tty {
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {prefix:.bold} {msg}")
                .unwrap()
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        } else {
            ProgressStyle::default_spinner()
                .template("{prefix} {msg}")
                .unwrap()
        };

        pb.set_style(style);
        pb.set_prefix(host.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Print one streamed output line from a host
    pub fn print_stream_line(&self, host: &str, task: &str, chunk: &str) {
        if !self.verbose || self.quiet {
            return;
        }
        for line in chunk.lines() {
            println!("  {} {} | {}", host.cyan(), task.dimmed(), line);
        }
    }

    /// Print one completed outcome
    pub fn print_outcome(&self, outcome: &OutcomeRecord) {
        if self.quiet && outcome.status != OutcomeStatus::Failed {
            return;
        }

        let styled = match outcome.status {
            OutcomeStatus::Succeeded => "ok".green(),
            OutcomeStatus::Failed => "failed".red().bold(),
            OutcomeStatus::Skipped => "skipped".yellow(),
        };

        println!(
            "  {} {} ({:.1}s)",
            format!("{:>10}:", outcome.host).bold(),
            styled,
            outcome.duration.as_secs_f64()
        );

        if let Some(error) = &outcome.error {
            for line in error.lines().take(8) {
                println!("      {}", line.red());
            }
        }
    }

    /// Print the final recap
    pub fn print_recap(&self, report: &RunReport) {
        if self.quiet && report.success() {
            return;
        }

        println!();
        println!("{}", "RECAP".bold());
        println!(
            "  {} succeeded, {} failed, {} skipped in {:.1}s",
            report
                .count(OutcomeStatus::Succeeded)
                .to_string()
                .green(),
            report.count(OutcomeStatus::Failed).to_string().red(),
            report
                .count(OutcomeStatus::Skipped)
                .to_string()
                .yellow(),
            report.duration.as_secs_f64()
        );

        if !report.success() {
            println!(
                "  {} {}",
                "failed hosts:".dimmed(),
                report.failed_hosts().join(", ")
            );
        }
    }
}

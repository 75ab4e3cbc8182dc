// Output module for Armada

use indicatif::ProgressBar;

pub mod errors;
pub mod events;
pub mod json_output;
pub mod terminal;

pub use errors::*;
pub use events::*;
pub use json_output::*;
pub use terminal::*;

/// Output format for Armada
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// Machine-readable JSON output (NDJSON format)
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(()),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
    /// Suppresses all output, used by library embedders and tests
    Silent,
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(verbose, quiet)),
        }
    }

    pub fn silent() -> Self {
        OutputWriter::Silent
    }

    pub fn print_run_header(&self, task: &str, hosts: usize) {
        match self {
            OutputWriter::Text(output) => output.print_run_header(task, hosts),
            OutputWriter::Json(output) => output.print_run_header(task, hosts),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_task_header(&self, task_name: &str) {
        match self {
            OutputWriter::Text(output) => output.print_task_header(task_name),
            OutputWriter::Json(output) => output.print_task_header(task_name),
            OutputWriter::Silent => {}
        }
    }

    /// A live spinner for one host while its execution is in flight.
    /// Hidden for JSON and silent modes.
    pub fn create_host_progress(&self, host: &str) -> ProgressBar {
        match self {
            OutputWriter::Text(output) => output.create_host_progress(host),
            OutputWriter::Json(_) => ProgressBar::hidden(),
            OutputWriter::Silent => ProgressBar::hidden(),
        }
    }

    pub fn print_stream_line(&self, host: &str, task: &str, chunk: &str) {
        match self {
            OutputWriter::Text(output) => output.print_stream_line(host, task, chunk),
            OutputWriter::Json(output) => output.print_stream_line(host, task, chunk),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_outcome(&self, outcome: &OutcomeRecord) {
        match self {
            OutputWriter::Text(output) => output.print_outcome(outcome),
            OutputWriter::Json(output) => output.print_outcome(outcome),
            OutputWriter::Silent => {}
        }
    }

    pub fn print_recap(&self, report: &RunReport) {
        match self {
            OutputWriter::Text(output) => output.print_recap(report),
            OutputWriter::Json(output) => output.print_recap(report),
            OutputWriter::Silent => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text));
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_non_text_progress_is_hidden() {
        assert!(OutputWriter::silent().create_host_progress("h1").is_hidden());
        assert!(OutputWriter::Json(JsonOutput::new(false, false))
            .create_host_progress("h1")
            .is_hidden());
    }
}

// Human-readable error messages for Armada

use std::fmt;
use std::io::IsTerminal;
use std::path::PathBuf;

use colored::*;

/// Initialize color output based on TTY detection and NO_COLOR environment variable
fn should_use_colors() -> bool {
    // Check NO_COLOR environment variable first (https://no-color.org/)
    if std::env::var("NO_COLOR").is_ok() {
        return false;
    }

    // Check if stderr is a TTY (errors are typically written to stderr)
    std::io::stderr().is_terminal()
}

/// All error types in Armada
#[derive(Debug, Clone)]
pub enum ArmadaError {
    /// A host alias was registered twice
    DuplicateHost { alias: String },

    /// A selector expression matched no hosts
    UnknownSelector {
        selector: String,
        suggestion: Option<String>,
    },

    /// A task name (or hook reference) does not exist in the registry
    UnknownTask {
        name: String,
        referenced_by: Option<String>,
    },

    /// The before/after hook graph contains a cycle
    Cycle { path: Vec<String> },

    /// SSH connection establishment or session failure
    Connection {
        host: String,
        message: String,
        suggestion: Option<String>,
    },

    /// A command exited non-zero
    Command {
        host: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    /// A command or connection attempt exceeded its deadline
    Timeout {
        host: String,
        operation: String,
        duration_secs: u64,
    },

    /// Configuration file problems
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// I/O errors
    Io {
        message: String,
        path: Option<PathBuf>,
    },
}

impl ArmadaError {
    /// Errors that abort the invocation before any host is contacted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ArmadaError::DuplicateHost { .. }
                | ArmadaError::UnknownSelector { .. }
                | ArmadaError::UnknownTask { .. }
                | ArmadaError::Cycle { .. }
                | ArmadaError::Config { .. }
        )
    }
}

impl std::error::Error for ArmadaError {}

impl fmt::Display for ArmadaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Set color mode based on TTY detection and NO_COLOR
        if !should_use_colors() {
            colored::control::set_override(false);
        }

        match self {
            ArmadaError::DuplicateHost { alias } => {
                writeln!(
                    f,
                    "{}: host '{}' is already registered",
                    "HOST ERROR".red().bold(),
                    alias
                )?;
                writeln!(
                    f,
                    "{}: host aliases must be unique across the registry",
                    "Hint".yellow().bold()
                )?;
                Ok(())
            }

            ArmadaError::UnknownSelector {
                selector,
                suggestion,
            } => {
                writeln!(
                    f,
                    "{}: selector '{}' matched no hosts",
                    "SELECTOR ERROR".red().bold(),
                    selector
                )?;
                if let Some(suggestion) = suggestion {
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::UnknownTask {
                name,
                referenced_by,
            } => {
                writeln!(f, "{}: no task named '{}'", "TASK ERROR".red().bold(), name)?;
                if let Some(referrer) = referenced_by {
                    writeln!(f, "  {} {}", "Referenced by:".dimmed(), referrer)?;
                }
                Ok(())
            }

            ArmadaError::Cycle { path } => {
                writeln!(f, "{}: task hooks form a cycle", "CYCLE ERROR".red().bold())?;
                writeln!(f, "  {} {}", "Cycle:".dimmed(), path.join(" -> "))?;
                writeln!(
                    f,
                    "{}: remove one of the before/after references in the cycle",
                    "Hint".yellow().bold()
                )?;
                Ok(())
            }

            ArmadaError::Connection {
                host,
                message,
                suggestion,
            } => {
                writeln!(f, "{}: {}", "CONNECTION ERROR".red().bold(), message)?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                if let Some(suggestion) = suggestion {
                    writeln!(f)?;
                    writeln!(f, "{}: {}", "Hint".yellow().bold(), suggestion)?;
                }
                Ok(())
            }

            ArmadaError::Command {
                host,
                command,
                exit_code,
                output,
            } => {
                writeln!(
                    f,
                    "{}: command exited with status {}",
                    "COMMAND ERROR".red().bold(),
                    exit_code
                )?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                writeln!(f, "  {} {}", "Command:".dimmed(), command)?;
                if !output.is_empty() {
                    writeln!(f)?;
                    writeln!(f, "  {}:", "output".dimmed())?;
                    for line in output.lines().take(10) {
                        writeln!(f, "    {}", line)?;
                    }
                }
                Ok(())
            }

            ArmadaError::Timeout {
                host,
                operation,
                duration_secs,
            } => {
                writeln!(
                    f,
                    "{}: {} timed out after {}s",
                    "TIMEOUT".red().bold(),
                    operation,
                    duration_secs
                )?;
                writeln!(f, "  {} {}", "Host:".dimmed(), host)?;
                Ok(())
            }

            ArmadaError::Config { message, path } => {
                writeln!(f, "{}: {}", "CONFIG ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }

            ArmadaError::Io { message, path } => {
                writeln!(f, "{}: {}", "I/O ERROR".red().bold(), message)?;
                if let Some(path) = path {
                    writeln!(f, "  {} {}", "Path:".dimmed(), path.display())?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_display() {
        let err = ArmadaError::Cycle {
            path: vec![
                "deploy".to_string(),
                "build".to_string(),
                "deploy".to_string(),
            ],
        };

        let output = format!("{}", err);
        let clean = console::strip_ansi_codes(&output);

        assert!(clean.contains("deploy -> build -> deploy"));
        assert!(clean.contains("CYCLE ERROR"));
    }

    #[test]
    fn test_command_error_truncates_output() {
        let long_output = (0..50)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n");

        let err = ArmadaError::Command {
            host: "web1".to_string(),
            command: "make release".to_string(),
            exit_code: 2,
            output: long_output,
        };

        let clean = console::strip_ansi_codes(&format!("{}", err)).to_string();
        assert!(clean.contains("line 9"));
        assert!(!clean.contains("line 23"));
    }

    #[test]
    fn test_fatal_classification() {
        let dup = ArmadaError::DuplicateHost {
            alias: "web1".to_string(),
        };
        assert!(dup.is_fatal());

        let timeout = ArmadaError::Timeout {
            host: "web1".to_string(),
            operation: "deploy".to_string(),
            duration_secs: 30,
        };
        assert!(!timeout.is_fatal());
    }
}

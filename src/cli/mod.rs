//! CLI Module
//!
//! Provides command-line interface support:
//! - Exit codes for automation
//! - Output formatting for telemetry records and captures

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, exit_code_for, CliResult, ExitCodes};
pub use output::{format_capture, format_record, Columns, OutputFormat};

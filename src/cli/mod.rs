//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Event rendering for terminal and pipe output

pub mod exit_codes;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use output::{format_event, OutputFormat, CSV_HEADER};

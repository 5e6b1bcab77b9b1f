//! Instrulink - serial instrument ingestion
//!
//! Operator binary for field stations:
//! - List serial ports on this host
//! - Try a parsing rule against a sample sentence
//! - Monitor configured instruments

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use instrulink_core::cli::{format_event, CliResult, ExitCodes, OutputFormat, CSV_HEADER};
use instrulink_core::config::{self, AppConfig, LoggingConfig};
use instrulink_core::core::extract::{FieldExtractor, TextEncoding};
use instrulink_core::core::framing::FramingBuffer;
use instrulink_core::core::rule::{self, ParsingRule, Unit};
use instrulink_core::{available_ports, Context, Supervisor, SupervisorEvent, VERSION};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Instrulink CLI
#[derive(Parser, Debug)]
#[command(
    name = "instrulink",
    author = "Instrulink Team",
    version,
    about = "Serial instrument ingestion for field stations",
    long_about = None
)]
struct Cli {
    /// Config file (defaults to the per-user config directory)
    #[arg(short, long, env = "INSTRULINK_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    quiet: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List available serial ports
    ListPorts {
        /// Show adapter details
        #[arg(short, long)]
        detailed: bool,
    },

    /// Run a sample sentence through a parsing rule
    CheckRule {
        /// Sample input; `\r`, `\n` and `\xNN` escapes are expanded
        sample: String,

        /// Use the rule configured for this port
        #[arg(short, long, conflicts_with_all = ["fixed", "delimiter"])]
        port: Option<String>,

        /// Fixed columns, inclusive (e.g. `0:6`)
        #[arg(long, value_name = "START:END", conflicts_with = "delimiter")]
        fixed: Option<String>,

        /// Field delimiter
        #[arg(long, requires = "field")]
        delimiter: Option<String>,

        /// Zero-based field index
        #[arg(long)]
        field: Option<usize>,

        /// Sentence terminator
        #[arg(long, default_value = "\\r\\n")]
        terminator: String,

        /// Unit the device reports in
        #[arg(long)]
        unit: Option<Unit>,

        /// Unit consumers expect
        #[arg(long)]
        target: Option<Unit>,

        /// Stream encoding (iso-8859-1, ascii, utf-8)
        #[arg(long, default_value = "iso-8859-1")]
        encoding: String,
    },

    /// Read configured instruments and print what they send
    Monitor {
        /// Ports to start (default: every readable configured port)
        ports: Vec<String>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,

        /// Write the diagnostic log here on exit
        #[arg(long)]
        diagnostics: Option<PathBuf>,
    },

    /// Show the configuration file
    Config {
        /// Write a default config if none exists
        #[arg(long)]
        init: bool,
    },

    /// Show exit codes
    ExitCodes,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            return ExitCode::from(ExitCodes::CONFIG_ERROR);
        }
    };

    let _guard = init_logging(&cli, &app_config.logging);
    info!("Starting instrulink v{}", VERSION);

    let result = match &cli.command {
        Commands::ListPorts { detailed } => list_ports(&cli, *detailed),
        Commands::CheckRule {
            sample,
            port,
            fixed,
            delimiter,
            field,
            terminator,
            unit,
            target,
            encoding,
        } => build_rule(
            &app_config,
            port.as_deref(),
            fixed.as_deref(),
            delimiter.as_deref().zip(*field),
            terminator,
            *unit,
            encoding,
        )
        .and_then(|(rule, configured_target)| {
            check_rule(&cli, sample, rule, target.or(configured_target))
        }),
        Commands::Monitor {
            ports,
            duration,
            diagnostics,
        } => monitor(
            &cli,
            &app_config,
            ports,
            duration.map(Duration::from_secs),
            diagnostics.as_deref(),
        ),
        Commands::Config { init } => show_config(&cli, &app_config, *init),
        Commands::ExitCodes => {
            instrulink_core::cli::print_exit_codes();
            Ok(CliResult::success())
        }
    };

    match result {
        Ok(outcome) => {
            match (&outcome, outcome.message()) {
                (CliResult::Error(..), Some(msg)) => eprintln!("{msg}"),
                (CliResult::Success(_), Some(msg)) if !cli.quiet => println!("{msg}"),
                _ => {}
            }
            outcome.to_exit_code()
        }
        Err(err) => {
            error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(ExitCodes::ERROR)
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(AppConfig::load()?),
    }
}

fn init_logging(cli: &Cli, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let default = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (file_layer, guard) = match (logging.file, logging.directory.as_ref()) {
        (true, Some(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, "instrulink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        _ => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if cli.log_json || logging.json {
        registry.with(fmt::layer().json().with_writer(io::stderr)).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
    guard
}

fn list_ports(cli: &Cli, detailed: bool) -> anyhow::Result<CliResult> {
    let ports = available_ports()?;

    if ports.is_empty() {
        if !cli.quiet {
            println!("No serial ports found.");
        }
        return Ok(CliResult::success());
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ports)?),
        OutputFormat::Csv => {
            println!("name,description");
            for port in &ports {
                println!("{},\"{}\"", port.name, port.description.replace('"', "\"\""));
            }
        }
        OutputFormat::Text => {
            if detailed {
                println!("Available Serial Ports:");
                println!("{:-<60}", "");
                for port in &ports {
                    println!("  {} [{}]", port.name, port.description);
                }
            } else {
                for port in &ports {
                    println!("{}", port.name);
                }
            }
        }
    }

    Ok(CliResult::success())
}

fn parse_encoding(name: &str) -> anyhow::Result<TextEncoding> {
    Ok(match name.to_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "latin-1" => TextEncoding::Latin1,
        "ascii" => TextEncoding::Ascii,
        "utf-8" | "utf8" => TextEncoding::Utf8,
        other => bail!("unknown encoding: {other}"),
    })
}

/// Rule from the command line, or the one configured for `port`. Also
/// returns the configured target unit when the rule came from a port.
fn build_rule(
    app_config: &AppConfig,
    port: Option<&str>,
    fixed: Option<&str>,
    delimited: Option<(&str, usize)>,
    terminator: &str,
    unit: Option<Unit>,
    encoding: &str,
) -> anyhow::Result<(ParsingRule, Option<Unit>)> {
    if let Some(port) = port {
        let config = app_config
            .port(port)
            .with_context(|| format!("{port} is not configured"))?;
        let rule = config
            .rule
            .clone()
            .with_context(|| format!("{port} is write-only"))?;
        return Ok((rule, config.measurement.unit));
    }

    let mut rule = match (fixed, delimited) {
        (Some(columns), _) => {
            let (start, end) = columns
                .split_once(':')
                .context("fixed columns must look like START:END")?;
            ParsingRule::fixed(start.trim().parse()?, end.trim().parse()?)
        }
        (None, Some((delimiter, field))) => ParsingRule::delimited(delimiter, field),
        (None, None) => bail!("give --port, --fixed or --delimiter"),
    };
    rule = rule
        .terminator(&rule::unescape(terminator))
        .encoding(parse_encoding(encoding)?);
    if let Some(unit) = unit {
        rule = rule.unit(unit);
    }
    Ok((rule, None))
}

fn check_rule(
    cli: &Cli,
    sample: &str,
    rule: ParsingRule,
    target: Option<Unit>,
) -> anyhow::Result<CliResult> {
    let mut input = rule::unescape(sample);
    if !input.ends_with(&rule.line_terminator) {
        input.extend_from_slice(&rule.line_terminator);
    }

    let extractor = FieldExtractor::new(rule, target);
    let mut framing = FramingBuffer::new(&extractor.rule().line_terminator);
    let mut failures = 0;

    for sentence in framing.feed(&input).filter_map(|frame| frame.into_sentence()) {
        let text = match extractor.decode(&sentence) {
            Ok(text) => text,
            Err(err) => {
                failures += 1;
                eprintln!("{err} in {}", hex::encode(&sentence));
                continue;
            }
        };
        if text.is_empty() {
            continue;
        }

        let result = extractor.extract(&text);
        if result.is_err() {
            failures += 1;
        }
        match cli.format {
            OutputFormat::Json => {
                let line = match &result {
                    Ok(value) => serde_json::json!({ "sentence": text, "value": value }),
                    Err(err) => serde_json::json!({ "sentence": text, "error": err }),
                };
                println!("{line}");
            }
            OutputFormat::Csv | OutputFormat::Text => match &result {
                Ok(value) => println!("{text:?} -> {value}"),
                Err(err) => println!("{text:?} -> error: {err}"),
            },
        }
    }

    if failures > 0 {
        Ok(CliResult::error(
            ExitCodes::VALIDATION_FAILED,
            format!("{failures} sentence(s) did not match the rule"),
        ))
    } else {
        Ok(CliResult::success())
    }
}

fn monitor(
    cli: &Cli,
    app_config: &AppConfig,
    ports: &[String],
    duration: Option<Duration>,
    diagnostics: Option<&Path>,
) -> anyhow::Result<CliResult> {
    let supervisor = Supervisor::serial(app_config.supervisor_settings());
    supervisor.load_from(app_config)?;

    let started = if ports.is_empty() {
        supervisor.start_all()?
    } else {
        for port in ports {
            supervisor.start_session(port)?;
        }
        ports.len()
    };
    if started == 0 {
        return Ok(CliResult::error(
            ExitCodes::CONFIG_ERROR,
            "no readable ports configured",
        ));
    }
    for printer in supervisor.printers() {
        info!(port = %printer.port, "Printer port, not read");
    }

    let format = cli.format;
    let quiet = cli.quiet;
    if format == OutputFormat::Csv {
        println!("{CSV_HEADER}");
    }
    supervisor.subscribe_all(move |event: &SupervisorEvent| {
        let show = !quiet || matches!(event, SupervisorEvent::Measurement(_));
        if show {
            if let Some(line) = format_event(event, format) {
                println!("{line}");
            }
        }
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let deadline = duration.map(|d| Instant::now() + d);
    let no_screen = || None::<Context>;
    let mut cancelled = false;

    loop {
        supervisor.pump_timeout(&no_screen, Duration::from_millis(200));

        if !running.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        if supervisor.list_sessions().iter().all(|s| !s.running) {
            supervisor.pump(&no_screen);
            break;
        }
    }

    let stopped = supervisor.stop_all();
    supervisor.pump(&no_screen);
    info!(stopped, "Monitor finished");

    if let Some(path) = diagnostics {
        let log = supervisor.export_diagnostics(app_config.logging.diagnostics_format);
        std::fs::write(path, log).with_context(|| format!("writing {}", path.display()))?;
    }

    let fault = supervisor
        .list_sessions()
        .into_iter()
        .find_map(|s| s.last_fault);
    Ok(match fault {
        Some(fault) => CliResult::from(&fault),
        None if cancelled => CliResult::error(ExitCodes::CANCELLED, "cancelled"),
        None => CliResult::success(),
    })
}

fn show_config(cli: &Cli, app_config: &AppConfig, init: bool) -> anyhow::Result<CliResult> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => AppConfig::default_path()?,
    };

    if init && !path.exists() {
        config::init_directories()?;
        app_config.save_to(&path)?;
        return Ok(CliResult::success_with_message(format!(
            "Wrote {}",
            path.display()
        )));
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(app_config)?),
        OutputFormat::Csv | OutputFormat::Text => {
            if !cli.quiet {
                println!("# {}", path.display());
            }
            print!("{}", toml::to_string_pretty(app_config)?);
        }
    }
    Ok(CliResult::success())
}

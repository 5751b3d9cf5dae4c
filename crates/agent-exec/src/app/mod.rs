#![expect(clippy::print_stdout, reason = "CLI output is emitted here")]
#![expect(clippy::print_stderr, reason = "CLI output is emitted here")]

//! CLI application layer and composition root wiring.

use std::io;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

mod client;
mod commands;
mod daemon;

use crate::app::client::ClientError;
use crate::app::client::Message;
use crate::app::client::SocketClient;
use crate::app::commands::Cli;
use crate::app::commands::Commands;
use crate::app::commands::DaemonArgs;
use crate::app::commands::ExecArgs;
use crate::app::commands::PredictArgs;
use crate::app::daemon::start_daemon;
use crate::common::DaemonError;
use crate::common::ErrorCategory;
use crate::common::telemetry;
use crate::infra::daemon::DaemonConfig;
use crate::infra::daemon::HistorySpec;
use crate::infra::daemon::socket_path;

const PROGRAM_NAME: &str = "agent-exec";
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit codes following sysexits.h and LSB init script conventions.
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    /// LSB: program is not running (for `status`)
    pub const NOT_RUNNING: i32 = 3;
    pub const USAGE: i32 = 64;
    pub const UNAVAILABLE: i32 = 69;
    pub const CANTCREAT: i32 = 73;
    pub const IOERR: i32 = 74;
    pub const TEMPFAIL: i32 = 75;
    /// Same code `timeout(1)` uses for a killed command.
    pub const TIMEOUT: i32 = 124;
    /// Base for "killed by signal N".
    pub const SIGNAL_BASE: i32 = 128;
}

#[derive(Default)]
pub struct Application;

impl Application {
    pub fn new() -> Self {
        Self
    }

    pub fn run(&self) -> Result<i32> {
        let exit_code = match self.execute() {
            Ok(code) => code,
            Err(e) => self.handle_error(e),
        };
        Ok(exit_code)
    }

    fn execute(&self) -> Result<i32> {
        let cli = Cli::parse();
        if let Commands::Daemon(args) = &cli.command {
            start_daemon(daemon_config(cli.socket.clone(), args))?;
            return Ok(exit_codes::SUCCESS);
        }

        let _telemetry = telemetry::init_tracing(if cli.verbose { "debug" } else { "warn" });
        debug!(command = ?cli.command, json = cli.json, "CLI command parsed");

        let socket = cli.socket.clone().unwrap_or_else(socket_path);
        match &cli.command {
            Commands::Status => self.status(&socket, cli.json),
            Commands::Exec(args) => {
                let mut client = SocketClient::connect(&socket).context("failed to connect to daemon")?;
                exec(&mut client, args, cli.json).context("failed to execute command")
            }
            Commands::Predict(args) => {
                let mut client = SocketClient::connect(&socket).context("failed to connect to daemon")?;
                predict(&mut client, args, cli.json).context("failed to predict timeout")?;
                Ok(exit_codes::SUCCESS)
            }
            Commands::Daemon(_) => Ok(exit_codes::SUCCESS),
        }
    }

    fn status(&self, socket: &std::path::Path, json_output: bool) -> Result<i32> {
        let mut client = match SocketClient::connect(socket) {
            Ok(client) => client,
            Err(ClientError::DaemonNotRunning) => {
                if json_output {
                    println!("{}", json!({ "running": false, "socket": socket.display().to_string() }));
                } else {
                    println!("Daemon is not running ({})", socket.display());
                }
                return Ok(exit_codes::NOT_RUNNING);
            }
            Err(err) => return Err(err).context("failed to connect to daemon"),
        };
        client.set_read_timeout(Some(STATUS_TIMEOUT))?;
        let health = client.call("health", None).context("health check failed")?;
        if json_output {
            println!("{}", serde_json::to_string_pretty(&health)?);
        } else {
            print_health(&health);
        }
        Ok(exit_codes::SUCCESS)
    }

    fn handle_error(&self, e: anyhow::Error) -> i32 {
        if let Some(client_error) = find_error::<ClientError>(&e) {
            eprintln!("{PROGRAM_NAME}: Error: {client_error}");
            if let Some(context) = client_error.context() {
                eprintln!("Context: {context}");
            }
            if let Some(suggestion) = client_error.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            if client_error.is_retryable() {
                eprintln!("(This error may be transient - retry may succeed)");
            }
            exit_code_for_client_error(client_error)
        } else if let Some(daemon_error) = find_error::<DaemonError>(&e) {
            eprintln!("{PROGRAM_NAME}: Error: {daemon_error}");
            eprintln!("Suggestion: {}", daemon_error.suggestion());
            if daemon_error.is_retryable() {
                eprintln!("(This error may be transient - retry may succeed)");
            }
            match daemon_error {
                DaemonError::AlreadyRunning => exit_codes::TEMPFAIL,
                DaemonError::HookConfig(_) => exit_codes::USAGE,
                _ => exit_codes::IOERR,
            }
        } else {
            eprintln!("{PROGRAM_NAME}: Error: {e:#}");
            exit_codes::GENERAL_ERROR
        }
    }
}

fn daemon_config(socket: Option<PathBuf>, args: &DaemonArgs) -> DaemonConfig {
    let mut config = DaemonConfig::from_env();
    if let Some(socket) = socket {
        config = config.with_socket_path(socket);
    }
    if let Some(hooks) = &args.hooks {
        config = config.with_hooks_path(hooks);
    }
    if let Some(history) = &args.history {
        config = config.with_history(HistorySpec::parse(history));
    }
    if let Some(listen) = &args.ws_listen {
        config = config.with_ws_listen(listen.as_str());
    }
    if args.no_ws {
        config = config.with_ws_enabled(false);
    }
    if let Some(max) = args.max_sessions {
        config = config.with_max_sessions(usize::try_from(max).unwrap_or(usize::MAX));
    }
    if !args.allow.is_empty() {
        config = config.with_allowed_commands(args.allow.iter().map(String::as_str));
    }
    config
}

fn exec(client: &mut SocketClient, args: &ExecArgs, json_output: bool) -> Result<i32, ClientError> {
    let Some((executable, arguments)) = args.command.split_first() else {
        return Err(ClientError::UnexpectedResponse {
            message: "no command given".to_string(),
        });
    };
    let mut params = json!({
        "executable": executable,
        "arguments": arguments,
        "environment": args
            .env
            .iter()
            .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
            .collect::<serde_json::Map<String, Value>>(),
    });
    if let Some(cwd) = &args.cwd {
        params["working_directory"] = json!(cwd);
    }
    if let Some(timeout) = args.timeout {
        params["timeout"] = json!(timeout);
    }
    if let Some(session) = &args.session {
        params["session"] = json!(session);
    }

    let accepted = client.call("execute", Some(params))?;
    debug!(
        session = ?accepted.get("session_id"),
        timeout_ms = ?accepted.get("timeout_ms"),
        source = ?accepted.get("timeout_source"),
        "Run accepted"
    );

    let mut stdout = io::stdout().lock();
    loop {
        let Message::Notification { method, params } = client.next_message()? else {
            continue;
        };
        match method.as_str() {
            "process.output" if !json_output => {
                let data = params.get("data").and_then(Value::as_str).unwrap_or_default();
                let newline = !params.get("truncated").and_then(Value::as_bool).unwrap_or(false);
                if params.get("type").and_then(Value::as_str) == Some("stderr") {
                    if newline {
                        eprintln!("{data}");
                    } else {
                        eprint!("{data}");
                    }
                } else {
                    let _ = if newline {
                        writeln!(stdout, "{data}")
                    } else {
                        write!(stdout, "{data}")
                    };
                }
            }
            "process.completed" => {
                let _ = stdout.flush();
                if json_output {
                    println!("{}", serde_json::to_string_pretty(&params)?);
                } else if let Some(failure) = params.get("hook_failure") {
                    let message = failure.get("message").and_then(Value::as_str).unwrap_or("hook failed");
                    eprintln!("{PROGRAM_NAME}: post-execution hook failed: {message}");
                }
                return Ok(completion_exit_code(&params));
            }
            _ => {}
        }
    }
}

fn predict(client: &mut SocketClient, args: &PredictArgs, json_output: bool) -> Result<(), ClientError> {
    let Some((executable, arguments)) = args.command.split_first() else {
        return Err(ClientError::UnexpectedResponse {
            message: "no command given".to_string(),
        });
    };
    let prediction = client.call(
        "predict",
        Some(json!({ "executable": executable, "arguments": arguments })),
    )?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
        return Ok(());
    }
    let timeout_ms = prediction.get("timeout_ms").and_then(Value::as_u64).unwrap_or(0);
    let source = prediction.get("source").and_then(Value::as_str).unwrap_or("unknown");
    println!("Timeout:   {:.1}s", timeout_ms as f64 / 1000.0);
    println!("Source:    {source}");
    if let Some(samples) = prediction.get("samples").and_then(Value::as_u64) {
        println!("Samples:   {samples}");
    }
    if let Some(complexity) = prediction.get("complexity").and_then(Value::as_str) {
        println!("Class:     {complexity}");
    }
    if let Some(signature) = prediction.get("signature").and_then(Value::as_str) {
        println!("Signature: {signature}");
    }
    Ok(())
}

fn print_health(health: &Value) {
    let field = |key: &str| health.get(key).cloned().unwrap_or(Value::Null);
    println!("Daemon is running");
    println!("  pid:      {}", field("pid"));
    println!("  version:  {}", field("version").as_str().unwrap_or("unknown"));
    println!(
        "  uptime:   {:.1}s",
        field("uptime_ms").as_u64().unwrap_or(0) as f64 / 1000.0
    );
    println!(
        "  sessions: {} ({} active, max {})",
        field("sessions"),
        field("active_sessions"),
        field("max_sessions")
    );
    println!("  history:  {}", field("history_store").as_str().unwrap_or("unknown"));
    if let Some(state) = health.get("breaker").and_then(|b| b.get("state")).and_then(Value::as_str) {
        println!("  breaker:  {state}");
    }
}

/// Maps a `process.completed` payload onto a shell exit status.
fn completion_exit_code(completed: &Value) -> i32 {
    let reason = completed
        .get("termination_reason")
        .and_then(Value::as_str)
        .unwrap_or("error");
    let code = completed
        .get("exit_code")
        .and_then(Value::as_i64)
        .and_then(|c| i32::try_from(c).ok());
    let status = match (reason, code) {
        ("timeout" | "stalled", _) => exit_codes::TIMEOUT,
        ("normal", Some(code)) if code >= 0 => code,
        ("normal", Some(code)) => exit_codes::SIGNAL_BASE.saturating_add(code.saturating_neg()),
        _ => exit_codes::GENERAL_ERROR,
    };
    if status == exit_codes::SUCCESS && completed.get("hook_failure").is_some() {
        return exit_codes::GENERAL_ERROR;
    }
    status
}

fn find_error<T: std::error::Error + 'static>(error: &anyhow::Error) -> Option<&T> {
    error.chain().find_map(|source| source.downcast_ref::<T>())
}

fn exit_code_for_client_error(error: &ClientError) -> i32 {
    if matches!(error, ClientError::DaemonNotRunning) {
        return exit_codes::UNAVAILABLE;
    }

    match error.category() {
        Some(ErrorCategory::InvalidInput) => exit_codes::USAGE,
        Some(ErrorCategory::NotFound) => exit_codes::UNAVAILABLE,
        Some(ErrorCategory::Busy) => exit_codes::CANTCREAT,
        Some(ErrorCategory::External) => exit_codes::IOERR,
        Some(ErrorCategory::Internal) => exit_codes::IOERR,
        Some(ErrorCategory::Timeout) => exit_codes::TEMPFAIL,
        None => exit_codes::GENERAL_ERROR,
    }
}

// scriptbox CLI - headless snippet execution
// Reads ExecutionRequests, runs them in the sandbox, prints ExecutionResults.

mod exit_codes;

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use scriptbox_config::Settings;
use scriptbox_engine::{Capability, Engine, ExecutionRequest, ExecutionResult};

use exit_codes::{result_exit_code, EXIT_IO, EXIT_PARSE, EXIT_SUCCESS, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "sbx")]
#[command(about = "Run sandboxed Lua snippets against a JSON data context")]
#[command(version)]
struct Cli {
    /// Settings file (default: the user config dir's scriptbox/settings.toml)
    #[arg(long, global = true, env = "SCRIPTBOX_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ExecutionRequest (JSON) and print the ExecutionResult
    #[command(after_help = "\
Examples:
  sbx run request.json
  echo '{\"code\":\"1 + 1\",\"isExpression\":true}' | sbx run
  sbx run - --pretty < request.json

Exit code mirrors the result status (0 success, 1 snippet failed).")]
    Run {
        /// Request file (omit or '-' to read from stdin)
        input: Option<PathBuf>,

        /// Pretty-print the result JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Evaluate a snippet given on the command line
    #[command(after_help = "\
Examples:
  sbx eval --expr '2 ^ 10'
  sbx eval 'result = #data.items' --data order.json
  sbx eval 'print(date.now())' --allow date
  sbx eval --expr 'data.score * 2' --data grades.json --json")]
    Eval {
        /// Snippet source
        code: String,

        /// Treat the snippet as a single expression
        #[arg(long)]
        expr: bool,

        /// JSON file bound as `data`
        #[arg(long, value_name = "FILE")]
        data: Option<PathBuf>,

        /// Grant a capability (repeatable). Omit to use the configured defaults.
        #[arg(long, value_name = "CAP")]
        allow: Vec<String>,

        /// Override the sandbox timeout
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Print the ExecutionResult as JSON instead of human output
        #[arg(long)]
        json: bool,
    },

    /// Show the effective settings
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let result = match cli.command {
        None => {
            // No subcommand = show help
            eprintln!("Usage: sbx <command> [options]");
            eprintln!("       sbx --help for more information");
            Ok(())
        }
        Some(Commands::Run { input, pretty }) => {
            load_settings(cli.config.as_deref()).and_then(|settings| cmd_run(settings, input, pretty))
        }
        Some(Commands::Eval {
            code,
            expr,
            data,
            allow,
            timeout_ms,
            json,
        }) => load_settings(cli.config.as_deref())
            .and_then(|settings| cmd_eval(settings, code, expr, data, allow, timeout_ms, json)),
        Some(Commands::Config { json }) => {
            load_settings(cli.config.as_deref()).and_then(|settings| cmd_config(&settings, cli.config.as_deref(), json))
        }
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { code: EXIT_IO, message: msg.into(), hint: None }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self { code: EXIT_PARSE, message: msg.into(), hint: None }
    }

    /// The snippet failed. Output has already been printed, so no message.
    pub fn snippet_failed(result: &ExecutionResult) -> Self {
        Self { code: result_exit_code(result), message: String::new(), hint: None }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

// ============================================================================
// Settings
// ============================================================================

fn load_settings(path: Option<&Path>) -> Result<Settings, CliError> {
    match path {
        Some(path) => {
            let mut settings = Settings::load_from(path).map_err(|e| {
                CliError::usage(e).with_hint("fix the settings file or drop --config to use defaults")
            })?;
            settings.apply_env();
            Ok(settings)
        }
        None => Ok(Settings::load()),
    }
}

// ============================================================================
// run
// ============================================================================

fn cmd_run(settings: Settings, input: Option<PathBuf>, pretty: bool) -> Result<(), CliError> {
    let text = match input.as_deref() {
        Some(path) if path != Path::new("-") => fs::read_to_string(path)
            .map_err(|e| CliError::io(format!("cannot read {}: {}", path.display(), e)))?,
        _ => {
            if input.is_none() && atty::is(atty::Stream::Stdin) {
                return Err(CliError::usage("no request given")
                    .with_hint("pass a request file, or pipe JSON into `sbx run -`"));
            }
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| CliError::io(format!("cannot read stdin: {}", e)))?;
            buf
        }
    };

    let request: ExecutionRequest = serde_json::from_str(&text)
        .map_err(|e| CliError::parse(format!("invalid request: {}", e)))?;

    let engine = Engine::new(settings);
    let result = engine.execute(&request);

    let rendered = if pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    }
    .map_err(|e| CliError::io(e.to_string()))?;
    write_stdout(&rendered)?;

    if result.is_success() {
        Ok(())
    } else {
        Err(CliError::snippet_failed(&result))
    }
}

// ============================================================================
// eval
// ============================================================================

fn cmd_eval(
    mut settings: Settings,
    code: String,
    expr: bool,
    data: Option<PathBuf>,
    allow: Vec<String>,
    timeout_ms: Option<u64>,
    json: bool,
) -> Result<(), CliError> {
    if let Some(ms) = timeout_ms {
        if ms == 0 {
            return Err(CliError::usage("--timeout-ms must be greater than 0"));
        }
        settings.sandbox.timeout_ms = ms;
    }

    let data_context = match data {
        Some(path) => {
            let text = fs::read_to_string(&path)
                .map_err(|e| CliError::io(format!("cannot read {}: {}", path.display(), e)))?;
            serde_json::from_str(&text)
                .map_err(|e| CliError::parse(format!("{} is not valid JSON: {}", path.display(), e)))?
        }
        None => serde_json::Value::Null,
    };

    let mut request = if expr {
        ExecutionRequest::expression(code)
    } else {
        ExecutionRequest::statements(code)
    }
    .with_data(data_context);

    if !allow.is_empty() {
        for name in &allow {
            if Capability::known(name).is_none() {
                log::warn!("unknown capability '{}' will not be granted", name);
            }
        }
        request = request.with_capabilities(allow.iter().map(|name| Capability::from_name(name)));
    }

    let engine = Engine::new(settings);
    let execution = engine.execute_detailed(&request, None);
    log::debug!("eval finished in {:?}", execution.elapsed);
    let result = execution.result;

    if json {
        let rendered = serde_json::to_string(&result).map_err(|e| CliError::io(e.to_string()))?;
        write_stdout(&rendered)?;
    } else {
        print_human(&result, execution.elapsed)?;
    }

    if result.is_success() {
        Ok(())
    } else {
        Err(CliError::snippet_failed(&result))
    }
}

fn print_human(result: &ExecutionResult, elapsed: Duration) -> Result<(), CliError> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let (lines, error) = if result.is_success() {
        (&result.log[..], None)
    } else {
        match result.log.split_last() {
            Some((last, rest)) => (rest, Some(last)),
            None => (&result.log[..], None),
        }
    };

    for line in lines {
        writeln!(out, "{}", line).map_err(|e| CliError::io(e.to_string()))?;
    }
    if let Some(value) = &result.value {
        writeln!(out, "=> {}", value).map_err(|e| CliError::io(e.to_string()))?;
    }
    if result.dropped_log_entries > 0 {
        eprintln!("({} log entries could not be serialized)", result.dropped_log_entries);
    }
    if let Some(error) = error {
        eprintln!("error: {}", error);
    }
    log::info!("ran in {}ms", elapsed.as_millis());
    Ok(())
}

// ============================================================================
// config
// ============================================================================

fn cmd_config(settings: &Settings, explicit: Option<&Path>, json: bool) -> Result<(), CliError> {
    let path = match explicit {
        Some(path) => path.display().to_string(),
        None => Settings::config_path_display(),
    };

    if json {
        let value = serde_json::json!({
            "path": path,
            "settings": settings,
        });
        let rendered = serde_json::to_string(&value).map_err(|e| CliError::io(e.to_string()))?;
        return write_stdout(&rendered);
    }

    let text = toml::to_string_pretty(settings).map_err(|e| CliError::io(e.to_string()))?;
    write_stdout(&format!("# {}\n{}", path, text.trim_end()))
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", text).map_err(|e| CliError::io(e.to_string()))
}

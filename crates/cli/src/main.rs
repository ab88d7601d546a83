use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::fs;
use std::io::Read;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use toml::Value;
use tracing_subscriber::EnvFilter;
use wrapkit_core::logging::logged;
use wrapkit_core::memo::Memoized;
use wrapkit_core::retry::Retry;
#[cfg(feature = "sqlite")]
use wrapkit_core::scoped::with_database;
use wrapkit_core::scoped::{with_file, OpenMode};
#[cfg(feature = "http")]
use wrapkit_core::session::{fetch_text, Connector, HttpConnector, SessionError};
use wrapkit_core::types::{AppConfig, JsonEnvelope};

#[derive(Debug, Parser)]
#[command(
    name = "wrapkit",
    version,
    about = "Runs the scoped-resource and function-wrapper demonstrations"
)]
struct Cli {
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    InitConfig {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Insert a note inside a transaction; `--fail` forces a rollback.
    #[cfg(feature = "sqlite")]
    Db {
        #[arg(long, default_value = "wrapkit-demo.db")]
        path: PathBuf,
        #[arg(long, default_value = "hello from a scoped transaction")]
        note: String,
        #[arg(long, default_value_t = false)]
        fail: bool,
    },
    /// Write `--text` to a file, or print it when opened for reading.
    File {
        path: PathBuf,
        #[arg(long, default_value = "r")]
        mode: String,
        #[arg(long)]
        text: Option<String>,
    },
    /// Fetch the current weather for a city through a scoped session.
    #[cfg(feature = "http")]
    Fetch {
        city: String,
        #[arg(long)]
        endpoint: Option<String>,
    },
    /// Retry a callable that fails `--fail-times` times before succeeding.
    Retry {
        #[arg(long)]
        tries: Option<u32>,
        #[arg(long = "delay-ms")]
        delay_ms: Option<u64>,
        #[arg(long = "fail-times", default_value_t = 2)]
        fail_times: u32,
    },
    /// Call a slow async function through the logging wrapper.
    Log {
        #[arg(default_value_t = 21)]
        value: i64,
    },
    /// Call a slow function repeatedly through the memoizing wrapper.
    Memo {
        #[arg(default_value_t = 1_000_000)]
        n: u64,
        #[arg(long, default_value_t = 3)]
        repeat: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::InitConfig { force } = cli.cmd {
        init_config_file(Path::new(".wrapkit.toml"), force)?;
        println!("initialized .wrapkit.toml");
        return Ok(());
    }

    let cfg = load_config()?;
    init_tracing(&cfg.logging.filter);

    match cli.cmd {
        Commands::InitConfig { .. } => {}
        #[cfg(feature = "sqlite")]
        Commands::Db { path, note, fail } => run_db_demo(&path, &note, fail, cli.json)?,
        Commands::File { path, mode, text } => run_file_demo(&path, &mode, text, cli.json)?,
        #[cfg(feature = "http")]
        Commands::Fetch { city, endpoint } => {
            run_fetch_demo(&cfg, &city, endpoint, cli.json).await?
        }
        Commands::Retry {
            tries,
            delay_ms,
            fail_times,
        } => {
            let policy = Retry::new(
                tries.unwrap_or(cfg.retry.tries),
                Duration::from_millis(delay_ms.unwrap_or(cfg.retry.delay_ms)),
            );
            run_retry_demo(policy, fail_times, cli.json)?;
        }
        Commands::Log { value } => run_log_demo(value, cli.json).await?,
        Commands::Memo { n, repeat } => run_memo_demo(&cfg, n, repeat, cli.json)?,
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[cfg(feature = "sqlite")]
fn run_db_demo(path: &Path, note: &str, fail: bool, json_output: bool) -> anyhow::Result<()> {
    let outcome = with_database::<_, anyhow::Error, _>(path, |conn| {
        ensure_notes_table(conn)?;
        conn.execute("INSERT INTO notes (body) VALUES (?1)", [note])?;
        if fail {
            anyhow::bail!("simulated failure after insert");
        }
        Ok(())
    });

    let count = with_database::<i64, anyhow::Error, _>(path, |conn| {
        ensure_notes_table(conn)?;
        Ok(conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?)
    })?;

    let (status, message) = match &outcome {
        Ok(()) => {
            tracing::info!(path = %path.display(), notes = count, "transaction committed");
            ("ok", "transaction committed")
        }
        Err(err) => {
            tracing::error!(path = %path.display(), error = %err, "transaction rolled back");
            ("error", "transaction rolled back")
        }
    };
    report(
        json_output,
        status,
        "db",
        message,
        json!({"path": path, "notes": count}),
    )?;
    outcome.context("database demo failed")
}

#[cfg(feature = "sqlite")]
fn ensure_notes_table(conn: &wrapkit_core::rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS notes (id INTEGER PRIMARY KEY, body TEXT NOT NULL)",
        [],
    )?;
    Ok(())
}

fn run_file_demo(
    path: &Path,
    mode: &str,
    text: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let parsed: OpenMode = mode.parse()?;
    let content = with_file::<_, anyhow::Error, _>(path, mode, |file| {
        if parsed.is_writable() {
            let text = text.unwrap_or_default();
            writeln!(file, "{text}")?;
            Ok(text)
        } else {
            let mut content = String::new();
            file.read_to_string(&mut content)?;
            Ok(content)
        }
    })?;

    if json_output {
        report(
            true,
            "ok",
            "file",
            "file closed",
            json!({"path": path, "mode": mode, "content": content}),
        )
    } else {
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
        Ok(())
    }
}

#[cfg(feature = "http")]
async fn run_fetch_demo(
    cfg: &AppConfig,
    city: &str,
    endpoint: Option<String>,
    json_output: bool,
) -> anyhow::Result<()> {
    let template = endpoint.unwrap_or_else(|| cfg.session.weather_endpoint.clone());
    let url = weather_url(&template, city);
    let connector = HttpConnector::from_config(&cfg.session);
    let policy = Retry::from(&cfg.retry);

    let body = fetch_weather(&connector, &url, policy)
        .await
        .map_err(render_session_error)?;
    tracing::info!(city, url = %url, "weather fetched");

    report(
        json_output,
        "ok",
        "fetch",
        body.trim(),
        json!({"city": city, "url": url}),
    )
}

/// Retries only failures that can change on a second attempt; a bad URL or a
/// 4xx status is returned after the first try.
#[cfg(feature = "http")]
async fn fetch_weather<C: Connector>(
    connector: &C,
    url: &str,
    policy: Retry,
) -> Result<String, SessionError> {
    policy
        .call_async(move || async move {
            match fetch_text(connector, url).await {
                Err(err) if !err.is_transient() => Ok(Err(err)),
                other => other.map(Ok),
            }
        })
        .await
        .and_then(|outcome| outcome)
}

#[cfg(feature = "http")]
fn weather_url(template: &str, city: &str) -> String {
    template.replace("{city}", city.trim())
}

fn run_retry_demo(policy: Retry, fail_times: u32, json_output: bool) -> anyhow::Result<()> {
    let mut attempts = 0u32;
    let outcome = policy.call(|| {
        attempts += 1;
        if attempts <= fail_times {
            Err(anyhow::anyhow!("simulated failure on attempt {attempts}"))
        } else {
            Ok(attempts)
        }
    });

    match outcome {
        Ok(attempt) => {
            tracing::info!(attempt, tries = policy.tries(), "retry demo succeeded");
            report(
                json_output,
                "ok",
                "retry",
                &format!("succeeded on attempt {attempt}"),
                json!({"attempts": attempts, "tries": policy.tries()}),
            )
        }
        Err(err) => {
            tracing::error!(attempts, tries = policy.tries(), error = %err, "retry demo gave up");
            report(
                json_output,
                "error",
                "retry",
                &err.to_string(),
                json!({"attempts": attempts, "tries": policy.tries()}),
            )?;
            Err(err.context(format!("gave up after {attempts} attempts")))
        }
    }
}

async fn run_log_demo(value: i64, json_output: bool) -> anyhow::Result<()> {
    let slow_double = logged("slow_double", |n: i64| async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        n * 2
    });
    let result = slow_double.call(value).await;
    report(
        json_output,
        "ok",
        "log",
        &format!("{} returned {result}", slow_double.name()),
        json!({"input": value, "result": result}),
    )
}

fn run_memo_demo(cfg: &AppConfig, n: u64, repeat: usize, json_output: bool) -> anyhow::Result<()> {
    let expensive = |n: u64| -> u64 {
        std::thread::sleep(Duration::from_millis(200));
        (1..=n).map(|k| k % 7).sum()
    };
    let mut cached = if cfg.memo.unbounded {
        Memoized::unbounded(expensive)
    } else {
        Memoized::with_capacity(expensive, cfg.memo.capacity)
    };

    let mut timings = Vec::with_capacity(repeat);
    let mut value = 0;
    for _ in 0..repeat.max(1) {
        let started = Instant::now();
        value = cached.call(n);
        timings.push(started.elapsed().as_millis() as u64);
    }

    if !json_output {
        for (idx, ms) in timings.iter().enumerate() {
            println!("call {}: {value} in {ms}ms", idx + 1);
        }
    }
    let stats = cached.stats();
    report(
        json_output,
        "ok",
        "memo",
        &format!("{} hits, {} misses", stats.hits, stats.misses),
        json!({"n": n, "value": value, "timings_ms": timings}),
    )
}

fn report(
    json_output: bool,
    status: &str,
    phase: &str,
    message: &str,
    details: serde_json::Value,
) -> anyhow::Result<()> {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&JsonEnvelope {
                status: status.to_string(),
                phase: phase.to_string(),
                message: message.to_string(),
                details,
            })?
        );
    } else {
        println!("{message}");
    }
    std::io::stdout().flush()?;
    Ok(())
}

fn load_config() -> anyhow::Result<AppConfig> {
    let local_path = PathBuf::from(".wrapkit.toml");
    let home_path = std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".wrapkit.toml"));

    let home = match &home_path {
        Some(path) => read_config_value(path)?,
        None => None,
    };
    let local = read_config_value(&local_path)?;

    resolve_config(home, local, |k| std::env::var(k).ok())
}

fn resolve_config<F>(
    home: Option<Value>,
    local: Option<Value>,
    env_get: F,
) -> anyhow::Result<AppConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = Value::try_from(AppConfig::default())?;
    if let Some(home_value) = home {
        merge_toml(&mut merged, home_value);
    }
    if let Some(local_value) = local {
        merge_toml(&mut merged, local_value);
    }

    let mut cfg: AppConfig = merged.try_into()?;
    apply_env_overrides(&mut cfg, env_get);
    Ok(cfg)
}

fn read_config_value(path: &Path) -> anyhow::Result<Option<Value>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let parsed = raw
        .parse::<Value>()
        .with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(Some(parsed))
}

fn merge_toml(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_map), Value::Table(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(&key) {
                    merge_toml(base_value, value);
                } else {
                    base_map.insert(key, value);
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value;
        }
    }
}

fn apply_env_overrides<F>(cfg: &mut AppConfig, env_get: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = env_get("WRAPKIT_RETRY_TRIES").and_then(|v| v.parse::<u32>().ok()) {
        cfg.retry.tries = v;
    }
    if let Some(v) = env_get("WRAPKIT_RETRY_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.retry.delay_ms = v;
    }

    if let Some(v) = env_get("WRAPKIT_WEATHER_ENDPOINT") {
        cfg.session.weather_endpoint = v;
    }
    if let Some(v) = env_get("WRAPKIT_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        cfg.session.timeout_ms = v;
    }
    if let Some(v) = env_get("WRAPKIT_USER_AGENT") {
        cfg.session.user_agent = v;
    }

    if let Some(v) = env_get("WRAPKIT_MEMO_CAPACITY").and_then(|v| v.parse::<usize>().ok()) {
        cfg.memo.capacity = v;
    }
    if let Some(v) = env_get("WRAPKIT_MEMO_UNBOUNDED").and_then(|v| parse_bool(&v)) {
        cfg.memo.unbounded = v;
    }

    if let Some(v) = env_get("WRAPKIT_LOG") {
        cfg.logging.filter = v;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

fn init_config_file(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; re-run with --force to overwrite",
            path.display()
        );
    }
    fs::write(path, config_template())?;
    Ok(())
}

fn config_template() -> &'static str {
    r#"# wrapkit configuration
# precedence: CLI > env > local .wrapkit.toml > home ~/.wrapkit.toml > defaults

[retry]
tries = 3
delay_ms = 1000

[session]
# `{city}` is replaced by the requested location
weather_endpoint = "https://wttr.in/{city}?format=3"
timeout_ms = 10000
user_agent = "wrapkit"

[memo]
capacity = 1024
unbounded = false

[logging]
# used when RUST_LOG is unset
filter = "info"
"#
}

#[cfg(feature = "http")]
fn render_session_error(err: SessionError) -> anyhow::Error {
    match err {
        SessionError::Status { url, status: 404 } => {
            anyhow::anyhow!("no weather found at {url}; check the city name")
        }
        other => anyhow::anyhow!(other),
    }
}

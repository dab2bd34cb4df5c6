use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use qmpctl::endpoint::{self, DEFAULT_ENDPOINT};
use qmpctl::{AsyncSession, Event, QmpError, Session};
use serde_json::Value;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "qmpctl")]
#[command(about = "Send commands to a QEMU monitor and watch its events")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a QMP command and print its result
    Exec {
        /// Command name (e.g., query-status, stop, cont)
        command: String,

        /// Command arguments as a JSON object
        #[arg(long)]
        args: Option<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "json")]
        format: OutputFormat,

        /// Monitor address: host:port or socket path
        #[arg(long, env = "QMPCTL_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Run a human monitor (HMP) command line
    Hmp {
        /// Command line, e.g. "info block"
        command_line: String,

        /// Monitor address: host:port or socket path
        #[arg(long, env = "QMPCTL_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Print events emitted by the monitor
    Events {
        /// Keep waiting for new events instead of printing only pending ones
        #[arg(long)]
        wait: bool,

        /// Stop waiting after this many seconds without an event
        #[arg(long)]
        timeout: Option<u64>,

        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,

        /// Monitor address: host:port or socket path
        #[arg(long, env = "QMPCTL_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
    },

    /// Wait for a monitor to connect to us, then print its events
    Listen {
        /// Address to listen on: host:port or socket path
        #[arg(long, env = "QMPCTL_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
        endpoint: String,

        /// Stop after this many events
        #[arg(long)]
        count: Option<usize>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "qmpctl=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn parse_arguments(args: Option<&str>) -> Result<Option<Value>> {
    let Some(args) = args else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    if !value.is_object() {
        return Err(anyhow!("--args must be a JSON object"));
    }
    Ok(Some(value))
}

fn print_value(value: &Value, format: OutputFormat) -> Result<()> {
    match (format, value) {
        (OutputFormat::Text, Value::String(text)) => print!("{text}"),
        _ => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn format_event(event: &Event, format: OutputFormat) -> Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string(event)?,
        OutputFormat::Text => {
            let when = event
                .timestamp
                .and_then(|ts| ts.to_jiff())
                .map(|ts| ts.to_string())
                .unwrap_or_else(|| "-".to_string());
            match &event.data {
                Some(data) => format!("{when} {} {data}", event.name),
                None => format!("{when} {}", event.name),
            }
        }
    })
}

fn print_event(event: &Event, format: OutputFormat) -> Result<()> {
    println!("{}", format_event(event, format)?);
    Ok(())
}

async fn exec(
    endpoint: &str,
    command: &str,
    args: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let arguments = parse_arguments(args)?;
    let mut session = AsyncSession::connect(&endpoint::expand(endpoint))
        .await
        .with_context(|| format!("Failed to connect to monitor at {endpoint}"))?;

    let result = session.execute(command, arguments).await;
    session.close().await;

    match result {
        Ok(value) => print_value(&value, format),
        Err(QmpError::Command { class, desc }) => {
            Err(anyhow!("{command} failed ({class}): {desc}"))
        }
        Err(e) => Err(e.into()),
    }
}

async fn hmp(endpoint: &str, command_line: &str) -> Result<()> {
    let mut session = AsyncSession::connect(&endpoint::expand(endpoint))
        .await
        .with_context(|| format!("Failed to connect to monitor at {endpoint}"))?;

    let output = session.human_monitor_command(command_line).await;
    session.close().await;
    print!("{}", output?);
    Ok(())
}

async fn events(
    endpoint: &str,
    wait: bool,
    timeout: Option<u64>,
    count: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let mut session = AsyncSession::connect(&endpoint::expand(endpoint))
        .await
        .with_context(|| format!("Failed to connect to monitor at {endpoint}"))?;
    let timeout = timeout.map(Duration::from_secs);
    let mut printed = 0;

    while count.is_none_or(|limit| printed < limit) {
        let next = if wait {
            session.next_event(timeout).await.map(Some)
        } else {
            session.try_event().await
        };

        match next {
            Ok(Some(event)) => {
                print_event(&event, format)?;
                printed += 1;
            }
            Ok(None) => break,
            Err(QmpError::Timeout) => {
                tracing::info!("No event within {}s", timeout.unwrap_or_default().as_secs());
                break;
            }
            Err(QmpError::ConnectionClosed) => {
                tracing::info!("Monitor closed the connection");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    session.close().await;
    Ok(())
}

fn listen(endpoint: &str, count: Option<usize>, format: OutputFormat) -> Result<()> {
    let endpoint = qmpctl::resolve(&endpoint::expand(endpoint))?;
    tracing::info!("Waiting for a monitor to connect on {endpoint}");

    let mut session = Session::accept(endpoint)?;
    session.negotiate()?;
    if let Some(version) = session.greeting().and_then(|g| g.version()) {
        tracing::info!(
            "Monitor connected: QEMU {}.{}.{}",
            version.major,
            version.minor,
            version.micro
        );
    }

    let mut printed = 0;
    while count.is_none_or(|limit| printed < limit) {
        match session.next_event(None) {
            Ok(event) => {
                print_event(&event, format)?;
                printed += 1;
            }
            Err(QmpError::ConnectionClosed) => {
                tracing::info!("Monitor closed the connection");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    session.close();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Exec {
            command,
            args,
            format,
            endpoint,
        } => exec(&endpoint, &command, args.as_deref(), format).await,

        Commands::Hmp {
            command_line,
            endpoint,
        } => hmp(&endpoint, &command_line).await,

        Commands::Events {
            wait,
            timeout,
            count,
            format,
            endpoint,
        } => events(&endpoint, wait, timeout, count, format).await,

        Commands::Listen {
            endpoint,
            count,
            format,
        } => tokio::task::spawn_blocking(move || listen(&endpoint, count, format))
            .await
            .context("Listener task panicked")?,
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

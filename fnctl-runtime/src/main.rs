// you don't want your function gateway to randomly crash
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use {
    std::{path::PathBuf, process::exit, sync::Arc},
    tracing::{Level, info, warn},
    tracing_subscriber::FmtSubscriber,
    clap::{Parser, Subcommand},
    anyhow::{Context as _, anyhow},
    futures::StreamExt,
    fnctl_core::Event,
    fnctl_runtime::{Gateway, InvocationLogEntry, ServerConfig, StoreError},
};

#[derive(Parser, Debug)]
#[command(version, about = "Minimal self-hosted function runtime")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Directory holding `functions/` and `logs/`. Overrides `home` from `--config`, which in turn
    /// overrides `$FNCTL_HOME`. Defaults to `~/.fnctl`.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve functions over HTTP at `/fn/<name>`.
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        port: Option<u16>,

        /// Disable the access log.
        #[arg(long)]
        quiet: bool,

        /// YAML server config. Its `home` wins over `$FNCTL_HOME` but not over `--home`.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Invoke a function once without starting the server.
    Invoke {
        name: String,

        #[arg(long, default_value = "GET")]
        method: String,

        /// Query parameter as `key=value`, may be repeated.
        #[arg(long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,

        #[arg(long, default_value = "")]
        body: String,
    },

    List,

    /// Print invocation log entries.
    Logs {
        name: String,

        #[arg(short, long)]
        follow: bool,
    },

    EnableLogs {
        name: String,
    },

    DisableLogs {
        name: String,
    },

    /// Remove a function. Its route responds 404 afterwards.
    Destroy {
        name: String,

        #[arg(long)]
        purge_logs: bool,
    },
}

#[tokio::main]
async fn main() {
    FmtSubscriber::builder().with_max_level(Level::INFO).init();
    let args = Args::parse();

    if let Err(err) = run_command(args).await {
        eprintln!("error: {err:#}");
        exit(1);
    }
}

async fn run_command(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Serve { host, port, quiet, config } => {
            if let Some(path) = &config {
                info!("loading config from {path:?}");
            }
            let mut server_config = ServerConfig::resolve(config.as_deref(), args.home)?;
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            if quiet {
                server_config = server_config.with_quiet(true);
            }

            info!("serving functions from {:?}", server_config.functions_dir());
            let gateway = Arc::new(Gateway::new(&server_config)?);
            gateway.run(&server_config.host, server_config.port).await
                .with_context(|| format!("failed to serve on {}:{}", server_config.host, server_config.port))?;
        },

        Command::Invoke { name, method, query, body } => {
            let gateway = Gateway::new(&config_for(args.home))?.with_quiet(true);
            let event = query.into_iter()
                .fold(Event::new(method.to_uppercase(), format!("/fn/{name}")), |event, (key, value)| event.with_query(key, value))
                .with_body(body);

            let response = gateway.invoke_function(&name, event).await;
            println!("{}", response.status);
            for (header, value) in &response.headers {
                println!("{header}: {value}");
            }
            println!();
            println!("{}", String::from_utf8_lossy(&response.body));

            if !response.status.is_success() {
                exit(1);
            }
        },

        Command::List => {
            let gateway = Gateway::new(&config_for(args.home))?;
            let records = gateway.store().list().await.context("failed to list functions")?;
            if records.is_empty() {
                println!("no functions in {:?}", gateway.store().functions_dir());
            }
            for record in records {
                println!(
                    "{:<24} {:<8} logging {}",
                    record.name,
                    record.kind_name(),
                    if record.logging_enabled { "on" } else { "off" },
                );
            }
        },

        Command::Logs { name, follow } => {
            let gateway = Gateway::new(&config_for(args.home))?;
            let mut entries = Box::pin(gateway.logger().tail(&name, follow));
            while let Some(entry) = entries.next().await {
                match entry {
                    Ok(entry) => println!("{}", format_log_entry(&entry)),
                    Err(err) => warn!("skipping log line: {err}"),
                }
            }
        },

        Command::EnableLogs { name } => set_logging(args.home, &name, true).await?,
        Command::DisableLogs { name } => set_logging(args.home, &name, false).await?,

        Command::Destroy { name, purge_logs } => {
            let gateway = Gateway::new(&config_for(args.home))?;
            match gateway.store().remove(&name).await {
                Ok(()) => println!("destroyed {name}"),
                Err(StoreError::NotFound { .. }) => return Err(anyhow!("function {name:?} does not exist")),
                Err(err) => return Err(err.into()),
            }
            if purge_logs {
                gateway.logger().purge(&name).await?;
                println!("purged logs of {name}");
            }
        },
    }

    Ok(())
}

fn config_for(home: Option<PathBuf>) -> ServerConfig {
    match home {
        Some(home) => ServerConfig::new(home),
        None => ServerConfig::default(),
    }
}

async fn set_logging(home: Option<PathBuf>, name: &str, enabled: bool) -> anyhow::Result<()> {
    let gateway = Gateway::new(&config_for(home))?;
    gateway.store().set_logging(name, enabled).await?;
    println!("logging for {name} is {}", if enabled { "on" } else { "off" });
    Ok(())
}

fn format_log_entry(entry: &InvocationLogEntry) -> String {
    let mut line = format!(
        "{} {} {} {} {} {}ms",
        entry.timestamp.to_rfc3339(),
        entry.invocation_id,
        entry.method,
        entry.path,
        entry.status,
        entry.duration_ms,
    );
    if let Some(error) = &entry.error {
        line.push_str(&format!(" error: {error}"));
    }
    line
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_owned(), value.to_owned()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

//! qwire - command-line client
//!
//! Runs one-shot requests against a node or streams watch events.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use qwire_client::{
    Client, ConnectionConfig, Credentials, DisconnectReason, Endpoint, TlsClientConfig,
    DEFAULT_SCOPE,
};
use qwire_protocol::DEFAULT_PORT;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qwire")]
#[command(about = "Command-line client for qwire nodes")]
#[command(version)]
struct Cli {
    /// Node address (host, host:port or [v6]:port)
    #[arg(short, long, default_value = "127.0.0.1:9200", env = "QWIRE_SERVER")]
    server: String,

    /// Spawn this command and talk to it over stdin/stdout instead of TCP
    #[arg(long, env = "QWIRE_PIPE")]
    pipe: Option<String>,

    /// Authentication token
    #[arg(short = 't', long, env = "QWIRE_TOKEN")]
    token: Option<String>,

    /// Username (requires --password)
    #[arg(short, long, env = "QWIRE_USER", requires = "password")]
    user: Option<String>,

    /// Password
    #[arg(short, long, env = "QWIRE_PASSWORD", requires = "user")]
    password: Option<String>,

    /// Default scope (`name`, `:name` and `@:name` are equivalent)
    #[arg(long, default_value = DEFAULT_SCOPE, env = "QWIRE_SCOPE")]
    scope: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "30", env = "QWIRE_TIMEOUT")]
    timeout: u64,

    // ===== TLS Options =====
    /// Enable TLS connection
    #[arg(long, env = "QWIRE_TLS")]
    tls: bool,

    /// Path to CA certificate for server verification
    #[arg(long, env = "QWIRE_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Path to client certificate (for mTLS)
    #[arg(long, env = "QWIRE_CLIENT_CERT")]
    client_cert: Option<PathBuf>,

    /// Path to client private key (for mTLS)
    #[arg(long, env = "QWIRE_CLIENT_KEY")]
    client_key: Option<PathBuf>,

    /// Skip server certificate verification (INSECURE)
    #[arg(long, short = 'k')]
    insecure: bool,

    /// Server name for TLS SNI (defaults to server hostname)
    #[arg(long)]
    server_name: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Ping the node
    Ping,

    /// Run a query in the default scope
    Query {
        /// Query code
        code: String,

        /// Variables as a JSON object (or @file.json to read from file)
        #[arg(long)]
        vars: Option<String>,
    },

    /// Call a stored procedure
    Run {
        /// Procedure name
        procedure: String,

        /// Arguments, one JSON value each
        args: Vec<String>,
    },

    /// Watch ids in the default scope and print events until Ctrl+C
    Watch {
        /// Ids to watch (none watches the scope itself)
        ids: Vec<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let endpoint = match cli.pipe {
        Some(ref command) => commands::parse_pipe(command)?,
        None => Endpoint::parse_tcp(&cli.server, DEFAULT_PORT)
            .ok_or_else(|| format!("invalid server address: {}", cli.server))?,
    };

    let tls = tls_config(&cli).unwrap_or_else(|msg| {
        eprintln!("{}: {}", "Error".red(), msg);
        std::process::exit(1);
    });

    let mut config =
        ConnectionConfig::new(endpoint).with_request_timeout(Duration::from_secs(cli.timeout));
    match (cli.token, cli.user, cli.password) {
        (Some(token), _, _) => config = config.with_auth(Credentials::Token(token)),
        (None, Some(user), Some(password)) => {
            config = config.with_auth(Credentials::Password(user, password))
        }
        _ => {}
    }
    if let Some(tls) = tls {
        config = config.with_tls(tls);
    }

    let client = Client::new(config);
    client.use_scope(&cli.scope);

    client.connect().await.map_err(|e| {
        eprintln!("{}: {}", "Connection failed".red(), e);
        e
    })?;
    tracing::debug!("Connected to {}", client.connection_info());

    match cli.command {
        Commands::Watch { ids } => watch(&client, ids).await?,
        cmd => match commands::execute(&client, cmd).await {
            Ok(output) => {
                println!("{}", output);
            }
            Err(e) => {
                eprintln!("{}: {}", "Error".red(), e);
                client.close().await?;
                std::process::exit(1);
            }
        },
    }

    client.close().await?;
    Ok(())
}

/// Builds the TLS config if any TLS option is set.
fn tls_config(cli: &Cli) -> Result<Option<TlsClientConfig>, String> {
    let wants_tls = cli.tls
        || cli.ca_cert.is_some()
        || cli.client_cert.is_some()
        || cli.client_key.is_some()
        || cli.insecure
        || cli.server_name.is_some();
    if !wants_tls {
        return Ok(None);
    }

    let mut tls = TlsClientConfig::new();
    if let Some(ref path) = cli.ca_cert {
        tls = tls.with_ca_cert(path);
    }
    match (&cli.client_cert, &cli.client_key) {
        (Some(cert), Some(key)) => tls = tls.with_client_cert(cert, key),
        (None, None) => {}
        _ => return Err("--client-cert and --client-key must be used together".to_string()),
    }
    if cli.insecure {
        tls = tls.with_insecure();
    }
    if let Some(ref name) = cli.server_name {
        tls = tls.with_server_name(name);
    }

    Ok(Some(tls))
}

/// Streams events until Ctrl+C or until the connection is lost.
async fn watch(client: &Client, ids: Vec<u64>) -> Result<(), Box<dyn std::error::Error>> {
    // Subscribe before watching so no event is missed
    let mut event_rx = client.subscribe_events();
    let mut disconnect_rx = client.subscribe_disconnects();

    if let Err(e) = client.watch(None, &ids).await {
        eprintln!("{}: {}", "Error".red(), e);
        client.close().await?;
        std::process::exit(1);
    }

    eprintln!(
        "{} {} in {}",
        "Watching".green(),
        if ids.is_empty() {
            "scope".to_string()
        } else {
            format!("{:?}", ids).cyan().to_string()
        },
        client.scope().cyan()
    );
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Ok(e) => println!("{}", commands::format_event(&e)),
                    Err(RecvError::Lagged(n)) => {
                        eprintln!("{}: lagged {} events", "Warning".yellow(), n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            notice = disconnect_rx.recv() => {
                match notice.ok().map(|n| n.reason) {
                    Some(DisconnectReason::Failed(err)) => {
                        eprintln!("{}: {}", "Connection lost".red(), err);
                    }
                    _ => eprintln!("{}", "Connection closed".red()),
                }
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                let _ = client.unwatch(None, &ids).await;
                break;
            }
        }
    }

    Ok(())
}

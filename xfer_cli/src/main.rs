use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use xfer_core::{Client, ClientConfig, ClientRequest, Server, ServerConfig, ServerEvent};

#[derive(Parser)]
#[command(name = "xfer", version, about = "Minimal TCP file transfer")]
struct Cli {
    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files from a storage directory
    Server(ServerArgs),
    /// Connect to a server and run commands read from stdin
    Client(ClientArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// JSON config file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    address: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    storage: Option<PathBuf>,
    #[arg(long)]
    max_connections: Option<usize>,
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    address: Option<IpAddr>,
    #[arg(long)]
    port: Option<u16>,
    /// Where downloaded files are written
    #[arg(long)]
    download_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // 0. Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Mode::Server(args) => run_server(args).await,
        Mode::Client(args) => run_client(args).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let mut config = ServerConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(storage) = args.storage {
        config.storage_dir = storage;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }

    let (event_tx, mut event_rx) = mpsc::channel::<ServerEvent>(1000);
    let server = Server::bind(config)
        .await
        .context("Failed to start server")?
        .with_events(event_tx);

    // Events are already logged by the library; keep the channel drained
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            tracing::debug!("Server event: {:?}", event);
        }
    });

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received, shutting down");
            signal_token.cancel();
        }
    });

    server.run_until(shutdown).await?;
    Ok(())
}

async fn run_client(args: ClientArgs) -> Result<()> {
    let mut config = ClientConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }

    let mut client = Client::connect(&config)
        .await
        .with_context(|| format!("Failed to connect to {}", config.socket_addr()))?;

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        stdout
            .write_all(b"upload <path> | download <name> | quit > ")
            .await?;
        stdout.flush().await?;

        // EOF on stdin behaves like quit
        let Some(line) = lines.next_line().await? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request = match ClientRequest::parse(&line) {
            Some(request) => request,
            None => {
                eprintln!("Unrecognized command: {}", line.trim());
                continue;
            }
        };

        let outcome = match request {
            ClientRequest::Upload(path) => client
                .upload(&path)
                .await
                .map(|size| format!("Uploaded {} ({} bytes)", path.display(), size)),
            ClientRequest::Download(name) => client
                .download(&name)
                .await
                .map(|path| format!("Saved {}", path.display())),
            ClientRequest::Quit => break,
        };

        match outcome {
            Ok(message) => println!("{}", message),
            Err(e) if e.is_fatal() => return Err(e).context("Connection lost"),
            Err(e) => eprintln!("{}", e),
        }
    }

    client.quit().await?;
    Ok(())
}

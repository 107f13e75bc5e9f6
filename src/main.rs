use clap::{Parser, Subcommand};
use daqplay::{compose, library, protocol, server};
use daqplay_engine::client::Client;
use daqplay_engine::error::EngineError;
use std::path::PathBuf;
use std::process::exit;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "daqplay")]
#[command(version, about = "Audio file playback through NI-DAQ analog outputs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control-socket server (the default when no command is given)
    Serve {
        #[arg(long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,
    },

    /// Print a file's metadata (rate, channels, chapters, cover art) as JSON
    Metadata {
        path: PathBuf,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Scan directories for playable audio files
    Scan {
        dir: PathBuf,
        /// How many directory levels to descend below the root
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },

    /// Assemble a chaptered FLAC from a YAML track list
    Compose {
        spec: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve {
        port: protocol::DEFAULT_PORT,
    }) {
        Commands::Serve { port } => run_server(port).await,
        Commands::Metadata { path, output } => run_metadata(&path, output.as_deref()),
        Commands::Scan { dir, depth } => run_scan(dir, depth),
        Commands::Compose { spec, output } => run_compose(&spec, &output),
    }
}

async fn run_server(port: u16) {
    let client = Client::default();
    let server = match server::Server::bind(client, port).await {
        Ok(server) => server,
        Err(e) => {
            error!("cannot bind control socket on port {}: {}", port, e);
            exit(1);
        }
    };
    server.serve().await;
}

fn run_metadata(path: &std::path::Path, output: Option<&std::path::Path>) {
    if !path.exists() {
        eprintln!("file not found: {}", path.display());
        exit(3);
    }
    let asset = match library::metadata::extract(path) {
        Ok(asset) => asset,
        Err(EngineError::Decoder(message)) => {
            eprintln!("unsupported codec: {}", message);
            exit(4);
        }
        Err(EngineError::Validation(message)) => {
            eprintln!("{}", message);
            exit(3);
        }
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let json = match serde_json::to_string_pretty(&asset) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("cannot serialize metadata: {}", e);
            exit(1);
        }
    };
    match output {
        Some(output) => {
            if let Err(e) = std::fs::write(output, json) {
                eprintln!("cannot write '{}': {}", output.display(), e);
                exit(1);
            }
        }
        None => println!("{}", json),
    }
}

fn run_scan(dir: PathBuf, depth: usize) {
    let result = library::discover(&[dir], depth);
    let listing = serde_json::json!({
        "audioFiles": result.paths,
        "libraryStats": result.stats,
    });
    match serde_json::to_string_pretty(&listing) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("cannot serialize scan result: {}", e);
            exit(1);
        }
    }
}

fn run_compose(spec: &std::path::Path, output: &std::path::Path) {
    match compose::compose(spec, output) {
        Ok(summary) => {
            println!(
                "{} tracks, {} frames at {} Hz -> {}",
                summary.chapters.len(),
                summary.total_frames,
                summary.sample_rate_hz,
                summary.output.display()
            );
        }
        Err(EngineError::Validation(message)) => {
            eprintln!("{}", message);
            exit(2);
        }
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    }
}

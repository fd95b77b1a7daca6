use clap::Parser;
use console::style;
use tracing::error;

use chatrelay_core::{RelayOptions, start_server};

#[derive(Parser, Debug)]
#[clap(
    name = "chatrelay",
    version,
    about = "Minimal real-time chat relay with bounded history and optional durable storage"
)]
struct Opts {
    /// Host to bind to
    #[clap(long, env = "HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[clap(long, short = 'p', env = "PORT", default_value_t = 5000)]
    port: u16,

    /// SQLite database URL. Omit to run memory-only.
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() {
    // Load .env before parsing so env-backed flags pick it up.
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env file: {}", e);
            std::process::exit(1);
        }
    }

    let opts = Opts::parse();
    tracing_subscriber::fmt::init();

    let options = RelayOptions {
        host: opts.host,
        port: opts.port,
        database_url: opts.database_url,
        ..RelayOptions::default()
    };

    let storage = if options.database_url.is_some() {
        "durable (sqlite)"
    } else {
        "memory-only"
    };
    println!(
        "{} chat relay on {}",
        style("Starting").green().bold(),
        style(format!("{}:{}", options.host, options.port)).cyan()
    );
    println!("  storage:   {}", style(storage).dim());
    println!(
        "  websocket: {}",
        style(format!("ws://{}:{}/ws", options.host, options.port)).dim()
    );
    println!(
        "  health:    {}",
        style(format!("http://{}:{}/health", options.host, options.port)).dim()
    );

    if let Err(e) = start_server(&options).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

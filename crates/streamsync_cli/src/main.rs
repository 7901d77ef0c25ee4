//! Streamsync CLI
//!
//! Command-line client for a streamsync server.
//!
//! # Commands
//!
//! - `tail` - Subscribe to streams and print every event
//! - `catalog` - Validate and display an endpoint catalog file

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Streamsync command-line client.
#[derive(Parser)]
#[command(name = "streamsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Endpoint catalog (JSON array of {name, url_path, namespaced})
    #[arg(global = true, short, long)]
    catalog: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Subscribe to streams and print every event
    Tail {
        /// Server base URL, e.g. https://host:9443
        #[arg(short, long)]
        url: String,

        /// Bearer token
        #[arg(short, long, env = "STREAMSYNC_TOKEN")]
        token: Option<String>,

        /// Skip TLS certificate verification
        #[arg(long)]
        insecure: bool,

        /// Extra catalog entry, as name=path (repeatable)
        #[arg(long = "stream", value_name = "NAME=PATH")]
        streams: Vec<String>,

        /// Stream to subscribe explicitly (repeatable)
        #[arg(short, long = "subscribe", value_name = "NAME")]
        subscribe: Vec<String>,

        /// Parameter for a reserved stream, as name:key=value (repeatable)
        #[arg(long = "param", value_name = "NAME:KEY=VALUE")]
        params: Vec<String>,

        /// Ad-hoc query stream, as name=query (repeatable)
        #[arg(short, long = "query", value_name = "NAME=QUERY")]
        queries: Vec<String>,

        /// Namespace filter applied to every ad-hoc query
        #[arg(long)]
        query_namespace: Option<String>,

        /// Namespace to open namespace-scoped streams in (repeatable)
        #[arg(short, long = "namespace", value_name = "NAME")]
        namespaces: Vec<String>,

        /// Only open explicitly subscribed streams
        #[arg(long)]
        no_auto: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "json")]
        format: String,
    },

    /// Validate and display an endpoint catalog
    Catalog {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Tail {
            url,
            token,
            insecure,
            streams,
            subscribe,
            params,
            queries,
            query_namespace,
            namespaces,
            no_auto,
            format,
        } => {
            let options = commands::tail::TailOptions {
                url,
                token,
                insecure,
                catalog: cli.catalog,
                streams,
                subscribe,
                params,
                queries,
                query_namespace,
                namespaces,
                auto_activate: !no_auto,
                format: format.parse()?,
            };
            commands::tail::run(options).await?;
        }
        Commands::Catalog { format } => {
            let path = cli.catalog.ok_or("Catalog path required for catalog")?;
            commands::catalog::run(&path, &format)?;
        }
        Commands::Version => {
            println!("streamsync CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}

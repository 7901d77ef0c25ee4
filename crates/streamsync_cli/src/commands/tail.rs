//! Tail command implementation.

use super::{split_assignment, ArgError, OutputFormat};
use std::path::PathBuf;
use std::sync::Arc;
use streamsync_engine::{EngineConfig, StaticCredentials, StreamEvent, StreamingEngine};
use streamsync_protocol::{LogicalStream, StreamParams};
use tracing::{info, warn};

/// Options for the tail command.
#[derive(Debug)]
pub struct TailOptions {
    /// Server base URL.
    pub url: String,
    /// Bearer token.
    pub token: Option<String>,
    /// Skip TLS verification.
    pub insecure: bool,
    /// Catalog file.
    pub catalog: Option<PathBuf>,
    /// Extra `name=path` catalog entries.
    pub streams: Vec<String>,
    /// Explicit subscriptions.
    pub subscribe: Vec<String>,
    /// `name:key=value` parameters.
    pub params: Vec<String>,
    /// `name=query` ad-hoc queries.
    pub queries: Vec<String>,
    /// Namespace filter for ad-hoc queries.
    pub query_namespace: Option<String>,
    /// Namespaces for namespace-scoped streams.
    pub namespaces: Vec<String>,
    /// Activate every non-reserved catalog stream.
    pub auto_activate: bool,
    /// Output format.
    pub format: OutputFormat,
}

/// Runs the tail command until interrupted.
pub async fn run(options: TailOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut catalog = match &options.catalog {
        Some(path) => super::catalog::load(path)?,
        None => Vec::new(),
    };
    for entry in &options.streams {
        let (name, path) = split_assignment(entry, "NAME=PATH")?;
        catalog.push(LogicalStream::new(name, path));
    }
    super::catalog::validate(&catalog)?;
    let parameterized = collect_params(&options.params)?;

    let credentials = match &options.token {
        Some(token) => StaticCredentials::new(&options.url, token),
        None => StaticCredentials::anonymous(&options.url),
    };
    let config = EngineConfig::default()
        .with_env_overrides()
        .with_auto_activate_catalog(options.auto_activate);
    let engine = StreamingEngine::builder()
        .config(config)
        .credentials(Arc::new(credentials))
        .accept_invalid_certs(options.insecure)
        .build()?;

    let mut events = engine.events();
    info!(streams = catalog.len(), url = %options.url, "starting");
    engine.set_endpoint_catalog(catalog)?;
    engine.set_namespaces(options.namespaces.iter().cloned())?;
    for name in &options.subscribe {
        engine.subscribe(name).await?;
    }
    for (name, params) in parameterized {
        engine.subscribe_with(&name, params).await?;
    }
    for query in &options.queries {
        let (name, text) = split_assignment(query, "NAME=QUERY")?;
        engine
            .subscribe_query(name, text, options.query_namespace.as_deref())
            .await?;
    }
    engine.connect()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event, options.format)?,
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    engine.dispose().await?;
    Ok(())
}

/// Groups `name:key=value` arguments by stream.
fn collect_params(raw: &[String]) -> Result<Vec<(String, StreamParams)>, ArgError> {
    let mut grouped: Vec<(String, StreamParams)> = Vec::new();
    for value in raw {
        let (name, assignment) = value.split_once(':').ok_or_else(|| ArgError::Malformed {
            expected: "NAME:KEY=VALUE",
            value: value.clone(),
        })?;
        let (key, param) = split_assignment(assignment, "NAME:KEY=VALUE")?;
        match grouped.iter_mut().find(|(n, _)| n == name) {
            Some((_, params)) => *params = std::mem::take(params).with(key, param),
            None => grouped.push((name.to_string(), StreamParams::new().with(key, param))),
        }
    }
    Ok(grouped)
}

fn print_event(event: &StreamEvent, format: OutputFormat) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => {
            let line = serde_json::json!({
                "stream": event.stream,
                "namespace": event.namespace,
                "message": event.message,
            });
            println!("{}", serde_json::to_string(&line)?);
        }
        OutputFormat::Text => {
            let source = match &event.namespace {
                Some(ns) => format!("{}@{}", event.stream, ns),
                None => event.stream.clone(),
            };
            println!("{source} {}", event.message);
        }
    }
    Ok(())
}

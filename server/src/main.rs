//! anvil-server: a standalone LSP endpoint over stdio.
//!
//! This binary owns everything the dispatch core deliberately does not:
//! process setup (logging, configuration), the lifecycle methods
//! (`initialize`, `shutdown`, `initialized`), and the exit-code policy.
//! Analysis features plug in the same way the lifecycle handlers do.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use anvil_lsp::{Endpoint, EndpointBuilder, EndpointConfig, EndpointHandle, OffsetEncoding};

/// stdout carries the protocol, so logs must stay on stderr. Filtering is
/// driven by `ANVIL_LOG` (standard env-filter syntax).
fn init_tracing() {
    let env_filter = EnvFilter::try_from_env("ANVIL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Read the endpoint configuration from the JSON file named by
/// `ANVIL_CONFIG`, or fall back to the defaults.
fn load_config() -> Result<EndpointConfig> {
    match std::env::var_os("ANVIL_CONFIG") {
        Some(path) => {
            let path = PathBuf::from(path);
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing config {}", path.display()))
        }
        None => Ok(EndpointConfig::default()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct InitializeParams {
    #[serde(default)]
    capabilities: ClientCapabilities,
}

#[derive(Debug, Default, Deserialize)]
struct ClientCapabilities {
    /// Encodings the client can handle, in order of preference.
    #[serde(default, rename = "offsetEncoding")]
    offset_encoding: Option<Vec<String>>,
}

/// Pick the first encoding the client offered that we support; clients that
/// offer nothing get the configured default.
fn negotiate_encoding(offered: Option<&[String]>, fallback: OffsetEncoding) -> OffsetEncoding {
    offered
        .unwrap_or_default()
        .iter()
        .find_map(|name| OffsetEncoding::from_name(name))
        .unwrap_or(fallback)
}

fn register_lifecycle(builder: &mut EndpointBuilder, handle: &EndpointHandle) {
    {
        let handle = handle.clone();
        builder.on_call("initialize", move |params: InitializeParams, _cx, reply| {
            let encoding = negotiate_encoding(
                params.capabilities.offset_encoding.as_deref(),
                handle.offset_encoding(),
            );
            handle.set_offset_encoding(encoding);
            tracing::info!(encoding = encoding.name(), "session initialized");
            reply.ok(json!({
                "capabilities": {},
                "offsetEncoding": encoding.name(),
            }));
        });
    }
    {
        let handle = handle.clone();
        builder.on_call("shutdown", move |_params: Value, _cx, reply| {
            handle.request_shutdown();
            reply.ok(Value::Null);
        });
    }
    builder.on_notification("initialized", |_params: Value| {});
}

async fn serve() -> Result<bool> {
    let config = load_config()?;
    let mut builder = Endpoint::builder(config);
    let handle = builder.handle();
    register_lifecycle(&mut builder, &handle);

    let result = builder
        .build()
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await;
    let clean_exit = match result {
        Ok(()) => true,
        Err(error) => {
            tracing::error!("transport error: {error:#}");
            false
        }
    };
    // Exiting without a shutdown request is the client's protocol violation;
    // report it through the exit code.
    Ok(clean_exit && handle.shutdown_requested())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    match serve().await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

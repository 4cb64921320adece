use std::{path::Path, time::Duration};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use http_body_util::BodyExt;
use hyper::{Method, Request};
use relaygate::{
    DispatchEngine, RequestContext,
    config::{GatewayConfig, RouteDescriptor, loader::load_config},
    metrics,
    ports::Body,
    tracing_setup,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Commands,

    /// Gateway configuration file (YAML, TOML or JSON)
    #[clap(short, long, default_value = "config.yaml", global = true)]
    config: String,

    /// Log filter, e.g. `info` or `relaygate=debug`
    #[clap(long, default_value = "warn", global = true)]
    log_level: String,

    /// Emit JSON logs instead of console output
    #[clap(long, global = true)]
    json: bool,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Print the instances currently resolved for a route
    Resolve {
        /// Route key as declared in the configuration
        route: String,
        /// Print the instances as JSON
        #[clap(long)]
        as_json: bool,
    },
    /// Dispatch one GET request through a route and print the response
    Send {
        /// Route key as declared in the configuration
        route: String,
        /// Path and query sent downstream
        #[clap(default_value = "/")]
        path: String,
        /// Give up after this many milliseconds
        #[clap(long)]
        timeout_ms: Option<u64>,
        /// Print the response body after the status line
        #[clap(long)]
        body: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    tracing_setup::init_tracing_with_config(&args.log_level, args.json, args.json)
        .wrap_err("Failed to initialize tracing")?;
    metrics::init_metrics().wrap_err("Failed to initialize metrics")?;

    if !Path::new(&args.config).exists() {
        return Err(eyre!("Configuration file '{}' not found", args.config));
    }
    let config = load_config(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config))?;
    let engine = DispatchEngine::builder()
        .config(&config)
        .build()
        .wrap_err("Failed to build dispatch engine")?;

    match args.command {
        Commands::Resolve { route, as_json } => {
            resolve_command(&engine, &config, &route, as_json).await
        }
        Commands::Send {
            route,
            path,
            timeout_ms,
            body,
        } => send_command(&engine, &config, &route, &path, timeout_ms, body).await,
    }
}

fn find_route<'a>(config: &'a GatewayConfig, key: &str) -> Result<&'a RouteDescriptor> {
    config.route(key).ok_or_else(|| {
        let known: Vec<&str> = config.routes.iter().map(|r| r.key.as_str()).collect();
        eyre!("Route '{key}' not found; configured routes: {known:?}")
    })
}

async fn resolve_command(
    engine: &DispatchEngine,
    config: &GatewayConfig,
    key: &str,
    as_json: bool,
) -> Result<()> {
    let route = find_route(config, key)?;
    let instances = engine
        .resolve(route)
        .await
        .with_context(|| format!("Failed to resolve route '{key}'"))?;

    if as_json {
        let json = serde_json::to_string_pretty(&instances)
            .wrap_err("Failed to serialize instances")?;
        println!("{json}");
        return Ok(());
    }

    if instances.is_empty() {
        println!("Route '{key}' resolved to no instances");
        return Ok(());
    }
    println!("Route '{key}' ({} instances):", instances.len());
    for instance in &instances {
        let mut line = format!("  {} {}", instance.id, instance.host_and_port);
        if !instance.version.is_empty() {
            line.push_str(&format!(" version={}", instance.version));
        }
        if !instance.tags.is_empty() {
            let tags: Vec<&str> = instance.tags.iter().map(String::as_str).collect();
            line.push_str(&format!(" tags={}", tags.join(",")));
        }
        println!("{line}");
    }
    Ok(())
}

async fn send_command(
    engine: &DispatchEngine,
    config: &GatewayConfig,
    key: &str,
    path: &str,
    timeout_ms: Option<u64>,
    print_body: bool,
) -> Result<()> {
    let route = find_route(config, key)?;
    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .body(Body::empty())
        .with_context(|| format!("Invalid request path '{path}'"))?;

    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        match timeout_ms {
            Some(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
            None => {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
            }
        }
        canceller.cancel();
    });

    let response = engine
        .dispatch(route, RequestContext::with_cancellation(request, cancellation))
        .await
        .map_err(|e| eyre!("Dispatch through '{key}' failed ({}): {e}", e.kind()))?;

    println!("{}", response.status());
    if print_body {
        let bytes = response
            .into_body()
            .collect()
            .await
            .wrap_err("Failed to read response body")?
            .to_bytes();
        println!("{}", String::from_utf8_lossy(&bytes));
    }
    engine.shutdown().await;
    Ok(())
}

use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use conduit_connection::EventDispatcher;
use conduit_domain::config::CorsConfig;
use conduit_domain::{Config, ConfigSeverity};
use conduit_state::StateManager;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use conduit_gateway::cli::{self, Cli, Command, ConfigCommand};
use conduit_gateway::demo_agent;
use conduit_gateway::dispatcher::GatewayDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config()?;
            run_server(config, &cli.host, cli.port, &cli.agent_factory).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config()?;
            let passed = cli::doctor::run(&config, &config_path).await?;
            if !passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, config_path) = cli::load_config()?;
            let valid = cli::config::validate(&config, &config_path);
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config()?;
            cli::config::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("conduit {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
    .with_env_filter(
        EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,conduit_gateway=debug")),
    )
    .json()
    .init();
}

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<GatewayDispatcher>,
    outbound_cfg: conduit_domain::config::OutboundConfig,
    connection_cfg: conduit_domain::config::ConnectionConfig,
}

async fn run_server(
    mut config: Config,
    host_override: &Option<String>,
    port_override: Option<u16>,
    agent_factory_id: &str,
) -> anyhow::Result<()> {
    tracing::info!("conduit gateway starting");

    if let Some(host) = host_override {
        config.server.host = host.clone();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    let agent_factory = demo_agent::resolve_agent_factory(agent_factory_id)?;
    let planner_factory = Arc::new(demo_agent::DemoPlannerFactory);
    let solver_factory = agent_factory.clone();

    let state_manager = Arc::new(StateManager::new(config.state.clone()));
    let gateway_dispatcher = Arc::new(GatewayDispatcher::new(
            agent_factory,
            planner_factory,
            solver_factory,
            None,
            state_manager,
            &config,
    ));
    tracing::info!(agent_factory = agent_factory_id, "dispatcher ready");

    let cors_layer = build_cors_layer(&config.server.cors);

    let state = AppState {
        dispatcher: gateway_dispatcher,
        outbound_cfg: config.outbound.clone(),
        connection_cfg: config.connection.clone(),
    };

    let app = axum::Router::new()
    .route("/ws", get(ws_handler))
    .layer(cors_layer)
    .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
    .await
    .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "conduit gateway listening");

    axum::serve(listener, app).await.context("axum server error")?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
            let dispatcher: Arc<dyn EventDispatcher> = state.dispatcher.clone();
            conduit_connection::serve_connection(socket, dispatcher, state.outbound_cfg, state.connection_cfg).await;
    })
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may contain a trailing `*` wildcard for the port segment
/// (e.g. `http://localhost:*`). These are expanded into a predicate that
/// matches any port on that host. A literal `"*"` allows all origins
/// (not recommended for production).
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();

    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            let prefix = origin.trim_end_matches('*').to_owned();
            wildcard_prefixes.push(prefix);
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
                let origin_str = origin.to_str().unwrap_or("");
                if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                    return true;
                }
                wildcard_prefixes.iter().any(|prefix| {
                        origin_str
                        .strip_prefix(prefix.as_str())
                        .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                        .unwrap_or(false)
                })
        })
    };

    CorsLayer::new()
    .allow_origin(allow_origin)
    .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
    .allow_credentials(true)
}

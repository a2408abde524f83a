use std::path::PathBuf;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;

use aigate::config::GatewayConfig;
use aigate::server::config_routes;
use aigate::util::{cors_config_from_env, env_bind_addr, init_tracing, AppState};

#[derive(Debug, Parser)]
#[command(name = "aigate", version, about = "AI API gateway")]
struct Cli {
    /// Gateway config file (.json, .yaml or .yml)
    #[arg(long, short, env = "AIGATE_CONFIG", default_value = "aigate.yaml")]
    config: PathBuf,

    /// Listen address; overrides `listen` from the config file
    #[arg(long, env = "BIND_ADDR")]
    bind: Option<String>,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = GatewayConfig::load_from_file(&cli.config)?;
    let bind = cli
        .bind
        .or_else(|| config.listen.clone())
        .unwrap_or_else(env_bind_addr);
    if config.local_auth_token.is_none() {
        tracing::warn!("local_auth_token not set; the gateway accepts unauthenticated callers");
    }

    let state = web::Data::new(AppState::from_config(config).context("building gateway")?);
    tracing::info!(
        "aigate {} listening on {} ({} upstreams, {} endpoints)",
        env!("CARGO_PKG_VERSION"),
        bind,
        state.registry.targets().len(),
        state.endpoints.len()
    );

    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(state.clone())
            .configure(config_routes)
    })
    .bind(&bind)
    .with_context(|| format!("binding {bind}"))?
    .run()
    .await
    .context("server error")
}

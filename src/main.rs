// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod lookup;
mod models;
mod settlement;
mod validate;

use crate::api::AppState;
use crate::auth::SessionKeys;
use crate::config::Config;
use crate::lookup::IexLookup;
use env_logger::{Builder, Env};
use log::{error, info};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let pool = match db::init(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            process::exit(1);
        }
    };

    let lookup = match IexLookup::new(&config.lookup_url, &config.api_key) {
        Ok(lookup) => lookup,
        Err(e) => {
            error!("Failed to build price lookup client: {}", e);
            process::exit(1);
        }
    };

    info!("Starting the paper broker...");
    let state = AppState {
        pool,
        lookup: Arc::new(lookup),
        sessions: Arc::new(SessionKeys::new(
            &config.session_secret,
            config.session_ttl,
        )),
        password_rounds: config.password_rounds,
    };

    let api = api::routes(state);

    info!("Server running on http://{}", config.bind_addr);
    warp::serve(api).run(config.bind_addr).await;
}

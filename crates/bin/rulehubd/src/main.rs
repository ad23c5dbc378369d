//! # rulehubd — rulehub daemon
//!
//! Composition root that wires the store adapter and the engine
//! together and runs the dispatch loop.
//!
//! ## Responsibilities
//! - Parse configuration (TOML file, env vars)
//! - Initialize logging
//! - Construct the store adapter and the engine
//! - Bootstrap caches and run the single dispatch loop
//! - Handle graceful shutdown (SIGINT)
//!
//! ## Dependency rule
//! This is the **only** crate that depends on adapters and the engine
//! alike. It is the wiring layer — no domain logic belongs here.

mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rulehub_adapter_memory::MemoryStore;
use rulehub_engine::Engine;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&config.logging.filter))
        .init();

    let store = Arc::new(MemoryStore::new(256));
    let events = store.subscribe();

    let engine = Arc::new(Engine::new(store, config.engine_config()));
    engine.bootstrap().await.context("bootstrapping engine")?;

    let dispatcher = tokio::spawn(Arc::clone(&engine).run(events));
    info!(namespace = %engine.config().namespace, "rulehubd running");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutting down");
    dispatcher.abort();

    Ok(())
}

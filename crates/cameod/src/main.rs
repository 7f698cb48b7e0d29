use std::sync::Arc;

use anyhow::{Context, Result};
use cameo_avatar::Avatarizer;
use cameo_core::{AssetStore, DetectorChain, Segmenter};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
mod session;

use engine::{Pipeline, PipelineOptions};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("cameod starting");

    let config = config::Config::from_env();
    tracing::info!(
        listen_addr = %config.listen_addr,
        asset_dir = %config.asset_dir.display(),
        model_dir = %config.model_dir.display(),
        avatar_enabled = config.avatar_enabled,
        avatar_mandatory = config.avatar_mandatory,
        "configuration loaded"
    );

    let catalog = Arc::new(config.load_catalog().context("loading character catalog")?);
    let models = config.model_paths();
    let chain = DetectorChain::standard(&models, &config.stage_timeouts());
    let segmenter = Segmenter::load(&models, config.segment_timeout);

    let avatar = match config.avatar_settings() {
        Some(settings) => Some(Arc::new(
            Avatarizer::new(settings).context("building avatar client")?,
        )),
        None => {
            tracing::info!("no avatar API key configured, /avatarize disabled");
            None
        }
    };
    let pipeline_avatar = if config.avatar_active() {
        avatar.clone()
    } else {
        None
    };

    let mut pipeline = Pipeline::new(
        catalog,
        AssetStore::new(&config.asset_dir),
        chain,
        pipeline_avatar,
        PipelineOptions {
            working_max_dim: config.working_max_dim,
            avatar_mandatory: config.avatar_mandatory,
            prompt_version: config.avatar_prompt_version,
            retry_delay: config.retry_delay,
        },
    );
    if let Some(segmenter) = segmenter {
        tracing::info!(model = segmenter.name(), "segmented cutouts enabled");
        pipeline = pipeline.with_segmenter(segmenter);
    }
    let pipeline = Arc::new(pipeline);

    let state = http::AppState::new(pipeline, avatar);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "cameod ready");

    axum::serve(listener, http::router(Arc::clone(&state)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("cameod shutting down");
    state.shutdown().await;

    Ok(())
}

mod auth;
mod config;
mod describer;
mod error;
mod register;
mod routes;
mod store;

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    auth::AccessGuard,
    config::Config,
    describer::OpenAiDescriber,
    register::LatestImage,
    routes::{router, AppState},
    store::ImageStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let store = ImageStore::new(&config.upload_dir)
        .with_context(|| format!("creating upload dir {}", config.upload_dir.display()))?;
    let describer = OpenAiDescriber::new(
        config.vision_base_url.clone(),
        config.vision_api_key.clone(),
        config.vision_model.clone(),
        config.upstream_timeout,
    )?;

    let state = Arc::new(AppState {
        store,
        register: LatestImage::new(),
        guard: AccessGuard::from_tokens(&config.api_tokens),
        describer: Arc::new(describer),
        index_auth_required: config.index_auth_required,
    });

    let app = router(state, config.max_upload_bytes);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

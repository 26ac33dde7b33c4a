use anyhow::Result;
use faceproofd::config::Config;
use faceproofd::dbus_interface::{FaceproofService, BUS_NAME, OBJECT_PATH};
use faceproofd::Engine;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("faceproofd starting");

    let config = Config::load()?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        detector = config.detector.as_str(),
        recognizer = config.recognizer.as_str(),
        timeout_secs = config.request_timeout_secs,
        "configuration loaded"
    );

    let engine = Arc::new(Engine::from_config(&config).await?);

    let builder = if std::env::var("FACEPROOF_SYSTEM_BUS").as_deref() == Ok("1") {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceproofService::new(engine))?
        .build()
        .await?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "faceproofd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("faceproofd shutting down");

    Ok(())
}

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

use open_music_audio::config::Config;
use open_music_audio::idle::NoPresence;
use open_music_audio::node::{NodeClient, RestNodeClient};
use open_music_audio::reactor::LogNotifier;
use open_music_audio::supervisor::NodeStatus;
use open_music_audio::AudioSubsystem;

#[tokio::main]
async fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_audio=debug".parse()?)
                .add_directive("sqlx=warn".parse()?)
                .add_directive("tokio_tungstenite=info".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Audio v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = Config::load()?;

    // Manejar health check si es necesario
    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    info!("{}", config.summary());

    let audio = AudioSubsystem::start(&config, Arc::new(LogNotifier), Arc::new(NoPresence)).await?;
    if let NodeStatus::Unavailable(reason) = &*audio.status().borrow() {
        error!("❌ Audio deshabilitado: {}", reason);
    }

    // Esperar señal de shutdown
    tokio::signal::ctrl_c().await?;
    info!("⚠️ Señal de shutdown recibida, cerrando...");
    audio.shutdown().await;

    Ok(())
}

async fn health_check(config: &Config) -> Result<()> {
    let client = RestNodeClient::new(
        &config.node_host,
        config.node_rest_port,
        config.node_password.clone(),
        String::new(),
    )?;

    match client.version().await {
        Ok(version) => {
            println!("OK {version}");
            Ok(())
        }
        Err(e) => anyhow::bail!("Nodo de audio no disponible: {e}"),
    }
}

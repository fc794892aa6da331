use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info, warn};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use piio::{AppConfig, IoEvent, IoManager};

#[cfg(feature = "hardware")]
use piio::LinuxPlatform;
#[cfg(not(feature = "hardware"))]
use piio::MockPlatform;

const DEFAULT_CONFIG_PATH: &str = "/etc/piio/piio.json";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("PIIO_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = match AppConfig::load_from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load {config_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let platform = {
        #[cfg(feature = "hardware")]
        {
            Arc::new(LinuxPlatform::new())
        }
        #[cfg(not(feature = "hardware"))]
        {
            Arc::new(MockPlatform::default())
        }
    };

    let manager = IoManager::new(&config, platform);
    info!("Serving io groups: {}", manager.group_names().join(", "));

    let mut events = manager.stream();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return ExitCode::SUCCESS;
            }
            event = events.next() => match event {
                Some(Ok(IoEvent::CriticalError { group, message })) => {
                    error!("{group}: critical error, shutting down: {message}");
                    return ExitCode::FAILURE;
                }
                Some(Ok(event)) => info!("{}: {event:?}", event.path()),
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!("Event log lagged, {missed} events skipped");
                }
                None => return ExitCode::SUCCESS,
            }
        }
    }
}

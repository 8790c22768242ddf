pub mod audio;
pub mod capture;
pub mod effects;
pub mod metrics;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod supervisor;

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use capture::{create_backend, CaptureBackend, DeviceError};
use settings::{load_settings, AppSettings};
use store::JsonFileCommandStore;
use supervisor::Supervisor;

/// Reasons the daemon exits non-zero.
#[derive(Debug)]
pub enum AppError {
    /// The capture backend could not enumerate devices.
    Devices(DeviceError),
    Runtime(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Devices(e) => write!(f, "Cannot list capture devices: {}", e),
            AppError::Runtime(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for AppError {}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Log the devices the backend sees and warn if the configured default is missing.
fn check_devices(backend: &dyn CaptureBackend, settings: &AppSettings) -> Result<(), AppError> {
    let devices = backend.list_devices().map_err(AppError::Devices)?;
    log::info!("{} backend: {} input device(s)", backend.name(), devices.len());
    for device in &devices {
        log::info!(
            "  {} ({}): {} input channels",
            device.id,
            device.name,
            device.input_channels
        );
    }

    if let Some(default) = &settings.default_device {
        if !devices.iter().any(|d| &d.id == default) {
            log::warn!("Default device {} is not present", default);
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => log::info!("Interrupt received"),
                    _ = term.recv() => log::info!("Terminate received"),
                }
            }
            Err(e) => {
                log::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                log::info!("Interrupt received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Interrupt received");
    }
}

/// Run the recorder daemon until interrupted.
pub fn run() -> Result<(), AppError> {
    let settings = load_settings();
    let backend = create_backend(&settings);
    check_devices(backend.as_ref(), &settings)?;

    let store_path = settings.store_path();
    log::info!("Command store: {:?}", store_path);
    log::info!("Recordings: {:?}", settings.output_dir());
    let store = Arc::new(JsonFileCommandStore::new(store_path));
    let mut supervisor = Supervisor::new(store, backend, &settings);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| AppError::Runtime(e.to_string()))?;

    runtime.block_on(async move {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let mut worker = tokio::task::spawn_blocking(move || supervisor.run(&loop_token));

        tokio::select! {
            _ = shutdown_signal() => {
                token.cancel();
                worker.await.map_err(|e| AppError::Runtime(e.to_string()))
            }
            result = &mut worker => result.map_err(|e| AppError::Runtime(e.to_string())),
        }
    })?;

    log::info!("Multichannel recorder stopped");
    Ok(())
}

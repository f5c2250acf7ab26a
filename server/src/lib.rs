use std::{fs, future::Future, path::Path, pin::Pin, sync::Arc};

use common_net::{
    fabric::{Fabric, LocalFabric},
    shutdown,
};
use gateway::{access::StaticAccessPolicy, GatewayConfig, GatewaySettings};
use reaper::{ReaperConfig, ReaperSettings};
use registry::{MemoryStore, SignalStore};
use tokio::task::JoinSet;
use tracing::{error, info};

pub mod directory;

use directory::{Directory, DirectorySettings};

pub type BoxError = common_net::BoxError;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ServerSettings {
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub reaper: ReaperSettings,
    #[serde(default)]
    pub directory: DirectorySettings,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self, BoxError> {
        Ok(Self {
            gateway: GatewaySettings::from_env()?,
            reaper: ReaperSettings::from_env()?,
            directory: DirectorySettings::from_env()?,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, BoxError> {
        let raw = fs::read_to_string(path).map_err(|err| Box::new(err) as BoxError)?;
        let settings = serde_json::from_str(&raw).map_err(|err| Box::new(err) as BoxError)?;
        Ok(settings)
    }

    /// Rejects settings that would only fail once the services are running.
    pub fn validate(&self) -> Result<(), BoxError> {
        self.gateway.turn.ttl()?;
        self.reaper.validate()?;
        self.directory.validate()
    }

    pub fn into_config(self) -> Result<ServerConfig, BoxError> {
        ServerConfig::from_settings(self)
    }
}

pub struct ServerConfig {
    pub gateway: GatewayConfig,
    pub reaper: ReaperConfig,
    pub directory: Directory,
}

impl ServerConfig {
    /// Gateway, reaper and directory share one in-process store; gateway and
    /// reaper share one fabric.
    pub fn from_settings(settings: ServerSettings) -> Result<Self, BoxError> {
        settings.validate()?;
        let store: Arc<dyn SignalStore> = Arc::new(MemoryStore::new());
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let access = Arc::new(StaticAccessPolicy::new());
        Ok(Self {
            gateway: GatewayConfig::from_settings(
                settings.gateway,
                store.clone(),
                fabric.clone(),
                access.clone(),
            )?,
            reaper: ReaperConfig::from_settings(settings.reaper, store.clone(), fabric),
            directory: Directory::new(settings.directory, store, access),
        })
    }

    pub fn from_env() -> Result<Self, BoxError> {
        ServerSettings::from_env()?.into_config()
    }
}

pub async fn run() -> Result<(), BoxError> {
    let config = ServerConfig::from_env()?;
    run_with_ctrl_c(config).await
}

pub async fn run_with_ctrl_c(config: ServerConfig) -> Result<(), BoxError> {
    let (shutdown_tx, shutdown_rx) = shutdown::channel();
    let ctrl_c = shutdown::spawn_ctrl_c(shutdown_tx, "server");

    let result = run_with_shutdown(config, shutdown_rx).await;

    ctrl_c.abort();
    result
}

pub async fn run_with_shutdown(
    config: ServerConfig,
    shutdown_rx: shutdown::ShutdownReceiver,
) -> Result<(), BoxError> {
    let (service_shutdown_tx, service_shutdown_rx) = shutdown::channel();

    let ServerConfig {
        gateway,
        reaper,
        directory,
    } = config;

    // seeded rows must exist before the first socket can name them
    directory.load().await?;

    let mut join_set: JoinSet<Result<(), BoxError>> = JoinSet::new();

    let gateway_shutdown = service_shutdown_rx.clone();
    join_set.spawn(async move { gateway::run(gateway, gateway_shutdown).await });

    let reaper_shutdown = service_shutdown_rx;
    join_set.spawn(async move { reaper::run(reaper, reaper_shutdown).await });

    let mut shutdown_future: Pin<Box<dyn Future<Output = ()> + Send>> =
        Box::pin(shutdown::wait(shutdown_rx));
    let mut service_error: Option<BoxError> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_future => {
                info!("server: shutdown requested");
                shutdown::trigger(&service_shutdown_tx);
                break;
            }
            maybe_task = join_set.join_next() => {
                match maybe_task {
                    Some(Ok(Ok(()))) => continue,
                    Some(Ok(Err(err))) => {
                        error!(%err, "server: a service exited with an error");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    Some(Err(join_err)) => {
                        let err: BoxError = Box::new(join_err);
                        error!(%err, "server: service task panicked or was cancelled");
                        service_error = Some(err);
                        shutdown::trigger(&service_shutdown_tx);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    shutdown::trigger(&service_shutdown_tx);

    let drain_result = drain_join_set(&mut join_set).await;

    if let Some(err) = service_error {
        return Err(err);
    }

    drain_result
}

async fn drain_join_set(join_set: &mut JoinSet<Result<(), BoxError>>) -> Result<(), BoxError> {
    let mut first_err: Option<BoxError> = None;

    while let Some(task) = join_set.join_next().await {
        match task {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(join_err) => {
                if first_err.is_none() {
                    first_err = Some(Box::new(join_err) as BoxError);
                }
            }
        }
    }

    if let Some(err) = first_err {
        return Err(err);
    }

    Ok(())
}

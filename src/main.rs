use std::{process, sync::Arc};

use sideline::{
    cache::{CacheStore, DiskStore, Generation, MemoryStore},
    config::{self, RegionsArgs, StorageBackend, StorageSettings},
    engine::{Coordinator, Dispatcher, EngineContext, InstallOutcome, ManifestFile},
    error::AppError,
    infra::{
        error::InfraError,
        http::{self, HttpState},
        network::HttpNetwork,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Regions(args) => run_regions(settings, args).await,
    }
}

async fn open_store(storage: &StorageSettings) -> Result<Arc<dyn CacheStore>, AppError> {
    match storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Disk => {
            let store = DiskStore::open_root(storage.directory.clone()).await?;
            info!(directory = %store.root().display(), "Opened disk cache store");
            Ok(Arc::new(store))
        }
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let origin = settings.upstream.origin.clone().ok_or_else(|| {
        AppError::from(InfraError::configuration(
            "`upstream.origin` is required to serve",
        ))
    })?;

    let store = open_store(&settings.storage).await?;
    let network = HttpNetwork::new(settings.upstream.timeout).map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to build upstream client: {err}"
        )))
    })?;

    let ctx = EngineContext::new(store, Arc::new(network), origin);
    let coordinator = Coordinator::new(Arc::clone(&ctx)).with_source(Arc::new(ManifestFile::new(
        settings.engine.manifest.clone(),
    )));
    let dispatcher = Dispatcher::new(Arc::clone(&ctx));

    match coordinator.restore().await {
        Ok(Some(generation)) => info!(generation = %generation, "Serving recorded generation"),
        Ok(None) => {}
        Err(err) => warn!(error = %err, "Failed to read the recorded generation"),
    }

    // Without an active generation every request is forwarded untouched.
    match coordinator.check_for_update().await {
        Ok(InstallOutcome::Unchanged { generation, .. }) => {
            info!(generation = %generation, "Generation already installed");
        }
        Ok(_) => info!(
            active = ?ctx.registry().active_generation(),
            waiting = ?ctx.registry().waiting_generation(),
            "Initial generation installed"
        ),
        Err(err) => warn!(error = %err, "Initial install failed; forwarding all requests"),
    }

    let update_handle = settings.engine.update_check.map(|period| {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                if let Err(err) = coordinator.check_for_update().await {
                    warn!(error = %err, "Periodic update check failed");
                }
            }
        })
    });

    let result = serve_http(&settings, HttpState::new(dispatcher, coordinator)).await;

    if let Some(handle) = update_handle {
        handle.abort();
        let _ = handle.await;
    }

    result
}

async fn run_regions(settings: config::Settings, args: RegionsArgs) -> Result<(), AppError> {
    if settings.storage.backend == StorageBackend::Memory {
        warn!("The memory backend starts empty; use `--storage-backend disk` to inspect a cache");
    }
    let store = open_store(&settings.storage).await?;

    if let Some(keep) = args.prune_except.as_deref() {
        let keep = keep.trim();
        if keep.is_empty() {
            return Err(AppError::validation("`--prune-except` needs a generation tag"));
        }
        let keep = Generation::new(keep);
        for region in store.list_regions().await? {
            if !region.belongs_to(&keep) && store.delete_region(&region).await? {
                info!(region = %region, "Deleted cache region");
            }
        }
    }

    let regions = store.list_regions().await?;
    if regions.is_empty() {
        println!("no cache regions");
    }
    for region in regions {
        let entries = store.keys(&region).await?.len();
        println!("{region}\t{entries}");
    }

    Ok(())
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Interception proxy listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

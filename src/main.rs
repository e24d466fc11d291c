use std::io;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer};
use sqlx::postgres::PgPoolOptions;

use terrace_push::handlers::register_routes;
use terrace_push::services::InMemoryEventManager;
use terrace_push::storage::NotificationStorage;
use terrace_push::{
    logging, metrics, migrations, Config, ConnectionRegistry, NotificationDispatcher,
    PendingNotificationStore, PgNotificationStorage, RedeliveryScheduler,
};

#[actix_web::main]
async fn main() -> io::Result<()> {
    logging::init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return Err(io::Error::new(io::ErrorKind::Other, "invalid configuration"));
        }
    };

    tracing::info!("Starting terrace-push");

    let pool = match PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
    {
        Ok(pool) => {
            tracing::info!("Successfully connected to database");
            pool
        }
        Err(e) => {
            tracing::error!("Failed to connect to database: {}", e);
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "database connection failed",
            ));
        }
    };

    if let Err(e) = migrations::run_all(&pool).await {
        tracing::error!("Failed to apply migrations: {}", e);
        return Err(io::Error::new(io::ErrorKind::Other, "migration failure"));
    }

    let registry = ConnectionRegistry::new();
    let storage: Arc<dyn NotificationStorage> = Arc::new(PgNotificationStorage::new(pool.clone()));
    let store = Arc::new(PendingNotificationStore::new(storage, &config.push));
    // the back office wires its own event manager when it embeds the lib;
    // the standalone binary only serves user-level dispatch
    let events = Arc::new(InMemoryEventManager::new());
    let dispatcher = Arc::new(NotificationDispatcher::new(
        registry.clone(),
        store.clone(),
        events,
    ));
    let scheduler = Arc::new(RedeliveryScheduler::new(
        registry.clone(),
        store.clone(),
        &config.push,
    ));
    scheduler.start().await;

    let addr = format!("0.0.0.0:{}", config.app.port);
    tracing::info!("Starting HTTP server on {}", addr);

    let http_config = config.clone();
    let http_registry = registry.clone();
    let http_store = store.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_config.clone()))
            .app_data(web::Data::new(http_registry.clone()))
            .app_data(web::Data::new(http_store.clone()))
            .app_data(web::Data::new(dispatcher.clone()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .route("/", web::get().to(|| async { "Terrace Push v1.0" }))
            .configure(register_routes)
    })
    .bind(&addr)?
    .run()
    .await;

    scheduler.stop().await;
    store.shutdown().await;

    result
}

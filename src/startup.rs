use std::net::TcpListener;

use actix_web::dev::Server;
use actix_web::web;
use actix_web::App;
use actix_web::HttpServer;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing_actix_web::TracingLogger;

use crate::configuration::DatabaseSettings;
use crate::configuration::Settings;
use crate::deps::Deps;
use crate::routes::health_check;
use crate::routes::payer_callback;
use crate::routes::status;
use crate::routes::submit;

/// The HTTP half of the gateway, wrapped so callers can learn the bound
/// port (tests bind port 0).
pub struct Application {
    port: u16,
    server: Server,
}

impl Application {
    /// Binds the listener, migrates the database and assembles the app.
    /// Workers are started separately (see `main.rs`); they share the
    /// same database file but own their pools.
    pub async fn build(cfg: Settings) -> Result<Self, anyhow::Error> {
        let addr = format!("{}:{}", cfg.application.host, cfg.application.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let pool = get_connection_pool(&cfg.database);
        sqlx::migrate!().run(&pool).await?;

        let server = run(listener, pool, cfg)?;
        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Consumes `self`; the final call (or the argument to
    /// `tokio::spawn`).
    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        self.server.await
    }
}

pub fn get_connection_pool(db_cfg: &DatabaseSettings) -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(db_cfg.max_connections)
        .connect_lazy_with(db_cfg.connection())
}

fn run(listener: TcpListener, pool: SqlitePool, cfg: Settings) -> Result<Server, anyhow::Error> {
    let deps = web::Data::new(Deps::new(cfg, pool));
    let server = HttpServer::new(move || {
        App::new()
            .wrap(TracingLogger::default())
            .route("/health_check", web::get().to(health_check))
            .route("/submit", web::post().to(submit))
            .route("/status/{submission_id}", web::get().to(status))
            .route("/payer-callback/{submission_id}", web::post().to(payer_callback))
            .app_data(deps.clone())
    })
    .listen(listener)?
    .run();
    Ok(server)
}

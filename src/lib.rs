#[macro_use]
extern crate rocket;

pub mod config;
pub mod db;
pub mod error;
pub mod import;
pub mod models;
pub mod request_logger;
pub mod routes;

use crate::config::ImportConfig;
use crate::db::ImportDb;
use crate::import::{ImportServices, PgImportStore, SharedImportStore};
use crate::request_logger::RequestLogger;
use env_logger::Env;
use rocket::data::{Limits, ToByteUnit};
use rocket::fairing::AdHoc;
use rocket::http::Method;
use rocket::{Build, Rocket};
use rocket_cors::{AllowedOrigins, CorsOptions};
use rocket_db_pools::Database;
use rocket_okapi::{
    openapi_get_routes,
    rapidoc::{GeneralConfig, HideShowConfig, RapiDocConfig, make_rapidoc},
    settings::UrlObject,
    swagger_ui::{SwaggerUIConfig, make_swagger_ui},
};
use std::sync::{Arc, Once};
use std::time::Duration;

static LOGGER: Once = Once::new();

/// Interval between sweeps of expired progress and skip-log entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(
            Env::default().default_filter_or("info,rocket::server=warn,rocket::request=warn"),
        )
        .init();
    });
}

pub fn rocket() -> Rocket<Build> {
    init_logger();

    let import_config = ImportConfig::from_env();
    log::info!(
        "import config: chunk size {}, chunk delay {:?}, chunk timeout {:?}, progress ttl {:?}, upload limit {} MiB",
        import_config.chunk_size,
        import_config.chunk_delay,
        import_config.chunk_timeout,
        import_config.progress_ttl,
        import_config.max_upload_mb
    );

    let limits = Limits::default().limit("bytes", import_config.max_upload_mb.mebibytes());
    let figment = rocket::Config::figment().merge(("limits", limits));

    let cors = CorsOptions::default()
        .allowed_origins(AllowedOrigins::all())
        .allowed_methods(
            vec![Method::Get, Method::Post]
                .into_iter()
                .map(From::from)
                .collect(),
        )
        .allow_credentials(true)
        .to_cors()
        .expect("Error creating CORS");

    let services = ImportServices::new(import_config);

    rocket::custom(figment)
        .attach(RequestLogger)
        .attach(ImportDb::init())
        .attach(cors)
        .manage(services)
        // Run database migrations on startup
        .attach(AdHoc::try_on_ignite(
            "Run Migrations",
            |rocket| async move {
                match ImportDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        match db::run_migrations(&pool).await {
                            Ok(_) => {
                                log::info!("database migrations successful");
                                Ok(rocket)
                            }
                            Err(e) => {
                                log::error!("database migrations failed: {}", e);
                                Err(rocket)
                            }
                        }
                    }
                    None => {
                        log::error!("database pool not available for migrations");
                        Err(rocket)
                    }
                }
            },
        ))
        // Share the pool with import jobs through the store capability
        .attach(AdHoc::try_on_ignite(
            "Manage Import Store",
            |rocket| async move {
                match ImportDb::fetch(&rocket) {
                    Some(db) => {
                        let pool = (**db).clone();
                        let store: SharedImportStore = Arc::new(PgImportStore::new(pool));
                        Ok(rocket.manage(store))
                    }
                    None => Err(rocket),
                }
            },
        ))
        .attach(AdHoc::on_liftoff("Spawn Progress Purger", |rocket| {
            Box::pin(async move {
                if let Some(services) = rocket.state::<ImportServices>() {
                    let services = services.clone();
                    tokio::spawn(async move {
                        log::info!("starting progress purger");
                        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
                        loop {
                            ticker.tick().await;
                            let purged = services.purge_expired();
                            if purged > 0 {
                                log::debug!("purged {} expired import entries", purged);
                            }
                        }
                    });
                } else {
                    log::error!("failed to spawn progress purger: import services not found");
                }
            })
        }))
        .mount(
            "/api/v1",
            openapi_get_routes![
                routes::health::health_check,
                routes::imports::start_import,
                routes::imports::get_progress,
                routes::imports::get_skipped,
                routes::imports::cancel_import,
            ],
        )
        .mount(
            "/api/docs/swagger/",
            make_swagger_ui(&SwaggerUIConfig {
                url: "../../v1/openapi.json".to_owned(),
                ..Default::default()
            }),
        )
        .mount(
            "/api/docs/rapidoc/",
            make_rapidoc(&RapiDocConfig {
                general: GeneralConfig {
                    spec_urls: vec![UrlObject::new("Import API", "../../v1/openapi.json")],
                    ..Default::default()
                },
                hide_show: HideShowConfig {
                    allow_spec_url_load: false,
                    allow_spec_file_load: false,
                    ..Default::default()
                },
                ..Default::default()
            }),
        )
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::ImportConfig;
    use crate::import::{ImportServices, SharedImportStore};
    use rocket::config::LogLevel;
    use rocket::figment::Figment;
    use rocket::local::asynchronous::Client as AsyncClient;
    use rocket::local::blocking::Client;
    use rocket::{Build, Rocket, Route};
    use rocket_db_pools::sqlx::PgPool;
    use std::sync::Arc;
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};
    pub use memory::MemoryStore;

    /// Import settings for tests: small chunks and no inter-chunk delay.
    pub fn test_config() -> ImportConfig {
        ImportConfig {
            chunk_size: 2,
            chunk_delay: Duration::ZERO,
            chunk_timeout: Duration::from_secs(5),
            progress_ttl: Duration::from_secs(60),
            skipped_inline_limit: 50,
            skipped_retained_limit: 1_000,
            customer_table: "customers".to_string(),
            subscription_table: "subscriptions".to_string(),
            max_upload_mb: 8,
        }
    }

    pub mod memory {
        use crate::import::records::{CustomerRecord, ImportRecord, SubscriptionRecord};
        use crate::import::store::{ImportStore, RecordSink, StoreError};
        use parking_lot::Mutex;
        use std::collections::{BTreeMap, HashSet};

        #[derive(Default)]
        struct MemoryState {
            customers: BTreeMap<String, CustomerRecord>,
            subscriptions: BTreeMap<String, SubscriptionRecord>,
            batch_calls: usize,
        }

        /// In-memory import store with failure injection.
        ///
        /// Subscriptions referencing a missing customer are rejected like a
        /// foreign key violation. A bulk write containing a failing record
        /// writes nothing.
        #[derive(Default)]
        pub struct MemoryStore {
            state: Mutex<MemoryState>,
            fail_batches: bool,
            fail_known_ids: bool,
            failing_ids: HashSet<String>,
        }

        impl MemoryStore {
            pub fn new() -> Self {
                Self::default()
            }

            /// Make every bulk upsert fail.
            pub fn fail_batches(mut self) -> Self {
                self.fail_batches = true;
                self
            }

            /// Make every write of the record keyed `id` fail.
            pub fn fail_id(mut self, id: &str) -> Self {
                self.failing_ids.insert(id.to_string());
                self
            }

            /// Make loading the known customer ids fail.
            pub fn fail_known_ids(mut self) -> Self {
                self.fail_known_ids = true;
                self
            }

            pub fn insert_customer(&self, record: CustomerRecord) {
                self.state
                    .lock()
                    .customers
                    .insert(record.customer_id.clone(), record);
            }

            pub fn customer(&self, id: &str) -> Option<CustomerRecord> {
                self.state.lock().customers.get(id).cloned()
            }

            pub fn subscription(&self, id: &str) -> Option<SubscriptionRecord> {
                self.state.lock().subscriptions.get(id).cloned()
            }

            pub fn has_customer(&self, id: &str) -> bool {
                self.state.lock().customers.contains_key(id)
            }

            pub fn has_subscription(&self, id: &str) -> bool {
                self.state.lock().subscriptions.contains_key(id)
            }

            pub fn customer_count(&self) -> usize {
                self.state.lock().customers.len()
            }

            pub fn subscription_count(&self) -> usize {
                self.state.lock().subscriptions.len()
            }

            /// Number of bulk upserts attempted, failed ones included.
            pub fn batch_calls(&self) -> usize {
                self.state.lock().batch_calls
            }

            fn check<R: ImportRecord>(&self, state: &MemoryState, record: &R) -> Result<(), StoreError> {
                if self.failing_ids.contains(record.key()) {
                    return Err(StoreError::Rejected(format!(
                        "{} '{}' rejected by store",
                        R::ENTITY,
                        record.key()
                    )));
                }
                match record.parent_key() {
                    Some(parent) if !state.customers.contains_key(parent) => {
                        Err(StoreError::Rejected(format!(
                            "foreign key violation: customer '{parent}' does not exist"
                        )))
                    }
                    _ => Ok(()),
                }
            }
        }

        #[rocket::async_trait]
        impl RecordSink<CustomerRecord> for MemoryStore {
            async fn upsert_batch(&self, records: &[CustomerRecord]) -> Result<u64, StoreError> {
                let mut state = self.state.lock();
                state.batch_calls += 1;
                if self.fail_batches {
                    return Err(StoreError::Rejected("bulk writes disabled".to_string()));
                }
                for record in records {
                    self.check(&state, record)?;
                }
                for record in records {
                    state
                        .customers
                        .insert(record.customer_id.clone(), record.clone());
                }
                Ok(records.len() as u64)
            }

            async fn upsert_one(&self, record: &CustomerRecord) -> Result<(), StoreError> {
                let mut state = self.state.lock();
                self.check(&state, record)?;
                state
                    .customers
                    .insert(record.customer_id.clone(), record.clone());
                Ok(())
            }
        }

        #[rocket::async_trait]
        impl RecordSink<SubscriptionRecord> for MemoryStore {
            async fn upsert_batch(
                &self,
                records: &[SubscriptionRecord],
            ) -> Result<u64, StoreError> {
                let mut state = self.state.lock();
                state.batch_calls += 1;
                if self.fail_batches {
                    return Err(StoreError::Rejected("bulk writes disabled".to_string()));
                }
                for record in records {
                    self.check(&state, record)?;
                }
                for record in records {
                    state
                        .subscriptions
                        .insert(record.subscription_id.clone(), record.clone());
                }
                Ok(records.len() as u64)
            }

            async fn upsert_one(&self, record: &SubscriptionRecord) -> Result<(), StoreError> {
                let mut state = self.state.lock();
                self.check(&state, record)?;
                state
                    .subscriptions
                    .insert(record.subscription_id.clone(), record.clone());
                Ok(())
            }
        }

        #[rocket::async_trait]
        impl ImportStore for MemoryStore {
            async fn known_customer_ids(&self) -> Result<HashSet<String>, StoreError> {
                if self.fail_known_ids {
                    return Err(StoreError::Rejected("customer lookup failed".to_string()));
                }
                Ok(self.state.lock().customers.keys().cloned().collect())
            }
        }
    }

    pub mod database {
        use crate::db::MIGRATOR;
        use log::LevelFilter;
        use rocket_db_pools::sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use rocket_db_pools::sqlx::{self, ConnectOptions, PgPool};
        use testcontainers::{ContainerAsync, core::error::TestcontainersError, runners::AsyncRunner};
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set and TEST_USE_CONTAINER disabled")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral, migrated database for integration tests.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            /// Create a database on the server at `TEST_DATABASE_URL`, or in a
            /// disposable Postgres container when `TEST_USE_CONTAINER=1`.
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    return Self::new(&url, None).await;
                }

                let use_container = std::env::var("TEST_USE_CONTAINER")
                    .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false);
                if !use_container {
                    return Err(TestDatabaseError::MissingUrl);
                }

                let container = Postgres::default().start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                Self::new(&url, Some(container)).await
            }

            async fn new(
                base_url: &str,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options: PgConnectOptions =
                    base_url.parse().map_err(TestDatabaseError::Sqlx)?;
                let base_options = base_options.log_statements(LevelFilter::Off);

                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql)
                    .execute(&admin_pool)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await
                    .map_err(TestDatabaseError::Sqlx)?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options, &db_name).await;
                        });
                    } else {
                        std::thread::spawn(move || {
                            if let Ok(rt) = tokio::runtime::Runtime::new() {
                                rt.block_on(async move {
                                    pool.close().await;
                                    let _ =
                                        drop_database_with_fallback(admin_options, &db_name).await;
                                });
                            }
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }

    /// Builder for constructing Rocket instances tailored for integration tests.
    #[derive(Default)]
    pub struct TestRocketBuilder {
        figment: Figment,
        mounts: Vec<(String, Vec<Route>)>,
        services: Option<ImportServices>,
        store: Option<SharedImportStore>,
        pg_pool: Option<PgPool>,
    }

    impl TestRocketBuilder {
        /// Start a builder with sensible defaults: random port, logging disabled.
        pub fn new() -> Self {
            let figment = rocket::Config::figment()
                .merge(("port", 0))
                .merge(("log_level", LogLevel::Off))
                .merge(("cli_colors", false));

            Self {
                figment,
                ..Default::default()
            }
        }

        /// Mount routes under `/api/v1`.
        pub fn mount_api_routes(mut self, routes: Vec<Route>) -> Self {
            self.mounts.push(("/api/v1".to_string(), routes));
            self
        }

        /// Manage the given import services instead of fresh ones.
        pub fn manage_services(mut self, services: ImportServices) -> Self {
            self.services = Some(services);
            self
        }

        /// Manage the store import routes write to.
        pub fn manage_store(mut self, store: SharedImportStore) -> Self {
            self.store = Some(store);
            self
        }

        /// Manage a `PgPool` and a PostgreSQL-backed import store over it.
        pub fn manage_pg_pool(mut self, pool: PgPool) -> Self {
            self.store = Some(Arc::new(crate::import::PgImportStore::new(pool.clone())));
            self.pg_pool = Some(pool);
            self
        }

        /// Finish building the Rocket instance.
        ///
        /// Import services always get managed, built from [`test_config`]
        /// unless provided.
        pub fn build(self) -> Rocket<Build> {
            let mut rocket = rocket::custom(self.figment);

            for (base, routes) in self.mounts {
                rocket = rocket.mount(base, routes);
            }

            rocket = rocket.manage(
                self.services
                    .unwrap_or_else(|| ImportServices::new(test_config())),
            );

            if let Some(store) = self.store {
                rocket = rocket.manage(store);
            }

            if let Some(pool) = self.pg_pool {
                rocket = rocket.manage(pool);
            }

            rocket
        }

        /// Convenience helper to produce a blocking local client.
        pub fn blocking_client(self) -> Client {
            Client::tracked(self.build()).expect("valid Rocket instance")
        }

        /// Convenience helper to produce an asynchronous local client.
        pub async fn async_client(self) -> AsyncClient {
            AsyncClient::tracked(self.build())
                .await
                .expect("valid Rocket instance")
        }
    }
}

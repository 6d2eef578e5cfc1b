use rocket_db_pools::sqlx::migrate::{MigrateError, Migrator};
use rocket_db_pools::sqlx::{self, PgPool};
use rocket_db_pools::Database;

/// Target database for imported customers and subscriptions.
#[derive(Database)]
#[database("import_db")]
pub struct ImportDb(sqlx::PgPool);

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply pending migrations for the `customers` and `subscriptions` tables.
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

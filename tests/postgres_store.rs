use import_server::db::MIGRATOR;
use import_server::import::validation::prepare_row;
use import_server::import::{
    ImportJob, ImportServices, ImportStore, PgImportStore, RecordSink, SkipReason,
    SubscriptionRecord,
};
use import_server::test_support::{TestDatabase, TestDatabaseError, test_config};

fn customer_row(id: &str, name: &str) -> String {
    format!("(1,'{id}','{name}',NULL,NULL,NULL,'Bandung',NULL,NULL,NULL,'2024-01-01 10:00:00',NULL)")
}

fn subscription_tokens(id: &str, customer: &str) -> Vec<String> {
    let mut tokens = vec!["NULL".to_string(); 34];
    tokens[0] = "1".into();
    tokens[1] = format!("'{id}'");
    tokens[2] = format!("'{customer}'");
    tokens[3] = "'Home Fiber 50M'".into();
    tokens[5] = "50".into();
    tokens[6] = "'350000'".into();
    tokens
}

fn subscription_row(id: &str, customer: &str) -> String {
    format!("({})", subscription_tokens(id, customer).join(","))
}

async fn provision() -> Option<TestDatabase> {
    match TestDatabase::new_from_env().await {
        Ok(db) => {
            MIGRATOR.run(db.pool()).await.expect("migrations run");
            Some(db)
        }
        Err(TestDatabaseError::MissingUrl) => {
            eprintln!("skipping postgres store test: TEST_DATABASE_URL not set");
            None
        }
        Err(err) => panic!("failed to provision test database: {err:?}"),
    }
}

#[tokio::test]
async fn postgres_import_is_idempotent_and_refreshes_fields() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgImportStore::new(test_db.pool_clone());
    let services = ImportServices::new(test_config());

    let first = format!(
        "INSERT INTO `customers` VALUES {},{};\nINSERT INTO `subscriptions` VALUES {},{};\n",
        customer_row("P1", "Alice"),
        customer_row("P2", "Bob"),
        subscription_row("C1", "P1"),
        subscription_row("C2", "P404"),
    );
    let result = ImportJob::new("pg-first", &store, &services)
        .run(first.as_bytes())
        .await
        .expect("import succeeds");
    assert_eq!(result.customers.imported, 2);
    assert_eq!(result.subscriptions.imported, 1);
    assert_eq!(result.subscriptions.skipped_records[0].reason, SkipReason::Referential);

    let second = format!(
        "INSERT INTO `customers` VALUES {},{};\n",
        customer_row("P1", "Alice Smith"),
        customer_row("P2", "Bob"),
    );
    ImportJob::new("pg-second", &store, &services)
        .run(second.as_bytes())
        .await
        .expect("re-import succeeds");

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
        .fetch_one(test_db.pool())
        .await
        .unwrap();
    assert_eq!(count, 2);

    let name: String = sqlx::query_scalar("SELECT name FROM customers WHERE customer_id = 'P1'")
        .fetch_one(test_db.pool())
        .await
        .unwrap();
    assert_eq!(name, "Alice Smith");

    let fee: i64 =
        sqlx::query_scalar("SELECT monthly_fee FROM subscriptions WHERE subscription_id = 'C1'")
            .fetch_one(test_db.pool())
            .await
            .unwrap();
    assert_eq!(fee, 350000);

    let known = store.known_customer_ids().await.unwrap();
    assert!(known.contains("P1") && known.contains("P2"));

    test_db.close().await.expect("failed to drop test database");
}

#[tokio::test]
async fn postgres_batch_rejects_orphans_atomically() {
    let Some(test_db) = provision().await else {
        return;
    };
    let store = PgImportStore::new(test_db.pool_clone());
    let services = ImportServices::new(test_config());

    let dump = format!("INSERT INTO customers VALUES {};\n", customer_row("P1", "Alice"));
    ImportJob::new("pg-seed", &store, &services)
        .run(dump.as_bytes())
        .await
        .expect("seed succeeds");

    let valid = prepare_row::<SubscriptionRecord>("pg", &subscription_tokens("C1", "P1"))
        .unwrap_or_else(|_| panic!("valid subscription row"));
    let orphan = prepare_row::<SubscriptionRecord>("pg", &subscription_tokens("C2", "P9"))
        .unwrap_or_else(|_| panic!("valid subscription row"));

    let batch =
        RecordSink::<SubscriptionRecord>::upsert_batch(&store, &[valid.clone(), orphan.clone()])
            .await;
    assert!(batch.is_err());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(test_db.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);

    RecordSink::<SubscriptionRecord>::upsert_one(&store, &valid)
        .await
        .expect("valid record persists alone");
    assert!(
        RecordSink::<SubscriptionRecord>::upsert_one(&store, &orphan)
            .await
            .is_err()
    );

    test_db.close().await.expect("failed to drop test database");
}

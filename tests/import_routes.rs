use import_server::import::{ImportResult, ImportServices, ProgressSnapshot, SharedImportStore, SkippedRecord};
use import_server::models::MessageResponse;
use import_server::routes::imports::{cancel_import, get_progress, get_skipped, start_import};
use import_server::test_support::{MemoryStore, TestRocketBuilder, test_config};
use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;
use rocket::routes;
use std::sync::Arc;

const DUMP: &str = "INSERT INTO customers VALUES (1,'P1','Alice',NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL);
INSERT INTO subscriptions VALUES (1,'C1','P1','Fiber',NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL),(2,'C2','P2','Fiber',NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL,NULL);
";

fn client(services: ImportServices, store: Arc<MemoryStore>) -> Client {
    let store: SharedImportStore = store;
    TestRocketBuilder::new()
        .mount_api_routes(routes![start_import, get_progress, get_skipped, cancel_import])
        .manage_services(services)
        .manage_store(store)
        .blocking_client()
}

#[test]
fn import_endpoint_returns_result() {
    let store = Arc::new(MemoryStore::new());
    let client = client(ImportServices::new(test_config()), store.clone());

    let response = client
        .post("/api/v1/imports?progress_id=nightly")
        .header(ContentType::Plain)
        .body(DUMP)
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let result: ImportResult = response.into_json().expect("valid JSON payload");
    assert_eq!(result.progress_id, "nightly");
    assert_eq!(result.customers.imported, 1);
    assert_eq!(result.subscriptions.imported, 1);
    assert_eq!(result.subscriptions.skipped, 1);
    assert!(store.has_subscription("C1"));

    let progress: ProgressSnapshot = client
        .get("/api/v1/imports/nightly/progress")
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert_eq!(progress.percentage, 100);

    let response = client.get("/api/v1/imports/nightly/skipped/subscriptions").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let skipped: Vec<SkippedRecord> = response.into_json().expect("valid JSON payload");
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].identifying_id, "C2");
}

#[test]
fn import_endpoint_generates_progress_id() {
    let client = client(ImportServices::new(test_config()), Arc::new(MemoryStore::new()));

    let result: ImportResult = client
        .post("/api/v1/imports")
        .body(DUMP)
        .dispatch()
        .into_json()
        .expect("valid JSON payload");

    assert!(!result.progress_id.is_empty());
}

#[test]
fn import_endpoint_rejects_invalid_progress_id() {
    let client = client(ImportServices::new(test_config()), Arc::new(MemoryStore::new()));

    let response = client
        .post("/api/v1/imports?progress_id=bad%20id")
        .body(DUMP)
        .dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn import_endpoint_conflicts_with_running_job() {
    let services = ImportServices::new(test_config());
    let _running = services.registry.register("busy").unwrap();
    let client = client(services, Arc::new(MemoryStore::new()));

    let response = client
        .post("/api/v1/imports?progress_id=busy")
        .body(DUMP)
        .dispatch();
    assert_eq!(response.status(), Status::Conflict);

    let body = response.into_string().unwrap_or_default();
    assert!(body.contains("\"error\":\"Conflict\""));
}

#[test]
fn import_endpoint_reports_fatal_errors() {
    let client = client(
        ImportServices::new(test_config()),
        Arc::new(MemoryStore::new().fail_known_ids()),
    );

    let response = client
        .post("/api/v1/imports?progress_id=broken")
        .body(DUMP)
        .dispatch();
    assert_eq!(response.status(), Status::InternalServerError);

    let progress: ProgressSnapshot = client
        .get("/api/v1/imports/broken/progress")
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert_eq!(progress.percentage, -1);
}

#[test]
fn progress_for_unknown_job_is_not_started() {
    let client = client(ImportServices::new(test_config()), Arc::new(MemoryStore::new()));

    let progress: ProgressSnapshot = client
        .get("/api/v1/imports/unknown/progress")
        .dispatch()
        .into_json()
        .expect("valid JSON payload");
    assert_eq!(progress.percentage, 0);
    assert_eq!(progress.message, "Not started");
}

#[test]
fn skipped_rejects_unknown_entity() {
    let client = client(ImportServices::new(test_config()), Arc::new(MemoryStore::new()));

    let response = client.get("/api/v1/imports/job/skipped/prospects").dispatch();
    assert_eq!(response.status(), Status::BadRequest);
}

#[test]
fn cancel_reports_missing_and_running_jobs() {
    let services = ImportServices::new(test_config());
    let running = services.registry.register("running").unwrap();
    let client = client(services, Arc::new(MemoryStore::new()));

    let response = client.post("/api/v1/imports/idle/cancel").dispatch();
    assert_eq!(response.status(), Status::NotFound);

    let response = client.post("/api/v1/imports/running/cancel").dispatch();
    assert_eq!(response.status(), Status::Ok);
    let message: MessageResponse = response.into_json().expect("valid JSON payload");
    assert!(message.message.contains("running"));
    assert!(running.token().is_cancelled());
}

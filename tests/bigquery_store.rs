mod util;

use app_store_analytics::catalog;
use app_store_analytics::http::{HttpResponse, Method, RequestBody};
use app_store_analytics::registry::table_spec;
use app_store_analytics::store::{
    BigQueryConfig, BigQueryStore, CreateOutcome, StoreError, TableStore, WriteMode,
};
use serde_json::{Value, json};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use util::{ScriptedTransport, day};

const API: &str = "https://bq.test/bigquery/v2";
const UPLOAD: &str = "https://bq.test/upload/bigquery/v2";

fn store(transport: &Arc<ScriptedTransport>) -> BigQueryStore<ScriptedTransport> {
    let mut config = BigQueryConfig::new("proj", "ds", "secret-token");
    config.api_base_url = API.to_string();
    config.upload_base_url = UPLOAD.to_string();
    config.poll_interval = Duration::from_millis(1);
    BigQueryStore::new(Arc::clone(transport), config)
}

fn ok(body: Value) -> HttpResponse {
    HttpResponse::new(200).with_body(body.to_string())
}

fn json_body(body: &RequestBody) -> &Value {
    match body {
        RequestBody::Json(value) => value,
        other => panic!("expected json body, got {other:?}"),
    }
}

#[tokio::test]
async fn table_existence_maps_404_to_false() {
    let transport = ScriptedTransport::new([
        HttpResponse::new(404),
        ok(json!({"id": "proj:ds.crashes_total"})),
        HttpResponse::new(403).with_body(r#"{"error":{"code":403,"message":"Access Denied"}}"#),
    ]);
    let store = store(&transport);

    assert!(!store.table_exists("crashes_total").await.unwrap());
    assert!(store.table_exists("crashes_total").await.unwrap());
    let err = store.table_exists("crashes_total").await.unwrap_err();
    assert!(matches!(err, StoreError::Http { status: 403, .. }));

    let request = &transport.requests()[0];
    assert_eq!(request.method, Method::Get);
    assert_eq!(request.url, format!("{API}/projects/proj/datasets/ds/tables/crashes_total"));
    assert_eq!(request.header_value("Authorization"), Some("Bearer secret-token"));
}

#[tokio::test]
async fn create_is_partitioned_and_tolerates_conflict() {
    let transport = ScriptedTransport::new([ok(json!({})), HttpResponse::new(409)]);
    let store = store(&transport);
    let spec = table_spec(catalog::metric("sessions").unwrap(), Some("region"));

    assert_eq!(store.create_table(&spec).await.unwrap(), CreateOutcome::Created);
    assert_eq!(store.create_table(&spec).await.unwrap(), CreateOutcome::AlreadyExists);

    let request = &transport.requests()[0];
    assert_eq!(request.url, format!("{API}/projects/proj/datasets/ds/tables"));
    let body = json_body(&request.body);
    assert_eq!(body["tableReference"]["tableId"], "sessions_by_opt_in_region");
    assert_eq!(body["timePartitioning"], json!({"type": "DAY", "field": "date"}));
    assert_eq!(body["schema"]["fields"][3], json!({"name": "region", "type": "STRING", "mode": "REQUIRED"}));
    assert!(body["description"].as_str().unwrap().starts_with("Opt-In."));
}

#[tokio::test]
async fn missing_dataset_is_created() {
    let transport = ScriptedTransport::new([HttpResponse::new(404), ok(json!({}))]);
    store(&transport).ensure_dataset().await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0], (Method::Get, format!("{API}/projects/proj/datasets/ds")));
    assert_eq!(calls[1], (Method::Post, format!("{API}/projects/proj/datasets")));
    let body = json_body(&transport.requests()[1].body).clone();
    assert_eq!(body["datasetReference"]["datasetId"], "ds");
}

#[tokio::test]
async fn delete_uses_named_parameters_and_polls_until_complete() {
    let transport = ScriptedTransport::new([
        ok(json!({"jobReference": {"jobId": "q1", "location": "US"}, "jobComplete": false})),
        ok(json!({"jobReference": {"jobId": "q1", "location": "US"}, "jobComplete": true, "numDmlAffectedRows": "3"})),
    ]);
    let deleted = store(&transport)
        .delete_partition("crashes_total", day("2024-01-01"), "O'Focus")
        .await
        .unwrap();
    assert_eq!(deleted, 3);

    let requests = transport.requests();
    assert_eq!(requests[0].url, format!("{API}/projects/proj/queries"));
    let body = json_body(&requests[0].body);
    assert_eq!(
        body["query"],
        "DELETE FROM `proj.ds.crashes_total` WHERE date = @date AND app_name = @app_name"
    );
    assert_eq!(body["useLegacySql"], false);
    assert_eq!(body["queryParameters"][0]["parameterValue"]["value"], "2024-01-01");
    assert_eq!(body["queryParameters"][1]["parameterValue"]["value"], "O'Focus");
    assert_eq!(requests[1].method, Method::Get);
    assert_eq!(requests[1].url, format!("{API}/projects/proj/queries/q1?location=US"));
}

#[tokio::test]
async fn load_uploads_multipart_and_waits_for_done() {
    let transport = ScriptedTransport::new([
        ok(json!({"jobReference": {"jobId": "load_1", "location": "US"}})),
        ok(json!({"jobReference": {"jobId": "load_1"}, "status": {"state": "RUNNING"}})),
        ok(json!({"jobReference": {"jobId": "load_1"}, "status": {"state": "DONE"}})),
    ]);
    let store = store(&transport);
    let spec = table_spec(catalog::metric("crashes").unwrap(), None);

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"2024-01-01\tFocus\t4\n").unwrap();

    let job = store
        .submit_load(&spec, file.path(), WriteMode::Truncate)
        .await
        .unwrap();
    assert_eq!(job.job_id, "load_1");
    assert_eq!(job.location.as_deref(), Some("US"));
    store.wait_for_job(&job).await.unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].url, format!("{UPLOAD}/projects/proj/jobs?uploadType=multipart"));
    let RequestBody::Raw { content_type, bytes } = &requests[0].body else {
        panic!("raw body expected");
    };
    assert!(content_type.starts_with("multipart/related; boundary="));
    let text = String::from_utf8(bytes.clone()).unwrap();
    assert!(text.contains("\"writeDisposition\":\"WRITE_TRUNCATE\""));
    assert!(text.contains("\"createDisposition\":\"CREATE_NEVER\""));
    assert!(text.contains("2024-01-01\tFocus\t4\n"));
    assert_eq!(requests[1].url, format!("{API}/projects/proj/jobs/load_1?location=US"));
}

#[tokio::test]
async fn finished_job_with_error_result_fails() {
    let transport = ScriptedTransport::new([ok(json!({
        "jobReference": {"jobId": "load_2"},
        "status": {
            "state": "DONE",
            "errorResult": {"reason": "invalid", "message": "Too many values in row 1"}
        }
    }))]);
    let store = store(&transport);
    let job = app_store_analytics::store::JobHandle {
        job_id: "load_2".to_string(),
        location: None,
    };
    match store.wait_for_job(&job).await.unwrap_err() {
        StoreError::JobFailed { job_id, reason } => {
            assert_eq!(job_id, "load_2");
            assert!(reason.contains("Too many values"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

use app_store_analytics::analytics::{MetricRow, MetricValue};
use app_store_analytics::auth::CredentialSession;
use app_store_analytics::http::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};
use app_store_analytics::store::{
    CreateOutcome, JobHandle, MemoryStore, StoreError, TableSpec, TableStore, WriteMode,
};
use chrono::NaiveDate;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// Answers requests from a queue of canned responses, recording every request.
#[allow(dead_code)]
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<HttpResponse>>,
    requests: Mutex<Vec<HttpRequest>>,
}

#[allow(dead_code)]
impl ScriptedTransport {
    pub fn new(responses: impl IntoIterator<Item = HttpResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, response: HttpResponse) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// `(method, url)` of every request, in order.
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.requests()
            .into_iter()
            .map(|r| (r.method, r.url))
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (method, url) = (request.method, request.url.clone());
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError {
                method,
                url,
                message: "no scripted response left".to_string(),
            })
    }
}

/// [`MemoryStore`] that measures how many delete+load pairs overlap.
///
/// A pair is open from `delete_partition` until `wait_for_job` returns.
#[allow(dead_code)]
pub struct CountingStore {
    pub inner: MemoryStore,
    job_latency: Duration,
    open: AtomicUsize,
    peak: AtomicUsize,
    modes: Mutex<Vec<WriteMode>>,
}

#[allow(dead_code)]
impl CountingStore {
    pub fn new(job_latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            job_latency,
            open: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
        })
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn modes(&self) -> Vec<WriteMode> {
        self.modes.lock().unwrap().clone()
    }
}

impl TableStore for CountingStore {
    async fn ensure_dataset(&self) -> Result<(), StoreError> {
        self.inner.ensure_dataset().await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        self.inner.table_exists(table).await
    }

    async fn create_table(&self, spec: &TableSpec) -> Result<CreateOutcome, StoreError> {
        self.inner.create_table(spec).await
    }

    async fn delete_partition(
        &self,
        table: &str,
        date: NaiveDate,
        app_name: &str,
    ) -> Result<u64, StoreError> {
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let deleted = self.inner.delete_partition(table, date, app_name).await;
        if deleted.is_err() {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
        deleted
    }

    async fn submit_load(
        &self,
        spec: &TableSpec,
        source: &Path,
        mode: WriteMode,
    ) -> Result<JobHandle, StoreError> {
        self.modes.lock().unwrap().push(mode);
        let submitted = self.inner.submit_load(spec, source, mode).await;
        if submitted.is_err() {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
        submitted
    }

    async fn wait_for_job(&self, job: &JobHandle) -> Result<(), StoreError> {
        tokio::time::sleep(self.job_latency).await;
        let done = self.inner.wait_for_job(job).await;
        self.open.fetch_sub(1, Ordering::SeqCst);
        done
    }
}

#[allow(dead_code)]
pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid date")
}

#[allow(dead_code)]
pub fn int_row(date: &str, value: i64, label: Option<&str>) -> MetricRow {
    MetricRow::new(day(date), MetricValue::Int(value), label)
}

/// A session holding both cookies the analytics API needs.
#[allow(dead_code)]
pub fn signed_in_session() -> CredentialSession {
    let mut session = CredentialSession::new();
    session.absorb_set_cookie("myacinfo=account-token; Path=/; Secure; HttpOnly");
    session.absorb_set_cookie("itctx=session-token; Path=/; Secure");
    session
}

/// Response to a successful credentials POST, setting the account cookie.
#[allow(dead_code)]
pub fn sign_in_ok() -> HttpResponse {
    HttpResponse::new(200).with_header("set-cookie", "myacinfo=account-token; Path=/; Secure")
}

/// Response of the session endpoint, setting the session cookie.
#[allow(dead_code)]
pub fn session_ok() -> HttpResponse {
    HttpResponse::new(200)
        .with_header("set-cookie", "itctx=session-token; Path=/; Domain=.apple.com")
        .with_body("{}")
}

/// A 409/412 carrying the verification challenge headers.
#[allow(dead_code)]
pub fn challenge(status: u16) -> HttpResponse {
    HttpResponse::new(status)
        .with_header("X-Apple-ID-Session-Id", "sess-123")
        .with_header("scnt", "scnt-abc")
}

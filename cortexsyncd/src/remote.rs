use crate::errors::{Error, Result};
use crate::retry::{Retry, RetryPolicy, RetryState};

use clap::ValueEnum;
use cortexsync_api::{FunctionKind, SyncFailure, SyncOutcome};
use log;
use reqwest::Method;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

pub const CONTENT_TYPE: &str = "application/yaml";

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum PushMethod {
    Put,
    Post,
}

impl PushMethod {

    pub fn method(&self) -> Method {
	match self {
	    PushMethod::Put => Method::PUT,
	    PushMethod::Post => Method::POST,
	}
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub rules_url: Option<String>,
    pub alerts_url: Option<String>,
    pub tenant_header: String,
    pub push_method: PushMethod,
    pub timeout: Duration,
    pub skip_tls_verify: bool,
    pub retry: RetryPolicy,
}

impl RemoteSettings {

    pub fn base_url(&self, function: FunctionKind) -> Option<&str> {
	match function {
	    FunctionKind::Rules => self.rules_url.as_deref(),
	    FunctionKind::Alerts => self.alerts_url.as_deref(),
	}
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl RemoteRequest {

    pub fn header(&self, name: &str) -> Option<&str> {
	self.headers.iter()
	    .find(|(key, _)| key.eq_ignore_ascii_case(name))
	    .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/*
 * Transport sends one request and hands back the HTTP response. Network
 * level failures (including timeouts) are errors; any status, even a 5xx,
 * is a successful send as far as the transport is concerned.
 */
pub trait Transport: Send + Sync + 'static {
    fn send<'a>(&'a self, request: &'a RemoteRequest) -> impl Future<Output = Result<RemoteResponse>> + Send + 'a;
}

/*
 * Map a status to the call's outcome. Retryable failures come back as
 * Error::RemoteUnavailable, final ones as Error::RemoteRejected.
 */
fn classify(method: &Method, status: u16) -> Result<SyncOutcome> {
    match status {
	200..=299 => Ok(SyncOutcome::Applied),

	// deleting something that's already gone is what we wanted anyway,
	// and the ruler answers 404 when a tenant has no rule groups at all
	404 if *method == Method::DELETE || *method == Method::GET => Ok(SyncOutcome::NoOp),

	400..=499 => Err(Error::RemoteRejected{ status }),
	status => Err(Error::RemoteUnavailable(format!("status {}", status))),
    }
}

/*
 * RemoteSyncClient talks to the Cortex ruler/alertmanager API on behalf of
 * a tenant, retrying transient failures with exponential backoff.
 */
pub struct RemoteSyncClient<T> {
    transport: T,
    settings: RemoteSettings,
}

impl<T: Transport> RemoteSyncClient<T> {

    pub fn new(transport: T, settings: RemoteSettings) -> Self {
	Self{
	    transport: transport,
	    settings: settings,
	}
    }

    fn request(&self, method: Method, url: String, tenant: &str, body: Option<Vec<u8>>) -> RemoteRequest {
	let mut headers = vec![(self.settings.tenant_header.clone(), tenant.to_string())];
	if body.is_some() {
	    headers.push((String::from("Content-Type"), String::from(CONTENT_TYPE)));
	}

	RemoteRequest{
	    method: method,
	    url: url,
	    headers: headers,
	    body: body,
	}
    }

    fn unroutable(function: FunctionKind) -> SyncOutcome {
	let reason = format!("no base url configured for {}", function);
	log::error!("{}", reason);
	SyncOutcome::Failed(SyncFailure::Unavailable{ attempts: 0, reason: reason })
    }

    pub async fn push(&self, tenant: &str, function: FunctionKind, content: &[u8]) -> SyncOutcome {
	let url = match self.settings.base_url(function) {
	    Some(url) => url.to_string(),
	    None => return Self::unroutable(function),
	};

	let request = self.request(self.settings.push_method.method(), url, tenant, Some(content.to_vec()));
	self.call(request).await
    }

    pub async fn delete(&self, tenant: &str, function: FunctionKind, name: &str) -> SyncOutcome {
	let url = match self.settings.base_url(function) {
	    Some(url) => format!("{}/{}", url, name),
	    None => return Self::unroutable(function),
	};

	let request = self.request(Method::DELETE, url, tenant, None);
	self.call(request).await
    }

    /*
     * Names of the entries a tenant holds on the ruler. The listing maps
     * every entry name to its rule groups:
     *
     *   cm1:
     *     - name: example
     *       rules: [ ... ]
     */
    pub async fn list(&self, tenant: &str, function: FunctionKind) -> Result<Vec<String>, SyncFailure> {
	let url = match self.settings.base_url(function) {
	    Some(url) => url.to_string(),
	    None => return Err(SyncFailure::Unavailable{ attempts: 0, reason: format!("no base url configured for {}", function) }),
	};

	let request = self.request(Method::GET, url, tenant, None);
	let (outcome, body) = self.exchange(request).await?;
	if outcome == SyncOutcome::NoOp || body.iter().all(u8::is_ascii_whitespace) {
	    return Ok(Vec::new());
	}

	let listing: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_slice(&body)
	    .map_err(|err| SyncFailure::Unavailable{ attempts: 1, reason: format!("unreadable listing: {}", err) })?;
	Ok(listing.into_keys().collect())
    }

    async fn call(&self, request: RemoteRequest) -> SyncOutcome {
	match self.exchange(request).await {
	    Ok((outcome, _)) => outcome,
	    Err(failure) => SyncOutcome::Failed(failure),
	}
    }

    async fn exchange(&self, request: RemoteRequest) -> Result<(SyncOutcome, Vec<u8>), SyncFailure> {
	let mut retry = Retry::new(self.settings.retry);
	retry.begin();

	loop {
	    let result = self.transport.send(&request).await
		.and_then(|response| Ok((classify(&request.method, response.status)?, response.body)));

	    let err = match result {
		Ok((outcome, body)) => {
		    retry.succeed();
		    log::debug!("{} {} for tenant {} answered: {}", request.method, request.url,
				request.header(&self.settings.tenant_header).unwrap_or("-"), outcome);
		    return Ok((outcome, body));
		},
		Err(Error::RemoteRejected{ status }) => {
		    retry.abandon();
		    return Err(SyncFailure::Rejected{ status });
		},
		Err(err) => err,
	    };

	    let attempt = retry.attempts();
	    match retry.backoff() {
		Some(delay) => {
		    log::warn!("{} {} failed ({}), backoff try {} waiting {:.1}s",
			       request.method, request.url, err, attempt, delay.as_secs_f64());
		    tokio::time::sleep(delay).await;
		},
		None => {
		    debug_assert_eq!(retry.state(), RetryState::Failed);
		    return Err(SyncFailure::Unavailable{
			attempts: attempt,
			reason: err.to_string(),
		    });
		}
	    }
	}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /*
     * Records every request; answers with scripted statuses, then with
     * the fallback status once the script runs out. A status of 0 stands
     * for a network error. GET requests which succeed get the listing of
     * their tenant as body.
     */
    #[derive(Clone)]
    pub(crate) struct FakeTransport {
	pub requests: Arc<Mutex<Vec<(RemoteRequest, Instant)>>>,
	pub script: Arc<Mutex<VecDeque<u16>>>,
	pub fallback: Arc<Mutex<u16>>,
	pub listings: Arc<Mutex<BTreeMap<String, String>>>,
	pub latency: Duration,
    }

    impl FakeTransport {

	pub fn new(fallback: u16) -> Self {
	    Self{
		requests: Arc::new(Mutex::new(Vec::new())),
		script: Arc::new(Mutex::new(VecDeque::new())),
		fallback: Arc::new(Mutex::new(fallback)),
		listings: Arc::new(Mutex::new(BTreeMap::new())),
		latency: Duration::ZERO,
	    }
	}

	pub fn listing(self, tenant: &str, body: &str) -> Self {
	    self.listings.lock().unwrap().insert(tenant.to_string(), body.to_string());
	    self
	}

	pub fn then(self, status: u16) -> Self {
	    self.script.lock().unwrap().push_back(status);
	    self
	}

	pub fn answer(&self, status: u16) {
	    *self.fallback.lock().unwrap() = status;
	}

	pub fn requests(&self) -> Vec<RemoteRequest> {
	    self.requests.lock().unwrap().iter().map(|(req, _)| req.clone()).collect()
	}

	pub fn calls(&self) -> Vec<(String, String)> {
	    self.requests().into_iter().map(|req| (req.method.to_string(), req.url)).collect()
	}
    }

    impl Transport for FakeTransport {
	fn send<'a>(&'a self, request: &'a RemoteRequest) -> impl Future<Output = Result<RemoteResponse>> + Send + 'a {
	    async move {
		self.requests.lock().unwrap().push((request.clone(), Instant::now()));
		if !self.latency.is_zero() {
		    tokio::time::sleep(self.latency).await;
		}

		let scripted = self.script.lock().unwrap().pop_front();
		let status = scripted.unwrap_or_else(|| *self.fallback.lock().unwrap());
		if status == 0 {
		    return Err(Error::RemoteUnavailable("connection refused".to_string()));
		}

		let mut body = Vec::new();
		if request.method == Method::GET && (200..300).contains(&status) {
		    let tenant = request.header("X-Scope-OrgID").unwrap_or_default();
		    if let Some(listing) = self.listings.lock().unwrap().get(tenant) {
			body = listing.as_bytes().to_vec();
		    }
		}
		Ok(RemoteResponse{ status: status, body: body })
	    }
	}
    }

    pub(crate) fn settings(max_attempts: u32) -> RemoteSettings {
	RemoteSettings{
	    rules_url: Some("http://cortex/api/v1/rules".to_string()),
	    alerts_url: Some("http://cortex/api/v1/alerts".to_string()),
	    tenant_header: "X-Scope-OrgID".to_string(),
	    push_method: PushMethod::Put,
	    timeout: Duration::from_secs(10),
	    skip_tls_verify: false,
	    retry: RetryPolicy{
		max_attempts: max_attempts,
		initial_backoff: Duration::from_secs(1),
		max_backoff: Duration::from_secs(60),
	    },
	}
    }

    #[tokio::test]
    async fn push_carries_tenant_and_content() {
	let transport = FakeTransport::new(202);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	let outcome = client.push("alpha", FunctionKind::Rules, b"groups: []\n").await;
	assert_eq!(outcome, SyncOutcome::Applied);

	let requests = transport.requests();
	assert_eq!(requests.len(), 1);
	assert_eq!(requests[0].method, Method::PUT);
	assert_eq!(requests[0].url, "http://cortex/api/v1/rules");
	assert_eq!(requests[0].header("x-scope-orgid"), Some("alpha"));
	assert_eq!(requests[0].header("Content-Type"), Some(CONTENT_TYPE));
	assert_eq!(requests[0].body.as_deref(), Some(&b"groups: []\n"[..]));
    }

    #[tokio::test]
    async fn push_method_and_function_pick_the_endpoint() {
	let transport = FakeTransport::new(200);
	let mut settings = settings(5);
	settings.push_method = PushMethod::Post;
	let client = RemoteSyncClient::new(transport.clone(), settings);

	client.push("alpha", FunctionKind::Alerts, b"alertmanager_config: x\n").await;
	assert_eq!(transport.calls(), vec![("POST".to_string(), "http://cortex/api/v1/alerts".to_string())]);
    }

    #[tokio::test]
    async fn delete_targets_the_object_name() {
	let transport = FakeTransport::new(204);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	assert_eq!(client.delete("alpha", FunctionKind::Rules, "cm1").await, SyncOutcome::Applied);
	let requests = transport.requests();
	assert_eq!(requests[0].method, Method::DELETE);
	assert_eq!(requests[0].url, "http://cortex/api/v1/rules/cm1");
	assert_eq!(requests[0].header("X-Scope-OrgID"), Some("alpha"));
	assert_eq!(requests[0].body, None);
    }

    #[tokio::test]
    async fn delete_of_absent_object_is_a_success() {
	let transport = FakeTransport::new(404);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	let outcome = client.delete("alpha", FunctionKind::Rules, "gone").await;
	assert_eq!(outcome, SyncOutcome::NoOp);
	assert!(outcome.is_success());
	assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
	let transport = FakeTransport::new(400);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	let outcome = client.push("alpha", FunctionKind::Rules, b"bad").await;
	assert_eq!(outcome, SyncOutcome::Failed(SyncFailure::Rejected{ status: 400 }));
	assert_eq!(transport.requests().len(), 1);

	// a 404 on push is a rejection too, only deletes treat it as success
	transport.answer(404);
	let outcome = client.push("alpha", FunctionKind::Rules, b"bad").await;
	assert_eq!(outcome, SyncOutcome::Failed(SyncFailure::Rejected{ status: 404 }));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_api_is_retried_up_to_the_limit() {
	let transport = FakeTransport::new(503);
	let client = RemoteSyncClient::new(transport.clone(), settings(4));

	let outcome = client.push("alpha", FunctionKind::Rules, b"groups: []\n").await;
	match outcome {
	    SyncOutcome::Failed(SyncFailure::Unavailable{ attempts, reason }) => {
		assert_eq!(attempts, 4);
		assert!(reason.contains("503"), "reason: {}", reason);
	    },
	    other => panic!("unexpected outcome {:?}", other),
	}

	let sent = transport.requests.lock().unwrap().iter().map(|(_, at)| *at).collect::<Vec<_>>();
	assert_eq!(sent.len(), 4);
	let gaps = sent.windows(2).map(|w| w[1] - w[0]).collect::<Vec<_>>();
	assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
	let transport = FakeTransport::new(200).then(0).then(502);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	let outcome = client.push("alpha", FunctionKind::Rules, b"groups: []\n").await;
	assert_eq!(outcome, SyncOutcome::Applied);
	assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn list_reads_entry_names_of_a_tenant() {
	let listing = "cm1:\n  - name: g1\n    rules: []\nlost:\n  - name: g2\n    rules: []\n";
	let transport = FakeTransport::new(200).listing("alpha", listing);
	let client = RemoteSyncClient::new(transport.clone(), settings(5));

	assert_eq!(client.list("alpha", FunctionKind::Rules).await, Ok(vec!["cm1".to_string(), "lost".to_string()]));
	assert_eq!(client.list("beta", FunctionKind::Rules).await, Ok(vec![]));

	let requests = transport.requests();
	assert_eq!(requests[0].method, Method::GET);
	assert_eq!(requests[0].url, "http://cortex/api/v1/rules");
	assert_eq!(requests[0].header("X-Scope-OrgID"), Some("alpha"));

	// "no rule groups found"
	transport.answer(404);
	assert_eq!(client.list("alpha", FunctionKind::Rules).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn unreadable_listing_is_a_failure() {
	let transport = FakeTransport::new(200).listing("alpha", "- just\n- a list\n");
	let client = RemoteSyncClient::new(transport, settings(5));

	let err = client.list("alpha", FunctionKind::Rules).await.unwrap_err();
	assert!(matches!(err, SyncFailure::Unavailable{ reason, .. } if reason.contains("unreadable listing")));
    }

    #[tokio::test]
    async fn missing_base_url_fails_without_a_request() {
	let transport = FakeTransport::new(200);
	let mut settings = settings(5);
	settings.alerts_url = None;
	let client = RemoteSyncClient::new(transport.clone(), settings);

	let outcome = client.push("alpha", FunctionKind::Alerts, b"x").await;
	assert!(matches!(outcome, SyncOutcome::Failed(SyncFailure::Unavailable{ attempts: 0, .. })));
	assert!(transport.requests().is_empty());
    }
}

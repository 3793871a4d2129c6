use crate::errors::{Error, Result};
use crate::remote::{RemoteRequest, RemoteResponse, RemoteSettings, Transport};

use reqwest::Client as HttpClient;
use std::future::Future;
use std::time::Duration;

/*
 * Transport backed by reqwest. Every request carries the configured
 * timeout; running into it is reported as the API being unavailable so
 * the caller retries.
 */
#[derive(Clone)]
pub struct HttpTransport {
    http_client: HttpClient,
    timeout: Duration,
}

impl HttpTransport {

    pub fn new(settings: &RemoteSettings) -> Result<Self> {
	let http_client = HttpClient::builder()
	    .timeout(settings.timeout)
	    .danger_accept_invalid_certs(settings.skip_tls_verify)
	    .build()?;

	Ok(Self{
	    http_client: http_client,
	    timeout: settings.timeout,
	})
    }

    fn unavailable(&self, err: reqwest::Error) -> Error {
	match err.is_timeout() {
	    true => Error::RemoteUnavailable(format!("request timed out after {:.1}s", self.timeout.as_secs_f64())),
	    false => Error::Http(err),
	}
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a RemoteRequest) -> impl Future<Output = Result<RemoteResponse>> + Send + 'a {
	async move {
	    let mut builder = self.http_client.request(request.method.clone(), request.url.as_str());
	    for (name, value) in &request.headers {
		builder = builder.header(name.as_str(), value.as_str());
	    }
	    if let Some(body) = &request.body {
		builder = builder.body(body.clone());
	    }

	    let response = builder.send().await.map_err(|err| self.unavailable(err))?;
	    let status = response.status().as_u16();
	    let body = response.bytes().await.map_err(|err| self.unavailable(err))?;

	    Ok(RemoteResponse{
		status: status,
		body: body.to_vec(),
	    })
	}
    }
}

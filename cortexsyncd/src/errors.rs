use cortexsync_api::ObjectKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    /* the watch stream broke; the watcher relists after reconnecting */
    #[error("watch stream interrupted: {0}")]
    StreamInterrupted(#[from] kube::runtime::watcher::Error),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed payload in {key}: {reason}")]
    MalformedPayload { key: ObjectKey, reason: String },

    #[error("remote API rejected the request with status {status}")]
    RemoteRejected { status: u16 },

    #[error("remote API unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {

    pub fn malformed(key: &ObjectKey, reason: impl Into<String>) -> Self {
	Error::MalformedPayload{
	    key: key.clone(),
	    reason: reason.into(),
	}
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

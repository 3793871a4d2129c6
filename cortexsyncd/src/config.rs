use crate::errors::{Error, Result};
use crate::filter::{OperatorMatch, ResourceFilter};
use crate::remote::{PushMethod, RemoteSettings};
use crate::retry::RetryPolicy;
use crate::tenant::TenantSettings;

use clap::{ArgAction, Parser};
use cortexsync_api::FunctionKind;
use regex::Regex;
use std::fmt;
use std::time::Duration;

const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/*
 * Command line (and environment) surface of cortexsyncd. Every flag can
 * be set through the environment variable named next to it, which is how
 * the sidecar is configured when it runs in a pod.
 */
#[derive(Parser, Debug, Clone)]
#[command(name = "cortexsyncd", version, about = "Sync labelled ConfigMaps into the Cortex ruler or alertmanager")]
pub struct Config {

    /// Which API to feed: rules or alerts
    #[arg(long, env = "FUNCTION", default_value = "rules")]
    pub function: FunctionKind,

    /// Label key an object must carry to be synced
    #[arg(long, env = "LABEL")]
    pub label: String,

    /// Exact value the label must have; any value matches when unset
    #[arg(long, env = "LABEL_VALUE")]
    pub label_value: Option<String>,

    /// Name pattern of objects generated by an operator (e.g. prometheus-.*-rulefiles.*)
    #[arg(long, env = "OPERATOR_NAME_PATTERN")]
    pub operator_name_pattern: Option<String>,

    /// key=value label the operator puts on the objects it generates
    #[arg(long, env = "OPERATOR_LABEL")]
    pub operator_label: Option<String>,

    /// Tenant used when the namespace doesn't carry the tenant label
    #[arg(long, env = "X_SCOPE_ORGID_DEFAULT", default_value = "system")]
    pub x_scope_orgid_default: String,

    /// Namespace label holding the tenant identifier
    #[arg(long, env = "X_SCOPE_ORGID_NAMESPACE_LABEL", default_value = "")]
    pub x_scope_orgid_namespace_label: String,

    /// Header carrying the tenant identifier on every request
    #[arg(long, env = "TENANT_HEADER", default_value = "X-Scope-OrgID")]
    pub tenant_header: String,

    #[arg(long, env = "RULES_URL")]
    pub rules_url: Option<String>,

    #[arg(long, env = "ALERTS_URL")]
    pub alerts_url: Option<String>,

    /// ALL or a comma separated list of namespaces; defaults to the pod's namespace
    #[arg(long, env = "NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long, env = "PUSH_METHOD", value_enum, default_value_t = PushMethod::Put)]
    pub push_method: PushMethod,

    /// Request timeout in seconds
    #[arg(long, env = "REQ_TIMEOUT", default_value_t = 10.0)]
    pub req_timeout: f64,

    /// Attempts per request before giving up
    #[arg(long, env = "REQ_RETRY_TOTAL", default_value_t = 5)]
    pub req_retry_total: u32,

    /// First backoff delay in seconds, doubled after every failed attempt
    #[arg(long, env = "REQ_RETRY_BACKOFF_FACTOR", default_value_t = 1.1)]
    pub req_retry_backoff_factor: f64,

    #[arg(long, env = "REQ_RETRY_MAX_BACKOFF", default_value_t = 60.0)]
    pub req_retry_max_backoff: f64,

    #[arg(long, env = "REQ_SKIP_TLS_VERIFY", default_value_t = false)]
    pub req_skip_tls_verify: bool,

    /// Seconds between two full listings of the watched objects
    #[arg(long, env = "SYNC_SLEEP", default_value_t = 60)]
    pub sync_interval: u64,

    /// Seconds to wait before re-creating a watch that ended
    #[arg(long, env = "ERROR_THROTTLE_SLEEP", default_value_t = 5)]
    pub error_throttle_sleep: u64,

    #[arg(long, env = "WATCH_SERVER_TIMEOUT", default_value_t = 60)]
    pub watch_server_timeout: u32,

    /// Seconds a resolved tenant is cached for, 0 disables the cache
    #[arg(long, env = "TENANT_CACHE_TTL", default_value_t = 30)]
    pub tenant_cache_ttl: u64,

    /// Seconds in-flight requests get to finish on shutdown
    #[arg(long, env = "SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace: u64,

    /// Delete rule entries no object backs anymore (rules, watching ALL namespaces only)
    #[arg(long, env = "PRUNE_ORPHANS", default_value_t = true, action = ArgAction::Set)]
    pub prune_orphans: bool,
}

/*
 * A watched scope: one worker is started per scope.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Namespace(String),
}

impl Scope {

    pub fn contains(&self, namespace: &str) -> bool {
	match self {
	    Scope::All => true,
	    Scope::Namespace(ns) => ns == namespace,
	}
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    Scope::All => write!(f, "ALL"),
	    Scope::Namespace(ns) => write!(f, "{}", ns),
	}
    }
}

#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub sync_interval: Duration,
    pub error_throttle: Duration,
    pub server_timeout: u32,
}

/*
 * Settings is the validated, immutable context built once at startup and
 * handed to every component.
 */
#[derive(Debug, Clone)]
pub struct Settings {
    pub function: FunctionKind,
    pub filter: ResourceFilter,
    pub tenant: TenantSettings,
    pub remote: RemoteSettings,
    pub scopes: Vec<Scope>,
    pub watch: WatchSettings,
    pub shutdown_grace: Duration,

    /*
     * Remote entries are named after objects only, so whatever a tenant
     * holds may as well come from namespaces somebody else watches: the
     * orphan cleanup is only safe when watching everything.
     */
    pub prune: bool,
}

fn seconds(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
	return Err(Error::Config(format!("{} must be a positive number of seconds, got {}", name, value)));
    }
    Duration::try_from_secs_f64(value)
	.map_err(|err| Error::Config(format!("{} is out of range ({}): {}", name, value, err)))
}

fn base_url(function: FunctionKind, url: Option<&str>) -> Result<String> {
    let url = match url {
	Some(url) if !url.trim().is_empty() => url.trim(),
	_ => {
	    let var = match function {
		FunctionKind::Rules => "RULES_URL",
		FunctionKind::Alerts => "ALERTS_URL",
	    };
	    return Err(Error::Config(format!("{} is required when function is {}", var, function)));
	}
    };

    let parsed = reqwest::Url::parse(url)
	.map_err(|err| Error::Config(format!("invalid {} url `{}`: {}", function, url, err)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
	return Err(Error::Config(format!("{} url `{}` must be http or https", function, url)));
    }

    Ok(url.trim_end_matches('/').to_string())
}

/*
 * The URL of the function we don't serve is optional, but when it is
 * given it has to be valid.
 */
fn optional_url(function: FunctionKind, url: Option<&str>) -> Result<Option<String>> {
    match url {
	Some(url) if !url.trim().is_empty() => Ok(Some(base_url(function, Some(url))?)),
	_ => Ok(None),
    }
}

fn operator_match(pattern: Option<&str>, label: Option<&str>) -> Result<Option<OperatorMatch>> {
    let (pattern, label) = match (pattern, label) {
	(None, None) => return Ok(None),
	(Some(pattern), Some(label)) => (pattern, label),
	_ => {
	    let errmsg = "OPERATOR_NAME_PATTERN and OPERATOR_LABEL must be configured together";
	    return Err(Error::Config(errmsg.to_string()));
	}
    };

    // anchored: the whole name has to match, not just a substring
    let pattern = Regex::new(&format!("^(?:{})$", pattern))
	.map_err(|err| Error::Config(format!("invalid operator name pattern: {}", err)))?;

    let (key, value) = match label.split_once('=') {
	Some((key, value)) if !key.is_empty() => (key, value),
	_ => {
	    return Err(Error::Config(format!("OPERATOR_LABEL must be key=value, got `{}`", label)));
	}
    };

    Ok(Some(OperatorMatch::new(pattern, key, value)))
}

pub fn parse_scopes(namespace: &str) -> Result<Vec<Scope>> {
    let mut scopes = Vec::new();

    for ns in namespace.split(',').map(str::trim).filter(|ns| !ns.is_empty()) {
	let scope = match ns {
	    "ALL" => Scope::All,
	    ns => Scope::Namespace(ns.to_string()),
	};
	if !scopes.contains(&scope) {
	    scopes.push(scope);
	}
    }

    if scopes.is_empty() {
	return Err(Error::Config(format!("no namespace to watch in `{}`", namespace)));
    }

    // watching everything already covers any explicit namespace
    if scopes.contains(&Scope::All) {
	return Ok(vec![Scope::All]);
    }
    Ok(scopes)
}

fn default_namespace() -> Result<String> {
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
	.map(|ns| ns.trim().to_string())
	.map_err(|err| Error::Config(format!("NAMESPACE is not set and {} is unreadable: {}", SERVICE_ACCOUNT_NAMESPACE, err)))
}

impl Config {

    pub fn validate(&self) -> Result<Settings> {
	let (rules_url, alerts_url) = match self.function {
	    FunctionKind::Rules => (
		Some(base_url(FunctionKind::Rules, self.rules_url.as_deref())?),
		optional_url(FunctionKind::Alerts, self.alerts_url.as_deref())?,
	    ),
	    FunctionKind::Alerts => (
		optional_url(FunctionKind::Rules, self.rules_url.as_deref())?,
		Some(base_url(FunctionKind::Alerts, self.alerts_url.as_deref())?),
	    ),
	};

	if self.label.is_empty() {
	    return Err(Error::Config("LABEL must not be empty".to_string()));
	}
	if self.req_retry_total == 0 {
	    return Err(Error::Config("REQ_RETRY_TOTAL must be at least 1".to_string()));
	}
	if self.tenant_header.is_empty() {
	    return Err(Error::Config("TENANT_HEADER must not be empty".to_string()));
	}

	let operator = operator_match(self.operator_name_pattern.as_deref(), self.operator_label.as_deref())?;
	let label_value = self.label_value.clone().filter(|value| !value.is_empty());
	let filter = ResourceFilter::new(&self.label, label_value, operator);

	let namespace = match &self.namespace {
	    Some(ns) => ns.clone(),
	    None => default_namespace()?,
	};

	let namespace_label = Some(self.x_scope_orgid_namespace_label.clone()).filter(|label| !label.is_empty());
	let scopes = parse_scopes(&namespace)?;
	let prune = self.prune_orphans && self.function == FunctionKind::Rules && scopes == [Scope::All];

	Ok(Settings{
	    function: self.function,
	    filter: filter,
	    tenant: TenantSettings{
		default_tenant: self.x_scope_orgid_default.clone(),
		namespace_label: namespace_label,
		cache_ttl: Duration::from_secs(self.tenant_cache_ttl),
	    },
	    remote: RemoteSettings{
		rules_url: rules_url,
		alerts_url: alerts_url,
		tenant_header: self.tenant_header.clone(),
		push_method: self.push_method,
		timeout: seconds("REQ_TIMEOUT", self.req_timeout)?,
		skip_tls_verify: self.req_skip_tls_verify,
		retry: RetryPolicy{
		    max_attempts: self.req_retry_total,
		    initial_backoff: seconds("REQ_RETRY_BACKOFF_FACTOR", self.req_retry_backoff_factor)?,
		    max_backoff: seconds("REQ_RETRY_MAX_BACKOFF", self.req_retry_max_backoff)?,
		},
	    },
	    scopes: scopes,
	    watch: WatchSettings{
		sync_interval: Duration::from_secs(self.sync_interval.max(1)),
		error_throttle: Duration::from_secs(self.error_throttle_sleep),
		server_timeout: self.watch_server_timeout,
	    },
	    shutdown_grace: Duration::from_secs(self.shutdown_grace),
	    prune: prune,
	})
    }
}

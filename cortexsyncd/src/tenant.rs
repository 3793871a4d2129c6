use crate::errors::Result;

use cortexsync_api::TenantContext;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use log;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct TenantSettings {
    pub default_tenant: String,

    // namespace label holding the tenant, None means always use the default
    pub namespace_label: Option<String>,

    pub cache_ttl: Duration,
}

/*
 * Point lookup of a namespace's labels. Ok(None) means the namespace
 * doesn't exist.
 */
pub trait NamespaceLookup: Send + Sync + 'static {
    fn labels<'a>(&'a self, namespace: &'a str) -> impl Future<Output = Result<Option<BTreeMap<String, String>>>> + Send + 'a;
}

#[derive(Clone)]
pub struct KubeNamespaces {
    namespace_api: KubeApi<KubeNamespace>,
}

impl KubeNamespaces {

    pub fn new(kube_client: KubeClient) -> Self {
	Self{
	    namespace_api: KubeApi::all(kube_client),
	}
    }
}

impl NamespaceLookup for KubeNamespaces {
    fn labels<'a>(&'a self, namespace: &'a str) -> impl Future<Output = Result<Option<BTreeMap<String, String>>>> + Send + 'a {
	async move {
	    let ns = self.namespace_api.get_opt(namespace).await?;
	    Ok(ns.map(|ns| ns.metadata.labels.unwrap_or_default()))
	}
    }
}

/*
 * TenantResolver maps a namespace to the tenant its objects belong to.
 *
 * It never fails: a missing label, a missing namespace or an API error
 * all degrade to the default tenant, so sync keeps going.
 */
pub struct TenantResolver<L> {
    lookup: L,
    settings: TenantSettings,
    cache: Mutex<HashMap<String, (TenantContext, Instant)>>,
}

impl<L: NamespaceLookup> TenantResolver<L> {

    pub fn new(lookup: L, settings: TenantSettings) -> Self {
	Self{
	    lookup: lookup,
	    settings: settings,
	    cache: Mutex::new(HashMap::new()),
	}
    }

    fn cached(&self, namespace: &str) -> Option<TenantContext> {
	let cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

	match cache.get(namespace) {
	    Some((ctx, at)) if at.elapsed() < self.settings.cache_ttl => Some(ctx.clone()),
	    _ => None,
	}
    }

    fn remember(&self, ctx: &TenantContext) {
	if self.settings.cache_ttl.is_zero() {
	    return;
	}

	let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	if cache.len() >= CACHE_CAPACITY {
	    let ttl = self.settings.cache_ttl;
	    cache.retain(|_, (_, at)| at.elapsed() < ttl);

	    if cache.len() >= CACHE_CAPACITY {
		cache.clear();
	    }
	}
	cache.insert(ctx.namespace.clone(), (ctx.clone(), Instant::now()));
    }

    /*
     * Drop the cached tenant of a namespace, called whenever the namespace
     * object changes so a relabel is seen by the very next event.
     */
    pub fn invalidate(&self, namespace: &str) {
	let mut cache = self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
	if cache.remove(namespace).is_some() {
	    log::debug!("dropped cached tenant for namespace {}", namespace);
	}
    }

    pub fn default_tenant(&self) -> &str {
	&self.settings.default_tenant
    }

    pub fn caching(&self) -> bool {
	self.settings.namespace_label.is_some() && !self.settings.cache_ttl.is_zero()
    }

    pub async fn resolve(&self, namespace: &str) -> TenantContext {
	let default = TenantContext::default_for(namespace, &self.settings.default_tenant);
	let label = match &self.settings.namespace_label {
	    Some(label) => label,
	    None => return default,
	};

	if let Some(ctx) = self.cached(namespace) {
	    return ctx;
	}

	let ctx = match self.lookup.labels(namespace).await {
	    Ok(Some(labels)) => match labels.get(label) {
		Some(tenant) if !tenant.is_empty() => TenantContext::from_label(namespace, tenant),
		_ => default,
	    },
	    Ok(None) => {
		log::warn!("namespace {} not found, using default tenant {}", namespace, default.tenant);
		return default;
	    },
	    Err(err) => {
		// not cached: the next event gets another chance at the label
		log::warn!("unable to read labels of namespace {}, using default tenant {}: {}", namespace, default.tenant, err);
		return default;
	    }
	};

	log::debug!("namespace {} resolves to tenant {} ({})", namespace, ctx.tenant, ctx.source);
	self.remember(&ctx);
	ctx
    }
}

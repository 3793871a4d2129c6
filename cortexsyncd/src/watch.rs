use crate::config::{Scope, WatchSettings};
use crate::dispatcher::ScopeEvent;
use crate::errors::Error;
use crate::reconcile::Reconciler;
use crate::remote::Transport;
use crate::tenant::NamespaceLookup;

use cortexsync_api::WatchedObject;
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::ConfigMap as KubeConfigMap;
use k8s_openapi::api::core::v1::Namespace as KubeNamespace;
use kube::Api as KubeApi;
use kube::Client as KubeClient;
use kube::api::ListParams as KubeListParams;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher as kube_watcher;
use kube::runtime::watcher::Config as KubeWatcherConfig;
use kube::runtime::watcher::Event as KubeEvent;
use log;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

type Closed = mpsc::error::SendError<ScopeEvent>;
type WatchItem = Result<KubeEvent<KubeConfigMap>, kube_watcher::Error>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScopeState {
    /*
     * no usable stream: before the first connection or after an error,
     * the watcher backs off and reconnects on its own
     */
    Disconnected,

    /*
     * (re)listing the scope, objects are collected until the listing is
     * complete
     */
    Connecting,

    /*
     * listing done, following the watch
     */
    Streaming,
}

fn convert(cm: &KubeConfigMap) -> Option<WatchedObject> {
    match WatchedObject::try_from(cm) {
	Ok(obj) => Some(obj),
	Err(err) => {
	    log::warn!("ignoring configmap {:?}: {}", cm.metadata.name, err);
	    None
	}
    }
}

/*
 * Turns the watcher's raw events into scope events, tracking the state of
 * the stream along the way. An initial (or post-reconnect) listing is
 * buffered and handed over as one Resync, so missed deletes are noticed.
 */
struct ScopeStream {
    scope: Scope,
    state: ScopeState,
    listing: Option<Vec<WatchedObject>>,
}

impl ScopeStream {

    fn new(scope: Scope) -> Self {
	Self{
	    scope: scope,
	    state: ScopeState::Disconnected,
	    listing: None,
	}
    }

    fn transition(&mut self, state: ScopeState) {
	if self.state != state {
	    log::info!("watch on scope {}: {:?} -> {:?}", self.scope, self.state, state);
	    self.state = state;
	}
    }

    fn on_error(&mut self, err: Error) {
	if self.state != ScopeState::Disconnected {
	    log::warn!("watch on scope {}: {}", self.scope, err);
	} else {
	    log::debug!("watch on scope {}: {}", self.scope, err);
	}
	self.listing = None;
	self.transition(ScopeState::Disconnected);
    }

    fn on_event(&mut self, event: KubeEvent<KubeConfigMap>) -> Option<ScopeEvent> {
	match event {
	    KubeEvent::Init => {
		self.transition(ScopeState::Connecting);
		self.listing = Some(Vec::new());
		None
	    },
	    KubeEvent::InitApply(cm) => {
		if let (Some(listing), Some(obj)) = (self.listing.as_mut(), convert(&cm)) {
		    listing.push(obj);
		}
		None
	    },
	    KubeEvent::InitDone => {
		self.transition(ScopeState::Streaming);
		let objects = self.listing.take().unwrap_or_default();
		Some(ScopeEvent::Resync{ scope: self.scope.clone(), objects: objects })
	    },
	    KubeEvent::Apply(cm) => convert(&cm).map(ScopeEvent::Applied),
	    KubeEvent::Delete(cm) => convert(&cm).map(ScopeEvent::Deleted),
	}
    }
}

/*
 * Forward a scope's watch events and, every `period` while streaming, a
 * fresh listing. Returns Ok when the watch ends, Err when nobody listens
 * to the events anymore.
 */
async fn follow<S, F, Fut>(scope: &Scope, period: Duration, watcher: S, list: F, events: &mpsc::Sender<ScopeEvent>) -> Result<(), Closed>
where
    S: Stream<Item = WatchItem>,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<WatchedObject>, Error>>,
{
    let mut scope_stream = ScopeStream::new(scope.clone());
    futures::pin_mut!(watcher);

    let mut resync = tokio::time::interval_at(Instant::now() + period, period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
	tokio::select! {
	    event = watcher.next() => match event {
		None => return Ok(()),
		Some(Err(err)) => scope_stream.on_error(Error::StreamInterrupted(err)),
		Some(Ok(event)) => {
		    if let Some(event) = scope_stream.on_event(event) {
			events.send(event).await?;
		    }
		},
	    },

	    // when not streaming, the watcher's own relist is already on its way
	    _ = resync.tick(), if scope_stream.state == ScopeState::Streaming => {
		match list().await {
		    Ok(objects) => {
			events.send(ScopeEvent::Resync{ scope: scope.clone(), objects: objects }).await?;
		    },
		    Err(err) => log::warn!("periodic listing of scope {} failed: {}", scope, err),
		}
	    },
	}
    }
}

/*
 * ScopeWatcher follows the ConfigMaps of one scope (a namespace or ALL)
 * and feeds them to the dispatcher, relisting the scope periodically.
 */
pub struct ScopeWatcher {
    scope: Scope,
    selector: Option<String>,
    settings: WatchSettings,

    configmap_api: KubeApi<KubeConfigMap>,
    events: mpsc::Sender<ScopeEvent>,
}

impl ScopeWatcher {

    pub fn new(kube_client: KubeClient, scope: Scope, selector: Option<String>, settings: WatchSettings, events: mpsc::Sender<ScopeEvent>) -> Self {
	let configmap_api = match &scope {
	    Scope::All => KubeApi::all(kube_client),
	    Scope::Namespace(ns) => KubeApi::namespaced(kube_client, ns),
	};

	Self{
	    scope: scope,
	    selector: selector,
	    settings: settings,
	    configmap_api: configmap_api,
	    events: events,
	}
    }

    fn watcher_config(&self) -> KubeWatcherConfig {
	let config = KubeWatcherConfig::default().timeout(self.settings.server_timeout);
	match &self.selector {
	    Some(selector) => config.labels(selector),
	    None => config,
	}
    }

    async fn list(&self) -> Result<Vec<WatchedObject>, Error> {
	let mut params = KubeListParams::default();
	if let Some(selector) = &self.selector {
	    params = params.labels(selector);
	}

	let configmaps = self.configmap_api.list(&params).await?;
	Ok(configmaps.items.iter().filter_map(convert).collect())
    }

    async fn stream(&self) -> Result<(), Closed> {
	let watcher = kube_watcher(self.configmap_api.clone(), self.watcher_config()).default_backoff();
	follow(&self.scope, self.settings.sync_interval, watcher, || self.list(), &self.events).await
    }

    pub async fn run(self) {
	log::info!("> watching configmaps in scope {} (selector: {:?})", self.scope, self.selector);

	loop {
	    if self.stream().await.is_err() {
		log::info!("< dispatcher is gone, stopping watch on scope {}", self.scope);
		return;
	    }

	    log::warn!("watch on scope {} ended, restarting in {:?}", self.scope, self.settings.error_throttle);
	    tokio::time::sleep(self.settings.error_throttle).await;
	}
    }
}

/*
 * namespace_watcher drops the cached tenant of every namespace that
 * changes, so a relabel takes effect on the next event of that namespace.
 */
pub fn namespace_watcher<L, T>(kube_client: KubeClient, reconciler: Arc<Reconciler<L, T>>) -> impl Future<Output = ()>
where
    L: NamespaceLookup,
    T: Transport,
{
    let namespace_api: KubeApi<KubeNamespace> = KubeApi::all(kube_client);

    kube_watcher(namespace_api, KubeWatcherConfig::default())
	.default_backoff()
	.touched_objects()
	.for_each(move |ns| {
	    match ns {
		Ok(ns) => {
		    if let Some(name) = ns.metadata.name.as_deref() {
			reconciler.tenants().invalidate(name);
		    }
		},
		Err(err) => log::warn!("namespace watch: {}", err),
	    }

	    futures::future::ready(())
	})
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn configmap(name: &str, namespace: Option<&str>) -> KubeConfigMap {
	let mut data = BTreeMap::new();
	data.insert("rules.yaml".to_string(), "groups: []".to_string());

	KubeConfigMap{
	    metadata: ObjectMeta{
		name: Some(name.to_string()),
		namespace: namespace.map(str::to_string),
		..ObjectMeta::default()
	    },
	    data: Some(data),
	    ..KubeConfigMap::default()
	}
    }

    fn names(event: &ScopeEvent) -> Vec<String> {
	match event {
	    ScopeEvent::Resync{ objects, .. } => objects.iter().map(|obj| obj.name().to_string()).collect(),
	    ScopeEvent::Applied(obj) | ScopeEvent::Deleted(obj) => vec![obj.name().to_string()],
	}
    }

    #[test]
    fn initial_listing_becomes_one_resync() {
	let mut stream = ScopeStream::new(Scope::Namespace("ns-a".to_string()));
	assert_eq!(stream.state, ScopeState::Disconnected);

	assert!(stream.on_event(KubeEvent::Init).is_none());
	assert_eq!(stream.state, ScopeState::Connecting);
	assert!(stream.on_event(KubeEvent::InitApply(configmap("cm1", Some("ns-a")))).is_none());
	assert!(stream.on_event(KubeEvent::InitApply(configmap("cm2", Some("ns-a")))).is_none());

	let resync = stream.on_event(KubeEvent::InitDone).unwrap();
	assert_eq!(stream.state, ScopeState::Streaming);
	assert!(matches!(&resync, ScopeEvent::Resync{ scope: Scope::Namespace(ns), .. } if ns == "ns-a"));
	assert_eq!(names(&resync), vec!["cm1", "cm2"]);
    }

    #[test]
    fn watch_events_pass_through() {
	let mut stream = ScopeStream::new(Scope::All);

	let applied = stream.on_event(KubeEvent::Apply(configmap("cm1", Some("ns-a")))).unwrap();
	assert!(matches!(applied, ScopeEvent::Applied(_)));
	let deleted = stream.on_event(KubeEvent::Delete(configmap("cm1", Some("ns-a")))).unwrap();
	assert!(matches!(deleted, ScopeEvent::Deleted(_)));

	// objects without a namespace can't be keyed, they're dropped
	assert!(stream.on_event(KubeEvent::Apply(configmap("odd", None))).is_none());
    }

    fn listed(name: &str) -> Result<Vec<WatchedObject>, Error> {
	Ok(vec![convert(&configmap(name, Some("ns-a"))).unwrap()])
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_scope_is_relisted_periodically() {
	let listing: Vec<WatchItem> = vec![
	    Ok(KubeEvent::Init),
	    Ok(KubeEvent::InitApply(configmap("cm1", Some("ns-a")))),
	    Ok(KubeEvent::InitDone),
	];
	let watch = stream::iter(listing).chain(stream::pending());

	let lists = AtomicUsize::new(0);
	let list = || {
	    lists.fetch_add(1, Ordering::SeqCst);
	    async { listed("cm2") }
	};

	let (tx, mut rx) = mpsc::channel(8);
	let scope = Scope::Namespace("ns-a".to_string());
	let following = follow(&scope, Duration::from_secs(60), watch, list, &tx);
	futures::pin_mut!(following);

	let start = Instant::now();
	let first = tokio::select! {
	    _ = &mut following => panic!("the watch never ends"),
	    event = rx.recv() => event.unwrap(),
	};
	assert_eq!(names(&first), vec!["cm1"]);

	let second = tokio::select! {
	    _ = &mut following => panic!("the watch never ends"),
	    event = rx.recv() => event.unwrap(),
	};
	assert_eq!(names(&second), vec!["cm2"]);
	assert!(matches!(second, ScopeEvent::Resync{ .. }));
	assert!(start.elapsed() >= Duration::from_secs(60));
	assert_eq!(lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_scope_is_not_relisted() {
	let lists = AtomicUsize::new(0);
	let list = || {
	    lists.fetch_add(1, Ordering::SeqCst);
	    async { listed("cm2") }
	};

	let (tx, mut rx) = mpsc::channel(8);
	let following = follow(&Scope::All, Duration::from_secs(60), stream::pending::<WatchItem>(), list, &tx);

	let waited = tokio::time::timeout(Duration::from_secs(300), following).await;
	assert!(waited.is_err());
	assert_eq!(lists.load(Ordering::SeqCst), 0);
	assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn follow_returns_when_the_watch_ends() {
	let lists = AtomicUsize::new(0);
	let list = || {
	    lists.fetch_add(1, Ordering::SeqCst);
	    async { listed("cm2") }
	};

	let (tx, mut rx) = mpsc::channel(8);
	let applied = || -> Vec<WatchItem> { vec![Ok(KubeEvent::Apply(configmap("cm1", Some("ns-a"))))] };
	let watch = stream::iter(applied());
	assert!(follow(&Scope::All, Duration::from_secs(60), watch, list, &tx).await.is_ok());
	assert!(matches!(rx.try_recv(), Ok(ScopeEvent::Applied(_))));

	// nobody listening anymore is what stops the watcher for good
	drop(rx);
	let watch = stream::iter(applied()).chain(stream::pending());
	assert!(follow(&Scope::All, Duration::from_secs(60), watch, list, &tx).await.is_err());
    }

    #[test]
    fn errors_discard_a_partial_listing() {
	let mut stream = ScopeStream::new(Scope::All);
	stream.on_event(KubeEvent::Init);
	stream.on_event(KubeEvent::InitApply(configmap("cm1", Some("ns-a"))));

	stream.on_error(Error::RemoteUnavailable("connection reset".to_string()));
	assert_eq!(stream.state, ScopeState::Disconnected);

	stream.on_event(KubeEvent::Init);
	stream.on_event(KubeEvent::InitApply(configmap("cm2", Some("ns-a"))));
	let resync = stream.on_event(KubeEvent::InitDone).unwrap();
	assert_eq!(names(&resync), vec!["cm2"]);
    }
}

use crate::config::Scope;
use crate::reconcile::Reconciler;
use crate::remote::Transport;
use crate::tenant::NamespaceLookup;

use cortexsync_api::{ObjectKey, WatchedObject};
use log;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/*
 * The uniform event handed to the reconciler. Synthesized deletes (from a
 * resync) carry no object.
 */
#[derive(Debug, Clone)]
pub struct InternalEvent {
    pub key: ObjectKey,
    pub kind: EventKind,
    pub object: Option<WatchedObject>,
}

/*
 * What scope watchers feed into the dispatcher.
 */
#[derive(Debug)]
pub enum ScopeEvent {
    Applied(WatchedObject),
    Deleted(WatchedObject),

    /*
     * A full listing of the scope: anything we know of in the scope but
     * missing from the listing was deleted while we weren't looking.
     */
    Resync { scope: Scope, objects: Vec<WatchedObject> },
}

/*
 * A worker's mailbox holds the newest event not yet picked up. Every event
 * carries the object's full state, so a newer one makes older pending ones
 * pointless: a slow object never builds up a backlog.
 */
struct Worker {
    mailbox: watch::Sender<Option<InternalEvent>>,
    handle: JoinHandle<()>,
}

/*
 * Objects known to be alive in the cluster, shared with the orphan
 * cleanup which runs next to the workers.
 */
#[derive(Clone, Default)]
struct Seen(Arc<Mutex<HashSet<ObjectKey>>>);

impl Seen {

    fn keys(&self) -> MutexGuard<'_, HashSet<ObjectKey>> {
	self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn contains(&self, key: &ObjectKey) -> bool {
	self.keys().contains(key)
    }

    fn insert(&self, key: ObjectKey) {
	self.keys().insert(key);
    }

    fn remove(&self, key: &ObjectKey) {
	self.keys().remove(key);
    }

    fn snapshot(&self) -> Vec<ObjectKey> {
	self.keys().iter().cloned().collect()
    }

    fn holds_name(&self, name: &str) -> bool {
	self.keys().iter().any(|key| key.name == name)
    }

    fn namespaces(&self) -> BTreeSet<String> {
	self.keys().iter().map(|key| key.namespace.clone()).collect()
    }
}

/*
 * Dispatcher serializes processing per object: every key gets its own
 * worker task, so two events of one object are never reconciled
 * concurrently nor out of order, while different objects proceed in
 * parallel. Events superseded while the worker is busy are skipped.
 *
 * A worker is retired when its object is deleted. If the object comes
 * back, the new worker first waits for the retired one to finish.
 */
pub struct Dispatcher<L, T> {
    reconciler: Arc<Reconciler<L, T>>,
    workers: HashMap<ObjectKey, Worker>,
    retiring: HashMap<ObjectKey, JoinHandle<()>>,
    seen: Seen,
    pruning: Option<JoinHandle<()>>,
}

impl<L: NamespaceLookup, T: Transport> Dispatcher<L, T> {

    pub fn new(reconciler: Arc<Reconciler<L, T>>) -> Self {
	Self{
	    reconciler: reconciler,
	    workers: HashMap::new(),
	    retiring: HashMap::new(),
	    seen: Seen::default(),
	    pruning: None,
	}
    }

    /*
     * Consume scope events until every sender is gone, then drain the
     * workers within the grace period.
     */
    pub async fn run(mut self, mut events: mpsc::Receiver<ScopeEvent>, grace: Duration) {
	while let Some(event) = events.recv().await {
	    self.handle(event);
	}

	log::info!("event stream closed, draining in-flight work");
	self.shutdown(grace).await;
    }

    pub fn handle(&mut self, event: ScopeEvent) {
	match event {
	    ScopeEvent::Applied(obj) => self.applied(obj),
	    ScopeEvent::Deleted(obj) => {
		self.dispatch(InternalEvent{
		    key: obj.key.clone(),
		    kind: EventKind::Deleted,
		    object: Some(obj),
		});
	    },
	    ScopeEvent::Resync{ scope, objects } => self.resync(&scope, objects),
	}
    }

    fn applied(&mut self, obj: WatchedObject) {
	let kind = if self.seen.contains(&obj.key) { EventKind::Modified } else { EventKind::Added };

	self.dispatch(InternalEvent{
	    key: obj.key.clone(),
	    kind: kind,
	    object: Some(obj),
	});
    }

    fn resync(&mut self, scope: &Scope, objects: Vec<WatchedObject>) {
	log::info!("resync of scope {}: {} object(s) listed, {} tracked overall", scope, objects.len(), self.reconciler.store().len());

	let listed: HashSet<ObjectKey> = objects.iter().map(|obj| obj.key.clone()).collect();
	for obj in objects {
	    self.applied(obj);
	}

	// pushed (store) or possibly being pushed right now (seen)
	let known: BTreeSet<ObjectKey> = self.reconciler.store().keys().into_iter()
	    .chain(self.seen.snapshot())
	    .filter(|key| scope.contains(&key.namespace) && !listed.contains(key))
	    .collect();

	for key in known {
	    log::info!("{} is gone from the listing, treating it as deleted", key);
	    self.dispatch(InternalEvent{
		key: key,
		kind: EventKind::Deleted,
		object: None,
	    });
	}

	self.retiring.retain(|_, handle| !handle.is_finished());

	if self.reconciler.prunes() {
	    self.prune();
	}
    }

    /*
     * Look for remote entries nothing backs anymore, unless the previous
     * cleanup is still at it.
     */
    fn prune(&mut self) {
	if self.pruning.as_ref().is_some_and(|handle| !handle.is_finished()) {
	    log::debug!("orphan cleanup still running, skipping this round");
	    return;
	}

	let reconciler = self.reconciler.clone();
	let seen = self.seen.clone();
	let namespaces = seen.namespaces();

	self.pruning = Some(tokio::spawn(async move {
	    let pruned = reconciler.prune(namespaces, |name| seen.holds_name(name)).await;
	    if pruned > 0 {
		log::info!("removed {} orphan entr(y|ies) from the remote API", pruned);
	    }
	}));
    }

    fn spawn(&mut self, key: &ObjectKey, previous: Option<JoinHandle<()>>) -> Worker {
	let (mailbox, mut rx) = watch::channel::<Option<InternalEvent>>(None);
	let reconciler = self.reconciler.clone();
	let previous = previous.or_else(|| self.retiring.remove(key));

	let handle = tokio::spawn(async move {
	    if let Some(previous) = previous {
		let _ = previous.await;
	    }

	    // a closed mailbox still hands out its last unseen event first
	    while rx.changed().await.is_ok() {
		let event = rx.borrow_and_update().clone();
		if let Some(event) = event {
		    reconciler.reconcile(event).await;
		}
	    }
	});

	Worker{
	    mailbox: mailbox,
	    handle: handle,
	}
    }

    fn dispatch(&mut self, event: InternalEvent) {
	let key = event.key.clone();
	let deleted = event.kind == EventKind::Deleted;

	let worker = match self.workers.remove(&key) {
	    Some(worker) if !worker.mailbox.is_closed() => worker,

	    // the worker died (it panicked), its successor waits for it anyway
	    Some(worker) => self.spawn(&key, Some(worker.handle)),
	    None => self.spawn(&key, None),
	};

	// replaces the pending event, if the worker hasn't picked it up yet
	worker.mailbox.send_replace(Some(event));

	if deleted {
	    // closing the mailbox lets the worker finish the pending event, then exit
	    self.seen.remove(&key);
	    self.retiring.insert(key, worker.handle);
	} else {
	    self.seen.insert(key.clone());
	    self.workers.insert(key, worker);
	}
    }

    pub async fn shutdown(self, grace: Duration) {
	let mut handles: Vec<JoinHandle<()>> = self.retiring.into_values().collect();
	for (_, worker) in self.workers {
	    drop(worker.mailbox);
	    handles.push(worker.handle);
	}
	handles.extend(self.pruning);

	let aborts: Vec<_> = handles.iter().map(|handle| handle.abort_handle()).collect();
	match tokio::time::timeout(grace, futures::future::join_all(handles)).await {
	    Ok(_) => log::info!("all in-flight work drained"),
	    Err(_) => {
		// aborted calls never reach the store, they'll be redone after restart
		log::warn!("in-flight work didn't finish within {:?}, aborting {} worker(s)", grace, aborts.len());
		for abort in aborts {
		    abort.abort();
		}
	    }
	}
    }
}

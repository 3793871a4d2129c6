use crate::config::Settings;
use crate::dispatcher::{EventKind, InternalEvent};
use crate::filter::ResourceFilter;
use crate::normalize;
use crate::remote::{RemoteSyncClient, Transport};
use crate::store::ReconciliationStore;
use crate::tenant::{NamespaceLookup, TenantResolver};

use cortexsync_api::{FunctionKind, ObjectKey, ReconciliationRecord, SyncOutcome};
use log;
use std::collections::BTreeSet;
use std::fmt;

/*
 * What the reconciler did about one event.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /* the remote API already holds this exact content */
    Unchanged,

    /* not in scope and never pushed, nothing to clean up */
    Untracked,

    /* the content couldn't be normalized, waits for a corrected version */
    Malformed(String),

    Pushed(SyncOutcome),
    Deleted(SyncOutcome),
}

impl Decision {

    fn name(&self) -> &'static str {
	match self {
	    Decision::Unchanged | Decision::Untracked | Decision::Malformed(_) => "skip",
	    Decision::Pushed(outcome) | Decision::Deleted(outcome) if !outcome.is_success() => "fail",
	    Decision::Pushed(_) => "push",
	    Decision::Deleted(_) => "delete",
	}
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
	match self {
	    Decision::Unchanged => write!(f, "unchanged"),
	    Decision::Untracked => write!(f, "untracked"),
	    Decision::Malformed(reason) => write!(f, "malformed: {}", reason),
	    Decision::Pushed(outcome) | Decision::Deleted(outcome) => write!(f, "{}", outcome),
	}
    }
}

fn report(key: &ObjectKey, tenant: Option<&str>, decision: &Decision) {
    let tenant = tenant.unwrap_or("-");

    match decision {
	Decision::Pushed(SyncOutcome::Failed(_)) | Decision::Deleted(SyncOutcome::Failed(_)) => {
	    log::error!("decision={} key={} tenant={} outcome=\"{}\"", decision.name(), key, tenant, decision);
	},
	Decision::Malformed(_) => {
	    log::warn!("decision={} key={} tenant={} outcome=\"{}\"", decision.name(), key, tenant, decision);
	},
	_ => {
	    log::info!("decision={} key={} tenant={} outcome=\"{}\"", decision.name(), key, tenant, decision);
	},
    }
}

/*
 * Reconciler converges the remote API to one object's current state:
 *
 *   filter -> resolve tenant -> normalize -> diff with the store -> push/delete -> store
 *
 * It is called by at most one worker per key at a time, so the read and
 * write of a key's record can't interleave with another event for the
 * same key.
 */
pub struct Reconciler<L, T> {
    function: FunctionKind,
    prune: bool,
    filter: ResourceFilter,
    tenants: TenantResolver<L>,
    store: ReconciliationStore,
    remote: RemoteSyncClient<T>,
}

impl<L: NamespaceLookup, T: Transport> Reconciler<L, T> {

    pub fn new(settings: &Settings, tenants: TenantResolver<L>, store: ReconciliationStore, remote: RemoteSyncClient<T>) -> Self {
	Self{
	    function: settings.function,
	    prune: settings.prune,
	    filter: settings.filter.clone(),
	    tenants: tenants,
	    store: store,
	    remote: remote,
	}
    }

    pub fn tenants(&self) -> &TenantResolver<L> {
	&self.tenants
    }

    pub fn store(&self) -> &ReconciliationStore {
	&self.store
    }

    pub fn prunes(&self) -> bool {
	self.prune
    }

    pub async fn reconcile(&self, event: InternalEvent) -> Decision {
	let key = event.key;
	let obj = match (event.kind, event.object) {
	    (EventKind::Deleted, _) | (_, None) => return self.remove(&key).await,
	    (_, Some(obj)) => obj,
	};

	// fell out of scope (label removed, name changed): same as a delete
	if !self.filter.matches(&obj) {
	    return self.remove(&key).await;
	}

	let tenant = self.tenants.resolve(obj.namespace()).await;
	let payload = match normalize::normalize(&obj, &tenant, self.function) {
	    Ok(payload) => payload,
	    Err(err) => {
		let decision = Decision::Malformed(err.to_string());
		report(&key, Some(&tenant.tenant), &decision);
		return decision;
	    }
	};

	let previous = self.store.get(&key);
	if let Some(record) = &previous {
	    if record.fingerprint == payload.fingerprint && record.tenant == payload.tenant {
		log::debug!("{} unchanged since {}", key, record.last_synced);
		self.sweep(&key).await;
		let decision = Decision::Unchanged;
		report(&key, Some(&payload.tenant), &decision);
		return decision;
	    }
	}

	let outcome = self.remote.push(&payload.tenant, self.function, &payload.content).await;
	if outcome.is_success() {
	    self.store.put(key.clone(), ReconciliationRecord::new(&payload.fingerprint, &payload.tenant));

	    // the namespace moved to another tenant, the old one still holds a copy
	    if let Some(record) = previous.filter(|record| record.tenant != payload.tenant) {
		self.store.add_leftover(key.clone(), &record.tenant);
	    }
	    self.sweep(&key).await;
	}

	let decision = Decision::Pushed(outcome);
	report(&key, Some(&payload.tenant), &decision);
	decision
    }

    /*
     * Remove the object from the remote API if we ever pushed it. The
     * record is dropped only once the remote side confirmed, a failed
     * delete is retried by the next event or resync.
     */
    async fn remove(&self, key: &ObjectKey) -> Decision {
	let record = self.store.get(key);
	let leftovers = self.store.leftovers(key);

	let tenant = match (&record, leftovers.first()) {
	    (Some(record), _) => record.tenant.clone(),
	    (None, Some(tenant)) => tenant.clone(),
	    (None, None) => {
		let decision = Decision::Untracked;
		report(key, None, &decision);
		return decision;
	    }
	};

	let mut outcome = None;
	if let Some(record) = &record {
	    let deleted = self.remote.delete(&record.tenant, self.function, &key.name).await;
	    if deleted.is_success() {
		self.store.remove(key);
	    }
	    outcome = Some(deleted);
	}
	let swept = self.sweep(key).await;

	let outcome = match outcome {
	    Some(outcome) if !outcome.is_success() || swept.is_success() => outcome,
	    _ => swept,
	};

	let decision = Decision::Deleted(outcome);
	report(key, Some(&tenant), &decision);
	decision
    }

    /*
     * Delete the copies previous tenants of the object still hold. The
     * ones that fail stay recorded and are tried again by the next event
     * (a resync brings one at least every sync interval).
     */
    async fn sweep(&self, key: &ObjectKey) -> SyncOutcome {
	let mut outcome = SyncOutcome::NoOp;

	for tenant in self.store.leftovers(key) {
	    let removed = self.remote.delete(&tenant, self.function, &key.name).await;
	    if removed.is_success() {
		log::info!("removed {} from previous tenant {}", key, tenant);
		self.store.clear_leftover(key, &tenant);
		if outcome == SyncOutcome::NoOp {
		    outcome = SyncOutcome::Applied;
		}
	    } else {
		log::warn!("unable to remove {} from previous tenant {}: {}", key, tenant, removed);
		outcome = removed;
	    }
	}

	outcome
    }

    /*
     * Delete what tenants hold on the ruler without any object behind it,
     * e.g. objects deleted while this process wasn't running. Scanned are
     * the default tenant, the tenants we pushed to and those of the given
     * namespaces.
     *
     * `backed` is asked right before each delete, so an object which
     * showed up since the listing is left alone.
     */
    pub async fn prune(&self, namespaces: BTreeSet<String>, backed: impl Fn(&str) -> bool) -> usize {
	if !self.prune {
	    return 0;
	}

	let mut tenants = self.store.tenants();
	tenants.insert(self.tenants.default_tenant().to_string());
	for namespace in namespaces {
	    tenants.insert(self.tenants.resolve(&namespace).await.tenant);
	}

	let mut pruned = 0;
	for tenant in tenants {
	    let names = match self.remote.list(&tenant, self.function).await {
		Ok(names) => names,
		Err(failure) => {
		    log::warn!("unable to list what tenant {} holds: {}", tenant, failure);
		    continue;
		}
	    };

	    for name in names {
		if backed(&name) || self.store.holds_name(&name) {
		    continue;
		}

		let outcome = self.remote.delete(&tenant, self.function, &name).await;
		if outcome.is_success() {
		    pruned += 1;
		    log::info!("decision=delete name={} tenant={} outcome=\"orphan {}\"", name, tenant, outcome);
		} else {
		    log::error!("decision=fail name={} tenant={} outcome=\"orphan {}\"", name, tenant, outcome);
		}
	    }
	}

	pruned
    }
}

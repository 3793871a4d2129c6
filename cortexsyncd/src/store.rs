use cortexsync_api::{ObjectKey, ReconciliationRecord};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Default)]
struct Records {
    current: HashMap<ObjectKey, ReconciliationRecord>,

    /*
     * tenants still holding a copy of an object after it moved to another
     * tenant, until the delete on their side goes through
     */
    leftovers: HashMap<ObjectKey, BTreeSet<String>>,
}

/*
 * ReconciliationStore remembers, per object, what was last accepted by the
 * remote API. It is in-memory only: after a restart it starts empty and the
 * first listing pushes every object again.
 *
 * Writes for one key are serialized by the dispatcher, the lock only makes
 * the map safe to share between the per-key workers.
 */
#[derive(Clone, Default)]
pub struct ReconciliationStore {
    records: Arc<Mutex<Records>>,
}

impl ReconciliationStore {

    pub fn new() -> Self {
	Self::default()
    }

    fn records(&self) -> MutexGuard<'_, Records> {
	self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, key: &ObjectKey) -> Option<ReconciliationRecord> {
	self.records().current.get(key).cloned()
    }

    /*
     * A tenant which just accepted the content can't be a leftover of the
     * same object anymore.
     */
    pub fn put(&self, key: ObjectKey, record: ReconciliationRecord) {
	let mut records = self.records();
	if let Some(tenants) = records.leftovers.get_mut(&key) {
	    tenants.remove(&record.tenant);
	    if tenants.is_empty() {
		records.leftovers.remove(&key);
	    }
	}
	records.current.insert(key, record);
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<ReconciliationRecord> {
	self.records().current.remove(key)
    }

    pub fn add_leftover(&self, key: ObjectKey, tenant: &str) {
	self.records().leftovers.entry(key).or_default().insert(tenant.to_string());
    }

    pub fn leftovers(&self, key: &ObjectKey) -> BTreeSet<String> {
	self.records().leftovers.get(key).cloned().unwrap_or_default()
    }

    pub fn clear_leftover(&self, key: &ObjectKey, tenant: &str) {
	let mut records = self.records();
	if let Some(tenants) = records.leftovers.get_mut(key) {
	    tenants.remove(tenant);
	    if tenants.is_empty() {
		records.leftovers.remove(key);
	    }
	}
    }

    /*
     * Every key the remote API may hold content for, under its current
     * tenant or as a leftover.
     */
    pub fn keys(&self) -> Vec<ObjectKey> {
	let records = self.records();
	let keys: BTreeSet<&ObjectKey> = records.current.keys().chain(records.leftovers.keys()).collect();
	keys.into_iter().cloned().collect()
    }

    /*
     * Whether some record, under any tenant, is named `name` remotely.
     */
    pub fn holds_name(&self, name: &str) -> bool {
	self.records().current.keys().any(|key| key.name == name)
    }

    pub fn tenants(&self) -> BTreeSet<String> {
	self.records().current.values().map(|record| record.tenant.clone()).collect()
    }

    pub fn len(&self) -> usize {
	self.records().current.len()
    }
}

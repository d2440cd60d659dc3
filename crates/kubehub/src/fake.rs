//! In-memory dynamic client for tests: stores runs by namespace/name, bumps
//! `resourceVersion` on every write and enforces optimistic concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::anyhow;
use runvault_core::{ClientError, Identity, ResourceClient};

use crate::kinds::{RunKind, RunObject};

#[derive(Default)]
struct Counters {
    updates: AtomicU64,
    deletes: AtomicU64,
    fail_updates: AtomicU32,
    fail_gets: AtomicU32,
}

pub struct FakeResources {
    kind: RunKind,
    objects: Mutex<BTreeMap<(String, String), RunObject>>,
    rv: AtomicU64,
    counters: Counters,
}

impl FakeResources {
    pub fn new(kind: RunKind) -> Self {
        Self { kind, objects: Mutex::new(BTreeMap::new()), rv: AtomicU64::new(0), counters: Counters::default() }
    }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<(String, String), RunObject>>, ClientError> {
        self.objects.lock().map_err(|_| ClientError::transient(anyhow!("fake store lock poisoned")))
    }

    fn key_of(run: &RunObject) -> Result<(String, String), ClientError> {
        let ns = run.namespace().ok_or_else(|| ClientError::transient(anyhow!("object has no namespace")))?;
        Ok((ns.to_string(), run.name().to_string()))
    }

    /// Insert a new object, assigning a resourceVersion. Fails with Conflict
    /// if the name is taken.
    pub fn create(&self, run: RunObject) -> Result<RunObject, ClientError> {
        let key = Self::key_of(&run)?;
        let mut objects = self.lock()?;
        if objects.contains_key(&key) {
            return Err(ClientError::Conflict(format!("{}/{} already exists", key.0, key.1)));
        }
        let mut run = run;
        run.kind = self.kind;
        run.obj.metadata.resource_version = Some(self.next_rv());
        objects.insert(key, run.clone());
        Ok(run)
    }

    /// Current stored copy, bypassing failure injection and counters.
    pub fn peek(&self, namespace: &str, name: &str) -> Option<RunObject> {
        self.objects.lock().ok()?.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    /// Successful update calls so far.
    pub fn update_calls(&self) -> u64 {
        self.counters.updates.load(Ordering::SeqCst)
    }

    /// Successful delete calls so far.
    pub fn delete_calls(&self) -> u64 {
        self.counters.deletes.load(Ordering::SeqCst)
    }

    /// Fail the next `n` update calls with a transient error.
    pub fn fail_next_updates(&self, n: u32) {
        self.counters.fail_updates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` get calls with a transient error.
    pub fn fail_next_gets(&self, n: u32) {
        self.counters.fail_gets.store(n, Ordering::SeqCst);
    }

    fn take_failure(slot: &AtomicU32) -> bool {
        slot.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
    }
}

#[async_trait::async_trait]
impl ResourceClient for FakeResources {
    type Object = RunObject;

    async fn get(&self, namespace: &str, name: &str) -> Result<RunObject, ClientError> {
        if Self::take_failure(&self.counters.fail_gets) {
            return Err(ClientError::transient(anyhow!("injected get failure")));
        }
        self.lock()?
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("{} {}/{}", self.kind, namespace, name)))
    }

    async fn update(&self, run: &RunObject) -> Result<RunObject, ClientError> {
        if Self::take_failure(&self.counters.fail_updates) {
            return Err(ClientError::transient(anyhow!("injected update failure")));
        }
        let key = Self::key_of(run)?;
        let mut objects = self.lock()?;
        let current = objects
            .get(&key)
            .ok_or_else(|| ClientError::NotFound(format!("{} {}/{}", self.kind, key.0, key.1)))?;
        if let Some(rv) = run.resource_version() {
            if current.resource_version() != Some(rv) {
                return Err(ClientError::Conflict(format!(
                    "{}/{}: resourceVersion {} is stale (current {})",
                    key.0,
                    key.1,
                    rv,
                    current.resource_version().unwrap_or("")
                )));
            }
        }
        let mut next = run.clone();
        next.kind = self.kind;
        next.obj.metadata.resource_version = Some(self.next_rv());
        objects.insert(key, next.clone());
        self.counters.updates.fetch_add(1, Ordering::SeqCst);
        Ok(next)
    }

    async fn delete(&self, id: &Identity) -> Result<(), ClientError> {
        let key = (id.namespace.clone(), id.name.clone());
        let mut objects = self.lock()?;
        let current = objects.get(&key).ok_or_else(|| ClientError::NotFound(id.key()))?;
        if current.obj.metadata.uid.as_deref() != Some(id.uid.as_str()) {
            return Err(ClientError::Conflict(format!("{}: uid precondition failed", id.key())));
        }
        objects.remove(&key);
        self.counters.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

use super::{object_name, Error, Object, Result, Selector, Store, WatchEvent};
use gargantua_core::SharedClock;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{ListParams, ObjectMeta};
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::BTreeMap, marker::PhantomData, sync::Arc};
use tokio::sync::broadcast;

/// An in-process [`Store`] that behaves like the API server for the operations controllers use.
///
/// Objects are held as JSON so that every write round-trips through the same encoding the API
/// server applies.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
    clock: SharedClock,
}

/// A typed stream of changes to one kind.
pub struct Watch<K> {
    kind: String,
    rx: broadcast::Receiver<Change>,
    _marker: PhantomData<fn() -> K>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    uids: u64,
    names: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Clone, Debug)]
struct Change {
    kind: String,
    op: Op,
    object: Value,
}

#[derive(Copy, Clone, Debug)]
enum Op {
    Added,
    Modified,
    Deleted,
}

const NAME_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const NAME_SUFFIX_LEN: usize = 5;
const WATCH_CAPACITY: usize = 1024;

fn kind_of<K: Object>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn metadata<K: Object>(value: &Value) -> Result<ObjectMeta> {
    let meta = value.get("metadata").cloned().unwrap_or(Value::Null);
    serde_json::from_value(meta).map_err(|e| Error::invalid::<K>(e))
}

fn decode<K: Object>(value: &Value) -> Result<K> {
    serde_json::from_value(value.clone()).map_err(Into::into)
}

fn set_status(value: &mut Value, status: Option<&Value>) {
    if let Some(map) = value.as_object_mut() {
        match status {
            Some(status) if !status.is_null() => {
                map.insert("status".to_string(), status.clone());
            }
            _ => {
                map.remove("status");
            }
        }
    }
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Default::default(),
            changes,
            clock,
        }
    }

    /// Subscribes to changes of kind `K` made after this call.
    pub fn watch<K: Object>(&self) -> Watch<K> {
        Watch {
            kind: kind_of::<K>(),
            rx: self.changes.subscribe(),
            _marker: PhantomData,
        }
    }

    fn key<K: Object>(namespace: &str, name: &str) -> Key {
        Key {
            kind: kind_of::<K>(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn publish(&self, kind: String, op: Op, object: Value) {
        // Nobody may be watching.
        let _ = self.changes.send(Change { kind, op, object });
    }

    fn create_sync<K: Object>(&self, namespace: &str, object: &K) -> Result<K> {
        let mut state = self.state.lock();
        let mut object = object.clone();
        let meta = object.meta_mut();
        meta.namespace = Some(namespace.to_string());

        let name = match meta.name.clone().filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => {
                let prefix = meta
                    .generate_name
                    .clone()
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| Error::invalid::<K>("name or generateName is required"))?;
                loop {
                    let name = format!("{prefix}{}", state.next_suffix());
                    if !state.objects.contains_key(&Self::key::<K>(namespace, &name)) {
                        break name;
                    }
                }
            }
        };

        let key = Self::key::<K>(namespace, &name);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists::<K>(namespace, &name));
        }

        state.uids += 1;
        let uid = format!("00000000-0000-0000-0000-{:012}", state.uids);
        let version = state.next_version();
        meta.name = Some(name);
        meta.uid = Some(uid);
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Time(self.clock.now()));
        meta.deletion_timestamp = None;

        let value = serde_json::to_value(&object)?;
        state.objects.insert(key.clone(), value.clone());
        drop(state);

        let created = decode::<K>(&value)?;
        self.publish(key.kind, Op::Added, value);
        Ok(created)
    }

    fn update_sync<K: Object>(&self, object: &K, status_only: bool) -> Result<K> {
        let (namespace, name) = object_name(object);
        let key = Self::key::<K>(namespace, name);
        let mut state = self.state.lock();
        let stored = state
            .objects
            .get(&key)
            .ok_or_else(|| Error::not_found::<K>(namespace, name))?;
        let stored_meta = metadata::<K>(stored)?;
        if let Some(version) = object.meta().resource_version.as_ref() {
            if stored_meta.resource_version.as_ref() != Some(version) {
                return Err(Error::conflict::<K>(namespace, name));
            }
        }

        let incoming = serde_json::to_value(object)?;
        let mut value = if status_only {
            let mut value = stored.clone();
            set_status(&mut value, incoming.get("status"));
            value
        } else {
            let mut updated = object.clone();
            let meta = updated.meta_mut();
            meta.uid = stored_meta.uid.clone();
            meta.creation_timestamp = stored_meta.creation_timestamp.clone();
            meta.deletion_timestamp = stored_meta.deletion_timestamp.clone();
            meta.resource_version = stored_meta.resource_version.clone();
            let mut value = serde_json::to_value(&updated)?;
            set_status(&mut value, stored.get("status"));
            value
        };

        // Writes that change nothing neither bump the version nor notify watchers.
        if value == *stored {
            return decode::<K>(stored);
        }

        let version = state.next_version();
        value["metadata"]["resourceVersion"] = Value::String(version);
        state.objects.insert(key.clone(), value.clone());
        drop(state);

        let updated = decode::<K>(&value)?;
        self.publish(key.kind, Op::Modified, value);
        Ok(updated)
    }

    fn delete_sync<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let removed = state
            .objects
            .remove(&Self::key::<K>(namespace, name))
            .ok_or_else(|| Error::not_found::<K>(namespace, name))?;

        let mut deleted = vec![(kind_of::<K>(), removed)];
        let mut i = 0;
        // Dependents are collected transitively by owner UID.
        while i < deleted.len() {
            let uid = deleted[i]
                .1
                .pointer("/metadata/uid")
                .and_then(Value::as_str)
                .map(str::to_string);
            i += 1;
            let Some(uid) = uid else { continue };
            let dependents = state
                .objects
                .iter()
                .filter(|(_, v)| is_owned_by(v, &uid))
                .map(|(k, _)| k.clone())
                .collect::<Vec<_>>();
            for key in dependents {
                if let Some(value) = state.objects.remove(&key) {
                    deleted.push((key.kind, value));
                }
            }
        }
        drop(state);

        for (kind, value) in deleted {
            self.publish(kind, Op::Deleted, value);
        }
        Ok(())
    }

    fn list_sync<K: Object>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>> {
        if params.field_selector.is_some() {
            return Err(Error::invalid::<K>("field selectors are not supported"));
        }
        let selector = params
            .label_selector
            .as_deref()
            .unwrap_or_default()
            .parse::<Selector>()
            .map_err(Error::invalid::<K>)?;

        let kind = kind_of::<K>();
        let state = self.state.lock();
        let mut objects = Vec::new();
        for (key, value) in state.objects.iter() {
            if key.kind != kind || (!namespace.is_empty() && key.namespace != namespace) {
                continue;
            }
            let meta = metadata::<K>(value)?;
            if selector.matches(meta.labels.as_ref()) {
                objects.push(decode::<K>(value)?);
            }
            if params.limit.is_some_and(|l| objects.len() >= l as usize) {
                break;
            }
        }
        Ok(objects)
    }
}

fn is_owned_by(value: &Value, uid: &str) -> bool {
    value
        .pointer("/metadata/ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.get("uid").and_then(Value::as_str) == Some(uid))
        })
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K> {
        let state = self.state.lock();
        let value = state
            .objects
            .get(&Self::key::<K>(namespace, name))
            .ok_or_else(|| Error::not_found::<K>(namespace, name))?;
        decode::<K>(value)
    }

    async fn list<K: Object>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>> {
        self.list_sync(namespace, params)
    }

    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K> {
        self.create_sync(namespace, object)
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K> {
        self.update_sync(object, false)
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K> {
        self.update_sync(object, true)
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete_sync::<K>(namespace, name)
    }

    async fn delete_collection<K: Object>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<usize> {
        let mut deleted = 0;
        for object in self.list_sync::<K>(namespace, params)? {
            let (namespace, name) = object_name(&object);
            match self.delete_sync::<K>(namespace, name) {
                Ok(()) => deleted += 1,
                // Already removed as a dependent of an earlier deletion.
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error),
            }
        }
        Ok(deleted)
    }
}

// === impl State ===

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_suffix(&mut self) -> String {
        self.names += 1;
        let mut n = self.names as usize;
        let mut suffix = String::with_capacity(NAME_SUFFIX_LEN);
        for _ in 0..NAME_SUFFIX_LEN {
            suffix.push(NAME_ALPHABET[n % NAME_ALPHABET.len()] as char);
            n /= NAME_ALPHABET.len();
        }
        suffix
    }
}

// === impl Watch ===

impl<K: Object> Watch<K> {
    /// Waits for the next change, returning `None` once the store is dropped. Changes that were
    /// missed because the watcher fell behind are skipped.
    pub async fn next(&mut self) -> Option<WatchEvent<K>> {
        loop {
            let change = match self.rx.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(kind = %self.kind, skipped, "Watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            if change.kind != self.kind {
                continue;
            }
            let object = match decode::<K>(&change.object) {
                Ok(object) => object,
                Err(error) => {
                    tracing::warn!(kind = %self.kind, %error, "Failed to decode watched object");
                    continue;
                }
            };
            return Some(match change.op {
                Op::Added => WatchEvent::Added(object),
                Op::Modified => WatchEvent::Modified(object),
                Op::Deleted => WatchEvent::Deleted(object),
            });
        }
    }
}

use super::{object_name, Error, Object, Result, Store};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    Client,
};

/// A [`Store`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: Object>(&self, namespace: &str) -> Api<K> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

/// Maps API status codes onto store errors.
fn classify<K: Object>(namespace: &str, name: &str, error: kube::Error) -> Error {
    match &error {
        kube::Error::Api(rsp) if rsp.code == 404 => Error::not_found::<K>(namespace, name),
        kube::Error::Api(rsp) if rsp.code == 409 && rsp.reason == "AlreadyExists" => {
            Error::already_exists::<K>(namespace, name)
        }
        kube::Error::Api(rsp) if rsp.code == 409 => Error::conflict::<K>(namespace, name),
        kube::Error::Api(rsp) if rsp.code == 422 => Error::invalid::<K>(&rsp.message),
        _ => Error::Kube(error),
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get<K: Object>(&self, namespace: &str, name: &str) -> Result<K> {
        self.api::<K>(namespace)
            .get(name)
            .await
            .map_err(|e| classify::<K>(namespace, name, e))
    }

    async fn list<K: Object>(&self, namespace: &str, params: &ListParams) -> Result<Vec<K>> {
        let list = self
            .api::<K>(namespace)
            .list(params)
            .await
            .map_err(|e| classify::<K>(namespace, "", e))?;
        Ok(list.items)
    }

    async fn create<K: Object>(&self, namespace: &str, object: &K) -> Result<K> {
        let name = object.meta().name.clone().unwrap_or_default();
        Api::<K>::namespaced(self.client.clone(), namespace)
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| classify::<K>(namespace, &name, e))
    }

    async fn replace<K: Object>(&self, object: &K) -> Result<K> {
        let (namespace, name) = object_name(object);
        Api::<K>::namespaced(self.client.clone(), namespace)
            .replace(name, &PostParams::default(), object)
            .await
            .map_err(|e| classify::<K>(namespace, name, e))
    }

    async fn replace_status<K: Object>(&self, object: &K) -> Result<K> {
        let (namespace, name) = object_name(object);
        let value = serde_json::to_value(object)?;
        // A merge patch that carries the resource version is rejected with a conflict when the
        // stored object has moved on.
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": object.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        Api::<K>::namespaced(self.client.clone(), namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| classify::<K>(namespace, name, e))
    }

    async fn delete<K: Object>(&self, namespace: &str, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| classify::<K>(namespace, name, e))?;
        Ok(())
    }

    async fn delete_collection<K: Object>(
        &self,
        namespace: &str,
        params: &ListParams,
    ) -> Result<usize> {
        let deleted = self
            .api::<K>(namespace)
            .delete_collection(&DeleteParams::background(), params)
            .await
            .map_err(|e| classify::<K>(namespace, "", e))?;
        Ok(deleted.left().map(|list| list.items.len()).unwrap_or(0))
    }
}

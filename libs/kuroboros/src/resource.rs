//! CR schema & property mapper, non-schema half.
//!
//! A user CR type is an ordinary
//! `#[derive(kube::CustomResource, schemars::JsonSchema)]` struct with
//! `#[serde(rename_all = "camelCase")]`, which gives typed, case-converted
//! field access and OpenAPI schema generation for free — see `DESIGN.md` for
//! the reasoning behind leaning on derive instead of a hand-rolled schema
//! layer. This module provides the part serde derive doesn't: the
//! read-only/writable invariant, deep-copy-on-load semantics, patch/
//! finalizer/owner-ref helpers, and the namespaced CRUD wrappers.

use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::gvi::{GroupVersionInfo, Scope};

/// A `K` that round-trips through the cluster: every instance is either
/// read-only or writable, tracked as a `bool` checked at the point of
/// mutation rather than encoded in the type system — two wrapper types
/// would have bought nothing a single guarded method doesn't already give.
#[derive(Debug, Clone)]
pub struct ManagedResource<K> {
    data: K,
    api: Option<Api<K>>,
    gvi: Option<GroupVersionInfo>,
    read_only: bool,
}

pub trait CrBound:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}
impl<K> CrBound for K where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K: CrBound> ManagedResource<K> {
    /// Constructs a read-only view, e.g. for webhook validation. There is
    /// no api handle or GVI: any call that needs either returns
    /// `Error::NotWritable`.
    pub fn read_only(data: K) -> Self {
        Self {
            data,
            api: None,
            gvi: None,
            read_only: true,
        }
    }

    /// Constructs a writable view bound to an API handle and GVI.
    pub fn writable(data: K, api: Api<K>, gvi: GroupVersionInfo) -> Self {
        Self {
            data,
            api: Some(api),
            gvi: Some(gvi),
            read_only: false,
        }
    }

    /// Replaces the internal state with a deep copy of `data`. An owned
    /// value moved in by `Clone` gives us this for free, with no explicit
    /// deep-copy call needed.
    pub fn load_data(&mut self, data: K) {
        self.data = data;
    }

    pub fn data(&self) -> &K {
        &self.data
    }

    /// Mutable access to the wrapped object; writing through it mutates the
    /// same location `data()` reads from. Errors on a read-only instance,
    /// matching `patch` et al.
    pub fn data_mut(&mut self) -> Result<&mut K> {
        self.require_writable()?;
        Ok(&mut self.data)
    }

    pub fn into_inner(self) -> K {
        self.data
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn namespace_name(&self) -> (String, String) {
        (
            self.data.meta().namespace.clone().unwrap_or_default(),
            self.data.meta().name.clone().unwrap_or_default(),
        )
    }

    pub fn finalizers(&self) -> &[String] {
        self.data
            .meta()
            .finalizers
            .as_deref()
            .unwrap_or_default()
    }

    /// Empty list and absent key both read as "no finalizers".
    pub fn has_finalizers(&self) -> bool {
        !self.finalizers().is_empty()
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.data.meta().deletion_timestamp.is_some()
    }

    /// `{metadata (minus resourceVersion/managedFields), spec, status}` as
    /// a JSON-ready value.
    pub fn get_data(&self) -> Result<serde_json::Value> {
        let mut value = serde_json::to_value(&self.data)?;
        if let Some(metadata) = value.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            metadata.remove("resourceVersion");
            metadata.remove("managedFields");
        }
        Ok(value)
    }

    fn require_api(&self) -> Result<&Api<K>> {
        self.api
            .as_ref()
            .ok_or_else(|| Error::NotWritable("no API handle bound".into()))
    }

    fn require_gvi(&self) -> Result<&GroupVersionInfo> {
        self.gvi
            .as_ref()
            .ok_or_else(|| Error::NotWritable("no GroupVersionInfo bound".into()))
    }

    fn require_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::NotWritable("resource is read-only".into()));
        }
        Ok(())
    }

    /// Sends the status-then-full-object patch sequence.
    pub async fn patch(&mut self, patch_status: bool) -> Result<()> {
        self.require_writable()?;
        let api = self.require_api()?.clone();
        let gvi = self.require_gvi()?;
        if gvi.scope != Scope::Namespaced {
            return Err(Error::NotWritable(
                "cluster-scoped resources are not supported by this path".into(),
            ));
        }
        let name = self.data.name_any();
        let pp = PatchParams::default();

        let full = self.get_data()?;
        if patch_status {
            if let Some(status) = full.get("status") {
                let body = serde_json::json!({ "status": status });
                let updated = api.patch_status(&name, &pp, &Patch::Merge(body)).await?;
                self.data = updated;
            }
        }

        let full = self.get_data()?;
        let updated = api.patch(&name, &pp, &Patch::Merge(full)).await?;
        self.data = updated;
        Ok(())
    }

    /// Idempotent: a no-op if `finalizer` is already present.
    pub async fn add_finalizer(&mut self, finalizer: &str) -> Result<()> {
        self.require_writable()?;
        let finalizers = self.data.meta_mut().finalizers.get_or_insert_with(Vec::new);
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch(false).await
    }

    /// Idempotent: a no-op if `finalizer` is absent.
    pub async fn remove_finalizer(&mut self, finalizer: &str) -> Result<()> {
        self.require_writable()?;
        let Some(finalizers) = self.data.meta_mut().finalizers.as_mut() else {
            return Ok(());
        };
        let before = finalizers.len();
        finalizers.retain(|f| f != finalizer);
        if finalizers.len() == before {
            return Ok(());
        }
        self.patch(false).await
    }

    pub fn owner_ref(&self, block_owner_deletion: bool) -> Result<OwnerReference> {
        let gvi = self.require_gvi()?;
        let meta = self.data.meta();
        Ok(OwnerReference {
            api_version: gvi.api_version.clone(),
            kind: gvi.kind.clone(),
            name: meta
                .name
                .clone()
                .ok_or_else(|| Error::Unrecoverable("resource has no name".into()))?,
            uid: meta
                .uid
                .clone()
                .ok_or_else(|| Error::Unrecoverable("resource has no uid".into()))?,
            controller: Some(true),
            block_owner_deletion: Some(block_owner_deletion),
        })
    }

    pub async fn create_namespaced(api: Api<K>, gvi: GroupVersionInfo, object: K) -> Result<Self> {
        let created = api.create(&PostParams::default(), &object).await?;
        Ok(Self {
            data: created,
            api: Some(api),
            gvi: Some(gvi),
            read_only: false,
        })
    }

    pub async fn get_namespaced(api: Api<K>, gvi: GroupVersionInfo, name: &str) -> Result<Self> {
        let data = api.get(name).await?;
        Ok(Self {
            data,
            api: Some(api),
            gvi: Some(gvi),
            read_only: false,
        })
    }

    pub async fn list_namespaced(
        api: Api<K>,
        gvi: GroupVersionInfo,
        lp: &ListParams,
    ) -> Result<Vec<Self>> {
        let list = api.list(lp).await?;
        Ok(list
            .items
            .into_iter()
            .map(|data| Self {
                data,
                api: Some(api.clone()),
                gvi: Some(gvi.clone()),
                read_only: false,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResource;
    use schemars::JsonSchema;

    #[derive(CustomResource, Debug, Clone, Serialize, serde::Deserialize, JsonSchema, PartialEq)]
    #[kube(group = "example.com", version = "v1", kind = "Gadget", namespaced)]
    #[serde(rename_all = "camelCase")]
    struct GadgetSpec {
        size: i32,
    }

    fn gadget(finalizers: Option<Vec<String>>) -> Gadget {
        Gadget {
            metadata: ObjectMeta {
                name: Some("g".into()),
                namespace: Some("default".into()),
                finalizers,
                ..Default::default()
            },
            spec: GadgetSpec { size: 1 },
        }
    }

    #[test]
    fn read_only_resource_rejects_mutation() {
        let mut resource = ManagedResource::read_only(gadget(None));
        assert!(resource.is_read_only());
        assert!(resource.data_mut().is_err());
    }

    #[test]
    fn absent_and_empty_finalizers_both_read_as_no_finalizers() {
        let absent = ManagedResource::read_only(gadget(None));
        let empty = ManagedResource::read_only(gadget(Some(vec![])));
        let present = ManagedResource::read_only(gadget(Some(vec!["f".into()])));
        assert!(!absent.has_finalizers());
        assert!(!empty.has_finalizers());
        assert!(present.has_finalizers());
    }

    #[test]
    fn get_data_strips_resource_version_and_managed_fields() {
        let mut gadget = gadget(None);
        gadget.meta_mut().resource_version = Some("123".into());
        let resource = ManagedResource::read_only(gadget);
        let value = resource.get_data().unwrap();
        let metadata = value.get("metadata").unwrap();
        assert!(metadata.get("resourceVersion").is_none());
        assert!(metadata.get("managedFields").is_none());
    }
}

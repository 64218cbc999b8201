use std::{
    fmt::Debug,
    ops::{Deref, DerefMut},
};

use json_patch::diff;
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    MANAGER,
    errors::{ControllerError, ExtKubeApiError},
};

/// Helper construct to simplify patching cluster scoped objects: the
/// controller works on `modified` and only the difference to `original` is
/// sent to the API server.
pub(crate) struct Modifications<K> {
    original: K,
    pub modified: K,
}

impl<K> Deref for Modifications<K> {
    type Target = K;

    fn deref(&self) -> &Self::Target {
        &self.modified
    }
}

impl<K> DerefMut for Modifications<K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.modified
    }
}

fn without_status(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
    }
    value
}

fn status_of(value: &Value) -> Value {
    value.get("status").cloned().unwrap_or(Value::Null)
}

impl<K> Modifications<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned,
{
    pub(crate) fn new(original: K) -> Self {
        let modified = original.clone();
        Self { original, modified }
    }

    fn api(&self, client: Client) -> Api<K> {
        Api::<K>::all(client)
    }

    /// JSON patch turning `original` into `modified`, ignoring the status.
    pub(crate) fn metadata_patch(&self) -> Result<Option<json_patch::Patch>, ControllerError> {
        let patch = diff(
            &without_status(serde_json::to_value(&self.original)?),
            &without_status(serde_json::to_value(&self.modified)?),
        );
        if patch.0.is_empty() {
            Ok(None)
        } else {
            Ok(Some(patch))
        }
    }

    /// Merge patch replacing the status, `None` if it did not change.
    pub(crate) fn status_patch(&self) -> Result<Option<Value>, ControllerError> {
        let original = status_of(&serde_json::to_value(&self.original)?);
        let modified = status_of(&serde_json::to_value(&self.modified)?);
        if original == modified {
            Ok(None)
        } else {
            Ok(Some(json!({ "status": modified })))
        }
    }

    /// Persist finalizers, annotations and the other non-status changes.
    /// Local status changes are kept and still need [`Self::patch_status`].
    pub(crate) async fn patch_metadata(&mut self, client: Client) -> Result<(), ControllerError> {
        let Some(patch) = self.metadata_patch()? else {
            return Ok(());
        };
        let name = self.original.name_any();
        let api = self.api(client);
        let response = api
            .patch(
                name.as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::<()>::Json(patch),
            )
            .await;
        debug!(
            "patch metadata of {} {} ({:?}) -> {}",
            K::kind(&()),
            name,
            self.original.resource_version(),
            if response.is_ok() { "ok" } else { "failed" }
        );
        let latest = match response {
            Ok(latest) => latest,
            // Removing the last finalizer lets the object go away.
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let status = status_of(&serde_json::to_value(&self.original)?);
        let mut original = serde_json::to_value(&latest)?;
        if let Some(obj) = original.as_object_mut() {
            obj.insert("status".to_string(), status);
        }
        self.original = serde_json::from_value(original)?;
        self.modified.meta_mut().resource_version = latest.resource_version();
        Ok(())
    }

    pub(crate) async fn patch_status(&mut self, client: Client) -> Result<(), ControllerError> {
        let Some(patch) = self.status_patch()? else {
            return Ok(());
        };
        let name = self.original.name_any();
        let api = self.api(client);
        match api
            .patch_status(
                name.as_str(),
                &PatchParams {
                    field_manager: Some(MANAGER.to_string()),
                    ..Default::default()
                },
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => (),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let mut original = serde_json::to_value(&self.original)?;
        if let (Some(obj), Some(status)) = (original.as_object_mut(), patch.get("status")) {
            obj.insert("status".to_string(), status.clone());
        }
        self.original = serde_json::from_value(original)?;
        Ok(())
    }
}

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    api::ListParams,
};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use provider_bitbucket_apis::{
    Condition, PROVIDER_CONFIG_LABEL, ProviderConfig, ProviderConfigUsage, READY,
};

use crate::{
    errors::ControllerError,
    modifications::Modifications,
    utils::{add_finalizer_if_missing, has_finalizer, is_deleted, metric_name, remove_finalizer},
};

pub(crate) const PROVIDER_CONFIG_CONTROLLER: &'static str = "provider_config_controller";

/// Kept on a `ProviderConfig` as long as managed resources use it.
pub(crate) const IN_USE_FINALIZER: &'static str = "in-use.bitbucket.krateo.io";

const IN_USE_WAIT: Duration = Duration::from_secs(10);

/// Tracks the `ProviderConfigUsage` objects of every `ProviderConfig` and
/// blocks deletion of configs which are still in use.
pub(crate) struct ProviderConfigController {
    client: Client,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

fn usage_selector(provider_config: &str) -> String {
    format!("{}={}", PROVIDER_CONFIG_LABEL, provider_config)
}

fn in_use(users: usize) -> Condition {
    Condition::new(
        READY,
        Some(false),
        "InUse",
        format!(
            "cannot delete ProviderConfig, it is used by {} managed resource(s)",
            users
        ),
    )
}

/// Maps a usage to the `ProviderConfig` named by its label.
fn referenced_provider_config(usage: ProviderConfigUsage) -> Option<ObjectRef<ProviderConfig>> {
    usage
        .labels()
        .get(PROVIDER_CONFIG_LABEL)
        .map(|name| ObjectRef::new(name))
}

impl ProviderConfigController {
    pub fn new(client: Client) -> Self {
        let meter: Meter = global::meter(PROVIDER_CONFIG_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("provider_config_reconcile_count"))
            .with_description("Count of ProviderConfig reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("provider_config_reconcile_duration_ms"))
            .with_description("Reconcile duration of ProviderConfig objects in milliseconds")
            .with_unit("ms")
            .build();
        Self {
            client,
            reconcile_count,
            reconcile_duration,
        }
    }

    async fn count_users(&self, name: &str) -> Result<usize, ControllerError> {
        let api = Api::<ProviderConfigUsage>::all(self.client.clone());
        let usages = api
            .list(&ListParams::default().labels(&usage_selector(name)))
            .await?;
        Ok(usages.items.len())
    }

    async fn sync(&self, pc: &mut Modifications<ProviderConfig>) -> Result<Action, ControllerError> {
        let name = pc.name_any();
        let users = self.count_users(&name).await?;
        pc.status.get_or_insert_with(Default::default).users = Some(users as i64);

        if is_deleted(&pc.modified) {
            if !has_finalizer(&pc.modified, IN_USE_FINALIZER) {
                return Ok(Action::await_change());
            }
            if users > 0 {
                debug!("provider config {} is still used by {} resources", name, users);
                pc.status
                    .get_or_insert_with(Default::default)
                    .update_condition(in_use(users));
                pc.patch_status(self.client.clone()).await?;
                return Ok(Action::requeue(IN_USE_WAIT));
            }
            pc.patch_status(self.client.clone()).await?;
            remove_finalizer(&mut pc.modified, IN_USE_FINALIZER);
            pc.patch_metadata(self.client.clone()).await?;
            info!("provider config {} is no longer in use", name);
            return Ok(Action::await_change());
        }

        if add_finalizer_if_missing(&mut pc.modified, IN_USE_FINALIZER) {
            pc.patch_metadata(self.client.clone()).await?;
        }
        pc.patch_status(self.client.clone()).await?;
        Ok(Action::await_change())
    }

    async fn reconcile(
        object: Arc<ProviderConfig>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let start = Instant::now();
        let mut pc = Modifications::new(object.as_ref().clone());
        let result = me.sync(&mut pc).await;
        let duration = Instant::now() - start;
        let labels = &[KeyValue::new("object_name", pc.name_any())];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        result
    }

    fn error_policy(
        _object: Arc<ProviderConfig>,
        _error: &ControllerError,
        _ctx: Arc<Self>,
    ) -> Action {
        Action::requeue(Duration::from_secs(30))
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let provider_configs = Api::<ProviderConfig>::all(self.client.clone());
        let usages = Api::<ProviderConfigUsage>::all(self.client.clone());
        Controller::new(provider_configs, Config::default())
            .watches(usages, Config::default(), referenced_provider_config)
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("reconciled {:?}", o),
                    Err(e) => warn!("provider config reconcile failed: {}", e),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, chrono::Utc};
    use provider_bitbucket_apis::{
        ProviderConfigReference, ProviderConfigSpec, ProviderConfigUsageSpec, TypedReference,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller(server: &MockServer) -> Arc<ProviderConfigController> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = kube::Config::new(server.uri().parse().unwrap());
        Arc::new(ProviderConfigController::new(
            Client::try_from(config).unwrap(),
        ))
    }

    fn deleted_provider_config() -> ProviderConfig {
        let mut pc = ProviderConfig::new("default", ProviderConfigSpec::default());
        pc.metadata.finalizers = Some(vec![IN_USE_FINALIZER.to_string()]);
        pc.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pc
    }

    async fn mount_usages(server: &MockServer, items: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/apis/bitbucket.krateo.io/v1alpha1/providerconfigusages"))
            .and(query_param(
                "labelSelector",
                "bitbucket.krateo.io/provider-config=default",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "bitbucket.krateo.io/v1alpha1",
                "kind": "ProviderConfigUsageList",
                "metadata": {},
                "items": items
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn usages_map_to_provider_config() {
        let mut usage = ProviderConfigUsage::new(
            "6b1c8a2e",
            ProviderConfigUsageSpec {
                provider_config_ref: ProviderConfigReference {
                    name: "default".to_string(),
                },
                resource_ref: TypedReference::default(),
            },
        );
        assert!(referenced_provider_config(usage.clone()).is_none());
        usage.metadata.labels = Some(BTreeMap::from([(
            PROVIDER_CONFIG_LABEL.to_string(),
            "default".to_string(),
        )]));
        assert_eq!(
            Some(ObjectRef::new("default")),
            referenced_provider_config(usage)
        );
        assert_eq!(
            "bitbucket.krateo.io/provider-config=default",
            usage_selector("default")
        );
    }

    #[tokio::test]
    async fn deletion_is_blocked_while_in_use() {
        let server = MockServer::start().await;
        mount_usages(
            &server,
            json!([{
                "apiVersion": "bitbucket.krateo.io/v1alpha1",
                "kind": "ProviderConfigUsage",
                "metadata": {"name": "6b1c8a2e"},
                "spec": {
                    "providerConfigRef": {"name": "default"},
                    "resourceRef": {"apiVersion": "bitbucket.krateo.io/v1alpha1", "kind": "Repo", "name": "demo"}
                }
            }]),
        )
        .await;
        let pc = deleted_provider_config();
        Mock::given(method("PATCH"))
            .and(path("/apis/bitbucket.krateo.io/v1alpha1/providerconfigs/default/status"))
            .and(body_string_contains("InUse"))
            .and(body_string_contains(r#""users":1"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(&pc))
            .expect(1)
            .mount(&server)
            .await;

        let action = ProviderConfigController::reconcile(Arc::new(pc), controller(&server))
            .await
            .unwrap();
        assert_eq!(Action::requeue(IN_USE_WAIT), action);
    }

    #[tokio::test]
    async fn unused_config_releases_finalizer() {
        let server = MockServer::start().await;
        mount_usages(&server, json!([])).await;
        let pc = deleted_provider_config();
        Mock::given(method("PATCH"))
            .and(path("/apis/bitbucket.krateo.io/v1alpha1/providerconfigs/default/status"))
            .and(body_string_contains(r#""users":0"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(&pc))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/apis/bitbucket.krateo.io/v1alpha1/providerconfigs/default"))
            .and(body_string_contains("remove"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&pc))
            .expect(1)
            .mount(&server)
            .await;

        let action = ProviderConfigController::reconcile(Arc::new(pc), controller(&server))
            .await
            .unwrap();
        assert_eq!(Action::await_change(), action);
    }
}

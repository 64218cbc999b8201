//! Generic reconciler for managed resources. Resource specific behavior lives
//! behind [`ExternalClient`], the reconciler takes care of finalizers,
//! conditions, events and persisting changes.

use std::{
    fmt::Debug,
    future::Future,
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use futures::StreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    events::{Event, EventType, Recorder},
    watcher::Config,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use provider_bitbucket_apis::{Condition, DeletionPolicy, ManagedResource};
use serde::{Serialize, de::DeserializeOwned};

use crate::{
    FINALIZER, bitbucket, clients,
    errors::ControllerError,
    modifications::Modifications,
    utils::{add_finalizer_if_missing, has_finalizer, is_deleted, metric_name, remove_finalizer},
};

/// Requeue delay once an external resource was created or deleted.
const SHORT_WAIT: Duration = Duration::from_secs(5);
const ERROR_WAIT: Duration = Duration::from_secs(30);

/// The state of the external resource as seen by [`ExternalClient::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ExternalObservation {
    pub resource_exists: bool,
    pub resource_up_to_date: bool,
}

/// Resource specific operations against Bitbucket. Implementations may write
/// the status and the external name of `cr`, both are persisted by the
/// reconciler.
#[async_trait]
pub(crate) trait ExternalClient<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    async fn observe(&self, cr: &mut K) -> Result<ExternalObservation, ControllerError>;

    async fn create(&self, cr: &mut K) -> Result<(), ControllerError>;

    async fn update(&self, cr: &mut K) -> Result<(), ControllerError>;

    async fn delete(&self, cr: &mut K) -> Result<(), ControllerError>;
}

pub(crate) struct ManagedReconciler<K, E> {
    /// Used as meter name and in log messages.
    name: &'static str,
    client: Client,
    recorder: Recorder,
    poll_interval: Duration,
    connector: Box<dyn Fn(bitbucket::Client) -> E + Send + Sync>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    _resource: PhantomData<fn() -> K>,
}

impl<K, E> ManagedReconciler<K, E>
where
    K: ManagedResource + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static,
    E: ExternalClient<K> + 'static,
{
    pub fn new(
        name: &'static str,
        client: Client,
        recorder: Recorder,
        poll_interval: Duration,
        connector: impl Fn(bitbucket::Client) -> E + Send + Sync + 'static,
    ) -> Self {
        let meter: Meter = global::meter(name);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of managed resource reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of managed resources in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocation errors for managed resources")
            .build();
        Self {
            name,
            client,
            recorder,
            poll_interval,
            connector: Box::new(connector),
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            _resource: PhantomData,
        }
    }

    async fn connect(&self, cr: &K) -> Result<E, ControllerError> {
        let opts = clients::get_config(&self.client, cr).await?;
        Ok((self.connector)(bitbucket::Client::new(opts)))
    }

    async fn publish(&self, cr: &K, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &cr.object_ref(&())).await {
            warn!(
                "{}: cannot publish event {} for {}: {}",
                self.name,
                reason,
                cr.name_any(),
                e
            );
        }
    }

    async fn connect_and_observe(
        &self,
        cr: &mut Modifications<K>,
    ) -> Result<(E, ExternalObservation), ControllerError> {
        let external = match self.connect(cr).await {
            Ok(external) => external,
            Err(e) => {
                self.publish(cr, EventType::Warning, "CannotConnectToProvider", e.to_string())
                    .await;
                return Err(e);
            }
        };
        match external.observe(&mut cr.modified).await {
            Ok(observation) => Ok((external, observation)),
            Err(e) => {
                self.publish(
                    cr,
                    EventType::Warning,
                    "CannotObserveExternalResource",
                    e.to_string(),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn observe_and_sync(&self, cr: &mut Modifications<K>) -> Result<Action, ControllerError> {
        if add_finalizer_if_missing(&mut cr.modified, FINALIZER) {
            cr.patch_metadata(self.client.clone()).await?;
        }
        let (external, observation) = self.connect_and_observe(cr).await?;

        if !observation.resource_exists {
            if let Err(e) = external.create(&mut cr.modified).await {
                self.publish(cr, EventType::Warning, "CannotCreateExternalResource", e.to_string())
                    .await;
                return Err(e);
            }
            // Persist the external name before anything else can fail.
            cr.patch_metadata(self.client.clone()).await?;
            info!("{}: created external resource for {}", self.name, cr.name_any());
            self.publish(
                cr,
                EventType::Normal,
                "CreatedExternalResource",
                "Successfully requested creation of external resource".to_string(),
            )
            .await;
            cr.set_conditions(Condition::reconcile_success());
            cr.patch_status(self.client.clone()).await?;
            return Ok(Action::requeue(SHORT_WAIT));
        }

        if !observation.resource_up_to_date {
            if let Err(e) = external.update(&mut cr.modified).await {
                self.publish(cr, EventType::Warning, "CannotUpdateExternalResource", e.to_string())
                    .await;
                return Err(e);
            }
            cr.patch_metadata(self.client.clone()).await?;
            info!("{}: updated external resource for {}", self.name, cr.name_any());
            self.publish(
                cr,
                EventType::Normal,
                "UpdatedExternalResource",
                "Successfully requested update of external resource".to_string(),
            )
            .await;
        }

        cr.set_conditions(Condition::reconcile_success());
        cr.patch_status(self.client.clone()).await?;
        Ok(Action::requeue(self.poll_interval))
    }

    async fn finalize(&self, cr: &mut Modifications<K>) -> Result<Action, ControllerError> {
        if !has_finalizer(&cr.modified, FINALIZER) {
            return Ok(Action::await_change());
        }
        if cr.resource_spec().deletion_policy() == DeletionPolicy::Delete {
            let (external, observation) = self.connect_and_observe(cr).await?;
            if observation.resource_exists {
                cr.set_conditions(Condition::deleting());
                if let Err(e) = external.delete(&mut cr.modified).await {
                    self.publish(cr, EventType::Warning, "CannotDeleteExternalResource", e.to_string())
                        .await;
                    return Err(e);
                }
                info!("{}: deleted external resource of {}", self.name, cr.name_any());
                self.publish(
                    cr,
                    EventType::Normal,
                    "DeletedExternalResource",
                    "Successfully requested deletion of external resource".to_string(),
                )
                .await;
                cr.set_conditions(Condition::reconcile_success());
                cr.patch_status(self.client.clone()).await?;
                // Wait until observe no longer finds the external resource.
                return Ok(Action::requeue(SHORT_WAIT));
            }
        } else {
            debug!(
                "{}: orphaning external resource of {}",
                self.name,
                cr.name_any()
            );
        }
        clients::untrack_usage(&self.client, &cr.modified).await?;
        remove_finalizer(&mut cr.modified, FINALIZER);
        cr.patch_metadata(self.client.clone()).await?;
        debug!("{}: removed finalizer from {}", self.name, cr.name_any());
        Ok(Action::await_change())
    }

    /// Controller triggers this whenever a managed resource changed or its
    /// requeue delay elapsed.
    async fn reconcile(object: Arc<K>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let start = Instant::now();
        let mut cr = Modifications::new(object.as_ref().clone());
        let result = if is_deleted(&cr.modified) {
            me.finalize(&mut cr).await
        } else {
            me.observe_and_sync(&mut cr).await
        };
        let result = match result {
            Ok(action) => Ok(action),
            Err(e) => {
                cr.set_conditions(Condition::reconcile_error(e.to_string()));
                if let Err(status_error) = cr.patch_status(me.client.clone()).await {
                    warn!(
                        "{}: cannot update status of {}: {}",
                        me.name,
                        cr.name_any(),
                        status_error
                    );
                }
                Err(e)
            }
        };
        let duration = Instant::now() - start;
        let labels = &[
            KeyValue::new("kind", K::kind(&()).to_string()),
            KeyValue::new("object_name", cr.name_any()),
        ];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        result
    }

    fn error_policy(_object: Arc<K>, _error: &ControllerError, _ctx: Arc<Self>) -> Action {
        Action::requeue(ERROR_WAIT)
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let name = self.name;
        let reconcile_errors = self.reconcile_errors.clone();
        let api = Api::<K>::all(self.client.clone());
        Controller::new(api, Config::default())
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(move |res| {
                let reconcile_errors = reconcile_errors.clone();
                async move {
                    match res {
                        Ok(o) => debug!("{}: reconciled {:?}", name, o),
                        Err(kube_runtime::controller::Error::ReconcilerFailed(e, o)) => {
                            reconcile_errors
                                .add(1, &[KeyValue::new("reason", e.metric_label())]);
                            if e.is_temporary() {
                                warn!("{}: reconcile of {} failed: {}", name, o.name, e);
                            } else {
                                error!("{}: reconcile of {} failed: {}", name, o.name, e);
                            }
                        }
                        Err(e @ kube_runtime::controller::Error::ObjectNotFound { .. }) => {
                            debug!("{}: reconcile failed: {:?}", name, e);
                        }
                        Err(e) => {
                            warn!("{}: reconcile failed: {:?}", name, e);
                            reconcile_errors.add(1, &[KeyValue::new("reason", "controller")]);
                        }
                    }
                }
            })
    }
}

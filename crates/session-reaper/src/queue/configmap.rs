//! Durable queue stored as Kubernetes `ConfigMap`s.
//!
//! Each job is one labelled `ConfigMap` in the org namespace. Claiming writes lease
//! annotations with a `resourceVersion`-guarded replace, so two workers racing for the
//! same job cannot both win. Acknowledging deletes the `ConfigMap`.

use super::{Delivery, TaskQueue};
use crate::error::QueueError;
use crate::models::CaptureJob;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const LABEL_APP: &str = "app";
const LABEL_COMPONENT: &str = "component";
const APP_NAME: &str = "session-reaper";
const COMPONENT_NAME: &str = "capture-queue";

/// Annotation holding the worker that owns the current lease.
pub const ANNOTATION_CLAIMED_BY: &str = "session-reaper.5dlabs.ai/claimed-by";
/// Annotation holding the RFC 3339 lease expiry.
pub const ANNOTATION_CLAIMED_UNTIL: &str = "session-reaper.5dlabs.ai/claimed-until";
/// Annotation counting deliveries so far.
pub const ANNOTATION_DELIVERIES: &str = "session-reaper.5dlabs.ai/deliveries";

const JOB_KEY: &str = "job.json";

/// [`TaskQueue`] persisted in the Kubernetes API.
#[derive(Clone)]
pub struct ConfigMapQueue {
    configmaps: Api<ConfigMap>,
    namespace: String,
}

impl ConfigMapQueue {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    fn selector() -> String {
        format!("{LABEL_APP}={APP_NAME},{LABEL_COMPONENT}={COMPONENT_NAME}")
    }

    /// Drop a job that can never be decoded so it does not block the queue.
    async fn discard(&self, name: &str) {
        match self.configmaps.delete(name, &DeleteParams::default()).await {
            Ok(_) => warn!(job_id = %name, "Discarded undecodable capture job"),
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(e) => error!(job_id = %name, error = %e, "Failed to discard capture job"),
        }
    }
}

/// Build the `ConfigMap` holding a job.
pub fn job_configmap(name: &str, namespace: &str, job: &CaptureJob) -> Result<ConfigMap, QueueError> {
    let payload = serde_json::to_string(job)?;

    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), COMPONENT_NAME.to_string());

    let mut data = BTreeMap::new();
    data.insert(JOB_KEY.to_string(), payload);
    data.insert("pod_name".to_string(), job.pod_name.clone());
    data.insert("enqueued_at".to_string(), Utc::now().to_rfc3339());

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..ConfigMap::default()
    })
}

/// Read the job back out of its `ConfigMap`.
pub fn decode_job(cm: &ConfigMap) -> Result<CaptureJob, QueueError> {
    let name = cm.name_any();
    let payload = cm
        .data
        .as_ref()
        .and_then(|data| data.get(JOB_KEY))
        .ok_or_else(|| QueueError::Corrupt {
            id: name.clone(),
            reason: format!("missing {JOB_KEY}"),
        })?;

    serde_json::from_str(payload).map_err(|e| QueueError::Corrupt {
        id: name,
        reason: e.to_string(),
    })
}

/// True when nobody holds a live lease on the job.
#[must_use]
pub fn is_claimable(meta: &ObjectMeta, now: DateTime<Utc>) -> bool {
    if meta.deletion_timestamp.is_some() {
        return false;
    }

    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_CLAIMED_UNTIL))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .is_none_or(|until| until.with_timezone(&Utc) <= now)
}

/// Number of deliveries recorded on the job.
#[must_use]
pub fn deliveries(meta: &ObjectMeta) -> u32 {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(ANNOTATION_DELIVERIES))
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Write lease annotations for `worker_id` and return the new delivery count.
pub fn stamp_claim(meta: &mut ObjectMeta, worker_id: &str, until: DateTime<Utc>) -> u32 {
    let count = deliveries(meta) + 1;
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(ANNOTATION_CLAIMED_BY.to_string(), worker_id.to_string());
    annotations.insert(ANNOTATION_CLAIMED_UNTIL.to_string(), until.to_rfc3339());
    annotations.insert(ANNOTATION_DELIVERIES.to_string(), count.to_string());
    count
}

/// Push the lease expiry out to `until` if `worker_id` still holds the claim. The
/// delivery count is left alone. Returns `false` when someone else holds the claim.
pub fn extend_claim(meta: &mut ObjectMeta, worker_id: &str, until: DateTime<Utc>) -> bool {
    let Some(annotations) = meta.annotations.as_mut() else {
        return false;
    };
    if annotations.get(ANNOTATION_CLAIMED_BY).map(String::as_str) != Some(worker_id) {
        return false;
    }

    annotations.insert(ANNOTATION_CLAIMED_UNTIL.to_string(), until.to_rfc3339());
    true
}

fn lease_span(lease: Duration) -> chrono::Duration {
    chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(5))
}

#[async_trait]
impl TaskQueue for ConfigMapQueue {
    async fn enqueue(&self, job: &CaptureJob) -> Result<String, QueueError> {
        let name = format!("capture-job-{}", Uuid::new_v4());
        let cm = job_configmap(&name, &self.namespace, job)?;

        self.configmaps.create(&PostParams::default(), &cm).await?;
        info!(job_id = %name, pod_name = %job.pod_name, "Enqueued capture job");
        Ok(name)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now();
        let lease = lease_span(lease);

        let mut candidates = self
            .configmaps
            .list(&ListParams::default().labels(&Self::selector()))
            .await?
            .items;
        candidates.sort_by_key(|cm| cm.metadata.creation_timestamp.as_ref().map(|ts| ts.0));

        for mut cm in candidates {
            if !is_claimable(&cm.metadata, now) {
                continue;
            }

            let name = cm.name_any();
            let job = match decode_job(&cm) {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %name, error = %e, "Capture job is corrupt");
                    self.discard(&name).await;
                    continue;
                }
            };

            // The listed resourceVersion rides along, so a concurrent claim yields 409.
            let delivery_count = stamp_claim(&mut cm.metadata, worker_id, now + lease);
            match self.configmaps.replace(&name, &PostParams::default(), &cm).await {
                Ok(_) => {
                    debug!(job_id = %name, worker_id = %worker_id, delivery_count, "Claimed capture job");
                    return Ok(Some(Delivery {
                        id: name,
                        job,
                        delivery_count,
                    }));
                }
                Err(kube::Error::Api(err)) if err.code == 409 || err.code == 404 => {
                    debug!(job_id = %name, "Lost claim race");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    async fn renew(&self, delivery: &Delivery, worker_id: &str, lease: Duration) -> Result<bool, QueueError> {
        let mut cm = match self.configmaps.get(&delivery.id).await {
            Ok(cm) => cm,
            Err(kube::Error::Api(err)) if err.code == 404 => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        if !extend_claim(&mut cm.metadata, worker_id, Utc::now() + lease_span(lease)) {
            return Ok(false);
        }

        match self.configmaps.replace(&delivery.id, &PostParams::default(), &cm).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(err)) if err.code == 409 || err.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        match self
            .configmaps
            .delete(&delivery.id, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(job_id = %delivery.id, "Acknowledged capture job");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

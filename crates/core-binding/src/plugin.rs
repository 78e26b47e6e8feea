//! NRI plugin pinning new containers to the CPUs requested by their pod.
//!
//! Only container creation carries logic; every other lifecycle event is
//! logged and acknowledged.

use nri_api::Container;
use nri_api::ContainerAdjustment;
use nri_api::EventMask;
use nri_api::PodSandbox;
use nri_stub::HandlerError;
use nri_stub::LifecycleEvent;
use nri_stub::Plugin;
use nri_stub::Reply;
use tracing::info;

use crate::annotations::find_cpuset_annotation;
use crate::annotations::CpuSet;

/// Stateless; one instance serves the whole session.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct CoreBindingPlugin;

impl CoreBindingPlugin {
    /// Decide how a container about to be created should be adjusted.
    ///
    /// Returns `None` when the pod requests no binding or the request is
    /// malformed; the container is then created unchanged.
    pub(crate) fn create_container(
        &self,
        pod: &PodSandbox,
        container: &Container,
    ) -> Option<ContainerAdjustment> {
        info!(container_id = %container.id, pod_id = %pod.id, "Creating container");

        let Some((annotation, raw)) = find_cpuset_annotation(&pod.annotations) else {
            info!(pod_id = %pod.id, "No core-id/cpuset annotation found");
            return None;
        };

        let Some(cpus) = CpuSet::parse(raw) else {
            info!(
                pod_id = %pod.id,
                annotation,
                value = raw,
                "Ignoring malformed cpuset annotation"
            );
            return None;
        };

        info!(
            container_id = %container.id,
            annotation,
            cpus = %cpus,
            "Requesting cpuset binding"
        );
        Some(ContainerAdjustment::with_cpuset_cpus(cpus.into_inner()))
    }
}

impl Plugin for CoreBindingPlugin {
    fn handle(&self, event: LifecycleEvent) -> Result<Reply, HandlerError> {
        let reply = match event {
            LifecycleEvent::Configure(request) => {
                info!(
                    config = %request.config,
                    runtime = %request.runtime_name,
                    version = %request.runtime_version,
                    "Plugin configured"
                );
                Reply::Subscribe(EventMask::all())
            }
            LifecycleEvent::Synchronize { pods, containers } => {
                info!(
                    pods = pods.len(),
                    containers = containers.len(),
                    "Synchronizing"
                );
                Reply::Ack
            }
            LifecycleEvent::CreateContainer { pod, container } => self
                .create_container(&pod, &container)
                .map_or(Reply::Ack, Reply::Adjust),
            LifecycleEvent::Shutdown => {
                info!("Runtime is shutting down the plugin");
                Reply::Ack
            }
            other => {
                log_lifecycle_event(&other);
                Reply::Ack
            }
        };
        Ok(reply)
    }
}

fn log_lifecycle_event(event: &LifecycleEvent) {
    let pod_id = event.pod().map_or("", |pod| pod.id.as_str());
    match event.container() {
        Some(container) => info!(
            event = %event.kind(),
            pod_id,
            container_id = %container.id,
            "Container lifecycle event"
        ),
        None => info!(event = %event.kind(), pod_id, "Pod lifecycle event"),
    }
}

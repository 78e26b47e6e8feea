//! Lifecycle events delivered to a plugin and the replies it can give.

use std::sync::Arc;

use derive_more::Display;
use nri_api::ConfigureRequest;
use nri_api::Container;
use nri_api::ContainerAdjustment;
use nri_api::ContainerUpdate;
use nri_api::Event;
use nri_api::EventMask;
use nri_api::LinuxResources;
use nri_api::PodSandbox;
use nri_api::StateChangeEvent;
use thiserror::Error;

/// Error returned by a plugin handler. It is reported back to the runtime
/// as a failed request and does not end the session.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A request from the runtime, decoded into one variant per lifecycle phase.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Configure(ConfigureRequest),
    Synchronize {
        pods: Vec<PodSandbox>,
        containers: Vec<Container>,
    },
    RunPodSandbox(PodSandbox),
    StopPodSandbox(PodSandbox),
    RemovePodSandbox(PodSandbox),
    CreateContainer {
        pod: PodSandbox,
        container: Container,
    },
    PostCreateContainer {
        pod: PodSandbox,
        container: Container,
    },
    StartContainer {
        pod: PodSandbox,
        container: Container,
    },
    PostStartContainer {
        pod: PodSandbox,
        container: Container,
    },
    UpdateContainer {
        pod: PodSandbox,
        container: Container,
        resources: Option<LinuxResources>,
    },
    PostUpdateContainer {
        pod: PodSandbox,
        container: Container,
    },
    StopContainer {
        pod: PodSandbox,
        container: Container,
    },
    RemoveContainer {
        pod: PodSandbox,
        container: Container,
    },
    Shutdown,
}

/// Variant name of a [`LifecycleEvent`], for logging.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Configure,
    Synchronize,
    RunPodSandbox,
    StopPodSandbox,
    RemovePodSandbox,
    CreateContainer,
    PostCreateContainer,
    StartContainer,
    PostStartContainer,
    UpdateContainer,
    PostUpdateContainer,
    StopContainer,
    RemoveContainer,
    Shutdown,
}

impl LifecycleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            LifecycleEvent::Configure(_) => EventKind::Configure,
            LifecycleEvent::Synchronize { .. } => EventKind::Synchronize,
            LifecycleEvent::RunPodSandbox(_) => EventKind::RunPodSandbox,
            LifecycleEvent::StopPodSandbox(_) => EventKind::StopPodSandbox,
            LifecycleEvent::RemovePodSandbox(_) => EventKind::RemovePodSandbox,
            LifecycleEvent::CreateContainer { .. } => EventKind::CreateContainer,
            LifecycleEvent::PostCreateContainer { .. } => EventKind::PostCreateContainer,
            LifecycleEvent::StartContainer { .. } => EventKind::StartContainer,
            LifecycleEvent::PostStartContainer { .. } => EventKind::PostStartContainer,
            LifecycleEvent::UpdateContainer { .. } => EventKind::UpdateContainer,
            LifecycleEvent::PostUpdateContainer { .. } => EventKind::PostUpdateContainer,
            LifecycleEvent::StopContainer { .. } => EventKind::StopContainer,
            LifecycleEvent::RemoveContainer { .. } => EventKind::RemoveContainer,
            LifecycleEvent::Shutdown => EventKind::Shutdown,
        }
    }

    /// The pod the event concerns, if it concerns a single pod.
    pub fn pod(&self) -> Option<&PodSandbox> {
        match self {
            LifecycleEvent::RunPodSandbox(pod)
            | LifecycleEvent::StopPodSandbox(pod)
            | LifecycleEvent::RemovePodSandbox(pod)
            | LifecycleEvent::CreateContainer { pod, .. }
            | LifecycleEvent::PostCreateContainer { pod, .. }
            | LifecycleEvent::StartContainer { pod, .. }
            | LifecycleEvent::PostStartContainer { pod, .. }
            | LifecycleEvent::UpdateContainer { pod, .. }
            | LifecycleEvent::PostUpdateContainer { pod, .. }
            | LifecycleEvent::StopContainer { pod, .. }
            | LifecycleEvent::RemoveContainer { pod, .. } => Some(pod),
            LifecycleEvent::Configure(_)
            | LifecycleEvent::Synchronize { .. }
            | LifecycleEvent::Shutdown => None,
        }
    }

    /// The container the event concerns, if any.
    pub fn container(&self) -> Option<&Container> {
        match self {
            LifecycleEvent::CreateContainer { container, .. }
            | LifecycleEvent::PostCreateContainer { container, .. }
            | LifecycleEvent::StartContainer { container, .. }
            | LifecycleEvent::PostStartContainer { container, .. }
            | LifecycleEvent::UpdateContainer { container, .. }
            | LifecycleEvent::PostUpdateContainer { container, .. }
            | LifecycleEvent::StopContainer { container, .. }
            | LifecycleEvent::RemoveContainer { container, .. } => Some(container),
            _ => None,
        }
    }
}

/// Why a state change notification could not be turned into an event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown lifecycle event {0}")]
    UnknownEvent(i32),

    #[error("{0} is not delivered as a state change")]
    NotAStateChange(Event),

    #[error("{0} notification without a container")]
    MissingContainer(Event),

    #[error("{0} notification without a pod")]
    MissingPod(Event),
}

impl TryFrom<StateChangeEvent> for LifecycleEvent {
    type Error = EventError;

    fn try_from(change: StateChangeEvent) -> Result<Self, EventError> {
        let event = Event::try_from(change.event)
            .ok()
            .filter(|event| *event != Event::Unknown)
            .ok_or(EventError::UnknownEvent(change.event))?;
        let pod = change.pod.ok_or(EventError::MissingPod(event))?;

        if event.is_pod_event() {
            return Ok(match event {
                Event::RunPodSandbox => LifecycleEvent::RunPodSandbox(pod),
                Event::StopPodSandbox => LifecycleEvent::StopPodSandbox(pod),
                _ => LifecycleEvent::RemovePodSandbox(pod),
            });
        }

        let container = change
            .container
            .ok_or(EventError::MissingContainer(event))?;
        match event {
            Event::PostCreateContainer => Ok(LifecycleEvent::PostCreateContainer { pod, container }),
            Event::StartContainer => Ok(LifecycleEvent::StartContainer { pod, container }),
            Event::PostStartContainer => Ok(LifecycleEvent::PostStartContainer { pod, container }),
            Event::PostUpdateContainer => Ok(LifecycleEvent::PostUpdateContainer { pod, container }),
            Event::RemoveContainer => Ok(LifecycleEvent::RemoveContainer { pod, container }),
            other => Err(EventError::NotAStateChange(other)),
        }
    }
}

/// What a plugin answers to a [`LifecycleEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Acknowledge without side effects.
    Ack,
    /// Subscribe to the given events; only meaningful for `Configure`.
    Subscribe(EventMask),
    /// Adjust the container being created; only meaningful for `CreateContainer`.
    Adjust(ContainerAdjustment),
    /// Update existing containers.
    Update(Vec<ContainerUpdate>),
}

/// A plugin reacting to runtime lifecycle events.
pub trait Plugin {
    fn handle(&self, event: LifecycleEvent) -> Result<Reply, HandlerError>;
}

impl<T> Plugin for Arc<T>
where
    T: Plugin,
{
    fn handle(&self, event: LifecycleEvent) -> Result<Reply, HandlerError> {
        (**self).handle(event)
    }
}

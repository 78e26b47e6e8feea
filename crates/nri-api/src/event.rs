//! Lifecycle event identifiers and the subscription mask built from them.

use derive_more::Display;

/// Pod and container lifecycle events a plugin can subscribe to.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
)]
#[repr(i32)]
pub enum Event {
    Unknown = 0,
    RunPodSandbox = 1,
    StopPodSandbox = 2,
    RemovePodSandbox = 3,
    CreateContainer = 4,
    PostCreateContainer = 5,
    StartContainer = 6,
    PostStartContainer = 7,
    UpdateContainer = 8,
    PostUpdateContainer = 9,
    StopContainer = 10,
    RemoveContainer = 11,
}

impl Event {
    /// Every event a plugin can subscribe to, in protocol order.
    pub const ALL: [Event; 11] = [
        Event::RunPodSandbox,
        Event::StopPodSandbox,
        Event::RemovePodSandbox,
        Event::CreateContainer,
        Event::PostCreateContainer,
        Event::StartContainer,
        Event::PostStartContainer,
        Event::UpdateContainer,
        Event::PostUpdateContainer,
        Event::StopContainer,
        Event::RemoveContainer,
    ];

    /// Whether the event concerns a pod sandbox rather than a container.
    pub const fn is_pod_event(self) -> bool {
        matches!(
            self,
            Event::RunPodSandbox | Event::StopPodSandbox | Event::RemovePodSandbox
        )
    }
}

/// Bit set of subscribed events; event `n` occupies bit `n - 1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EventMask(i32);

impl EventMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with every subscribable event set.
    pub fn all() -> Self {
        Event::ALL.into_iter().collect()
    }

    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn set(&mut self, event: Event) {
        if event != Event::Unknown {
            self.0 |= 1 << (event as i32 - 1);
        }
    }

    pub fn is_set(self, event: Event) -> bool {
        event != Event::Unknown && self.0 & (1 << (event as i32 - 1)) != 0
    }
}

impl FromIterator<Event> for EventMask {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for event in iter {
            mask.set(event);
        }
        mask
    }
}

//! Lifecycle event filtering

use crate::image::ImageReference;
use crate::runtime::{LifecycleEvent, LifecycleKind};

/// Decides which runtime events mean a pool slot was vacated
#[derive(Debug, Clone)]
pub struct EventWatcher {
    image: ImageReference,
}

impl EventWatcher {
    pub fn new(image: ImageReference) -> Self {
        Self { image }
    }

    /// An exit of a container derived from the managed image.
    ///
    /// Events for other images, and events of other kinds, never trigger a
    /// reconciliation.
    pub fn is_managed_exit(&self, event: &LifecycleEvent) -> bool {
        event.kind == LifecycleKind::Exited
            && event
                .image
                .as_deref()
                .is_some_and(|image| self.image == *image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn event(kind: LifecycleKind, image: Option<&str>) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            container_id: "abc123".into(),
            image: image.map(str::to_string),
            attributes: HashMap::new(),
        }
    }

    fn watcher() -> EventWatcher {
        EventWatcher::new(ImageReference::new(None, "Jammy", "2.322.0"))
    }

    #[test]
    fn test_exit_of_managed_image() {
        assert!(watcher().is_managed_exit(&event(LifecycleKind::Exited, Some("local-runner:Jammy-2.322.0"))));
    }

    #[test]
    fn test_other_image_ignored() {
        let w = watcher();
        assert!(!w.is_managed_exit(&event(LifecycleKind::Exited, Some("nginx:latest"))));
        assert!(!w.is_managed_exit(&event(LifecycleKind::Exited, Some("local-runner:Jammy-2.321.0"))));
        assert!(!w.is_managed_exit(&event(LifecycleKind::Exited, None)));
    }

    #[test]
    fn test_other_kinds_ignored() {
        let w = watcher();
        for kind in [LifecycleKind::Created, LifecycleKind::Started, LifecycleKind::Destroyed] {
            assert!(!w.is_managed_exit(&event(kind, Some("local-runner:Jammy-2.322.0"))));
        }
    }
}

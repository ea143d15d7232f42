//! In-memory tracking of the containers owned by one run

use crate::CacheDescriptor;
use kiln_engine::{ContainerId, ContainerSpec};
use std::sync::Mutex;

/// Governs a container's lifecycle: services run for the duration of the
/// build, build containers run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRole {
    Service,
    Build,
}

/// Completion status of a build step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    /// The raw event action, when the exit code could not be inspected
    Unknown(String),
}

impl StepStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, StepStatus::Success)
    }
}

/// State of one container in the run
#[derive(Debug, Clone)]
pub struct ContainerState {
    pub spec: ContainerSpec,
    pub role: ContainerRole,
    /// Full container name
    pub name: String,
    /// Abbreviated name used in log prefixes
    pub short_name: String,
    /// Keep the container after the run
    pub save: bool,
    /// Remove the step's image at teardown
    pub cleanup: bool,
    /// Cache location when the step is cacheable
    pub cache: Option<CacheDescriptor>,
    /// Engine id, set once started
    pub id: Option<ContainerId>,
    pub status: StepStatus,
    pub done: bool,
}

impl ContainerState {
    pub fn new(spec: ContainerSpec, role: ContainerRole, name: String) -> Self {
        Self {
            spec,
            role,
            short_name: short_display_name(&name),
            name,
            save: false,
            cleanup: false,
            cache: None,
            id: None,
            status: StepStatus::Pending,
            done: false,
        }
    }

    fn matches(&self, id: &ContainerId) -> bool {
        self.id.as_ref() == Some(id)
    }
}

/// Abbreviate a container name for log prefixes. Truncation counts
/// characters, not bytes, so multibyte names cannot split mid-character.
pub fn short_display_name(name: &str) -> String {
    if name.chars().count() > 24 {
        let head: String = name.chars().take(24).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

/// Shared, mutex-guarded set of build container states.
///
/// The event watcher task updates completion through `mark_done` while
/// the worker reads snapshots; the lock is held only for field updates.
#[derive(Debug)]
pub struct StateSet {
    inner: Mutex<Vec<ContainerState>>,
}

impl StateSet {
    pub fn new(states: Vec<ContainerState>) -> Self {
        Self {
            inner: Mutex::new(states),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the engine id assigned at start
    pub fn set_id(&self, index: usize, id: ContainerId) {
        self.inner.lock().unwrap()[index].id = Some(id);
    }

    /// Substitute the image a step runs with (cache hit)
    pub fn set_image(&self, index: usize, image: String) {
        self.inner.lock().unwrap()[index].spec.image = image;
    }

    /// Whether the id belongs to a tracked build container
    pub fn is_tracked(&self, id: &ContainerId) -> bool {
        self.inner.lock().unwrap().iter().any(|s| s.matches(id))
    }

    /// Mark a container done, optionally updating its status.
    ///
    /// Returns true only when this call completes the last outstanding
    /// container, so the completion signal fires exactly once. Untracked
    /// or already-done containers return false.
    pub fn mark_done(&self, id: &ContainerId, status: Option<StepStatus>) -> bool {
        let mut states = self.inner.lock().unwrap();
        let Some(state) = states.iter_mut().find(|s| s.matches(id)) else {
            return false;
        };
        if state.done {
            return false;
        }
        state.done = true;
        if let Some(status) = status {
            state.status = status;
        }
        states.iter().all(|s| s.done)
    }

    pub fn all_done(&self) -> bool {
        self.inner.lock().unwrap().iter().all(|s| s.done)
    }

    /// Copy of the current states
    pub fn snapshot(&self) -> Vec<ContainerState> {
        self.inner.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_set(n: usize) -> StateSet {
        let states = (0..n)
            .map(|i| {
                let mut s = ContainerState::new(
                    ContainerSpec::new("img"),
                    ContainerRole::Build,
                    format!("run-{}-123", i),
                );
                s.id = Some(ContainerId::new(format!("c{}", i)));
                s
            })
            .collect();
        StateSet::new(states)
    }

    #[test]
    fn test_mark_done_signals_exactly_once() {
        let set = state_set(2);
        let c0 = ContainerId::new("c0");
        let c1 = ContainerId::new("c1");

        assert!(!set.mark_done(&c0, Some(StepStatus::Success)));
        // repeated event for the same container does not re-signal
        assert!(!set.mark_done(&c0, Some(StepStatus::Success)));

        assert!(set.mark_done(&c1, Some(StepStatus::Failed)));
        // late event after completion stays quiet
        assert!(!set.mark_done(&c1, None));
        assert!(set.all_done());
    }

    #[test]
    fn test_mark_done_ignores_untracked() {
        let set = state_set(1);
        assert!(!set.mark_done(&ContainerId::new("other"), Some(StepStatus::Success)));
        assert!(!set.all_done());
    }

    #[test]
    fn test_done_without_status_keeps_pending() {
        let set = state_set(1);
        let c0 = ContainerId::new("c0");
        assert!(set.mark_done(&c0, None));
        assert_eq!(set.snapshot()[0].status, StepStatus::Pending);
    }

    #[test]
    fn test_short_display_name() {
        assert_eq!(short_display_name("short"), "short");
        let long = "app-main-01234567-0-1700000000000000000";
        let short = short_display_name(long);
        assert!(short.ends_with("..."));
        assert_eq!(short.len(), 27);
    }

    #[test]
    fn test_short_display_name_multibyte() {
        // a multibyte character straddling the cut point must not panic
        let name = format!("{}éé", "a".repeat(23));
        let short = short_display_name(&name);
        assert!(short.ends_with("..."));
        assert_eq!(short.chars().count(), 27);

        // short multibyte names pass through untouched
        assert_eq!(short_display_name("café-db"), "café-db");
    }
}

//! Status table shared by the orchestrator, its task runners and any observer.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use rustc_hash::FxHashMap;
use tracing::debug;
use zoneshift_core::{Step, TaskStatus};

/// Task name -> status. Reads hand out owned copies; the lock is never held
/// across an await point.
#[derive(Debug, Clone, Default)]
pub struct StatusStore {
    inner: Arc<RwLock<FxHashMap<String, TaskStatus>>>,
}

impl StatusStore {
    /// Seed one `Pending` entry per task name.
    pub fn new<I, S>(tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let map: FxHashMap<String, TaskStatus> = tasks
            .into_iter()
            .map(|t| (t.as_ref().to_string(), TaskStatus::pending(t.as_ref())))
            .collect();
        Self { inner: Arc::new(RwLock::new(map)) }
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<String, TaskStatus>> {
        self.inner.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<String, TaskStatus>> {
        self.inner.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Mutate one entry in place. Terminal entries are frozen and unknown names ignored.
    /// Returns whether the closure ran.
    pub fn update<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut TaskStatus),
    {
        let mut map = self.write();
        match map.get_mut(name) {
            Some(st) if !st.is_terminal() => {
                f(st);
                true
            }
            Some(_) => {
                debug!(task = %name, "ignoring update to terminal status");
                false
            }
            None => false,
        }
    }

    /// Move to `step`; stamps the start time on first leave of `Pending` and the end
    /// time on entering a terminal step.
    pub fn advance(&self, name: &str, step: Step, progress: u8) -> bool {
        self.update(name, |st| {
            let now = Utc::now();
            if st.started_at.is_none() && step != Step::Pending {
                st.started_at = Some(now);
            }
            st.step = step;
            st.progress = progress.min(100);
            if step.is_terminal() {
                st.finished_at = Some(now);
            }
        })
    }

    pub fn set_progress(&self, name: &str, progress: u8) -> bool {
        self.update(name, |st| st.progress = progress.min(100))
    }

    pub fn fail(&self, name: &str, error: impl Into<String>) -> bool {
        let error = error.into();
        self.update(name, |st| {
            let now = Utc::now();
            st.started_at.get_or_insert(now);
            st.step = Step::Failed;
            st.error = Some(error);
            st.finished_at = Some(now);
        })
    }

    pub fn get(&self, name: &str) -> Option<TaskStatus> {
        self.read().get(name).cloned()
    }

    /// Independent copy of the whole table.
    pub fn snapshot(&self) -> FxHashMap<String, TaskStatus> {
        self.read().clone()
    }

    /// Names of entries not yet terminal, sorted.
    pub fn unfinished(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.read().values().filter(|s| !s.is_terminal()).map(|s| s.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

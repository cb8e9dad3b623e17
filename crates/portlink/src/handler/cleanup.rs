//! Ordered teardown for a connection.

use std::sync::Mutex;

use crate::sync::lock;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Cleanup steps run in reverse registration order, exactly once.
///
/// Steps pushed after the stack has run execute immediately so late
/// registrations are never lost.
pub(super) struct CleanupStack {
    steps: Mutex<Option<Vec<Cleanup>>>,
}

impl CleanupStack {
    pub(super) const fn new() -> Self {
        Self {
            steps: Mutex::new(Some(Vec::new())),
        }
    }

    pub(super) fn push(&self, step: impl FnOnce() + Send + 'static) {
        let mut steps = lock(&self.steps);
        match steps.as_mut() {
            Some(pending) => pending.push(Box::new(step)),
            None => {
                drop(steps);
                step();
            }
        }
    }

    /// Runs every step. Returns `false` when the stack had already run.
    pub(super) fn run(&self) -> bool {
        let Some(steps) = lock(&self.steps).take() else {
            return false;
        };
        for step in steps.into_iter().rev() {
            step();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::CleanupStack;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, CleanupStack) {
        (Arc::new(Mutex::new(Vec::new())), CleanupStack::new())
    }

    #[test]
    fn steps_run_once_in_reverse_order() {
        let (log, stack) = recorder();
        for name in ["listeners", "streams"] {
            let log = Arc::clone(&log);
            stack.push(move || log.lock().expect("lock").push(name));
        }

        assert!(stack.run());
        assert!(!stack.run());

        assert_eq!(*log.lock().expect("lock"), vec!["streams", "listeners"]);
    }

    #[test]
    fn late_step_runs_immediately() {
        let (log, stack) = recorder();
        assert!(stack.run());

        let late = Arc::clone(&log);
        stack.push(move || late.lock().expect("lock").push("late"));

        assert_eq!(*log.lock().expect("lock"), vec!["late"]);
    }
}

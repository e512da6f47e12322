use std::{collections::HashMap, sync::Mutex};

use crate::{data_model::AppSpec, utils::epoch_time_ms};

#[derive(Debug, Clone, Copy)]
pub struct ExpectedCount {
    pub count: u32,
    /// When containers for this runnable were last requested; resets the
    /// provisioning-timeout window.
    pub requested_at_ms: u64,
}

/// Desired instance counts per runnable. The provisioning loop converges
/// running containers towards these numbers.
pub struct ExpectedContainers {
    inner: Mutex<HashMap<String, ExpectedCount>>,
}

impl ExpectedContainers {
    pub fn from_spec(spec: &AppSpec) -> Self {
        let now = epoch_time_ms();
        let counts = spec
            .runnables
            .values()
            .map(|runtime_spec| {
                (
                    runtime_spec.name.clone(),
                    ExpectedCount {
                        count: runtime_spec.resource.instances,
                        requested_at_ms: now,
                    },
                )
            })
            .collect();
        ExpectedContainers {
            inner: Mutex::new(counts),
        }
    }

    pub fn expected(&self, runnable_name: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .get(runnable_name)
            .map(|e| e.count)
            .unwrap_or(0)
    }

    pub fn set_expected(&self, runnable_name: &str, count: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(
            runnable_name.to_string(),
            ExpectedCount {
                count,
                requested_at_ms: epoch_time_ms(),
            },
        );
    }

    /// Bumps the request timestamp of the given runnables so the next
    /// timeout check measures from the re-request, not the original one.
    pub fn update_request_time<'a>(&self, runnable_names: impl IntoIterator<Item = &'a str>) {
        let now = epoch_time_ms();
        let mut inner = self.inner.lock().unwrap();
        for name in runnable_names {
            if let Some(entry) = inner.get_mut(name) {
                entry.requested_at_ms = now;
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<String, ExpectedCount> {
        self.inner.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::echo_spec;

    #[test]
    fn test_counts_follow_spec_and_updates() {
        let expected = ExpectedContainers::from_spec(&echo_spec(2));
        assert_eq!(expected.expected("echo"), 2);
        assert_eq!(expected.expected("unknown"), 0);

        expected.set_expected("echo", 5);
        assert_eq!(expected.expected("echo"), 5);

        let before = expected.snapshot()["echo"].requested_at_ms;
        expected.update_request_time(["echo"]);
        let after = expected.snapshot()["echo"].requested_at_ms;
        assert!(after >= before);
    }
}

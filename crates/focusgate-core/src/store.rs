use std::{
    collections::BTreeSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

/// Monitored process names and blocked domains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    pub monitored_process_names: BTreeSet<String>,
    pub blocked_urls: BTreeSet<String>,
}

impl PolicyConfig {
    pub fn new<P, U>(processes: P, urls: U) -> Self
    where
        P: IntoIterator,
        P::Item: Into<String>,
        U: IntoIterator,
        U::Item: Into<String>,
    {
        Self {
            monitored_process_names: processes.into_iter().map(Into::into).collect(),
            blocked_urls: urls.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitored_process_names.is_empty() && self.blocked_urls.is_empty()
    }

    /// Resolve a pushed policy against the bootstrap one.
    ///
    /// Each field is resolved on its own: an empty pushed set defers to the
    /// bootstrap set, a non-empty one replaces it entirely.
    #[must_use]
    pub fn resolve(&self, bootstrap: &Self) -> Self {
        let pick = |pushed: &BTreeSet<String>, fallback: &BTreeSet<String>| {
            if pushed.is_empty() {
                fallback.clone()
            } else {
                pushed.clone()
            }
        };
        Self {
            monitored_process_names: pick(
                &self.monitored_process_names,
                &bootstrap.monitored_process_names,
            ),
            blocked_urls: pick(&self.blocked_urls, &bootstrap.blocked_urls),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared cell holding the most recently pushed policy.
///
/// Starts empty, which the enforcement loop reads as "use bootstrap defaults".
#[derive(Debug, Default)]
pub struct ConfigurationStore {
    current: Mutex<PolicyConfig>,
}

impl ConfigurationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, config: PolicyConfig) {
        *lock(&self.current) = config;
    }

    #[must_use]
    pub fn get(&self) -> PolicyConfig {
        lock(&self.current).clone()
    }
}

/// Whether this agent's user is currently active, as reported by the push channel.
#[derive(Debug)]
pub struct UserState {
    identity: String,
    active: Mutex<bool>,
}

impl UserState {
    #[must_use]
    pub fn new(identity: impl Into<String>, active: bool) -> Self {
        Self {
            identity: identity.into(),
            active: Mutex::new(active),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        *lock(&self.active)
    }

    /// Overwrite the flag, returning the previous value.
    pub fn set_active(&self, active: bool) -> bool {
        std::mem::replace(&mut *lock(&self.active), active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    fn bootstrap() -> PolicyConfig {
        PolicyConfig::new(["Boot.exe"], ["boot.example.com"])
    }

    #[test]
    fn test_empty_store_resolves_to_bootstrap() {
        let store = ConfigurationStore::new();
        assert!(store.get().is_empty());
        assert_eq!(store.get().resolve(&bootstrap()), bootstrap());
    }

    #[test]
    fn test_pushed_set_replaces_without_merge() {
        let pushed = PolicyConfig::new(["A.exe"], ["bad.example.com"]);
        let resolved = pushed.resolve(&bootstrap());
        assert_eq!(resolved, pushed);
        assert!(!resolved.monitored_process_names.contains("Boot.exe"));
    }

    #[test]
    fn test_resolution_is_per_field() {
        let pushed = PolicyConfig::new(["A.exe"], Vec::<String>::new());
        let resolved = pushed.resolve(&bootstrap());
        assert!(resolved.monitored_process_names.contains("A.exe"));
        assert!(resolved.blocked_urls.contains("boot.example.com"));
    }

    #[test]
    fn test_set_then_get() {
        let store = ConfigurationStore::new();
        let pushed = PolicyConfig::new(["A.exe"], ["bad.example.com"]);
        store.set(pushed.clone());
        assert_eq!(store.get(), pushed);
    }

    #[test]
    fn test_concurrent_writers_leave_a_whole_value() {
        let store = Arc::new(ConfigurationStore::new());
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        store.set(PolicyConfig::new(
                            [format!("p{i}.exe")],
                            [format!("u{i}.example.com")],
                        ));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let last = store.get();
        let process = last.monitored_process_names.iter().next().unwrap();
        let url = last.blocked_urls.iter().next().unwrap();
        assert_eq!(
            process.trim_end_matches(".exe").trim_start_matches('p'),
            url.trim_end_matches(".example.com").trim_start_matches('u')
        );
    }

    #[test]
    fn test_user_state_toggle() {
        let user = UserState::new("jdoe", true);
        assert_eq!(user.identity(), "jdoe");
        assert!(user.is_active());
        assert!(user.set_active(false));
        assert!(!user.is_active());
    }
}

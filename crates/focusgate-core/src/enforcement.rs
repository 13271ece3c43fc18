//! The enforcement loop: page state in, hosts entries and process
//! suspension out.

use std::{collections::BTreeSet, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};

use crate::{
    hosts::NetworkBlockGate,
    probe::PageProbe,
    process::{intersect, names_of, pid_set_equals, InstanceHandle, ProcessDirectory, ProcessSet},
    store::{ConfigurationStore, PolicyConfig, UserState},
};

/// Whether the page markup calls for blocking: true unless some marker is present.
#[must_use]
pub fn markup_requires_block(markup: &str, markers: &[String]) -> bool {
    !markers.iter().any(|marker| markup.contains(marker.as_str()))
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub bootstrap: PolicyConfig,
    pub markers: Vec<String>,
    pub interval: Duration,
}

/// Previous cycle's decision.
#[derive(Debug, Clone, Default)]
struct EnforcementSnapshot {
    matching: ProcessSet,
    should_block: bool,
}

/// Result of one cycle, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// User inactive: everything released.
    Released { resumed: usize },
    /// The session could not be listed; process state left untouched.
    ProcessesUnavailable { should_block: bool },
    Enforced {
        should_block: bool,
        matching: usize,
        transitioned: bool,
    },
}

pub struct EnforcementLoop<P: PageProbe, D: ProcessDirectory> {
    probe: P,
    directory: D,
    gate: NetworkBlockGate,
    store: Arc<ConfigurationStore>,
    user: Arc<UserState>,
    settings: LoopSettings,
    snapshot: EnforcementSnapshot,
    /// Pids this loop has suspended and not yet resumed. Suspension is
    /// counted by the OS, so these are never suspended a second time.
    suspended: BTreeSet<u32>,
}

impl<P: PageProbe, D: ProcessDirectory> EnforcementLoop<P, D> {
    pub fn new(
        probe: P,
        directory: D,
        gate: NetworkBlockGate,
        store: Arc<ConfigurationStore>,
        user: Arc<UserState>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            probe,
            directory,
            gate,
            store,
            user,
            settings,
            snapshot: EnforcementSnapshot::default(),
            suspended: BTreeSet::new(),
        }
    }

    fn effective_policy(&self) -> PolicyConfig {
        self.store.get().resolve(&self.settings.bootstrap)
    }

    /// Run one enforcement cycle.
    pub async fn tick(&mut self) -> CycleOutcome {
        let policy = self.effective_policy();

        if !self.user.is_active() {
            let resumed = self.release(&policy);
            return CycleOutcome::Released { resumed };
        }

        let should_block = match self.probe.fetch_page_markup().await {
            Ok(markup) => markup_requires_block(&markup, &self.settings.markers),
            Err(e) => {
                log::warn!("Page probe failed, blocking: {e}");
                true
            }
        };

        self.apply_network(&policy.blocked_urls, should_block);

        let active = match self.directory.list_session_processes() {
            Ok(active) => active,
            Err(e) => {
                log::warn!("Skipping process enforcement this cycle: {e}");
                return CycleOutcome::ProcessesUnavailable { should_block };
            }
        };
        self.suspended
            .retain(|pid| active.iter().any(|record| record.pid == *pid));

        let matching = intersect(&active, &policy.monitored_process_names);
        self.resume_vanished(&policy.monitored_process_names);
        let transitioned = self.apply_processes(&matching, should_block);

        let outcome = CycleOutcome::Enforced {
            should_block,
            matching: matching.len(),
            transitioned,
        };
        self.snapshot = EnforcementSnapshot {
            matching,
            should_block,
        };
        outcome
    }

    /// Resume names that were enforced last cycle but left the policy,
    /// whatever the current decision.
    fn resume_vanished(&mut self, monitored: &BTreeSet<String>) {
        let vanished: BTreeSet<String> = names_of(&self.snapshot.matching)
            .into_iter()
            .filter(|name| !monitored.contains(name))
            .collect();
        for name in &vanished {
            log::info!("{name} left the policy, resuming it");
            self.resume_all(name);
        }
    }

    /// Suspend or resume the matching set if it or the decision changed.
    fn apply_processes(&mut self, matching: &ProcessSet, should_block: bool) -> bool {
        let transitioned = !pid_set_equals(matching, &self.snapshot.matching)
            || should_block != self.snapshot.should_block;
        if !transitioned {
            return false;
        }

        let verb = if should_block { "Suspending" } else { "Resuming" };
        log::info!("{verb} {} monitored process instance(s)", matching.len());
        for name in names_of(matching) {
            if should_block {
                self.suspend_all(&name);
            } else {
                self.resume_all(&name);
            }
        }
        true
    }

    fn apply_network(&self, urls: &BTreeSet<String>, should_block: bool) {
        let result = if should_block {
            self.gate.block(urls)
        } else {
            self.gate.unblock(urls)
        };
        match result {
            Ok(0) => {}
            Ok(changed) => log::info!(
                "{} {changed} hosts entr{}",
                if should_block { "Added" } else { "Removed" },
                if changed == 1 { "y" } else { "ies" }
            ),
            Err(e) => log::error!("Hosts update failed: {e}"),
        }
    }

    fn handles(&self, name: &str) -> Vec<D::Handle> {
        match self.directory.handles_in_session(name) {
            Ok(handles) => handles,
            Err(e) => {
                log::debug!("{e}");
                Vec::new()
            }
        }
    }

    fn suspend_all(&mut self, name: &str) -> usize {
        let mut count = 0;
        for handle in self.handles(name) {
            let pid = handle.pid();
            if self.suspended.contains(&pid) {
                continue;
            }
            match self.directory.suspend(&handle) {
                Ok(()) => {
                    log::info!("Suspended {name} (pid {pid})");
                    self.suspended.insert(pid);
                    count += 1;
                }
                Err(e) => log::warn!("{e}"),
            }
        }
        count
    }

    fn resume_all(&mut self, name: &str) -> usize {
        let mut count = 0;
        for handle in self.handles(name) {
            let pid = handle.pid();
            match self.directory.resume(&handle) {
                Ok(()) => {
                    log::info!("Resumed {name} (pid {pid})");
                    self.suspended.remove(&pid);
                    count += 1;
                }
                Err(e) => log::warn!("{e}"),
            }
        }
        count
    }

    /// Undo every effect: unblock the urls and resume every monitored
    /// process plus anything in the retained snapshot.
    fn release(&mut self, policy: &PolicyConfig) -> usize {
        self.apply_network(&policy.blocked_urls, false);

        let mut names = policy.monitored_process_names.clone();
        names.extend(names_of(&self.snapshot.matching));
        let resumed = names.iter().map(|name| self.resume_all(name)).sum();

        // Pids whose resume failed stay recorded so they are not suspended twice.
        self.snapshot = EnforcementSnapshot::default();
        resumed
    }

    /// Release with the current effective policy.
    pub fn release_all(&mut self) -> usize {
        let policy = self.effective_policy();
        self.release(&policy)
    }

    /// Tick every interval until shutdown, then release everything.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        log::info!(
            "Enforcement loop started for {} (every {:?})",
            self.user.identity(),
            self.settings.interval
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    log::debug!("Cycle finished: {outcome:?}");
                }
                _ = shutdown.changed() => break,
            }
        }

        let resumed = self.release_all();
        log::info!("Enforcement loop stopped, resumed {resumed} process instance(s)");
    }
}

use crate::{
    config::AgentConfig,
    enforcement::{EnforcementLoop, LoopSettings},
    hosts::NetworkBlockGate,
    probe::CdpProbe,
    process::{create_directory, PlatformDirectory},
    push::{Backoff, PushListener},
    remote::ConfigClient,
    store::{ConfigurationStore, UserState},
};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::watch;

/// Wires the shared state, the enforcement loop and the push listener.
pub struct Daemon {
    config: AgentConfig,
    store: Arc<ConfigurationStore>,
    user: Arc<UserState>,
    source: Arc<ConfigClient>,
}

impl Daemon {
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let identity = config.resolved_identity();
        let source = ConfigClient::new(
            &config.config_endpoint,
            &config.client,
            config.fetch_timeout(),
        )?;
        log::info!("Agent identity: {identity} (client {})", config.client);

        Ok(Self {
            store: Arc::new(ConfigurationStore::new()),
            user: Arc::new(UserState::new(identity, true)),
            source: Arc::new(source),
            config,
        })
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        self.user.identity()
    }

    /// Seed the store from the configuration server. A failure leaves the
    /// store empty so the bootstrap policy applies.
    pub async fn seed_policy(&self) {
        match self.source.fetch().await {
            Ok(policy) => self.store.set(policy),
            Err(e) => log::warn!("Initial configuration fetch failed, using bootstrap: {e:#}"),
        }
    }

    /// Build the enforcement loop over the real probe, process table and hosts file.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe or the process directory cannot be created.
    pub fn enforcement_loop(&self) -> Result<EnforcementLoop<CdpProbe, PlatformDirectory>> {
        let probe = CdpProbe::new(
            &self.config.debug_endpoint,
            &self.config.monitored_url,
            self.config.probe_timeout(),
        )?;
        let directory = create_directory()?;
        Ok(EnforcementLoop::new(
            probe,
            directory,
            NetworkBlockGate::new(&self.config.hosts_path),
            self.store.clone(),
            self.user.clone(),
            LoopSettings {
                bootstrap: self.config.bootstrap_policy(),
                markers: self.config.markers.clone(),
                interval: self.config.poll_interval(),
            },
        ))
    }

    #[must_use]
    pub fn push_listener(&self) -> PushListener<ConfigClient> {
        let (min, max) = self.config.reconnect_bounds();
        PushListener::new(
            self.config.push_url(self.identity()),
            self.source.clone(),
            self.store.clone(),
            self.user.clone(),
            Backoff::new(min, max),
        )
        .with_keepalive(self.config.keepalive())
    }

    /// Run until Ctrl-C, then release every effect and stop both tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if the enforcement loop cannot be built.
    pub async fn run_with_signals(self) -> Result<()> {
        self.seed_policy().await;
        let enforcement = self.enforcement_loop()?;
        let listener = self.push_listener();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let push_task = tokio::spawn(listener.run(shutdown_rx.clone()));
        let loop_task = tokio::spawn(enforcement.run(shutdown_rx));
        log::info!("Agent started for {}", self.identity());

        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl-C, shutting down..."),
            Err(e) => log::error!("Failed to listen for Ctrl-C: {e}"),
        }
        let _ = shutdown_tx.send(true);

        for (name, task) in [("enforcement loop", loop_task), ("push listener", push_task)] {
            if let Err(e) = task.await {
                log::error!("The {name} task failed: {e}");
            }
        }
        log::info!("Agent shut down gracefully.");
        Ok(())
    }
}

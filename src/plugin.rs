//! Extension hooks invoked at fixed points of message processing.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::sip::message::Ticket;

/// Set of stages a plugin wants to be called for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginStages(u8);

impl PluginStages {
    pub const NONE: Self = Self(0);
    pub const PRE_PROXY: Self = Self(1 << 0);
    pub const DETERMINE_TARGET: Self = Self(1 << 1);
    pub const POST_PROXY: Self = Self(1 << 2);
    pub const TIMER: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl BitOr for PluginStages {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PluginStages {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Before any rewriting; the message is as received.
    PreProxy,
    /// After classification, before the next hop is chosen.
    DetermineTarget,
    /// After rewriting, right before transmission.
    PostProxy,
}

impl ProcessingStage {
    pub fn mask(self) -> PluginStages {
        match self {
            ProcessingStage::PreProxy => PluginStages::PRE_PROXY,
            ProcessingStage::DetermineTarget => PluginStages::DETERMINE_TARGET,
            ProcessingStage::PostProxy => PluginStages::POST_PROXY,
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessingStage::PreProxy => f.write_str("pre-proxy"),
            ProcessingStage::DetermineTarget => f.write_str("determine-target"),
            ProcessingStage::PostProxy => f.write_str("post-proxy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginOutcome {
    Continue,
    /// At target determination: stop asking further plugins.
    Handled,
    /// The plugin answered the message itself; processing ends.
    Responded,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn stages(&self) -> PluginStages;

    async fn init(&self, _config: &ProxyConfig) -> Result<()> {
        Ok(())
    }

    async fn process(&self, stage: ProcessingStage, ticket: &mut Ticket) -> Result<PluginOutcome>;

    async fn on_timer(&self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Plugins in registration order.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|plugin| plugin.name().to_string()))
            .finish()
    }
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Initialises every plugin; a plugin that fails is left out of the chain.
    pub async fn init(&mut self, config: &ProxyConfig) {
        let mut ready = Vec::with_capacity(self.plugins.len());
        for plugin in self.plugins.drain(..) {
            match plugin.init(config).await {
                Ok(()) => {
                    debug!(plugin = plugin.name(), "plugin initialised");
                    ready.push(plugin);
                }
                Err(err) => warn!(plugin = plugin.name(), error = %err, "plugin disabled"),
            }
        }
        self.plugins = ready;
    }

    pub async fn run(&self, stage: ProcessingStage, ticket: &mut Ticket) -> PluginOutcome {
        for plugin in &self.plugins {
            if !plugin.stages().contains(stage.mask()) {
                continue;
            }
            let outcome = match plugin.process(stage, ticket).await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(plugin = plugin.name(), %stage, error = %err, "plugin failed");
                    PluginOutcome::Continue
                }
            };
            match outcome {
                PluginOutcome::Responded => {
                    debug!(plugin = plugin.name(), %stage, "plugin answered message");
                    return PluginOutcome::Responded;
                }
                PluginOutcome::Handled if stage == ProcessingStage::DetermineTarget => {
                    return PluginOutcome::Handled;
                }
                _ => {}
            }
        }
        PluginOutcome::Continue
    }

    pub async fn on_timer(&self) {
        for plugin in &self.plugins {
            if !plugin.stages().contains(PluginStages::TIMER) {
                continue;
            }
            if let Err(err) = plugin.on_timer().await {
                warn!(plugin = plugin.name(), error = %err, "plugin timer failed");
            }
        }
    }

    pub async fn shutdown(&self) {
        for plugin in &self.plugins {
            if let Err(err) = plugin.shutdown().await {
                warn!(plugin = plugin.name(), error = %err, "plugin shutdown failed");
            }
        }
    }
}

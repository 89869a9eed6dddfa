//! Radio power monitor: polls hardware power state and drives the
//! service's awaken/sleep transitions. Repeated polls in the same state do
//! nothing.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bluepeer_core::radio::Radio;

use crate::scheduler::Task;

pub const TASK_NAME: &str = "RadioPowerMonitor";

/// Something with a radio-driven lifecycle.
#[async_trait]
pub trait PowerAware: Send + Sync {
    /// Radio came up. Returns false if the service could not start on it.
    async fn awaken(&self) -> bool;
    /// Radio went away.
    async fn sleep(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    Unchanged,
    Awakened,
    /// Awaken failed; retried on the next poll.
    AwakenFailed,
    Slept,
}

pub struct RadioPowerMonitor {
    radio: Arc<dyn Radio>,
    target: Weak<dyn PowerAware>,
    /// Last state the target was successfully moved to.
    powered: Mutex<bool>,
}

impl RadioPowerMonitor {
    pub fn new(radio: Arc<dyn Radio>, target: Weak<dyn PowerAware>) -> Self {
        Self {
            radio,
            target,
            powered: Mutex::new(false),
        }
    }

    fn last(&self) -> bool {
        self.powered.lock().map(|p| *p).unwrap_or(false)
    }

    fn record(&self, powered: bool) {
        if let Ok(mut p) = self.powered.lock() {
            *p = powered;
        }
    }

    /// Poll once and act on a transition.
    pub async fn check(&self) -> PowerTransition {
        let now = self.radio.is_powered();
        if now == self.last() {
            return PowerTransition::Unchanged;
        }
        let Some(target) = self.target.upgrade() else {
            tracing::debug!("power monitor target gone");
            return PowerTransition::Unchanged;
        };
        if now {
            tracing::info!("radio powered on");
            if target.awaken().await {
                self.record(true);
                PowerTransition::Awakened
            } else {
                tracing::warn!("awaken failed, retrying on next poll");
                PowerTransition::AwakenFailed
            }
        } else {
            tracing::info!("radio powered off");
            if !target.sleep().await {
                tracing::warn!("sleep did not complete cleanly");
            }
            self.record(false);
            PowerTransition::Slept
        }
    }
}

#[async_trait]
impl Task for RadioPowerMonitor {
    fn name(&self) -> &str {
        TASK_NAME
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.check().await;
        Ok(())
    }
}

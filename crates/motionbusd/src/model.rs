//! Object model cache: the JSON modules last reported by the firmware.
//!
//! Only the machine status is interpreted; everything else is kept as
//! opaque JSON per module.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Module carrying `state.status`.
pub const STATE_MODULE: u8 = 2;
/// Module polled in turn with the state module while a job is running.
pub const JOB_MODULE: u8 = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Off,
    Idle,
    Updating,
    Processing,
    Halted,
    Paused,
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Off => "off",
            Self::Idle => "idle",
            Self::Updating => "updating",
            Self::Processing => "processing",
            Self::Halted => "halted",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
pub struct ObjectModel {
    modules: HashMap<u8, serde_json::Value>,
    status: MachineStatus,
}

pub type SharedModel = Arc<RwLock<ObjectModel>>;

impl ObjectModel {
    pub fn shared() -> SharedModel {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn status(&self) -> MachineStatus {
        self.status
    }

    /// Returns true if the status changed.
    pub fn set_status(&mut self, status: MachineStatus) -> bool {
        if self.status == status {
            return false;
        }
        tracing::info!(from = %self.status, to = %status, "machine status changed");
        self.status = status;
        true
    }

    #[cfg(test)]
    pub fn module(&self, module: u8) -> Option<&serde_json::Value> {
        self.modules.get(&module)
    }

    /// Store a module. Returns the new status if the module changed it.
    pub fn update(
        &mut self,
        module: u8,
        json: &str,
    ) -> Result<Option<MachineStatus>, serde_json::Error> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let reported = value
            .pointer("/state/status")
            .and_then(|s| s.as_str())
            .map(|s| serde_json::from_value::<MachineStatus>(serde_json::Value::from(s)));
        self.modules.insert(module, value);

        match reported {
            Some(Ok(status)) if self.set_status(status) => Ok(Some(status)),
            Some(Err(_)) => {
                tracing::debug!(module, "ignoring unknown machine status");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Next module to request after `last`.
    pub fn next_module(&self, last: u8) -> u8 {
        if self.status == MachineStatus::Processing && last == STATE_MODULE {
            JOB_MODULE
        } else {
            STATE_MODULE
        }
    }
}

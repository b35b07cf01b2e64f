pub mod broker;
pub mod catalog;
pub mod config;
pub mod gateway;
pub mod manager;
pub mod notifier;
pub mod rpc;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod worker;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Liveness status of a monitored service as recorded in the runtime store.
///
/// Serialized as `"UP"` / `"DOWN"`. The status key is public read-only to
/// the catalog UI, so the string forms are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    #[serde(rename = "UP")]
    Up,
    #[serde(rename = "DOWN")]
    Down,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Up => "UP",
            ServiceStatus::Down => "DOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" => Some(ServiceStatus::Up),
            "DOWN" => Some(ServiceStatus::Down),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Catalog-owner RPC client
//!
//! The authoritative service catalog lives with the REST CRUD collaborator.
//! At startup the scheduler and the incident manager hydrate their local
//! catalogs through two calls against it:
//!
//! - `GetAllServicesInfo` → alerting attributes per service
//! - `GetAllSchedulerConfigurations` → probing attributes per service
//!
//! Both are carried over HTTP+JSON with a 5 second timeout. A failure here is
//! fatal at startup (the orchestrator restarts the process).

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::catalog::{CatalogEntry, ScheduleEntry};
use crate::config::RpcConfig;

#[derive(Debug, Deserialize)]
struct ServicesInfoResponse {
    services: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct SchedulerConfigurationsResponse {
    services: Vec<ScheduleEntry>,
}

/// Client for the catalog owner's RPC surface
///
/// The HTTP client is built once and reused across requests.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(config: &RpcConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build RPC client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetch alerting attributes for every registered service
    #[instrument(skip(self))]
    pub async fn get_all_services_info(&self) -> Result<Vec<CatalogEntry>> {
        let url = format!("{}/rpc/v1/services-info", self.base_url);

        let response: ServicesInfoResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("GetAllServicesInfo request failed")?
            .error_for_status()
            .context("GetAllServicesInfo returned an error status")?
            .json()
            .await
            .context("Failed to decode GetAllServicesInfo response")?;

        debug!("received {} service info rows", response.services.len());
        Ok(response.services)
    }

    /// Fetch probing attributes for every registered service
    #[instrument(skip(self))]
    pub async fn get_all_scheduler_configurations(&self) -> Result<Vec<ScheduleEntry>> {
        let url = format!("{}/rpc/v1/scheduler-configurations", self.base_url);

        let response: SchedulerConfigurationsResponse = self
            .client
            .get(&url)
            .send()
            .await
            .context("GetAllSchedulerConfigurations request failed")?
            .error_for_status()
            .context("GetAllSchedulerConfigurations returned an error status")?
            .json()
            .await
            .context("Failed to decode GetAllSchedulerConfigurations response")?;

        debug!(
            "received {} scheduler configuration rows",
            response.services.len()
        );
        Ok(response.services)
    }
}

//! Capability-based device choice.

use crate::device::{DeviceInfo, DeviceRegistry};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

const CONNECTED_WEIGHT: f64 = 0.3;
const FULL_MATCH_WEIGHT: f64 = 0.5;
const PARTIAL_MATCH_WEIGHT: f64 = 0.3;
const TYPE_PREFERENCE_WEIGHT: f64 = 0.2;

/// What a caller needs from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionCriteria {
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_device_type: Option<String>,
}

impl SelectionCriteria {
    pub fn with_capabilities(capabilities: &[&str]) -> Self {
        Self {
            required_capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            preferred_device_type: None,
        }
    }

    pub fn prefer_type(mut self, device_type: &str) -> Self {
        self.preferred_device_type = Some(device_type.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSelector {
    registry: Arc<DeviceRegistry>,
}

impl DeviceSelector {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self { registry }
    }

    /// Pick a connected device with every required capability.
    ///
    /// With no capable device this falls back to any connected device, so
    /// work still gets placed. Only an empty pool is an error.
    pub async fn select_best_device(&self, criteria: &SelectionCriteria) -> Result<DeviceInfo> {
        let connected = self.registry.get_connected_devices().await;
        if connected.is_empty() {
            return Err(Error::DeviceNotFound(
                "no connected devices available".to_string(),
            ));
        }

        let capable: Vec<DeviceInfo> = connected
            .iter()
            .filter(|d| d.has_capabilities(&criteria.required_capabilities))
            .cloned()
            .collect();

        let pool = if capable.is_empty() {
            warn!(
                required = ?criteria.required_capabilities,
                "no device has the required capabilities, using any connected device"
            );
            connected
        } else {
            capable
        };

        let best = rank(pool, criteria)
            .into_iter()
            .next()
            .map(|(device, _)| device)
            .ok_or_else(|| Error::DeviceNotFound("no connected devices available".to_string()))?;
        debug!(device_id = %best.device_id, "device selected");
        Ok(best)
    }

    /// Score in `[0, 1]`: connectivity, capability match and type preference.
    pub fn get_device_suitability_score(device: &DeviceInfo, criteria: &SelectionCriteria) -> f64 {
        let mut score = 0.0;
        if device.is_connected() {
            score += CONNECTED_WEIGHT;
        }

        let required = &criteria.required_capabilities;
        if device.has_capabilities(required) {
            score += FULL_MATCH_WEIGHT;
        } else {
            let matched = required
                .iter()
                .filter(|c| device.capabilities.contains(c.as_str()))
                .count();
            score += PARTIAL_MATCH_WEIGHT * matched as f64 / required.len() as f64;
        }

        if let (Some(preferred), Some(actual)) =
            (criteria.preferred_device_type.as_deref(), device.device_type())
        {
            if preferred.eq_ignore_ascii_case(actual) {
                score += TYPE_PREFERENCE_WEIGHT;
            }
        }

        score.clamp(0.0, 1.0)
    }

    /// All registered devices, best first. Ties keep registration order.
    pub async fn rank_devices_by_suitability(
        &self,
        criteria: &SelectionCriteria,
    ) -> Vec<(DeviceInfo, f64)> {
        rank(self.registry.get_all_devices().await, criteria)
    }
}

fn rank(devices: Vec<DeviceInfo>, criteria: &SelectionCriteria) -> Vec<(DeviceInfo, f64)> {
    let mut scored: Vec<(DeviceInfo, f64)> = devices
        .into_iter()
        .map(|d| {
            let score = DeviceSelector::get_device_suitability_score(&d, criteria);
            (d, score)
        })
        .collect();
    // sort_by is stable
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

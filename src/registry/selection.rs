use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::instance::{HealthStatus, ServiceInstance};
use crate::error::HubError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    Weighted,
    #[default]
    HealthAware,
}

impl FromStr for SelectionStrategy {
    type Err = HubError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ROUND_ROBIN" => Ok(SelectionStrategy::RoundRobin),
            "LEAST_CONNECTIONS" => Ok(SelectionStrategy::LeastConnections),
            "WEIGHTED" => Ok(SelectionStrategy::Weighted),
            "HEALTH_AWARE" => Ok(SelectionStrategy::HealthAware),
            other => Err(HubError::Config(format!("unknown selection strategy: {other}"))),
        }
    }
}

/// Relative preference per health state under HEALTH_AWARE
fn health_factor(health: HealthStatus) -> f64 {
    match health {
        HealthStatus::Healthy => 9.0,
        HealthStatus::Unknown => 3.0,
        HealthStatus::Degraded | HealthStatus::Unhealthy => 1.0,
    }
}

fn weighted_pick<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    WeightedIndex::new(weights)
        .map(|dist| dist.sample(rng))
        .unwrap_or(0)
}

/// Index into `candidates` (never empty) of the instance to use.
/// `cursor` is the round-robin position for this service type.
pub(crate) fn choose<R: Rng + ?Sized>(
    strategy: SelectionStrategy,
    candidates: &[ServiceInstance],
    cursor: usize,
    rng: &mut R,
) -> usize {
    match strategy {
        SelectionStrategy::RoundRobin => cursor % candidates.len(),
        SelectionStrategy::LeastConnections => candidates
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| instance.in_flight)
            .map(|(index, _)| index)
            .unwrap_or(0),
        SelectionStrategy::Weighted => {
            let weights: Vec<f64> = candidates.iter().map(|i| i.weight.max(0.0)).collect();
            weighted_pick(&weights, rng)
        }
        SelectionStrategy::HealthAware => {
            let weights: Vec<f64> = candidates
                .iter()
                .map(|i| i.weight.max(0.0) * health_factor(i.effective_health()))
                .collect();
            weighted_pick(&weights, rng)
        }
    }
}

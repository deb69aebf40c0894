//! Fitness engine configuration: weights, budgets, and policy thresholds.

use crate::config::helpers::parse_optional_env;
use crate::error::ConfigError;

/// Weights, budgets, and thresholds for fitness scoring.
#[derive(Debug, Clone)]
pub struct FitnessConfig {
    pub weight_success_rate: f64,
    pub weight_token_efficiency: f64,
    pub weight_speed: f64,
    pub weight_adoption: f64,
    pub weight_freshness: f64,

    /// Mean tokens per use at which token efficiency reaches zero.
    pub tokens_budget: f64,
    /// Mean execution time (ms) at which the speed term reaches zero.
    pub speed_budget_ms: f64,
    /// Unique-agent count at which adoption saturates.
    pub adoption_cap: u64,
    /// Freshness half-life in days.
    pub half_life_days: f64,

    /// Usage reports required before the delisting policy applies.
    pub min_observations: u64,
    /// Tools below this success rate are delisted.
    pub delist_success_floor: f64,
    /// Tools below this fitness for `min_observations` consecutive reports
    /// are delisted.
    pub delist_fitness_floor: f64,

    /// Uses required for promotion to BattleTested.
    pub trust_min_uses: u64,
    /// Success rate required for promotion to BattleTested.
    pub trust_min_success_rate: f64,
    /// Distinct agents required for promotion to BattleTested.
    pub trust_min_agents: u64,
}

impl Default for FitnessConfig {
    fn default() -> Self {
        Self {
            weight_success_rate: 0.35,
            weight_token_efficiency: 0.25,
            weight_speed: 0.20,
            weight_adoption: 0.10,
            weight_freshness: 0.10,
            tokens_budget: 1_000.0,
            speed_budget_ms: 5_000.0,
            adoption_cap: 32,
            half_life_days: 30.0,
            min_observations: 5,
            delist_success_floor: 0.1,
            delist_fitness_floor: 0.05,
            trust_min_uses: 20,
            trust_min_success_rate: 0.9,
            trust_min_agents: 3,
        }
    }
}

impl FitnessConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let d = Self::default();

        let config = Self {
            weight_success_rate: parse_optional_env("FITNESS_WEIGHT_SUCCESS", d.weight_success_rate)?,
            weight_token_efficiency: parse_optional_env(
                "FITNESS_WEIGHT_TOKENS",
                d.weight_token_efficiency,
            )?,
            weight_speed: parse_optional_env("FITNESS_WEIGHT_SPEED", d.weight_speed)?,
            weight_adoption: parse_optional_env("FITNESS_WEIGHT_ADOPTION", d.weight_adoption)?,
            weight_freshness: parse_optional_env("FITNESS_WEIGHT_FRESHNESS", d.weight_freshness)?,
            tokens_budget: parse_optional_env("FITNESS_TOKENS_BUDGET", d.tokens_budget)?,
            speed_budget_ms: parse_optional_env("FITNESS_SPEED_BUDGET_MS", d.speed_budget_ms)?,
            adoption_cap: parse_optional_env("FITNESS_ADOPTION_CAP", d.adoption_cap)?,
            half_life_days: parse_optional_env("FITNESS_HALF_LIFE_DAYS", d.half_life_days)?,
            min_observations: parse_optional_env("FITNESS_MIN_OBSERVATIONS", d.min_observations)?,
            delist_success_floor: parse_optional_env(
                "FITNESS_DELIST_SUCCESS_FLOOR",
                d.delist_success_floor,
            )?,
            delist_fitness_floor: parse_optional_env(
                "FITNESS_DELIST_FITNESS_FLOOR",
                d.delist_fitness_floor,
            )?,
            trust_min_uses: parse_optional_env("TRUST_MIN_USES", d.trust_min_uses)?,
            trust_min_success_rate: parse_optional_env(
                "TRUST_MIN_SUCCESS_RATE",
                d.trust_min_success_rate,
            )?,
            trust_min_agents: parse_optional_env("TRUST_MIN_AGENTS", d.trust_min_agents)?,
        };

        let weight_sum = config.weight_success_rate
            + config.weight_token_efficiency
            + config.weight_speed
            + config.weight_adoption
            + config.weight_freshness;
        if !(0.99..=1.01).contains(&weight_sum) {
            return Err(ConfigError::InvalidValue {
                key: "FITNESS_WEIGHT_*".to_string(),
                message: format!("weights must sum to 1.0, got {weight_sum}"),
            });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        let c = FitnessConfig::default();
        let sum = c.weight_success_rate
            + c.weight_token_efficiency
            + c.weight_speed
            + c.weight_adoption
            + c.weight_freshness;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}

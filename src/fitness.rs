//! Fitness scoring, delisting policy, and trust escalation.
//!
//! The engine is stateless: fitness is a pure function of a tool's
//! telemetry and the clock, so recomputation at a fixed instant is
//! deterministic.

use chrono::{DateTime, Utc};

use crate::config::FitnessConfig;
use crate::models::{Tool, TrustLevel};

/// Stateless fitness engine.
#[derive(Debug, Clone)]
pub struct FitnessEngine {
    config: FitnessConfig,
}

impl FitnessEngine {
    pub fn new(config: FitnessConfig) -> Self {
        Self { config }
    }

    /// Compute the fitness score in [0, 1], rounded to 4 decimals.
    pub fn compute(&self, tool: &Tool, now: DateTime<Utc>) -> f64 {
        let c = &self.config;

        let score = c.weight_success_rate * self.success_rate(tool)
            + c.weight_token_efficiency * self.token_efficiency(tool)
            + c.weight_speed * self.speed(tool)
            + c.weight_adoption * self.adoption(tool)
            + c.weight_freshness * self.freshness(tool, now);

        (score.clamp(0.0, 1.0) * 10_000.0).round() / 10_000.0
    }

    /// Why a tool should be delisted, if the policy says so.
    ///
    /// `low_fitness_streak` must already reflect the report being applied.
    pub fn delist_reason(&self, tool: &Tool) -> Option<String> {
        if (tool.total_uses as u64) < self.config.min_observations {
            return None;
        }
        if self.success_rate(tool) < self.config.delist_success_floor {
            return Some(format!(
                "success rate {:.3} below floor {:.3}",
                self.success_rate(tool),
                self.config.delist_success_floor
            ));
        }
        if (tool.low_fitness_streak as u64) >= self.config.min_observations {
            return Some(format!(
                "fitness below {:.3} for {} consecutive reports",
                self.config.delist_fitness_floor, tool.low_fitness_streak
            ));
        }
        None
    }

    /// Whether a fitness value counts toward the sustained-low streak.
    pub fn is_low_fitness(&self, fitness: f64) -> bool {
        fitness < self.config.delist_fitness_floor
    }

    /// The trust level a tool has earned from telemetry, if higher than its
    /// current one. Promotion is one-way and never skips the Gauntlet:
    /// a tool below `Verified` cannot be promoted here.
    pub fn trust_promotion(&self, tool: &Tool) -> Option<TrustLevel> {
        if tool.trust_level != TrustLevel::Verified {
            return None;
        }
        let c = &self.config;
        if (tool.total_uses as u64) >= c.trust_min_uses
            && self.success_rate(tool) >= c.trust_min_success_rate
            && (tool.unique_agents as u64) >= c.trust_min_agents
        {
            return Some(TrustLevel::BattleTested);
        }
        None
    }

    fn success_rate(&self, tool: &Tool) -> f64 {
        tool.success_rate()
    }

    /// Token cost relative to the budget; neutral 0.5 when no report ever
    /// carried token data.
    fn token_efficiency(&self, tool: &Tool) -> f64 {
        match tool.tokens_per_use() {
            Some(mean) => (1.0 - mean / self.config.tokens_budget).clamp(0.0, 1.0),
            None => 0.5,
        }
    }

    fn speed(&self, tool: &Tool) -> f64 {
        (1.0 - tool.avg_execution_time_ms / self.config.speed_budget_ms).clamp(0.0, 1.0)
    }

    /// Logarithmic adoption with diminishing returns, saturating at the cap.
    fn adoption(&self, tool: &Tool) -> f64 {
        if tool.unique_agents <= 0 {
            return 0.0;
        }
        let cap = (self.config.adoption_cap as f64 + 1.0).log2();
        ((tool.unique_agents as f64 + 1.0).log2() / cap).min(1.0)
    }

    /// Exponential decay in the tool's age.
    fn freshness(&self, tool: &Tool, now: DateTime<Utc>) -> f64 {
        let age_days = (now - tool.created_at).num_seconds().max(0) as f64 / 86_400.0;
        (-age_days / self.config.half_life_days).exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn blank_tool() -> Tool {
        Tool {
            id: Uuid::new_v4(),
            name: "t".to_string(),
            description: String::new(),
            intent: String::new(),
            code: String::new(),
            test_case: String::new(),
            input_schema: None,
            tags: Vec::new(),
            author_agent_id: "anonymous".to_string(),
            version: 1,
            parent_tool_id: None,
            content_hash: String::new(),
            signature: String::new(),
            trust_level: TrustLevel::Verified,
            created_at: Utc::now(),
            total_uses: 0,
            successful_uses: 0,
            unique_agents: 0,
            avg_execution_time_ms: 0.0,
            tokens_sum: 0,
            token_reports: 0,
            fitness_score: 0.0,
            low_fitness_streak: 0,
            exec_ms: 0,
            mem_kb: 0,
            delisted: false,
            delist_reason: None,
        }
    }

    fn engine() -> FitnessEngine {
        FitnessEngine::new(FitnessConfig::default())
    }

    #[test]
    fn fresh_unused_tool_scores_neutral_terms() {
        let tool = blank_tool();
        let now = tool.created_at;
        // success 0, tokens neutral 0.5, speed 1.0, adoption 0, freshness 1.0
        let expected = 0.25 * 0.5 + 0.20 * 1.0 + 0.10 * 1.0;
        let fitness = engine().compute(&tool, now);
        assert!((fitness - expected).abs() < 1e-9, "got {fitness}");
    }

    #[test]
    fn battle_tested_profile_scores_high() {
        let mut tool = blank_tool();
        tool.total_uses = 20;
        tool.successful_uses = 20;
        tool.unique_agents = 3;
        tool.avg_execution_time_ms = 50.0;
        let fitness = engine().compute(&tool, tool.created_at);
        assert!(fitness > 0.7, "got {fitness}");
    }

    #[test]
    fn compute_is_deterministic_at_fixed_clock() {
        let mut tool = blank_tool();
        tool.total_uses = 7;
        tool.successful_uses = 5;
        tool.unique_agents = 2;
        tool.avg_execution_time_ms = 1234.0;
        tool.tokens_sum = 900;
        tool.token_reports = 3;
        let now = tool.created_at + Duration::days(3);
        assert_eq!(engine().compute(&tool, now), engine().compute(&tool, now));
    }

    #[test]
    fn token_efficiency_neutral_without_data() {
        let mut with_tokens = blank_tool();
        with_tokens.tokens_sum = 1_000_000;
        with_tokens.token_reports = 10;
        let without = blank_tool();
        let now = without.created_at;
        // Huge token usage must score lower than the no-data neutral.
        assert!(engine().compute(&with_tokens, now) < engine().compute(&without, now));
    }

    #[test]
    fn speed_clamps_at_budget() {
        let mut tool = blank_tool();
        tool.avg_execution_time_ms = 50_000.0;
        let slow = engine().compute(&tool, tool.created_at);
        tool.avg_execution_time_ms = 5_000.0;
        let at_budget = engine().compute(&tool, tool.created_at);
        assert_eq!(slow, at_budget);
    }

    #[test]
    fn freshness_decays_with_age() {
        let tool = blank_tool();
        let young = engine().compute(&tool, tool.created_at);
        let old = engine().compute(&tool, tool.created_at + Duration::days(90));
        assert!(old < young);
    }

    #[test]
    fn adoption_saturates_at_cap() {
        let mut tool = blank_tool();
        tool.unique_agents = 32;
        let at_cap = engine().compute(&tool, tool.created_at);
        tool.unique_agents = 10_000;
        // total_uses unchanged; only the adoption term moves, and it is capped.
        assert_eq!(engine().compute(&tool, tool.created_at), at_cap);
    }

    #[test]
    fn delist_requires_min_observations() {
        let mut tool = blank_tool();
        tool.total_uses = 4;
        tool.successful_uses = 0;
        assert!(engine().delist_reason(&tool).is_none());

        tool.total_uses = 5;
        assert!(engine().delist_reason(&tool).is_some());
    }

    #[test]
    fn delist_on_sustained_low_fitness() {
        let mut tool = blank_tool();
        tool.total_uses = 10;
        tool.successful_uses = 5; // healthy success rate
        tool.low_fitness_streak = 5;
        let reason = engine().delist_reason(&tool).expect("should delist");
        assert!(reason.contains("consecutive"));
    }

    #[test]
    fn trust_promotion_thresholds() {
        let mut tool = blank_tool();
        tool.total_uses = 20;
        tool.successful_uses = 19;
        tool.unique_agents = 3;
        assert_eq!(engine().trust_promotion(&tool), Some(TrustLevel::BattleTested));

        tool.unique_agents = 2;
        assert_eq!(engine().trust_promotion(&tool), None);

        tool.unique_agents = 3;
        tool.successful_uses = 17; // 0.85 < 0.9
        assert_eq!(engine().trust_promotion(&tool), None);
    }

    #[test]
    fn trust_promotion_never_skips_the_gauntlet() {
        let mut tool = blank_tool();
        tool.trust_level = TrustLevel::Submitted;
        tool.total_uses = 100;
        tool.successful_uses = 100;
        tool.unique_agents = 50;
        assert_eq!(engine().trust_promotion(&tool), None);
    }

    #[test]
    fn battle_tested_is_not_promoted_again() {
        let mut tool = blank_tool();
        tool.trust_level = TrustLevel::BattleTested;
        tool.total_uses = 1000;
        tool.successful_uses = 1000;
        tool.unique_agents = 100;
        assert_eq!(engine().trust_promotion(&tool), None);
    }
}

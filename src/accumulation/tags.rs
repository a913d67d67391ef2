//! Tag assignment.
//!
//! Pure functions of the computed metric fields against configured
//! thresholds. Each tag can appear at most once; order follows the rule
//! order below and is not meaningful to consumers.

use crate::types::Tag;
use rust_decimal::Decimal;

/// Thresholds feeding the tag rules, carved out of the settings.
#[derive(Debug, Clone)]
pub struct TagRules {
    pub min_whales: u32,
    pub organic_accumulation_fraction: Decimal,
    pub gini_concentration_threshold: Decimal,
    pub divergence_price_pct: Decimal,
    pub divergence_score_pct: Decimal,
    pub mad_k: Decimal,
    pub depeg_threshold: Decimal,
}

impl Default for TagRules {
    fn default() -> Self {
        Self {
            min_whales: 20,
            organic_accumulation_fraction: Decimal::new(25, 2),
            gini_concentration_threshold: Decimal::new(85, 2),
            divergence_price_pct: Decimal::new(-20, 1),
            divergence_score_pct: Decimal::new(2, 1),
            mad_k: Decimal::from(3),
            depeg_threshold: Decimal::new(98, 2),
        }
    }
}

/// Everything the tag rules look at.
#[derive(Debug, Clone, Default)]
pub struct TagContext {
    pub analyzed_count: u32,
    pub accumulators_count: u32,
    pub score_native_pct: Option<Decimal>,
    pub score_lst_adjusted_pct: Option<Decimal>,
    pub concentration_gini: Option<Decimal>,
    pub mad_threshold_pct: Option<Decimal>,
    pub is_anomaly: bool,
    pub lst_migration_count: u32,
    pub price_change_lookback_pct: Option<Decimal>,
    pub steth_rate_used: Decimal,
    /// Set by the orchestrator when the validator reported degraded.
    pub quality_degraded: bool,
}

pub fn assign_tags(ctx: &TagContext, rules: &TagRules) -> Vec<Tag> {
    let mut tags = Vec::new();

    if Decimal::from(ctx.accumulators_count)
        > rules.organic_accumulation_fraction * Decimal::from(ctx.analyzed_count)
    {
        tags.push(Tag::OrganicAccumulation);
    }

    if matches!(ctx.concentration_gini, Some(g) if g > rules.gini_concentration_threshold) {
        tags.push(Tag::ConcentratedSignal);
    }

    // Percentage against percentage, on both sides.
    if let (Some(price), Some(score)) = (ctx.price_change_lookback_pct, ctx.score_native_pct) {
        if price < rules.divergence_price_pct && score > rules.divergence_score_pct {
            tags.push(Tag::BullishDivergence);
        }
    }

    if ctx.lst_migration_count > 0 {
        tags.push(Tag::LstMigration);
    }

    // LST score against k × MAD, both in percentage points.
    if let (Some(score), Some(mad)) = (ctx.score_lst_adjusted_pct, ctx.mad_threshold_pct) {
        if score > rules.mad_k * mad && !ctx.is_anomaly {
            tags.push(Tag::HighConviction);
        }
    }

    if ctx.steth_rate_used < rules.depeg_threshold {
        tags.push(Tag::DepegRisk);
    }

    if ctx.is_anomaly {
        tags.push(Tag::AnomalyAlert);
    }

    if ctx.quality_degraded {
        tags.push(Tag::DataQualityWarning);
    }

    if ctx.analyzed_count < rules.min_whales {
        tags.push(Tag::InsufficientData);
    }

    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn quiet_ctx() -> TagContext {
        TagContext {
            analyzed_count: 30,
            accumulators_count: 0,
            score_native_pct: Some(Decimal::ZERO),
            score_lst_adjusted_pct: Some(Decimal::ZERO),
            concentration_gini: Some(dec!(0.3)),
            mad_threshold_pct: Some(Decimal::ZERO),
            is_anomaly: false,
            lst_migration_count: 0,
            price_change_lookback_pct: None,
            steth_rate_used: Decimal::ONE,
            quality_degraded: false,
        }
    }

    #[test]
    fn quiet_market_has_no_tags() {
        assert!(assign_tags(&quiet_ctx(), &TagRules::default()).is_empty());
    }

    #[test]
    fn organic_accumulation_needs_quarter_of_population() {
        let mut ctx = quiet_ctx();
        ctx.accumulators_count = 7; // 7 <= 0.25 × 30 is false only above 7.5
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::OrganicAccumulation));
        ctx.accumulators_count = 8;
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::OrganicAccumulation));
    }

    #[test]
    fn concentrated_signal_above_gini_threshold() {
        let mut ctx = quiet_ctx();
        ctx.concentration_gini = Some(dec!(0.86));
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::ConcentratedSignal));
        ctx.concentration_gini = Some(dec!(0.85));
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::ConcentratedSignal));
        ctx.concentration_gini = None;
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::ConcentratedSignal));
    }

    #[test]
    fn bullish_divergence_requires_both_sides() {
        let mut ctx = quiet_ctx();
        ctx.price_change_lookback_pct = Some(dec!(-2.857));
        ctx.score_native_pct = Some(dec!(0.5));
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::BullishDivergence));

        // Price fell but whales did not accumulate.
        ctx.score_native_pct = Some(dec!(0.1));
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::BullishDivergence));

        // Missing price context never produces the tag.
        ctx.score_native_pct = Some(dec!(0.5));
        ctx.price_change_lookback_pct = None;
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::BullishDivergence));
    }

    #[test]
    fn high_conviction_blocked_by_anomaly() {
        let mut ctx = quiet_ctx();
        ctx.score_lst_adjusted_pct = Some(dec!(5));
        ctx.mad_threshold_pct = Some(dec!(1));
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::HighConviction));

        ctx.is_anomaly = true;
        let tags = assign_tags(&ctx, &TagRules::default());
        assert!(!tags.contains(&Tag::HighConviction));
        assert!(tags.contains(&Tag::AnomalyAlert));
    }

    #[test]
    fn high_conviction_unit_discipline() {
        // score 2.9 vs 3 × MAD 1.0: below; 3.1: above.
        let mut ctx = quiet_ctx();
        ctx.mad_threshold_pct = Some(dec!(1.0));
        ctx.score_lst_adjusted_pct = Some(dec!(2.9));
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::HighConviction));
        ctx.score_lst_adjusted_pct = Some(dec!(3.1));
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::HighConviction));
    }

    #[test]
    fn depeg_risk_below_soft_band() {
        let mut ctx = quiet_ctx();
        ctx.steth_rate_used = dec!(0.979);
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::DepegRisk));
        ctx.steth_rate_used = dec!(0.98);
        assert!(!assign_tags(&ctx, &TagRules::default()).contains(&Tag::DepegRisk));
    }

    #[test]
    fn degraded_quality_and_thin_population() {
        let mut ctx = quiet_ctx();
        ctx.quality_degraded = true;
        ctx.analyzed_count = 5;
        let tags = assign_tags(&ctx, &TagRules::default());
        assert!(tags.contains(&Tag::DataQualityWarning));
        assert!(tags.contains(&Tag::InsufficientData));
    }

    #[test]
    fn migration_tag() {
        let mut ctx = quiet_ctx();
        ctx.lst_migration_count = 1;
        assert!(assign_tags(&ctx, &TagRules::default()).contains(&Tag::LstMigration));
    }
}

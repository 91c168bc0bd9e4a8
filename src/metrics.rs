//! Prometheus metrics for settlement, sessions, recovery and fairness

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::common::types::{GameType, Points};

pub struct CasinoMetrics {
    registry: Registry,
    wagers_settled: IntCounterVec,
    wagered_cents: IntCounterVec,
    paid_out_cents: IntCounterVec,
    settlement_failures: IntCounterVec,
    refunds: IntCounterVec,
    refund_failures: IntCounter,
    periods_opened: IntCounter,
    periods_revealed: IntCounter,
    sessions_active: IntGauge,
}

impl CasinoMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let wagers_settled = IntCounterVec::new(
            Opts::new("fairstake_wagers_settled_total", "Wagers settled by game and result"),
            &["game", "result"],
        )?;
        let wagered_cents = IntCounterVec::new(
            Opts::new("fairstake_wagered_cents_total", "Stake volume in hundredths of a point"),
            &["game"],
        )?;
        let paid_out_cents = IntCounterVec::new(
            Opts::new("fairstake_paid_out_cents_total", "Payout volume in hundredths of a point"),
            &["game"],
        )?;
        let settlement_failures = IntCounterVec::new(
            Opts::new(
                "fairstake_settlement_failures_total",
                "Infrastructure failures during settlement",
            ),
            &["refunded"],
        )?;
        let refunds = IntCounterVec::new(
            Opts::new("fairstake_recovery_refunds_total", "Stakes refunded by the recovery sweep"),
            &["kind"],
        )?;
        let refund_failures = IntCounter::new(
            "fairstake_recovery_refund_failures_total",
            "Refunds that failed and need manual attention",
        )?;
        let periods_opened =
            IntCounter::new("fairstake_periods_opened_total", "Fair-play periods opened")?;
        let periods_revealed =
            IntCounter::new("fairstake_periods_revealed_total", "Fair-play periods revealed")?;
        let sessions_active =
            IntGauge::new("fairstake_sessions_active", "Sessions opened and not yet settled")?;

        registry.register(Box::new(wagers_settled.clone()))?;
        registry.register(Box::new(wagered_cents.clone()))?;
        registry.register(Box::new(paid_out_cents.clone()))?;
        registry.register(Box::new(settlement_failures.clone()))?;
        registry.register(Box::new(refunds.clone()))?;
        registry.register(Box::new(refund_failures.clone()))?;
        registry.register(Box::new(periods_opened.clone()))?;
        registry.register(Box::new(periods_revealed.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;

        Ok(Self {
            registry,
            wagers_settled,
            wagered_cents,
            paid_out_cents,
            settlement_failures,
            refunds,
            refund_failures,
            periods_opened,
            periods_revealed,
            sessions_active,
        })
    }

    pub fn record_settlement(&self, game: GameType, stake: Points, payout: Points) {
        let result = if payout > stake {
            "win"
        } else if payout == stake {
            "push"
        } else {
            "loss"
        };
        self.wagers_settled.with_label_values(&[game.as_str(), result]).inc();
        self.wagered_cents
            .with_label_values(&[game.as_str()])
            .inc_by(stake.cents());
        self.paid_out_cents
            .with_label_values(&[game.as_str()])
            .inc_by(payout.cents());
    }

    pub fn record_settlement_failure(&self, refunded: bool) {
        let label = if refunded { "true" } else { "false" };
        self.settlement_failures.with_label_values(&[label]).inc();
    }

    pub fn record_refund(&self, kind: &str) {
        self.refunds.with_label_values(&[kind]).inc();
    }

    pub fn record_refund_failure(&self) {
        self.refund_failures.inc();
    }

    pub fn record_period_opened(&self) {
        self.periods_opened.inc();
    }

    pub fn record_period_revealed(&self) {
        self.periods_revealed.inc();
    }

    pub fn session_opened(&self) {
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn wagers_settled(&self, game: GameType, result: &str) -> u64 {
        self.wagers_settled.with_label_values(&[game.as_str(), result]).get()
    }

    pub fn refunds(&self, kind: &str) -> u64 {
        self.refunds.with_label_values(&[kind]).get()
    }

    /// Text exposition format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = CasinoMetrics::new().unwrap();
        metrics.record_settlement(GameType::Coinflip, Points::whole(10), Points::ZERO);
        metrics.record_settlement(GameType::Coinflip, Points::whole(10), Points::from_cents(1960));
        metrics.record_refund("session");

        assert_eq!(metrics.wagers_settled(GameType::Coinflip, "loss"), 1);
        assert_eq!(metrics.wagers_settled(GameType::Coinflip, "win"), 1);

        let text = metrics.render();
        assert!(text.contains("fairstake_wagers_settled_total"));
        assert!(text.contains("fairstake_recovery_refunds_total{kind=\"session\"} 1"));
    }
}

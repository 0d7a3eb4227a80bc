//! Per-tick price evolution.
//!
//! Each symbol's new price combines signed trade pressure, a Gaussian random
//! walk scaled by the symbol's volatility, the propagated sector factor,
//! decaying event impact, and time-decayed sentiment. The move is capped in
//! log space and floored absolutely. All randomness comes from one seeded
//! ChaCha8 stream so runs replay exactly.

use crate::models::{Company, MarketEvent, Regime};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use statrs::distribution::Normal;
use tracing::warn;

/// Driver weights. Tuned so a quiet tick moves a fraction of the symbol's
/// volatility and a heavy one saturates near the cap.
#[derive(Debug, Clone)]
pub struct PriceWeights {
    pub pressure: f64,
    pub random: f64,
    pub sector: f64,
    pub event: f64,
    pub sentiment: f64,
}

impl Default for PriceWeights {
    fn default() -> Self {
        Self {
            pressure: 0.008,
            random: 1.0,
            sector: 0.5,
            event: 1.0,
            sentiment: 0.003,
        }
    }
}

/// Inputs for one symbol's price update.
pub struct PriceInputs<'a> {
    pub company: &'a Company,
    /// Signed aggressor volume of this tick's trades on the symbol.
    pub net_aggressor_volume: i64,
    pub traded_volume: i64,
    /// Aggregated sector log-move propagated from the sector's constituents.
    pub sector_factor: f64,
    pub events: &'a [MarketEvent],
    /// Time-decayed aggregate sentiment in [-1, 1].
    pub sentiment: f64,
    pub regime: Regime,
    pub tick: u64,
}

pub struct PriceModel {
    rng: ChaCha8Rng,
    weights: PriceWeights,
    floor: f64,
    move_cap: f64,
}

impl PriceModel {
    pub fn new(seed: u64, floor: f64, move_cap: f64) -> Self {
        let seed = if seed == 0 { rand::thread_rng().gen() } else { seed };
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            weights: PriceWeights::default(),
            floor,
            move_cap,
        }
    }

    pub fn with_weights(mut self, weights: PriceWeights) -> Self {
        self.weights = weights;
        self
    }

    /// Compute the symbol's next price. Guaranteed `>= floor` and within the
    /// per-tick log-move cap of the previous price.
    pub fn next_price(&mut self, inputs: &PriceInputs<'_>) -> f64 {
        let c = inputs.company;
        let old_price = c.price.max(self.floor);

        // Trade pressure saturates: a handful of lots nudges, a flood caps out.
        let liquidity_scale = (c.outstanding_shares as f64 / 10_000.0).max(100.0);
        let pressure = (inputs.net_aggressor_volume as f64 / liquidity_scale).tanh()
            * self.weights.pressure;

        let random_walk = self.gaussian(0.0, c.volatility) * self.weights.random;

        let sector = inputs.sector_factor * c.beta * self.weights.sector;

        let event_impact: f64 = inputs
            .events
            .iter()
            .filter(|e| e.applies_to(&c.symbol, &c.sector))
            .map(|e| e.impact_at(inputs.tick))
            .sum::<f64>()
            * self.weights.event;

        let sentiment = inputs.sentiment.clamp(-1.0, 1.0) * self.weights.sentiment;

        let drift = inputs.regime.drift() + c.momentum * 0.0002;

        let log_move = (pressure + random_walk + sector + event_impact + sentiment + drift)
            .clamp(-self.move_cap, self.move_cap);

        (old_price * log_move.exp()).max(self.floor)
    }

    fn gaussian(&mut self, mean: f64, std_dev: f64) -> f64 {
        if std_dev <= 0.0 {
            return mean;
        }
        match Normal::new(mean, std_dev) {
            Ok(dist) => self.rng.sample(dist),
            Err(e) => {
                warn!(error = %e, "degenerate volatility, skipping random walk");
                mean
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn company(price: f64, volatility: f64) -> Company {
        Company {
            symbol: "AAPL".into(),
            name: "Apple".into(),
            sector: "tech".into(),
            price,
            open_price: price,
            high: price,
            low: price,
            volume: 0,
            outstanding_shares: 1_000_000,
            volatility,
            beta: 1.0,
            momentum: 0.0,
        }
    }

    fn inputs<'a>(company: &'a Company, events: &'a [MarketEvent]) -> PriceInputs<'a> {
        PriceInputs {
            company,
            net_aggressor_volume: 0,
            traded_volume: 0,
            sector_factor: 0.0,
            events,
            sentiment: 0.0,
            regime: Regime::Normal,
            tick: 1,
        }
    }

    #[test]
    fn same_seed_replays_identical_prices() {
        let c = company(100.0, 0.02);
        let mut a = PriceModel::new(7, 0.01, 0.10);
        let mut b = PriceModel::new(7, 0.01, 0.10);
        for _ in 0..50 {
            assert_eq!(a.next_price(&inputs(&c, &[])), b.next_price(&inputs(&c, &[])));
        }
    }

    #[test]
    fn move_cap_bounds_log_return() {
        let c = company(100.0, 5.0); // absurd volatility
        let mut model = PriceModel::new(11, 0.01, 0.10);
        for _ in 0..200 {
            let next = model.next_price(&inputs(&c, &[]));
            let log_move = (next / c.price).ln();
            assert!(log_move.abs() <= 0.10 + 1e-9, "log move {log_move}");
        }
    }

    #[test]
    fn price_never_drops_below_floor() {
        let c = company(0.011, 0.5);
        let mut model = PriceModel::new(3, 0.01, 0.10);
        let mut price = c.price;
        let mut cursed = c.clone();
        for _ in 0..500 {
            cursed.price = price;
            price = model.next_price(&inputs(&cursed, &[]));
            assert!(price >= 0.01);
        }
    }

    #[test]
    fn buy_pressure_pushes_price_up_on_average() {
        let c = company(100.0, 0.0); // no noise
        let mut model = PriceModel::new(5, 0.01, 0.10);
        let mut pressured = inputs(&c, &[]);
        pressured.net_aggressor_volume = 10_000;
        pressured.traded_volume = 10_000;
        let next = model.next_price(&pressured);
        assert!(next > 100.0);
    }

    #[test]
    fn active_event_moves_affected_symbol_only() {
        let tech = company(100.0, 0.0);
        let mut energy = company(100.0, 0.0);
        energy.symbol = "XOM".into();
        energy.sector = "energy".into();

        let events = vec![MarketEvent {
            id: "e".into(),
            tick_started: 1,
            duration_ticks: 10,
            sector: Some("tech".into()),
            symbols: vec![],
            impact: -0.05,
            headline: "Chip glut".into(),
            category: crate::models::NewsCategory::Market,
        }];

        let mut model = PriceModel::new(9, 0.01, 0.10);
        let hit = model.next_price(&inputs(&tech, &events));
        let spared = model.next_price(&inputs(&energy, &events));
        assert!(hit < 100.0);
        assert!((spared - 100.0).abs() < 1e-9);
    }
}

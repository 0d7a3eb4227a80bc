//! Tick-scoped market event generation.
//!
//! With a configured chance per tick the generator opens a MarketEvent that
//! shapes prices while it decays, plus the news entry announcing it. Seeded
//! RNG keeps event history reproducible.

use crate::models::{Company, MarketEvent, NewsCategory, NewsItem};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

/// Decay horizon for news sentiment feeding the price model.
const SENTIMENT_WINDOW_TICKS: u64 = 20;

struct EventTemplate {
    category: NewsCategory,
    headline: &'static str,
    /// Impact magnitude range (sign decided by the template).
    impact: (f64, f64),
    /// Whether the event hits a single symbol or a whole sector.
    sector_wide: bool,
}

const TEMPLATES: &[EventTemplate] = &[
    EventTemplate {
        category: NewsCategory::Earnings,
        headline: "{name} posts blowout quarterly earnings",
        impact: (0.01, 0.04),
        sector_wide: false,
    },
    EventTemplate {
        category: NewsCategory::Earnings,
        headline: "{name} misses earnings expectations badly",
        impact: (-0.04, -0.01),
        sector_wide: false,
    },
    EventTemplate {
        category: NewsCategory::Product,
        headline: "{name} unveils surprise flagship product",
        impact: (0.01, 0.03),
        sector_wide: false,
    },
    EventTemplate {
        category: NewsCategory::Scandal,
        headline: "Accounting irregularities surface at {name}",
        impact: (-0.05, -0.02),
        sector_wide: false,
    },
    EventTemplate {
        category: NewsCategory::Merger,
        headline: "{name} in advanced takeover talks",
        impact: (0.02, 0.06),
        sector_wide: false,
    },
    EventTemplate {
        category: NewsCategory::Regulatory,
        headline: "Regulators open probe into the {sector} sector",
        impact: (-0.03, -0.01),
        sector_wide: true,
    },
    EventTemplate {
        category: NewsCategory::Market,
        headline: "Analysts turn bullish on the {sector} sector",
        impact: (0.01, 0.03),
        sector_wide: true,
    },
];

pub struct EventGenerator {
    rng: ChaCha8Rng,
    enabled: bool,
    chance: f64,
}

impl EventGenerator {
    pub fn new(seed: u64, enabled: bool, chance: f64) -> Self {
        let seed = if seed == 0 { rand::thread_rng().gen() } else { seed };
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            enabled,
            chance: chance.clamp(0.0, 1.0),
        }
    }

    /// Roll for a new event this tick. Returns the event and its news entry.
    pub fn maybe_generate(
        &mut self,
        tick: u64,
        companies: &[Company],
    ) -> Option<(MarketEvent, NewsItem)> {
        if !self.enabled || companies.is_empty() || !self.rng.gen_bool(self.chance) {
            return None;
        }

        let template = TEMPLATES.choose(&mut self.rng)?;
        let company = companies.choose(&mut self.rng)?;
        let (lo, hi) = template.impact;
        let impact = self.rng.gen_range(lo.min(hi)..=lo.max(hi));
        let duration_ticks = self.rng.gen_range(5..=30);

        let headline = template
            .headline
            .replace("{name}", &company.name)
            .replace("{sector}", &company.sector);

        let (sector, symbols) = if template.sector_wide {
            (Some(company.sector.clone()), Vec::new())
        } else {
            (None, vec![company.symbol.clone()])
        };

        let event = MarketEvent {
            id: Uuid::new_v4().to_string(),
            tick_started: tick,
            duration_ticks,
            sector,
            symbols: symbols.clone(),
            impact,
            headline: headline.clone(),
            category: template.category,
        };

        let sentiment = (impact * 25.0).clamp(-1.0, 1.0);
        let news = NewsItem::new(tick, headline, template.category)
            .with_sentiment(sentiment)
            .with_symbols(if symbols.is_empty() {
                companies
                    .iter()
                    .filter(|c| Some(&c.sector) == event.sector.as_ref())
                    .map(|c| c.symbol.clone())
                    .collect()
            } else {
                symbols
            });
        let news = if impact.abs() >= 0.04 {
            news.breaking()
        } else {
            news
        };

        Some((event, news))
    }
}

/// Time-decayed aggregate sentiment for one symbol from recent news.
/// Linear decay over the window; items not mentioning the symbol are ignored.
pub fn aggregate_sentiment(symbol: &str, news: &[NewsItem], tick: u64) -> f64 {
    let mut total = 0.0;
    for item in news {
        let age = tick.saturating_sub(item.tick);
        if age >= SENTIMENT_WINDOW_TICKS {
            continue;
        }
        if !item.symbols.iter().any(|s| s == symbol) {
            continue;
        }
        let decay = (SENTIMENT_WINDOW_TICKS - age) as f64 / SENTIMENT_WINDOW_TICKS as f64;
        total += item.sentiment * decay;
    }
    total.clamp(-1.0, 1.0)
}

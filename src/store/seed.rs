//! Startup seeding: listed companies for an empty store.

use crate::models::Company;
use crate::store::SqliteStore;
use anyhow::Result;
use tracing::info;

struct Listing {
    symbol: &'static str,
    name: &'static str,
    sector: &'static str,
    price: f64,
    shares: i64,
    volatility: f64,
    beta: f64,
}

const LISTINGS: &[Listing] = &[
    Listing { symbol: "AAPL", name: "Apple", sector: "tech", price: 178.0, shares: 15_500_000, volatility: 0.015, beta: 1.1 },
    Listing { symbol: "MSFT", name: "Microsoft", sector: "tech", price: 402.0, shares: 7_400_000, volatility: 0.014, beta: 0.9 },
    Listing { symbol: "NVDA", name: "Nvidia", sector: "tech", price: 690.0, shares: 2_500_000, volatility: 0.030, beta: 1.6 },
    Listing { symbol: "JPM", name: "JPMorgan", sector: "finance", price: 172.0, shares: 2_900_000, volatility: 0.012, beta: 1.0 },
    Listing { symbol: "GS", name: "Goldman Sachs", sector: "finance", price: 385.0, shares: 340_000, volatility: 0.016, beta: 1.2 },
    Listing { symbol: "XOM", name: "Exxon Mobil", sector: "energy", price: 102.0, shares: 4_000_000, volatility: 0.013, beta: 0.8 },
    Listing { symbol: "CVX", name: "Chevron", sector: "energy", price: 152.0, shares: 1_900_000, volatility: 0.013, beta: 0.8 },
    Listing { symbol: "PFE", name: "Pfizer", sector: "health", price: 27.0, shares: 5_600_000, volatility: 0.011, beta: 0.6 },
    Listing { symbol: "UNH", name: "UnitedHealth", sector: "health", price: 510.0, shares: 930_000, volatility: 0.012, beta: 0.7 },
    Listing { symbol: "WMT", name: "Walmart", sector: "retail", price: 165.0, shares: 2_700_000, volatility: 0.010, beta: 0.5 },
];

/// Insert the default listings when the companies table is empty. Returns how
/// many were created.
pub fn seed_default_companies(store: &SqliteStore) -> Result<usize> {
    if store.has_companies()? {
        return Ok(0);
    }
    for listing in LISTINGS {
        store.upsert_company(&Company {
            symbol: listing.symbol.to_string(),
            name: listing.name.to_string(),
            sector: listing.sector.to_string(),
            price: listing.price,
            open_price: listing.price,
            high: listing.price,
            low: listing.price,
            volume: 0,
            outstanding_shares: listing.shares,
            volatility: listing.volatility,
            beta: listing.beta,
            momentum: 0.0,
        })?;
    }
    info!(companies = LISTINGS.len(), "seeded default listings");
    Ok(LISTINGS.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_once_and_only_when_empty() {
        let store = SqliteStore::open(":memory:").unwrap();
        assert_eq!(seed_default_companies(&store).unwrap(), LISTINGS.len());
        assert_eq!(seed_default_companies(&store).unwrap(), 0);
        let companies = store.list_companies().unwrap();
        assert_eq!(companies.len(), LISTINGS.len());
        assert!(companies.iter().all(|c| c.price > 0.0));
    }
}

//! Machine size selection.
//!
//! Blueprints may pin a concrete instance size or give resource
//! requirements (RAM/CPU ranges, a price cap) and let the engine pick
//! the cheapest size that fits from the provider's catalog.

use flotilla_blueprint::Range;

/// One instance size a provider offers.
#[derive(Debug, Clone, PartialEq)]
pub struct Description {
    pub size: String,
    /// Hourly price in dollars.
    pub price: f64,
    /// Memory in GiB.
    pub ram: f64,
    /// Core count.
    pub cpu: f64,
}

/// The catalog for a provider; empty for providers without one, in
/// which case size selection is the provider's problem.
pub fn descriptions(provider: &str) -> Vec<Description> {
    match provider {
        "mock" => crate::mock::descriptions(),
        _ => Vec::new(),
    }
}

/// Pick the cheapest size satisfying the RAM and CPU ranges and the
/// price cap (0 means no cap). Ties keep the earlier catalog entry;
/// returns an empty string when nothing fits.
pub fn choose_best_size(
    descriptions: &[Description],
    ram: Range,
    cpu: Range,
    max_price: f64,
) -> String {
    let mut best: Option<&Description> = None;
    for d in descriptions {
        if !ram.accepts(d.ram) || !cpu.accepts(d.cpu) {
            continue;
        }
        if max_price != 0.0 && d.price > max_price {
            continue;
        }
        if best.map_or(true, |b| d.price < b.price) {
            best = Some(d);
        }
    }
    best.map(|d| d.size.clone()).unwrap_or_default()
}

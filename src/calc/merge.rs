/// Merging partial fills into a single trade.
///
/// Pure combination only: the caller re-derives the merged record and
/// decides what happens to the source legs.

use crate::state::{NumberField, RawTrade, TimestampField, Trade};

/// Combine several fills of one instrument into one raw trade: earliest
/// entry, latest exit, summed volume and costs, volume-weighted prices.
/// Stop loss, setup, and attachments come from the earliest leg.
///
/// Refuses (None) an empty slice or legs with mixed symbols/directions.
pub fn merge_trades(trades: &[Trade]) -> Option<RawTrade> {
    let first = trades.first()?;
    if !trades
        .iter()
        .all(|t| t.symbol == first.symbol && t.direction == first.direction)
    {
        return None;
    }

    // Legs without an entry time sort first; the earliest timed leg wins
    // otherwise.
    let earliest = trades.iter().min_by_key(|t| t.entry_time)?;

    let entry_time = trades.iter().filter_map(|t| t.entry_time).min();
    let exit_time = trades.iter().filter_map(|t| t.exit_time).max();

    let total_volume: f64 = trades.iter().filter_map(|t| t.volume).sum();
    let entry_price = weighted_price(trades, |t| t.entry_price);
    let exit_price = weighted_price(trades, |t| t.exit_price);

    Some(RawTrade {
        symbol: first.symbol.clone(),
        direction: first.direction,
        volume: (total_volume > 0.0).then_some(NumberField::Num(total_volume)),
        entry_price: entry_price.map(NumberField::Num),
        exit_price: exit_price.map(NumberField::Num),
        sl: earliest.sl.map(NumberField::Num),
        commission: sum_present(trades, |t| t.commission).map(NumberField::Num),
        swap: sum_present(trades, |t| t.swap).map(NumberField::Num),
        net_pnl: sum_present(trades, |t| t.net_pnl).map(NumberField::Num),
        entry_timestamp: entry_time.map(TimestampField::Instant),
        exit_timestamp: exit_time.map(TimestampField::Instant),
        pip_size: earliest.pip_size.map(NumberField::Num),
        pip_value_per_lot: earliest.pip_value_per_lot.map(NumberField::Num),
        setup_id: earliest.setup_id.clone(),
        selected_rules: earliest.selected_rules.clone(),
        image_url: earliest.image_url.clone(),
        notes: earliest.notes.clone(),
    })
}

/// Volume-weighted average over legs that carry both a price and a volume.
fn weighted_price(trades: &[Trade], price: impl Fn(&Trade) -> Option<f64>) -> Option<f64> {
    let mut num = 0.0;
    let mut den = 0.0;
    for t in trades {
        if let (Some(p), Some(v)) = (price(t), t.volume) {
            num += p * v;
            den += v;
        }
    }
    (den > 0.0).then(|| num / den)
}

fn sum_present(trades: &[Trade], value: impl Fn(&Trade) -> Option<f64>) -> Option<f64> {
    let present: Vec<f64> = trades.iter().filter_map(&value).collect();
    (!present.is_empty()).then(|| present.iter().sum())
}

/// Aggregate performance statistics.
///
/// Pure reducers over already-derived trades. Undefined ratios come back
/// as explicit sentinels; NaN and infinities never leak to callers.

use crate::state::{Trade, TradeStatus};

/// A ratio statistic that may be undefined. Renders as "2.00", "∞", or
/// "N/A"; callers get a value they can put on screen unconditionally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RatioStat {
    Value(f64),
    Infinite,
    NotApplicable,
}

impl std::fmt::Display for RatioStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v:.2}"),
            Self::Infinite => write!(f, "∞"),
            Self::NotApplicable => write!(f, "N/A"),
        }
    }
}

impl serde::Serialize for RatioStat {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

/// Realized P&L of one trade, coerced to 0 when absent or unusable.
#[inline]
fn pnl_of(trade: &Trade) -> f64 {
    trade.net_pnl.filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Sum of realized P&L across all trades. No rounding; the caller formats
/// for display.
pub fn net_cumulative_pnl(trades: &[Trade]) -> f64 {
    trades.iter().map(pnl_of).sum()
}

/// Gross profit over winning trades divided by absolute gross loss over
/// losing trades.
pub fn profit_factor(trades: &[Trade]) -> RatioStat {
    let gross_profit: f64 = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Win))
        .map(pnl_of)
        .filter(|p| *p > 0.0)
        .sum();
    let gross_loss: f64 = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Loss))
        .map(pnl_of)
        .filter(|p| *p < 0.0)
        .sum::<f64>()
        .abs();

    if gross_loss == 0.0 {
        if gross_profit > 0.0 {
            RatioStat::Infinite
        } else {
            RatioStat::NotApplicable
        }
    } else {
        RatioStat::Value(gross_profit / gross_loss)
    }
}

/// Winning trades over winning-plus-losing trades, as a percent string.
/// Break-even trades count on neither side. Exactly "0%" when there is
/// nothing to divide.
pub fn win_percentage(trades: &[Trade]) -> String {
    let wins = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Win))
        .count();
    let losses = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Loss))
        .count();

    let decided = wins + losses;
    if decided == 0 {
        return "0%".to_string();
    }
    format!("{:.2}%", wins as f64 / decided as f64 * 100.0)
}

/// Mean winner P&L over the absolute mean loser P&L.
pub fn avg_win_loss_ratio(trades: &[Trade]) -> RatioStat {
    let winners: Vec<f64> = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Win))
        .map(pnl_of)
        .collect();
    let losers: Vec<f64> = trades
        .iter()
        .filter(|t| t.status == Some(TradeStatus::Loss))
        .map(pnl_of)
        .collect();

    if winners.is_empty() || losers.is_empty() {
        return RatioStat::NotApplicable;
    }

    let avg_win = winners.iter().sum::<f64>() / winners.len() as f64;
    let avg_loss = losers.iter().sum::<f64>() / losers.len() as f64;

    if avg_loss == 0.0 {
        if avg_win > 0.0 {
            RatioStat::Infinite
        } else {
            RatioStat::NotApplicable
        }
    } else {
        RatioStat::Value(avg_win / avg_loss.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RawTrade, Trade};
    use chrono::Utc;

    fn trade_with(pnl: f64, status: TradeStatus) -> Trade {
        let mut t = Trade::from_raw(
            "t".to_string(),
            "a".to_string(),
            "u".to_string(),
            &RawTrade::default(),
            0.0,
            Utc::now(),
        );
        t.net_pnl = Some(pnl);
        t.status = Some(status);
        t
    }

    #[test]
    fn test_one_win_one_loss() {
        let trades = vec![
            trade_with(100.0, TradeStatus::Win),
            trade_with(-50.0, TradeStatus::Loss),
        ];
        assert_eq!(win_percentage(&trades), "50.00%");
        assert_eq!(profit_factor(&trades).to_string(), "2.00");
        assert_eq!(net_cumulative_pnl(&trades), 50.0);
        assert_eq!(avg_win_loss_ratio(&trades).to_string(), "2.00");
    }

    #[test]
    fn test_empty_portfolio() {
        let trades: Vec<Trade> = vec![];
        assert_eq!(win_percentage(&trades), "0%");
        assert_eq!(profit_factor(&trades), RatioStat::NotApplicable);
        assert_eq!(avg_win_loss_ratio(&trades), RatioStat::NotApplicable);
        assert_eq!(net_cumulative_pnl(&trades), 0.0);
    }

    #[test]
    fn test_break_even_excluded_from_win_rate() {
        let trades = vec![
            trade_with(100.0, TradeStatus::Win),
            trade_with(2.0, TradeStatus::BreakEven),
            trade_with(-1.0, TradeStatus::BreakEven),
            trade_with(-50.0, TradeStatus::Loss),
        ];
        assert_eq!(win_percentage(&trades), "50.00%");
    }

    #[test]
    fn test_all_winners_is_infinite_profit_factor() {
        let trades = vec![
            trade_with(100.0, TradeStatus::Win),
            trade_with(40.0, TradeStatus::Win),
        ];
        assert_eq!(profit_factor(&trades), RatioStat::Infinite);
        assert_eq!(profit_factor(&trades).to_string(), "∞");
        assert_eq!(win_percentage(&trades), "100.00%");
        // No losing group: the win/loss ratio is undefined, not infinite.
        assert_eq!(avg_win_loss_ratio(&trades), RatioStat::NotApplicable);
    }

    #[test]
    fn test_zero_mean_loss_is_infinite_ratio() {
        let trades = vec![
            trade_with(100.0, TradeStatus::Win),
            trade_with(0.0, TradeStatus::Loss),
        ];
        assert_eq!(avg_win_loss_ratio(&trades), RatioStat::Infinite);
        // Profit factor has no negative P&L to sum either.
        assert_eq!(profit_factor(&trades), RatioStat::Infinite);
    }

    #[test]
    fn test_missing_pnl_counts_as_zero() {
        let mut t = trade_with(0.0, TradeStatus::Win);
        t.net_pnl = None;
        let trades = vec![t, trade_with(25.0, TradeStatus::Win)];
        assert_eq!(net_cumulative_pnl(&trades), 25.0);
    }

    #[test]
    fn test_legacy_field_and_status_leniency() {
        // Older records carry netPL and lowercase statuses; both load.
        let json = r#"{
            "id": "t1", "accountId": "a1", "userId": "u1",
            "symbol": "EURUSD", "direction": "buy",
            "volume": 1.0, "entryPrice": null, "exitPrice": null,
            "sl": null, "commission": null, "swap": null,
            "netPL": 75.0,
            "entryTime": null, "exitTime": null,
            "pipSize": null, "pipValuePerLot": null,
            "setupId": null, "selectedRules": [],
            "imageUrl": null, "notes": null,
            "riskAmount": null, "durationMin": null, "session": null,
            "riskToReward": null, "percentRisk": null, "percentPnl": null,
            "status": "win",
            "isDeleted": false, "deletedAt": null,
            "createdAt": "2024-03-01T00:00:00Z"
        }"#;
        let trade: Trade = serde_json::from_str(json).expect("legacy record loads");
        assert_eq!(trade.net_pnl, Some(75.0));
        assert_eq!(trade.status, Some(TradeStatus::Win));
        assert_eq!(net_cumulative_pnl(std::slice::from_ref(&trade)), 75.0);
        assert_eq!(profit_factor(std::slice::from_ref(&trade)), RatioStat::Infinite);
    }
}

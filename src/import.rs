use crate::calc::fields;
use crate::errors::JournalResult;
use crate::state::{NumberField, RawTrade, TimestampField};

/// Result of parsing one CSV payload. Discarded rows never reach the
/// calculator.
#[derive(Debug, Default)]
pub struct CsvParseOutcome {
    pub rows: Vec<RawTrade>,
    pub discarded: usize,
}

/// Parse exported trade history into raw trade records.
///
/// Header names are matched case-insensitively, with or without
/// underscores, so both `entryPrice` and `entry_price` exports load.
/// Rows missing symbol, direction, either price, or P&L are discarded
/// and counted.
pub fn parse_trades_csv(data: &str) -> JournalResult<CsvParseOutcome> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data.as_bytes());

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(normalize_header)
        .collect();

    let mut outcome = CsvParseOutcome::default();

    for record in reader.records() {
        let record = record?;
        let get = |name: &str| -> Option<String> {
            let want = normalize_header(name);
            headers
                .iter()
                .position(|h| *h == want)
                .and_then(|i| record.get(i))
                .map(str::to_string)
                .filter(|v| !v.is_empty())
        };

        let raw = RawTrade {
            symbol: get("symbol"),
            direction: get("direction").and_then(|s| s.parse().ok()),
            volume: get("volume").map(NumberField::Text),
            entry_price: get("entryPrice").map(NumberField::Text),
            exit_price: get("exitPrice").map(NumberField::Text),
            sl: get("sl").map(NumberField::Text),
            commission: get("commission").map(NumberField::Text),
            swap: get("swap").map(NumberField::Text),
            net_pnl: get("netPnL").map(NumberField::Text),
            entry_timestamp: get("entryTimestamp").map(TimestampField::Text),
            exit_timestamp: get("exitTimestamp").map(TimestampField::Text),
            ..RawTrade::default()
        };

        if row_is_malformed(&raw) {
            outcome.discarded += 1;
            continue;
        }
        outcome.rows.push(raw);
    }

    Ok(outcome)
}

fn normalize_header(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != ' ')
        .collect::<String>()
        .to_ascii_lowercase()
}

fn row_is_malformed(raw: &RawTrade) -> bool {
    raw.symbol.is_none()
        || raw.direction.is_none()
        || fields::numeric(raw.entry_price.as_ref()).is_none()
        || fields::numeric(raw.exit_price.as_ref()).is_none()
        || fields::numeric(raw.net_pnl.as_ref()).is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Direction;

    const SAMPLE: &str = "\
symbol,direction,volume,entryPrice,exitPrice,sl,netPnL,entryTimestamp,exitTimestamp
EURUSD,Buy,1,1.1000,1.1050,1.0950,100,2024-03-01T14:00:00Z,2024-03-01T15:00:00Z
XAUUSD,sell,0.5,2300.0,2290.0,2310.0,-50,2024-03-01T09:00:00Z,2024-03-01T10:30:00Z
,Buy,1,1.1000,1.1050,1.0950,100,2024-03-01T14:00:00Z,2024-03-01T15:00:00Z
EURUSD,Buy,1,abc,1.1050,1.0950,100,2024-03-01T14:00:00Z,2024-03-01T15:00:00Z
";

    #[test]
    fn test_good_rows_parse_bad_rows_discard() {
        let outcome = parse_trades_csv(SAMPLE).expect("parse");
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.discarded, 2);

        let first = &outcome.rows[0];
        assert_eq!(first.symbol.as_deref(), Some("EURUSD"));
        assert_eq!(first.direction, Some(Direction::Buy));
        assert_eq!(fields::numeric(first.entry_price.as_ref()), Some(1.1000));

        // Lowercase direction still parses.
        assert_eq!(outcome.rows[1].direction, Some(Direction::Sell));
    }

    #[test]
    fn test_snake_case_headers_accepted() {
        let csv = "\
symbol,direction,volume,entry_price,exit_price,sl,net_pnl
EURUSD,Buy,1,1.1000,1.1050,1.0950,100
";
        let outcome = parse_trades_csv(csv).expect("parse");
        assert_eq!(outcome.rows.len(), 1);
        assert_eq!(
            fields::numeric(outcome.rows[0].net_pnl.as_ref()),
            Some(100.0)
        );
    }

    #[test]
    fn test_missing_pnl_discards() {
        let csv = "\
symbol,direction,volume,entryPrice,exitPrice,sl,netPnL
EURUSD,Buy,1,1.1000,1.1050,1.0950,
";
        let outcome = parse_trades_csv(csv).expect("parse");
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.discarded, 1);
    }

    #[test]
    fn test_empty_input() {
        let outcome = parse_trades_csv("").expect("parse");
        assert!(outcome.rows.is_empty());
        assert_eq!(outcome.discarded, 0);
    }
}

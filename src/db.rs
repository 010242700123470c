use crate::errors::{JournalError, JournalResult};
use crate::state::{Account, DbCommand, Note, Setup, SymbolInfo, Tag, Trade};
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub type DbPool = Arc<Mutex<Connection>>;

/// Soft-deleted trades stay restorable for this many days before they
/// become eligible for permanent removal.
pub const RECYCLE_BIN_DAYS: i64 = 7;

pub fn init_db(data_dir: &Path) -> JournalResult<DbPool> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| JournalError::Database(format!("create dir: {e}")))?;
    let db_path = data_dir.join("coredrift.db");
    let conn = Connection::open(&db_path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA cache_size=-64000;")?;

    let schema = include_str!("../migrations/001_init.sql");
    conn.execute_batch(schema)?;

    seed_symbols(&conn)?;

    tracing::info!("database initialized at {}", db_path.display());
    Ok(Arc::new(Mutex::new(conn)))
}

/// First-run defaults so risk math works before the user curates the
/// catalog.
fn seed_symbols(conn: &Connection) -> JournalResult<()> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM symbols", [], |row| row.get(0))?;
    if count > 0 {
        return Ok(());
    }

    let defaults = [
        ("EURUSD", 0.0001, 10.0, 100_000.0),
        ("XAUUSD", 0.1, 10.0, 100.0),
        ("NASDAQ", 1.0, 1.0, 1.0),
        ("BTCUSD", 1.0, 1.0, 1.0),
    ];
    for (id, pip_size, pip_value, contract_size) in defaults {
        conn.execute(
            "INSERT INTO symbols (id, pip_size, pip_value_per_lot, contract_size) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, pip_size, pip_value, contract_size],
        )?;
    }

    tracing::info!("symbol catalog seeded with defaults");
    Ok(())
}

/// Dedicated DB writer task. Reads commands from bounded channel, executes SQL.
/// This is the ONLY task that writes to the database.
pub async fn run_db_writer(db: DbPool, mut rx: mpsc::Receiver<DbCommand>) {
    tracing::info!("db writer task started");

    while let Some(cmd) = rx.recv().await {
        let result = execute_command(&db, cmd);
        if let Err(e) = result {
            tracing::error!("db write error: {e}");
        }
    }

    tracing::info!("db writer task shutting down");
}

fn execute_command(db: &DbPool, cmd: DbCommand) -> JournalResult<()> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock poisoned: {e}")))?;

    match cmd {
        DbCommand::InsertTrade(trade) | DbCommand::UpdateTrade(trade) => {
            upsert_trade(&conn, &trade)?;
        }
        DbCommand::SoftDeleteTrade { account_id, trade_id, deleted_at } => {
            conn.execute(
                "UPDATE trades SET is_deleted = 1, deleted_at = ?1 WHERE account_id = ?2 AND id = ?3",
                rusqlite::params![deleted_at.to_rfc3339(), account_id, trade_id],
            )?;
        }
        DbCommand::RestoreTrade { account_id, trade_id } => {
            conn.execute(
                "UPDATE trades SET is_deleted = 0, deleted_at = NULL WHERE account_id = ?1 AND id = ?2",
                rusqlite::params![account_id, trade_id],
            )?;
        }
        DbCommand::PurgeTrade { account_id, trade_id } => {
            conn.execute(
                "DELETE FROM trades WHERE account_id = ?1 AND id = ?2 AND is_deleted = 1",
                rusqlite::params![account_id, trade_id],
            )?;
        }
        DbCommand::PurgeExpiredTrades { account_id, cutoff } => {
            let purged = conn.execute(
                "DELETE FROM trades WHERE account_id = ?1 AND is_deleted = 1 AND deleted_at <= ?2",
                rusqlite::params![account_id, cutoff.to_rfc3339()],
            )?;
            if purged > 0 {
                tracing::info!(account = %account_id, purged, "purged expired trades");
            }
        }
        DbCommand::InsertAccount(account) | DbCommand::UpdateAccount(account) => {
            conn.execute(
                "INSERT OR REPLACE INTO accounts (id, user_id, name, initial_balance, account_type, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    account.id,
                    account.user_id,
                    account.name,
                    account.initial_balance,
                    account.account_type.as_str(),
                    account.created_at.to_rfc3339(),
                ],
            )?;
        }
        DbCommand::DeleteAccount { account_id } => {
            conn.execute("DELETE FROM trades WHERE account_id = ?1", rusqlite::params![account_id])?;
            conn.execute("DELETE FROM accounts WHERE id = ?1", rusqlite::params![account_id])?;
        }
        DbCommand::InsertSetup(setup) => {
            conn.execute(
                "INSERT OR REPLACE INTO setups (id, user_id, name, description, color, rule_groups)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    setup.id,
                    setup.user_id,
                    setup.name,
                    setup.description,
                    setup.color,
                    setup.rule_groups.to_string(),
                ],
            )?;
        }
        DbCommand::DeleteSetup { setup_id } => {
            // Trades referencing the setup fall back to "no setup".
            conn.execute(
                "UPDATE trades SET setup_id = NULL, selected_rules = '[]' WHERE setup_id = ?1",
                rusqlite::params![setup_id],
            )?;
            conn.execute("DELETE FROM setups WHERE id = ?1", rusqlite::params![setup_id])?;
        }
        DbCommand::InsertTag(tag) => {
            conn.execute(
                "INSERT OR REPLACE INTO tags (id, user_id, name) VALUES (?1, ?2, ?3)",
                rusqlite::params![tag.id, tag.user_id, tag.name],
            )?;
        }
        DbCommand::DeleteTag { tag_id } => {
            conn.execute("DELETE FROM trade_tags WHERE tag_id = ?1", rusqlite::params![tag_id])?;
            conn.execute("DELETE FROM note_tags WHERE tag_id = ?1", rusqlite::params![tag_id])?;
            conn.execute("DELETE FROM tags WHERE id = ?1", rusqlite::params![tag_id])?;
        }
        DbCommand::AttachTag { trade_id, tag_id } => {
            conn.execute(
                "INSERT OR IGNORE INTO trade_tags (trade_id, tag_id) VALUES (?1, ?2)",
                rusqlite::params![trade_id, tag_id],
            )?;
        }
        DbCommand::DeleteNote { note_id } => {
            conn.execute("DELETE FROM note_tags WHERE note_id = ?1", rusqlite::params![note_id])?;
            conn.execute("DELETE FROM notes WHERE id = ?1", rusqlite::params![note_id])?;
        }
        DbCommand::InsertNote(note) => {
            conn.execute(
                "INSERT OR REPLACE INTO notes (id, user_id, trade_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    note.id,
                    note.user_id,
                    note.trade_id,
                    note.content.to_string(),
                    note.created_at.to_rfc3339(),
                ],
            )?;
        }
    }
    Ok(())
}

fn upsert_trade(conn: &Connection, t: &Trade) -> JournalResult<()> {
    let rules = serde_json::to_string(&t.selected_rules).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT OR REPLACE INTO trades (
            id, account_id, user_id, symbol, direction, volume, entry_price, exit_price, sl,
            commission, swap, net_pnl, entry_time, exit_time, pip_size, pip_value_per_lot,
            setup_id, selected_rules, image_url, notes, risk_amount, duration_min, session,
            risk_to_reward, percent_risk, percent_pnl, status, is_deleted, deleted_at, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                   ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        rusqlite::params![
            t.id,
            t.account_id,
            t.user_id,
            t.symbol,
            t.direction.map(|d| d.as_str()),
            t.volume,
            t.entry_price,
            t.exit_price,
            t.sl,
            t.commission,
            t.swap,
            t.net_pnl,
            t.entry_time.map(|dt| dt.to_rfc3339()),
            t.exit_time.map(|dt| dt.to_rfc3339()),
            t.pip_size,
            t.pip_value_per_lot,
            t.setup_id,
            rules,
            t.image_url,
            t.notes.as_ref().map(|n| n.to_string()),
            t.risk_amount,
            t.duration_min,
            t.session.map(|s| s.as_str()),
            t.risk_to_reward,
            t.percent_risk,
            t.percent_pnl,
            t.status.map(|s| s.as_str()),
            t.is_deleted as i64,
            t.deleted_at.map(|dt| dt.to_rfc3339()),
            t.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ── Query helpers (for server REST reads -- these DO lock, but only from cold path) ──

const SELECT_TRADE: &str = "SELECT id, account_id, user_id, symbol, direction, volume, entry_price, exit_price, sl, \
    commission, swap, net_pnl, entry_time, exit_time, pip_size, pip_value_per_lot, \
    setup_id, selected_rules, image_url, notes, risk_amount, duration_min, session, \
    risk_to_reward, percent_risk, percent_pnl, status, is_deleted, deleted_at, created_at FROM trades";

fn parse_rfc3339(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| {
        DateTime::parse_from_rfc3339(&v)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}

fn trade_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trade> {
    Ok(Trade {
        id: row.get(0)?,
        account_id: row.get(1)?,
        user_id: row.get(2)?,
        symbol: row.get(3)?,
        direction: row.get::<_, Option<String>>(4)?.and_then(|s| s.parse().ok()),
        volume: row.get(5)?,
        entry_price: row.get(6)?,
        exit_price: row.get(7)?,
        sl: row.get(8)?,
        commission: row.get(9)?,
        swap: row.get(10)?,
        net_pnl: row.get(11)?,
        entry_time: parse_rfc3339(row.get(12)?),
        exit_time: parse_rfc3339(row.get(13)?),
        pip_size: row.get(14)?,
        pip_value_per_lot: row.get(15)?,
        setup_id: row.get(16)?,
        selected_rules: row
            .get::<_, Option<String>>(17)?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        image_url: row.get(18)?,
        notes: row
            .get::<_, Option<String>>(19)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        risk_amount: row.get(20)?,
        duration_min: row.get(21)?,
        session: row.get::<_, Option<String>>(22)?.and_then(|s| s.parse().ok()),
        risk_to_reward: row.get(23)?,
        percent_risk: row.get(24)?,
        percent_pnl: row.get(25)?,
        status: row.get::<_, Option<String>>(26)?.and_then(|s| s.parse().ok()),
        is_deleted: row.get::<_, i64>(27)? != 0,
        deleted_at: parse_rfc3339(row.get(28)?),
        created_at: parse_rfc3339(row.get(29)?).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    })
}

/// Active trades of one account, newest entry first.
pub fn list_trades(db: &DbPool, account_id: &str) -> JournalResult<Vec<Trade>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let sql = format!("{SELECT_TRADE} WHERE account_id = ?1 AND is_deleted = 0 ORDER BY entry_time DESC");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![account_id], trade_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Recycle bin: soft-deleted trades still inside the retention window.
pub fn list_deleted_trades(
    db: &DbPool,
    account_id: &str,
    now: DateTime<Utc>,
) -> JournalResult<Vec<Trade>> {
    let cutoff = (now - Duration::days(RECYCLE_BIN_DAYS)).to_rfc3339();
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let sql = format!(
        "{SELECT_TRADE} WHERE account_id = ?1 AND is_deleted = 1 AND deleted_at > ?2 ORDER BY deleted_at DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params![account_id, cutoff], trade_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_trade(db: &DbPool, account_id: &str, trade_id: &str) -> JournalResult<Option<Trade>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let sql = format!("{SELECT_TRADE} WHERE account_id = ?1 AND id = ?2");
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query_map(rusqlite::params![account_id, trade_id], trade_from_row)?;
    Ok(rows.next().transpose()?)
}

fn account_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        initial_balance: row.get(3)?,
        account_type: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(crate::state::AccountType::Demo),
        created_at: parse_rfc3339(row.get(5)?).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    })
}

pub fn list_accounts(db: &DbPool, user_id: &str) -> JournalResult<Vec<Account>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, name, initial_balance, account_type, created_at FROM accounts WHERE user_id = ?1 ORDER BY created_at",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], account_from_row)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn get_account(db: &DbPool, account_id: &str) -> JournalResult<Option<Account>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, name, initial_balance, account_type, created_at FROM accounts WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(rusqlite::params![account_id], account_from_row)?;
    Ok(rows.next().transpose()?)
}

pub fn get_symbol(db: &DbPool, symbol_id: &str) -> JournalResult<Option<SymbolInfo>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, pip_size, pip_value_per_lot, contract_size FROM symbols WHERE id = ?1",
    )?;
    let mut rows = stmt.query_map(rusqlite::params![symbol_id], |row| {
        Ok(SymbolInfo {
            id: row.get(0)?,
            pip_size: row.get(1)?,
            pip_value_per_lot: row.get(2)?,
            contract_size: row.get(3)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}

pub fn list_symbols(db: &DbPool) -> JournalResult<Vec<SymbolInfo>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, pip_size, pip_value_per_lot, contract_size FROM symbols ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(SymbolInfo {
            id: row.get(0)?,
            pip_size: row.get(1)?,
            pip_value_per_lot: row.get(2)?,
            contract_size: row.get(3)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_setups(db: &DbPool, user_id: &str) -> JournalResult<Vec<Setup>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, name, description, color, rule_groups FROM setups WHERE user_id = ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok(Setup {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            color: row.get(4)?,
            rule_groups: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Array(vec![])),
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_tags(db: &DbPool, user_id: &str) -> JournalResult<Vec<Tag>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt =
        conn.prepare("SELECT id, user_id, name FROM tags WHERE user_id = ?1 ORDER BY name")?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok(Tag {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_notes(db: &DbPool, user_id: &str) -> JournalResult<Vec<Note>> {
    let conn = db.lock().map_err(|e| JournalError::Database(format!("lock: {e}")))?;
    let mut stmt = conn.prepare(
        "SELECT id, user_id, trade_id, content, created_at FROM notes WHERE user_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map(rusqlite::params![user_id], |row| {
        Ok(Note {
            id: row.get(0)?,
            user_id: row.get(1)?,
            trade_id: row.get(2)?,
            content: row
                .get::<_, Option<String>>(3)?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            created_at: parse_rfc3339(row.get(4)?).unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
        })
    })?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NumberField, RawTrade};

    fn test_pool() -> DbPool {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(include_str!("../migrations/001_init.sql"))
            .expect("apply schema");
        seed_symbols(&conn).expect("seed symbols");
        Arc::new(Mutex::new(conn))
    }

    fn sample_trade(id: &str, now: DateTime<Utc>) -> Trade {
        let raw = RawTrade {
            symbol: Some("EURUSD".to_string()),
            volume: Some(NumberField::Num(1.0)),
            entry_price: Some(NumberField::Num(1.1000)),
            sl: Some(NumberField::Num(1.0950)),
            net_pnl: Some(NumberField::Num(100.0)),
            pip_size: Some(NumberField::Num(0.0001)),
            pip_value_per_lot: Some(NumberField::Num(10.0)),
            ..RawTrade::default()
        };
        Trade::from_raw(
            id.to_string(),
            "acct".to_string(),
            "user".to_string(),
            &raw,
            100_000.0,
            now,
        )
    }

    #[test]
    fn test_symbol_defaults_seeded() {
        let db = test_pool();
        let eurusd = get_symbol(&db, "EURUSD").expect("query").expect("seeded");
        assert_eq!(eurusd.pip_size, 0.0001);
        assert_eq!(eurusd.pip_value_per_lot, 10.0);
        assert_eq!(eurusd.contract_size, 100_000.0);
        assert_eq!(list_symbols(&db).expect("query").len(), 4);
    }

    #[test]
    fn test_seed_is_idempotent() {
        let db = test_pool();
        {
            let conn = db.lock().expect("lock");
            seed_symbols(&conn).expect("second seed is a no-op");
        }
        assert_eq!(list_symbols(&db).expect("query").len(), 4);
    }

    #[test]
    fn test_trade_round_trip() {
        let db = test_pool();
        let now = Utc::now();
        let trade = sample_trade("t1", now);
        execute_command(&db, DbCommand::InsertTrade(Box::new(trade.clone()))).expect("insert");

        let listed = list_trades(&db, "acct").expect("list");
        assert_eq!(listed.len(), 1);
        let stored = &listed[0];
        assert_eq!(stored.id, "t1");
        assert_eq!(stored.risk_amount, Some(500.0));
        assert_eq!(stored.risk_to_reward, Some(0.20));
        assert_eq!(stored.status, trade.status);
    }

    #[test]
    fn test_soft_delete_restore_cycle() {
        let db = test_pool();
        let now = Utc::now();
        let trade = sample_trade("t1", now);
        execute_command(&db, DbCommand::InsertTrade(Box::new(trade))).expect("insert");

        execute_command(
            &db,
            DbCommand::SoftDeleteTrade {
                account_id: "acct".to_string(),
                trade_id: "t1".to_string(),
                deleted_at: now,
            },
        )
        .expect("soft delete");

        assert!(list_trades(&db, "acct").expect("list").is_empty());
        let bin = list_deleted_trades(&db, "acct", now).expect("bin");
        assert_eq!(bin.len(), 1);
        assert!(bin[0].is_deleted);

        execute_command(
            &db,
            DbCommand::RestoreTrade {
                account_id: "acct".to_string(),
                trade_id: "t1".to_string(),
            },
        )
        .expect("restore");

        assert_eq!(list_trades(&db, "acct").expect("list").len(), 1);
        assert!(list_deleted_trades(&db, "acct", now).expect("bin").is_empty());
    }

    #[test]
    fn test_recycle_bin_window_and_purge() {
        let db = test_pool();
        let now = Utc::now();
        for (id, age_days) in [("fresh", 1), ("stale", 8)] {
            let trade = sample_trade(id, now);
            execute_command(&db, DbCommand::InsertTrade(Box::new(trade))).expect("insert");
            execute_command(
                &db,
                DbCommand::SoftDeleteTrade {
                    account_id: "acct".to_string(),
                    trade_id: id.to_string(),
                    deleted_at: now - Duration::days(age_days),
                },
            )
            .expect("soft delete");
        }

        // The window hides the stale trade from the bin view.
        let bin = list_deleted_trades(&db, "acct", now).expect("bin");
        assert_eq!(bin.len(), 1);
        assert_eq!(bin[0].id, "fresh");

        // The sweep removes only what aged out.
        execute_command(
            &db,
            DbCommand::PurgeExpiredTrades {
                account_id: "acct".to_string(),
                cutoff: now - Duration::days(RECYCLE_BIN_DAYS),
            },
        )
        .expect("purge");

        assert!(get_trade(&db, "acct", "stale").expect("query").is_none());
        assert!(get_trade(&db, "acct", "fresh").expect("query").is_some());
    }

    #[test]
    fn test_tag_delete_cleans_references() {
        let db = test_pool();
        let tag = Tag {
            id: "tag1".to_string(),
            user_id: "user".to_string(),
            name: "breakout".to_string(),
        };
        execute_command(&db, DbCommand::InsertTag(tag)).expect("insert tag");
        execute_command(
            &db,
            DbCommand::AttachTag {
                trade_id: "t1".to_string(),
                tag_id: "tag1".to_string(),
            },
        )
        .expect("attach");

        execute_command(&db, DbCommand::DeleteTag { tag_id: "tag1".to_string() }).expect("delete");

        assert!(list_tags(&db, "user").expect("list").is_empty());
        let conn = db.lock().expect("lock");
        let refs: i64 = conn
            .query_row("SELECT COUNT(*) FROM trade_tags", [], |row| row.get(0))
            .expect("count");
        assert_eq!(refs, 0);
    }
}

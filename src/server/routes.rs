use crate::calc::{merge, stats};
use crate::db;
use crate::import;
use crate::state::{
    Account, AccountType, AppState, DbCommand, Note, NumberField, RawTrade, Setup, Tag, Trade,
    WsMessage,
};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::{Duration, Utc};
use portable_atomic::Ordering;
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(serde::Deserialize)]
pub struct UserQuery {
    pub user: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountBody {
    pub user_id: String,
    pub name: String,
    pub initial_balance: f64,
    pub account_type: AccountType,
}

#[derive(Default, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateAccountBody {
    pub name: Option<String>,
    pub initial_balance: Option<f64>,
    pub account_type: Option<AccountType>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTradeBody {
    pub user_id: String,
    #[serde(flatten)]
    pub trade: RawTrade,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeBody {
    pub trade_ids: Vec<String>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSetupBody {
    pub user_id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    #[serde(default)]
    pub rule_groups: Option<serde_json::Value>,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTagBody {
    pub user_id: String,
    pub name: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachTagBody {
    pub trade_id: String,
    pub tag_id: String,
}

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNoteBody {
    pub user_id: String,
    pub trade_id: Option<String>,
    pub content: serde_json::Value,
}

/// Cached pip metadata travels on the trade record; fill it from the
/// catalog when the client didn't send it.
fn attach_symbol_metadata(state: &AppState, raw: &mut RawTrade) {
    if raw.pip_size.is_some() && raw.pip_value_per_lot.is_some() {
        return;
    }
    let Some(symbol) = raw.symbol.as_deref() else {
        return;
    };
    if let Ok(Some(info)) = db::get_symbol(&state.db, symbol) {
        if raw.pip_size.is_none() {
            raw.pip_size = Some(NumberField::Num(info.pip_size));
        }
        if raw.pip_value_per_lot.is_none() {
            raw.pip_value_per_lot = Some(NumberField::Num(info.pip_value_per_lot));
        }
    }
}

// ── Accounts ──

/// GET /api/accounts?user= -- accounts of one user
pub async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Json<serde_json::Value> {
    match db::list_accounts(&state.db, &params.user) {
        Ok(accounts) => Json(serde_json::json!({ "accounts": accounts })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// POST /api/accounts
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateAccountBody>,
) -> Json<serde_json::Value> {
    let account = Account {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: body.user_id,
        name: body.name,
        initial_balance: body.initial_balance,
        account_type: body.account_type,
        created_at: Utc::now(),
    };

    let _ = state.db_tx.send(DbCommand::InsertAccount(account.clone())).await;
    state.broadcast(WsMessage::AccountUpdated { account: account.clone() });
    Json(serde_json::json!({ "account": account }))
}

/// PUT /api/accounts/{id} -- a balance change re-derives every active
/// trade of the account through the shared calculator.
pub async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(body): Json<UpdateAccountBody>,
) -> Json<serde_json::Value> {
    let mut account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let balance_changed = body
        .initial_balance
        .map(|b| b != account.initial_balance)
        .unwrap_or(false);

    if let Some(name) = body.name {
        account.name = name;
    }
    if let Some(balance) = body.initial_balance {
        account.initial_balance = balance;
    }
    if let Some(account_type) = body.account_type {
        account.account_type = account_type;
    }

    let _ = state.db_tx.send(DbCommand::UpdateAccount(account.clone())).await;

    if balance_changed {
        match db::list_trades(&state.db, &account_id) {
            Ok(trades) => {
                let recomputed = trades.len() as u64;
                for mut trade in trades {
                    trade.recompute(account.initial_balance);
                    let _ = state.db_tx.send(DbCommand::UpdateTrade(Box::new(trade))).await;
                }
                state.counters.recomputes_run.fetch_add(recomputed, Ordering::Relaxed);
                tracing::info!(
                    account = %account_id,
                    trades = recomputed,
                    "re-derived trades after balance change"
                );
            }
            Err(e) => tracing::error!(account = %account_id, "recompute after balance change failed: {e}"),
        }
    }

    state.broadcast(WsMessage::AccountUpdated { account: account.clone() });
    Json(serde_json::json!({ "account": account }))
}

/// DELETE /api/accounts/{id} -- removes the account and its trades
pub async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::DeleteAccount { account_id: account_id.clone() })
        .await;
    Json(serde_json::json!({ "deleted": account_id }))
}

// ── Trades ──

/// GET /api/accounts/{id}/trades -- active trades, newest first
pub async fn list_trades(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<serde_json::Value> {
    match db::list_trades(&state.db, &account_id) {
        Ok(trades) => Json(serde_json::json!({ "trades": trades })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// POST /api/accounts/{id}/trades -- derive and persist a new trade
pub async fn create_trade(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(body): Json<CreateTradeBody>,
) -> Json<serde_json::Value> {
    let account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let mut raw = body.trade;
    attach_symbol_metadata(&state, &mut raw);

    let trade = Trade::from_raw(
        uuid::Uuid::new_v4().to_string(),
        account_id,
        body.user_id,
        &raw,
        account.initial_balance,
        Utc::now(),
    );

    state.counters.trades_created.fetch_add(1, Ordering::Relaxed);
    state.counters.recomputes_run.fetch_add(1, Ordering::Relaxed);

    let _ = state.db_tx.send(DbCommand::InsertTrade(Box::new(trade.clone()))).await;
    state.broadcast(WsMessage::TradeCreated { trade: Box::new(trade.clone()) });
    Json(serde_json::json!({ "trade": trade }))
}

/// PUT /api/accounts/{id}/trades/{tid} -- replace the raw fields and
/// re-derive everything
pub async fn update_trade(
    State(state): State<Arc<AppState>>,
    Path((account_id, trade_id)): Path<(String, String)>,
    Json(mut raw): Json<RawTrade>,
) -> Json<serde_json::Value> {
    let existing = match db::get_trade(&state.db, &account_id, &trade_id) {
        Ok(Some(t)) => t,
        Ok(None) => return Json(serde_json::json!({ "error": "trade not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };
    let account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    attach_symbol_metadata(&state, &mut raw);

    let mut updated = Trade::from_raw(
        trade_id,
        account_id,
        existing.user_id.clone(),
        &raw,
        account.initial_balance,
        existing.created_at,
    );
    updated.is_deleted = existing.is_deleted;
    updated.deleted_at = existing.deleted_at;

    state.counters.trades_updated.fetch_add(1, Ordering::Relaxed);
    state.counters.recomputes_run.fetch_add(1, Ordering::Relaxed);

    let _ = state.db_tx.send(DbCommand::UpdateTrade(Box::new(updated.clone()))).await;
    state.broadcast(WsMessage::TradeUpdated { trade: Box::new(updated.clone()) });
    Json(serde_json::json!({ "trade": updated }))
}

/// DELETE /api/accounts/{id}/trades/{tid} -- soft delete into the bin
pub async fn delete_trade(
    State(state): State<Arc<AppState>>,
    Path((account_id, trade_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let deleted_at = Utc::now();
    let _ = state
        .db_tx
        .send(DbCommand::SoftDeleteTrade {
            account_id: account_id.clone(),
            trade_id: trade_id.clone(),
            deleted_at,
        })
        .await;

    state.counters.trades_deleted.fetch_add(1, Ordering::Relaxed);
    state.broadcast(WsMessage::TradeDeleted {
        account_id,
        trade_id: trade_id.clone(),
        deleted_at: deleted_at.to_rfc3339(),
    });
    Json(serde_json::json!({ "deleted": trade_id, "deletedAt": deleted_at.to_rfc3339() }))
}

/// POST /api/accounts/{id}/trades/{tid}/restore -- back out of the bin,
/// re-derived against the current balance
pub async fn restore_trade(
    State(state): State<Arc<AppState>>,
    Path((account_id, trade_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let trade = match db::get_trade(&state.db, &account_id, &trade_id) {
        Ok(Some(t)) if t.is_deleted => t,
        Ok(Some(_)) => return Json(serde_json::json!({ "error": "trade is not deleted" })),
        Ok(None) => return Json(serde_json::json!({ "error": "trade not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };
    let account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let mut restored = trade;
    restored.is_deleted = false;
    restored.deleted_at = None;
    restored.recompute(account.initial_balance);

    state.counters.trades_restored.fetch_add(1, Ordering::Relaxed);
    state.counters.recomputes_run.fetch_add(1, Ordering::Relaxed);

    let _ = state.db_tx.send(DbCommand::UpdateTrade(Box::new(restored.clone()))).await;
    state.broadcast(WsMessage::TradeRestored {
        account_id,
        trade_id: restored.id.clone(),
    });
    Json(serde_json::json!({ "trade": restored }))
}

/// GET /api/accounts/{id}/bin -- recycle bin contents
pub async fn list_bin(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<serde_json::Value> {
    match db::list_deleted_trades(&state.db, &account_id, Utc::now()) {
        Ok(trades) => Json(serde_json::json!({ "trades": trades })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// DELETE /api/accounts/{id}/bin/{tid} -- permanent removal
pub async fn purge_trade(
    State(state): State<Arc<AppState>>,
    Path((account_id, trade_id)): Path<(String, String)>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::PurgeTrade {
            account_id,
            trade_id: trade_id.clone(),
        })
        .await;
    Json(serde_json::json!({ "purged": trade_id }))
}

/// POST /api/accounts/{id}/purge-expired -- drop everything past the
/// retention window
pub async fn purge_expired(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<serde_json::Value> {
    let cutoff = Utc::now() - Duration::days(db::RECYCLE_BIN_DAYS);
    let _ = state
        .db_tx
        .send(DbCommand::PurgeExpiredTrades {
            account_id,
            cutoff,
        })
        .await;
    Json(serde_json::json!({ "cutoff": cutoff.to_rfc3339() }))
}

/// POST /api/accounts/{id}/merge -- combine fills into one trade; the
/// source legs move to the bin
pub async fn merge_trades(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(body): Json<MergeBody>,
) -> Json<serde_json::Value> {
    if body.trade_ids.len() < 2 {
        return Json(serde_json::json!({ "error": "merge needs at least two trades" }));
    }

    let mut legs: SmallVec<[Trade; 4]> = SmallVec::new();
    for id in &body.trade_ids {
        match db::get_trade(&state.db, &account_id, id) {
            Ok(Some(t)) if !t.is_deleted => legs.push(t),
            Ok(Some(_)) => {
                return Json(serde_json::json!({ "error": format!("trade {id} is deleted") }))
            }
            Ok(None) => return Json(serde_json::json!({ "error": format!("trade {id} not found") })),
            Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
        }
    }

    let account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let Some(mut raw) = merge::merge_trades(&legs) else {
        return Json(serde_json::json!({ "error": "trades cannot be merged" }));
    };
    attach_symbol_metadata(&state, &mut raw);

    let now = Utc::now();
    let merged = Trade::from_raw(
        uuid::Uuid::new_v4().to_string(),
        account_id.clone(),
        legs[0].user_id.clone(),
        &raw,
        account.initial_balance,
        now,
    );

    let _ = state.db_tx.send(DbCommand::InsertTrade(Box::new(merged.clone()))).await;
    for leg in &legs {
        let _ = state
            .db_tx
            .send(DbCommand::SoftDeleteTrade {
                account_id: account_id.clone(),
                trade_id: leg.id.clone(),
                deleted_at: now,
            })
            .await;
    }

    state.counters.trades_created.fetch_add(1, Ordering::Relaxed);
    state.counters.trades_deleted.fetch_add(legs.len() as u64, Ordering::Relaxed);
    state.counters.recomputes_run.fetch_add(1, Ordering::Relaxed);

    let source_ids: Vec<String> = legs.iter().map(|t| t.id.clone()).collect();
    tracing::info!(
        account = %account_id,
        merged = %merged.id,
        legs = source_ids.len(),
        "merged trades"
    );

    state.broadcast(WsMessage::TradesMerged {
        account_id,
        merged: Box::new(merged.clone()),
        source_ids: source_ids.clone(),
    });
    Json(serde_json::json!({ "trade": merged, "sourceIds": source_ids }))
}

/// POST /api/accounts/{id}/import?user= -- CSV payload in the body;
/// malformed rows are discarded, the rest derive and persist
pub async fn import_trades(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(params): Query<UserQuery>,
    body: String,
) -> Json<serde_json::Value> {
    let account = match db::get_account(&state.db, &account_id) {
        Ok(Some(a)) => a,
        Ok(None) => return Json(serde_json::json!({ "error": "account not found" })),
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let outcome = match import::parse_trades_csv(&body) {
        Ok(o) => o,
        Err(e) => return Json(serde_json::json!({ "error": e.to_string() })),
    };

    let now = Utc::now();
    let mut imported = 0usize;
    for mut raw in outcome.rows {
        attach_symbol_metadata(&state, &mut raw);
        let trade = Trade::from_raw(
            uuid::Uuid::new_v4().to_string(),
            account_id.clone(),
            params.user.clone(),
            &raw,
            account.initial_balance,
            now,
        );
        if state.db_tx.send(DbCommand::InsertTrade(Box::new(trade))).await.is_err() {
            break;
        }
        imported += 1;
    }

    state.counters.rows_imported.fetch_add(imported as u64, Ordering::Relaxed);
    state.counters.rows_discarded.fetch_add(outcome.discarded as u64, Ordering::Relaxed);
    state.counters.recomputes_run.fetch_add(imported as u64, Ordering::Relaxed);

    tracing::info!(
        account = %account_id,
        imported,
        discarded = outcome.discarded,
        "csv import completed"
    );

    state.broadcast(WsMessage::ImportCompleted {
        account_id,
        imported,
        discarded: outcome.discarded,
    });
    Json(serde_json::json!({ "imported": imported, "discarded": outcome.discarded }))
}

/// GET /api/accounts/{id}/stats -- summary cards over active trades
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<serde_json::Value> {
    match db::list_trades(&state.db, &account_id) {
        Ok(trades) => Json(serde_json::json!({
            "totalTrades": trades.len(),
            "netPnl": stats::net_cumulative_pnl(&trades),
            "profitFactor": stats::profit_factor(&trades),
            "winPercentage": stats::win_percentage(&trades),
            "avgWinLossRatio": stats::avg_win_loss_ratio(&trades),
        })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

// ── Symbols, setups, tags, notes ──

/// GET /api/symbols
pub async fn list_symbols(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match db::list_symbols(&state.db) {
        Ok(symbols) => Json(serde_json::json!({ "symbols": symbols })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// GET /api/setups?user=
pub async fn list_setups(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Json<serde_json::Value> {
    match db::list_setups(&state.db, &params.user) {
        Ok(setups) => Json(serde_json::json!({ "setups": setups })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// POST /api/setups
pub async fn create_setup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSetupBody>,
) -> Json<serde_json::Value> {
    let setup = Setup {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: body.user_id,
        name: body.name,
        description: body.description,
        color: body.color,
        rule_groups: body.rule_groups.unwrap_or(serde_json::Value::Array(vec![])),
    };
    let _ = state.db_tx.send(DbCommand::InsertSetup(setup.clone())).await;
    Json(serde_json::json!({ "setup": setup }))
}

/// DELETE /api/setups/{id}
pub async fn delete_setup(
    State(state): State<Arc<AppState>>,
    Path(setup_id): Path<String>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::DeleteSetup { setup_id: setup_id.clone() })
        .await;
    Json(serde_json::json!({ "deleted": setup_id }))
}

/// GET /api/tags?user=
pub async fn list_tags(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Json<serde_json::Value> {
    match db::list_tags(&state.db, &params.user) {
        Ok(tags) => Json(serde_json::json!({ "tags": tags })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// POST /api/tags
pub async fn create_tag(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTagBody>,
) -> Json<serde_json::Value> {
    let tag = Tag {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: body.user_id,
        name: body.name,
    };
    let _ = state.db_tx.send(DbCommand::InsertTag(tag.clone())).await;
    Json(serde_json::json!({ "tag": tag }))
}

/// DELETE /api/tags/{id} -- removes the tag and its references
pub async fn delete_tag(
    State(state): State<Arc<AppState>>,
    Path(tag_id): Path<String>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::DeleteTag { tag_id: tag_id.clone() })
        .await;
    Json(serde_json::json!({ "deleted": tag_id }))
}

/// POST /api/tags/attach
pub async fn attach_tag(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AttachTagBody>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::AttachTag {
            trade_id: body.trade_id.clone(),
            tag_id: body.tag_id.clone(),
        })
        .await;
    Json(serde_json::json!({ "tradeId": body.trade_id, "tagId": body.tag_id }))
}

/// GET /api/notes?user=
pub async fn list_notes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UserQuery>,
) -> Json<serde_json::Value> {
    match db::list_notes(&state.db, &params.user) {
        Ok(notes) => Json(serde_json::json!({ "notes": notes })),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

/// POST /api/notes
pub async fn create_note(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateNoteBody>,
) -> Json<serde_json::Value> {
    let note = Note {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: body.user_id,
        trade_id: body.trade_id,
        content: body.content,
        created_at: Utc::now(),
    };
    let _ = state.db_tx.send(DbCommand::InsertNote(note.clone())).await;
    Json(serde_json::json!({ "note": note }))
}

/// DELETE /api/notes/{id}
pub async fn delete_note(
    State(state): State<Arc<AppState>>,
    Path(note_id): Path<String>,
) -> Json<serde_json::Value> {
    let _ = state
        .db_tx
        .send(DbCommand::DeleteNote { note_id: note_id.clone() })
        .await;
    Json(serde_json::json!({ "deleted": note_id }))
}

/// GET /api/counters -- performance counters (lock-free reads)
pub async fn get_counters(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    use portable_atomic::Ordering::Relaxed;
    Json(serde_json::json!({
        "trades_created": state.counters.trades_created.load(Relaxed),
        "trades_updated": state.counters.trades_updated.load(Relaxed),
        "trades_deleted": state.counters.trades_deleted.load(Relaxed),
        "trades_restored": state.counters.trades_restored.load(Relaxed),
        "recomputes_run": state.counters.recomputes_run.load(Relaxed),
        "rows_imported": state.counters.rows_imported.load(Relaxed),
        "rows_discarded": state.counters.rows_discarded.load(Relaxed),
        "ws_messages_sent": state.counters.ws_messages_sent.load(Relaxed),
    }))
}

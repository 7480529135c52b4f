//! Order log: the append-only audit trail of committed and skipped items.

use anyhow::Result;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::{NewOrderLog, OrderLog};
use crate::store::{self, PreferenceStore};

/// All log entries of one session, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHistory {
    pub session_id: String,
    pub created_at: i64,
    pub entries: Vec<OrderLog>,
}

pub async fn record_order_log(store: &PreferenceStore, entry: &NewOrderLog) -> Result<i64> {
    let mut w = store.begin_write().await?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO order_log
            (session_id, list_text, matched_grocery_item_id, proposed_product, final_product,
             was_corrected, added_to_cart, skipped, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(&entry.session_id)
    .bind(&entry.list_text)
    .bind(entry.matched_grocery_item_id)
    .bind(&entry.proposed_product)
    .bind(&entry.final_product)
    .bind(entry.was_corrected)
    .bind(entry.added_to_cart)
    .bind(entry.skipped)
    .bind(store::now_ts())
    .fetch_one(w.conn())
    .await?;
    w.commit().await?;
    Ok(id)
}

/// The most recent `limit` entries, grouped by session, newest session first.
pub async fn list_history(store: &PreferenceStore, limit: i64) -> Result<Vec<SessionHistory>> {
    let rows = sqlx::query(
        r#"
        SELECT id, session_id, list_text, matched_grocery_item_id, proposed_product,
               final_product, was_corrected, added_to_cart, skipped, created_at
        FROM order_log
        ORDER BY created_at DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(limit)
    .fetch_all(store.pool())
    .await?;

    let mut sessions: Vec<SessionHistory> = Vec::new();
    for row in &rows {
        let entry = log_from_row(row);
        match sessions.iter_mut().find(|s| s.session_id == entry.session_id) {
            Some(session) => {
                session.created_at = session.created_at.min(entry.created_at);
                session.entries.push(entry);
            }
            None => sessions.push(SessionHistory {
                session_id: entry.session_id.clone(),
                created_at: entry.created_at,
                entries: vec![entry],
            }),
        }
    }
    for session in &mut sessions {
        session.entries.reverse();
    }
    Ok(sessions)
}

pub async fn delete_session_history(store: &PreferenceStore, session_id: &str) -> Result<u64> {
    let mut w = store.begin_write().await?;
    let result = sqlx::query("DELETE FROM order_log WHERE session_id = ?")
        .bind(session_id)
        .execute(w.conn())
        .await?;
    w.commit().await?;
    Ok(result.rows_affected())
}

pub async fn clear_history(store: &PreferenceStore) -> Result<u64> {
    let mut w = store.begin_write().await?;
    let result = sqlx::query("DELETE FROM order_log").execute(w.conn()).await?;
    w.commit().await?;
    Ok(result.rows_affected())
}

fn log_from_row(row: &SqliteRow) -> OrderLog {
    OrderLog {
        id: row.get("id"),
        session_id: row.get("session_id"),
        list_text: row.get("list_text"),
        matched_grocery_item_id: row.get("matched_grocery_item_id"),
        proposed_product: row.get("proposed_product"),
        final_product: row.get("final_product"),
        was_corrected: row.get("was_corrected"),
        added_to_cart: row.get("added_to_cart"),
        skipped: row.get("skipped"),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::create_grocery_item;
    use crate::store::test_support::temp_store;

    fn entry(session: &str, text: &str) -> NewOrderLog {
        NewOrderLog {
            session_id: session.to_string(),
            list_text: text.to_string(),
            final_product: Some(format!("{} product", text)),
            added_to_cart: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_history_grouped_per_session() {
        let (_tmp, store) = temp_store().await;
        record_order_log(&store, &entry("s1", "milk")).await.unwrap();
        record_order_log(&store, &entry("s1", "eggs")).await.unwrap();
        record_order_log(&store, &entry("s2", "rice")).await.unwrap();

        let history = list_history(&store, 50).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].session_id, "s2");
        let texts: Vec<&str> = history[1]
            .entries
            .iter()
            .map(|e| e.list_text.as_str())
            .collect();
        assert_eq!(texts, vec!["milk", "eggs"]);
        assert!(history[1].entries[0].added_to_cart);
        assert!(!history[1].entries[0].skipped);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (_tmp, store) = temp_store().await;
        record_order_log(&store, &entry("s1", "milk")).await.unwrap();
        record_order_log(&store, &entry("s2", "rice")).await.unwrap();
        record_order_log(&store, &entry("s2", "beans")).await.unwrap();

        assert_eq!(delete_session_history(&store, "s2").await.unwrap(), 2);
        assert_eq!(list_history(&store, 50).await.unwrap().len(), 1);
        assert_eq!(clear_history(&store).await.unwrap(), 1);
        assert!(list_history(&store, 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_item_keeps_log() {
        let (_tmp, store) = temp_store().await;
        let item = create_grocery_item(&store, "milk").await.unwrap();
        let mut e = entry("s1", "milk");
        e.matched_grocery_item_id = Some(item.id);
        record_order_log(&store, &e).await.unwrap();

        store.delete_grocery_item(item.id).await.unwrap();
        let history = list_history(&store, 50).await.unwrap();
        assert_eq!(history[0].entries[0].matched_grocery_item_id, None);
    }
}

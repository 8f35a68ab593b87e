//! Credit Ledger
//! Mission: balance tracking, append-only audit trail, and idempotent
//! webhook intake for credit purchases. Every mutation runs inside a single
//! transaction on the shared connection so concurrent consumers never
//! double-spend.

use anyhow::{anyhow, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

const FREE_CREDITS: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    GrantFree,
    Purchase,
    Consume,
    Refund,
    AdminAdjust,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditSource {
    Balance,
    Free,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CreditsAvailability {
    pub available: bool,
    pub balance: i64,
    pub free_available: bool,
    pub source: CreditSource,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConsumeOutcome {
    pub success: bool,
    pub new_balance: i64,
    pub source: Option<CreditSource>,
    pub error: Option<&'static str>,
}

/// `{packId, credits, priceCents, currency, displayName, badge, sortOrder}`.
/// Sole trusted source of `credits`/`priceCents` — webhook handlers never
/// read these from client- or provider-supplied metadata.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CreditPack {
    pub pack_id: &'static str,
    pub credits: i64,
    pub price_cents: i64,
    pub currency: &'static str,
    pub display_name: &'static str,
    pub badge: Option<&'static str>,
    pub sort_order: i32,
}

pub const CREDIT_PACKS: &[CreditPack] = &[
    CreditPack {
        pack_id: "pack_1",
        credits: 1,
        price_cents: 99,
        currency: "EUR",
        display_name: "1 credit",
        badge: None,
        sort_order: 0,
    },
    CreditPack {
        pack_id: "pack_5",
        credits: 5,
        price_cents: 399,
        currency: "EUR",
        display_name: "5 credits",
        badge: None,
        sort_order: 1,
    },
    CreditPack {
        pack_id: "pack_10",
        credits: 10,
        price_cents: 699,
        currency: "EUR",
        display_name: "10 credits",
        badge: Some("popular"),
        sort_order: 2,
    },
    CreditPack {
        pack_id: "pack_30",
        credits: 30,
        price_cents: 1799,
        currency: "EUR",
        display_name: "30 credits",
        badge: Some("best value"),
        sort_order: 3,
    },
    CreditPack {
        pack_id: "pack_100",
        credits: 100,
        price_cents: 4999,
        currency: "EUR",
        display_name: "100 credits",
        badge: None,
        sort_order: 4,
    },
];

pub fn find_pack(pack_id: &str) -> Option<&'static CreditPack> {
    CREDIT_PACKS.iter().find(|p| p.pack_id == pack_id)
}

pub struct CreditLedger {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl CreditLedger {
    pub fn new(conn: Arc<Mutex<rusqlite::Connection>>) -> Self {
        Self { conn }
    }

    pub async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_credits (
                user TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0,
                free_credits_granted INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS credit_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                type TEXT NOT NULL,
                delta INTEGER NOT NULL,
                balance_after INTEGER NOT NULL,
                reason TEXT,
                related_object TEXT,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user TEXT NOT NULL,
                provider TEXT NOT NULL,
                external_session_id TEXT,
                external_payment_id TEXT UNIQUE,
                pack_id TEXT NOT NULL,
                credits_amount INTEGER NOT NULL,
                amount_cents INTEGER NOT NULL,
                currency TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                paid_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS processed_events (
                provider TEXT NOT NULL,
                event_id TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (provider, event_id)
            )",
            [],
        )?;
        Ok(())
    }

    /// Returns whether the free credit was granted on this call (false if
    /// it was already granted previously).
    pub async fn grant_free_if_missing(&self, user: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        ensure_user_row(&tx, user, &now)?;
        let granted: i64 = tx.query_row(
            "SELECT free_credits_granted FROM user_credits WHERE user = ?1",
            params![user],
            |r| r.get(0),
        )?;
        if granted != 0 {
            tx.commit()?;
            return Ok(false);
        }

        tx.execute(
            "UPDATE user_credits SET free_credits_granted = 1, balance = balance + ?2, updated_at = ?3 WHERE user = ?1",
            params![user, FREE_CREDITS, now],
        )?;
        let balance_after: i64 =
            tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
        append_ledger_row(&tx, user, LedgerEntryType::GrantFree, FREE_CREDITS, balance_after, Some("free credit grant"), None, &now)?;
        tx.commit()?;
        Ok(true)
    }

    pub async fn has_credits_available(&self, user: &str) -> Result<CreditsAvailability> {
        let conn = self.conn.lock().await;
        let row: Option<(i64, i64)> = conn
            .query_row(
                "SELECT balance, free_credits_granted FROM user_credits WHERE user = ?1",
                params![user],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(CreditsAvailability {
                available: true,
                balance: 0,
                free_available: true,
                source: CreditSource::Free,
            }),
            Some((balance, granted)) => {
                if balance > 0 {
                    Ok(CreditsAvailability {
                        available: true,
                        balance,
                        free_available: granted == 0,
                        source: CreditSource::Balance,
                    })
                } else if granted == 0 {
                    Ok(CreditsAvailability {
                        available: true,
                        balance,
                        free_available: true,
                        source: CreditSource::Free,
                    })
                } else {
                    Ok(CreditsAvailability {
                        available: false,
                        balance,
                        free_available: false,
                        source: CreditSource::None,
                    })
                }
            }
        }
    }

    /// The four-branch consume logic from the ledger's operating contract.
    pub async fn consume_credit(&self, user: &str, comparison_id: &str) -> Result<ConsumeOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT balance, free_credits_granted FROM user_credits WHERE user = ?1",
                params![user],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;

        let outcome = match row {
            None => {
                // Branch 1: no row at all, free not used.
                tx.execute(
                    "INSERT INTO user_credits (user, balance, free_credits_granted, updated_at) VALUES (?1, 0, 1, ?2)",
                    params![user, now],
                )?;
                append_ledger_row(&tx, user, LedgerEntryType::GrantFree, FREE_CREDITS, FREE_CREDITS, Some("free credit grant"), None, &now)?;
                let new_balance = FREE_CREDITS - 1;
                tx.execute("UPDATE user_credits SET balance = ?2, updated_at = ?3 WHERE user = ?1", params![user, new_balance, now])?;
                append_ledger_row(&tx, user, LedgerEntryType::Consume, -1, new_balance, Some("comparison"), Some(comparison_id), &now)?;
                ConsumeOutcome {
                    success: true,
                    new_balance,
                    source: Some(CreditSource::Free),
                    error: None,
                }
            }
            Some((0, 0)) => {
                // Branch 2: row exists with zero balance, free not used — net balance stays 0.
                tx.execute(
                    "UPDATE user_credits SET free_credits_granted = 1, updated_at = ?2 WHERE user = ?1",
                    params![user, now],
                )?;
                append_ledger_row(&tx, user, LedgerEntryType::GrantFree, FREE_CREDITS, FREE_CREDITS, Some("free credit grant"), None, &now)?;
                append_ledger_row(&tx, user, LedgerEntryType::Consume, -1, 0, Some("comparison"), Some(comparison_id), &now)?;
                ConsumeOutcome {
                    success: true,
                    new_balance: 0,
                    source: Some(CreditSource::Free),
                    error: None,
                }
            }
            Some((balance, _)) if balance > 0 => {
                // Branch 3: conditional decrement, lose the race to NO_CREDITS.
                let updated = tx.execute(
                    "UPDATE user_credits SET balance = balance - 1, updated_at = ?2 WHERE user = ?1 AND balance > 0",
                    params![user, now],
                )?;
                if updated == 0 {
                    ConsumeOutcome {
                        success: false,
                        new_balance: balance,
                        source: None,
                        error: Some("NO_CREDITS"),
                    }
                } else {
                    let new_balance: i64 =
                        tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
                    append_ledger_row(&tx, user, LedgerEntryType::Consume, -1, new_balance, Some("comparison"), Some(comparison_id), &now)?;
                    ConsumeOutcome {
                        success: true,
                        new_balance,
                        source: Some(CreditSource::Balance),
                        error: None,
                    }
                }
            }
            Some((balance, _)) => {
                // Branch 4: balance is zero and free already used.
                ConsumeOutcome {
                    success: false,
                    new_balance: balance,
                    source: None,
                    error: Some("NO_CREDITS"),
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// `(total purchased, total consumed)` lifetime, summed from the
    /// append-only ledger rather than kept as a running counter — the
    /// ledger rows are the source of truth.
    pub async fn usage_totals(&self, user: &str) -> Result<(i64, i64)> {
        let conn = self.conn.lock().await;
        let purchased: i64 = conn.query_row(
            "SELECT COALESCE(SUM(delta), 0) FROM credit_ledger WHERE user = ?1 AND type = 'purchase'",
            params![user],
            |r| r.get(0),
        )?;
        let consumed: i64 = conn.query_row(
            "SELECT COALESCE(SUM(-delta), 0) FROM credit_ledger WHERE user = ?1 AND type = 'consume'",
            params![user],
            |r| r.get(0),
        )?;
        Ok((purchased, consumed))
    }

    pub async fn add_purchased_credits(
        &self,
        user: &str,
        amount: i64,
        purchase_id: i64,
        external_payment_id: &str,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        ensure_user_row(&tx, user, &now)?;
        tx.execute(
            "UPDATE user_credits SET balance = balance + ?2, updated_at = ?3 WHERE user = ?1",
            params![user, amount, now],
        )?;
        let new_balance: i64 =
            tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
        append_ledger_row(
            &tx,
            user,
            LedgerEntryType::Purchase,
            amount,
            new_balance,
            Some("credit pack purchase"),
            Some(&format!("purchase:{purchase_id}:{external_payment_id}")),
            &now,
        )?;
        tx.commit()?;
        Ok(new_balance)
    }

    pub async fn refund_credits(&self, user: &str, amount: i64, purchase_id: i64, reason: &str) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        ensure_user_row(&tx, user, &now)?;
        let current: i64 =
            tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
        let new_balance = (current - amount).max(0);
        tx.execute(
            "UPDATE user_credits SET balance = ?2, updated_at = ?3 WHERE user = ?1",
            params![user, new_balance, now],
        )?;
        append_ledger_row(
            &tx,
            user,
            LedgerEntryType::Refund,
            -(current - new_balance),
            new_balance,
            Some(reason),
            Some(&format!("purchase:{purchase_id}")),
            &now,
        )?;
        tx.commit()?;
        Ok(new_balance)
    }

    pub async fn create_pending_purchase(
        &self,
        user: &str,
        provider: &str,
        pack_id: &str,
        external_session_id: Option<&str>,
    ) -> Result<i64> {
        let pack = find_pack(pack_id).ok_or_else(|| anyhow!("unknown credit pack: {pack_id}"))?;
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO purchases (user, provider, external_session_id, pack_id, credits_amount, amount_cents, currency, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![user, provider, external_session_id, pack_id, pack.credits, pack.price_cents, pack.currency, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Stamps a pending purchase with the provider's checkout session id at
    /// checkout-creation time — the only correlation key available before a
    /// webhook ever arrives. `externalPaymentId` (the real payment intent
    /// id) is only known once `checkout.session.completed` fires and is
    /// written by `handle_checkout_completed`.
    pub async fn attach_checkout_session(&self, purchase_id: i64, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE purchases SET external_session_id = ?2 WHERE id = ?1 AND status = 'pending'",
            params![purchase_id, session_id],
        )?;
        Ok(())
    }

    /// Idempotent Stripe-style checkout completion intake. `purchase_id` is
    /// resolved by the caller from the webhook payload's
    /// `session.metadata.purchase_id` — the purchase-creation-time
    /// correlation key we embedded ourselves, since `externalPaymentId`
    /// (the real payment intent) isn't known until this event fires.
    pub async fn handle_checkout_completed(
        &self,
        purchase_id: i64,
        external_session_id: &str,
        external_payment_id: &str,
        pack_id_from_metadata: &str,
        event_id: &str,
        provider: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let already_processed: Option<()> = tx
            .query_row(
                "SELECT 1 FROM processed_events WHERE provider = ?1 AND event_id = ?2",
                params![provider, event_id],
                |_| Ok(()),
            )
            .optional()?;
        if already_processed.is_some() {
            tx.commit()?;
            return Ok(());
        }

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT user, status FROM purchases WHERE id = ?1",
                params![purchase_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let (user, status) =
            existing.ok_or_else(|| anyhow!("no purchase found for id {purchase_id}"))?;

        if status == "paid" {
            tx.execute(
                "INSERT INTO processed_events (provider, event_id, processed_at) VALUES (?1, ?2, ?3)",
                params![provider, event_id, now],
            )?;
            tx.commit()?;
            return Ok(());
        }

        // Identical payment intents never grant credits twice, even if a
        // retried delivery somehow carries a different event id.
        let payment_already_claimed: Option<()> = tx
            .query_row(
                "SELECT 1 FROM purchases WHERE external_payment_id = ?1 AND status = 'paid' AND id != ?2",
                params![external_payment_id, purchase_id],
                |_| Ok(()),
            )
            .optional()?;
        if payment_already_claimed.is_some() {
            tx.execute(
                "INSERT INTO processed_events (provider, event_id, processed_at) VALUES (?1, ?2, ?3)",
                params![provider, event_id, now],
            )?;
            tx.commit()?;
            return Ok(());
        }

        let pack = find_pack(pack_id_from_metadata)
            .ok_or_else(|| anyhow!("unknown credit pack in webhook metadata: {pack_id_from_metadata}"))?;

        tx.execute(
            "UPDATE purchases SET status = 'paid', external_session_id = ?2, external_payment_id = ?3,
                paid_at = ?4, credits_amount = ?5, amount_cents = ?6 WHERE id = ?1",
            params![purchase_id, external_session_id, external_payment_id, now, pack.credits, pack.price_cents],
        )?;

        ensure_user_row(&tx, &user, &now)?;
        tx.execute(
            "UPDATE user_credits SET balance = balance + ?2, updated_at = ?3 WHERE user = ?1",
            params![user, pack.credits, now],
        )?;
        let new_balance: i64 =
            tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
        append_ledger_row(
            &tx,
            &user,
            LedgerEntryType::Purchase,
            pack.credits,
            new_balance,
            Some("credit pack purchase"),
            Some(&format!("purchase:{purchase_id}")),
            &now,
        )?;

        tx.execute(
            "INSERT INTO processed_events (provider, event_id, processed_at) VALUES (?1, ?2, ?3)",
            params![provider, event_id, now],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub async fn handle_charge_refunded(&self, external_payment_id: &str, reason: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let row: Option<(i64, String, String, i64)> = tx
            .query_row(
                "SELECT id, user, status, credits_amount FROM purchases WHERE external_payment_id = ?1",
                params![external_payment_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;

        let (purchase_id, user, status, credits_amount) = match row {
            Some(r) => r,
            None => return Err(anyhow!("no purchase found for external_payment_id {external_payment_id}")),
        };
        if status == "refunded" {
            tx.commit()?;
            return Ok(());
        }

        tx.execute("UPDATE purchases SET status = 'refunded' WHERE id = ?1", params![purchase_id])?;

        ensure_user_row(&tx, &user, &now)?;
        let current: i64 =
            tx.query_row("SELECT balance FROM user_credits WHERE user = ?1", params![user], |r| r.get(0))?;
        let new_balance = (current - credits_amount).max(0);
        tx.execute(
            "UPDATE user_credits SET balance = ?2, updated_at = ?3 WHERE user = ?1",
            params![user, new_balance, now],
        )?;
        append_ledger_row(
            &tx,
            &user,
            LedgerEntryType::Refund,
            -(current - new_balance),
            new_balance,
            Some(reason),
            Some(&format!("purchase:{purchase_id}")),
            &now,
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn ensure_user_row(conn: &rusqlite::Connection, user: &str, now: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO user_credits (user, balance, free_credits_granted, updated_at)
         VALUES (?1, 0, 0, ?2) ON CONFLICT(user) DO NOTHING",
        params![user, now],
    )?;
    Ok(())
}

fn append_ledger_row(
    conn: &rusqlite::Connection,
    user: &str,
    entry_type: LedgerEntryType,
    delta: i64,
    balance_after: i64,
    reason: Option<&str>,
    related_object: Option<&str>,
    now: &str,
) -> Result<()> {
    let type_str = serde_json::to_string(&entry_type)?;
    conn.execute(
        "INSERT INTO credit_ledger (user, type, delta, balance_after, reason, related_object, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![user, type_str.trim_matches('"'), delta, balance_after, reason, related_object, now],
    )?;
    Ok(())
}

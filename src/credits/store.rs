use sqlx::{Executor, Postgres, Transaction};

use super::models::{CreditAccount, LedgerEntry, NewLedgerEntry, PoolDeltas};

/// `reference_type` used by refund entries to point at the usage entry they
/// reverse. The partial unique index on refunds keys off this pair.
pub const REFUND_REFERENCE_TYPE: &str = "ledger_entry";

/// Creates the account row on first touch. The upsert keeps concurrent first
/// accesses from racing each other; the no-op DO UPDATE makes RETURNING yield
/// the surviving row either way.
pub async fn get_or_create_account<'c, E>(
    executor: E,
    user_id: i64,
) -> Result<CreditAccount, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, CreditAccount>(
        r#"
        INSERT INTO credit_accounts (user_id)
        VALUES ($1)
        ON CONFLICT (user_id) DO UPDATE
        SET user_id = credit_accounts.user_id
        RETURNING *
        "#,
    )
    .bind(user_id)
    .fetch_one(executor)
    .await
}

pub async fn get_account<'c, E>(
    executor: E,
    user_id: i64,
) -> Result<Option<CreditAccount>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, CreditAccount>("SELECT * FROM credit_accounts WHERE user_id = $1")
        .bind(user_id)
        .fetch_optional(executor)
        .await
}

/// Applies one balance change and writes its ledger entry on the caller's
/// transaction. The UPDATE only matches while the row still carries the
/// version the caller read and every pool stays non-negative; `Ok(None)`
/// means the guard failed and nothing was written.
pub async fn apply_mutation(
    tx: &mut Transaction<'_, Postgres>,
    account: &CreditAccount,
    deltas: PoolDeltas,
    entry: NewLedgerEntry<'_>,
    touch_last_used: bool,
) -> Result<Option<(CreditAccount, LedgerEntry)>, sqlx::Error> {
    let updated = sqlx::query_as::<_, CreditAccount>(
        r#"
        UPDATE credit_accounts
        SET
            bonus_credits = bonus_credits + $2,
            subscription_credits = subscription_credits + $3,
            purchased_credits = purchased_credits + $4,
            total_credits = total_credits + $5,
            version = version + 1,
            last_used_at = CASE WHEN $6 THEN NOW() ELSE last_used_at END,
            updated_at = NOW()
        WHERE user_id = $1
          AND version = $7
          AND bonus_credits + $2 >= 0
          AND subscription_credits + $3 >= 0
          AND purchased_credits + $4 >= 0
        RETURNING *
        "#,
    )
    .bind(account.user_id)
    .bind(deltas.bonus)
    .bind(deltas.subscription)
    .bind(deltas.purchased)
    .bind(deltas.total())
    .bind(touch_last_used)
    .bind(account.version)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(updated) = updated else {
        return Ok(None);
    };

    let recorded = sqlx::query_as::<_, LedgerEntry>(
        r#"
        INSERT INTO ledger_entries (
            user_id,
            entry_type,
            amount,
            pool,
            balance_before,
            balance_after,
            reference_type,
            reference_id,
            description
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(account.user_id)
    .bind(entry.entry_type)
    .bind(entry.amount)
    .bind(entry.pool)
    .bind(account.total_credits)
    .bind(updated.total_credits)
    .bind(entry.reference_type)
    .bind(entry.reference_id)
    .bind(entry.description)
    .fetch_one(&mut *tx)
    .await?;

    Ok(Some((updated, recorded)))
}

pub async fn get_entry<'c, E>(executor: E, entry_id: i64) -> Result<Option<LedgerEntry>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, LedgerEntry>("SELECT * FROM ledger_entries WHERE id = $1")
        .bind(entry_id)
        .fetch_optional(executor)
        .await
}

/// Looks up the refund that reverses `original_entry_id`, if one was written.
pub async fn find_refund_of<'c, E>(
    executor: E,
    original_entry_id: i64,
) -> Result<Option<LedgerEntry>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE entry_type = 'refund'
          AND reference_type = $1
          AND reference_id = $2
        "#,
    )
    .bind(REFUND_REFERENCE_TYPE)
    .bind(original_entry_id.to_string())
    .fetch_optional(executor)
    .await
}

pub async fn list_entries<'c, E>(
    executor: E,
    user_id: i64,
    limit: i64,
) -> Result<Vec<LedgerEntry>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT * FROM ledger_entries
        WHERE user_id = $1
        ORDER BY id DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(executor)
    .await
}

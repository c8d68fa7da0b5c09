//! Repository for the `accounts` and `api_tokens` balance ledgers.

use fleet_core::admission::LedgerRef;
use fleet_core::types::DbId;
use sqlx::{PgExecutor, PgPool};

use crate::models::account::{Account, ApiToken};

const ACCOUNT_COLUMNS: &str = "id, role_id, balance, weight_offset";
const TOKEN_COLUMNS: &str = "id, user_id, balance, weight_offset";

pub struct LedgerRepo;

impl LedgerRepo {
    pub async fn find_account(pool: &PgPool, id: DbId) -> Result<Option<Account>, sqlx::Error> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        sqlx::query_as::<_, Account>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_token(pool: &PgPool, id: DbId) -> Result<Option<ApiToken>, sqlx::Error> {
        let query = format!("SELECT {TOKEN_COLUMNS} FROM api_tokens WHERE id = $1");
        sqlx::query_as::<_, ApiToken>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Conditionally subtract `amount`. Returns `false` (and changes
    /// nothing) when the balance cannot cover it.
    pub async fn debit<'e, E: PgExecutor<'e>>(
        executor: E,
        ledger: LedgerRef,
        amount: f64,
    ) -> Result<bool, sqlx::Error> {
        let (table, id) = Self::table(ledger);
        let query = format!(
            "UPDATE {table} SET balance = balance - $2 WHERE id = $1 AND balance >= $2"
        );
        let result = sqlx::query(&query)
            .bind(id)
            .bind(amount)
            .execute(executor)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Current balance of a ledger row, if it exists.
    pub async fn balance<'e, E: PgExecutor<'e>>(
        executor: E,
        ledger: LedgerRef,
    ) -> Result<Option<f64>, sqlx::Error> {
        let (table, id) = Self::table(ledger);
        let query = format!("SELECT balance FROM {table} WHERE id = $1");
        sqlx::query_scalar::<_, f64>(&query)
            .bind(id)
            .fetch_optional(executor)
            .await
    }

    fn table(ledger: LedgerRef) -> (&'static str, DbId) {
        match ledger {
            LedgerRef::Account(id) => ("accounts", id),
            LedgerRef::Token(id) => ("api_tokens", id),
        }
    }
}

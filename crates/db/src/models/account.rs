//! Balance ledgers: user accounts and API tokens.

use fleet_core::admission::{LedgerRef, LedgerView};
use fleet_core::status::{Role, StatusId};
use fleet_core::types::DbId;
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `accounts` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Account {
    pub id: DbId,
    pub role_id: StatusId,
    /// `-1` means unlimited.
    pub balance: f64,
    pub weight_offset: f64,
}

impl Account {
    pub fn role(&self) -> Option<Role> {
        Role::from_id(self.role_id)
    }

    pub fn ledger_view(&self) -> LedgerView {
        LedgerView {
            ledger: LedgerRef::Account(self.id),
            balance: self.balance,
            weight_offset: self.weight_offset,
        }
    }
}

/// A row from the `api_tokens` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiToken {
    pub id: DbId,
    pub user_id: DbId,
    pub balance: f64,
    pub weight_offset: f64,
}

impl ApiToken {
    pub fn ledger_view(&self) -> LedgerView {
        LedgerView {
            ledger: LedgerRef::Token(self.id),
            balance: self.balance,
            weight_offset: self.weight_offset,
        }
    }
}

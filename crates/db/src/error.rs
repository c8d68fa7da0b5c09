use fleet_core::admission::LedgerRef;
use fleet_core::error::CoreError;
use fleet_core::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    /// The conditional debit matched no row.
    #[error("Insufficient balance on {ledger:?}: required {required}, available {available}")]
    InsufficientBalance {
        ledger: LedgerRef,
        required: f64,
        available: f64,
    },
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => CoreError::NotFound { entity, id },
            StoreError::InsufficientBalance {
                required,
                available,
                ..
            } => CoreError::InsufficientBalance {
                required,
                available,
            },
            other => CoreError::Internal(other.to_string()),
        }
    }
}

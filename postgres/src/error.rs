use parkflow_core::store::StoreError;

/// Map a sqlx error onto the storage error taxonomy.
///
/// Pool exhaustion, connection failures and server-side conditions that clear
/// on retry (see [`retryable_sqlstate`]) are transient; unique violations are
/// conflicts; decode failures mean the row does not fit the model.
pub(crate) fn map_sqlx(error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            StoreError::Unavailable(error.to_string())
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(db.message().to_string()),
        sqlx::Error::Database(db) if db.code().is_some_and(|code| retryable_sqlstate(&code)) => {
            StoreError::Unavailable(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(error.to_string())
        }
        _ => StoreError::Database(error.to_string()),
    }
}

/// Serialization failure, deadlock, connection exceptions (class `08`) and
/// operator intervention such as a server restart (class `57P`).
fn retryable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01") || code.starts_with("08") || code.starts_with("57P")
}

/// Name of the constraint a unique violation tripped, if any.
pub(crate) fn violated_constraint(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) if db.is_unique_violation() => db.constraint().map(str::to_string),
        _ => None,
    }
}

pub(crate) fn corrupt(column: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{column}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_sqlstates() {
        for code in ["40001", "40P01", "08006", "57P01"] {
            assert!(retryable_sqlstate(code), "{code}");
        }
        for code in ["42601", "23503", "22P02"] {
            assert!(!retryable_sqlstate(code), "{code}");
        }
    }

    #[test]
    fn pool_timeout_is_transient() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!map_sqlx(sqlx::Error::RowNotFound).is_transient());
    }
}

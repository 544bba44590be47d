use idcore::{EventStoreError, Operation, QueryError};
use tracing::{debug, error, warn};

const UNIQUE_VIOLATION: &str = "23505";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";

pub fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> EventStoreError {
    if let Some(database) = error.as_database_error() {
        let code = database.code();
        if let Some(mapped) = classify(
            code.as_deref(),
            database.constraint(),
            database.message(),
            operation,
        ) {
            return mapped;
        }
    }
    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    EventStoreError::internal(operation, error)
}

/// Maps SQLSTATE codes with a meaning of their own; everything else is
/// left to the caller as an internal failure.
fn classify(
    code: Option<&str>,
    constraint: Option<&str>,
    message: &str,
    operation: Operation,
) -> Option<EventStoreError> {
    match code? {
        UNIQUE_VIOLATION => {
            debug!(constraint, operation = %operation, "[postgres.unique_violation] {message}");
            Some(EventStoreError::AlreadyExists {
                unique_type: constraint.unwrap_or("unknown").to_string(),
                message: message.to_string(),
            })
        }
        SERIALIZATION_FAILURE | DEADLOCK_DETECTED => {
            warn!(operation = %operation, "[postgres.transient_error] {message}");
            Some(EventStoreError::Transient {
                operation,
                detail: message.to_string(),
            })
        }
        _ => None,
    }
}

pub fn map_query_error(error: sqlx::Error) -> QueryError {
    error!(error = %error, "[postgres.search_error] projection search failed");
    QueryError::Internal(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_keep_the_operation() {
        let mapped = map_sqlx_error(sqlx::Error::PoolTimedOut, Operation::Push);

        assert!(matches!(
            mapped,
            EventStoreError::Internal {
                operation: Operation::Push,
                ..
            }
        ));
    }

    #[test]
    fn unique_violations_name_the_constraint() {
        let mapped = classify(
            Some("23505"),
            Some("users_username_key"),
            "duplicate key value violates unique constraint",
            Operation::Execute,
        );

        assert!(matches!(
            mapped,
            Some(EventStoreError::AlreadyExists { ref unique_type, .. }) if unique_type == "users_username_key"
        ));
    }

    #[test]
    fn serialization_failures_and_deadlocks_are_transient() {
        for code in ["40001", "40P01"] {
            let mapped = classify(Some(code), None, "could not serialize access", Operation::Push)
                .unwrap();

            assert!(mapped.is_retryable(), "{code}");
            assert!(matches!(
                mapped,
                EventStoreError::Transient {
                    operation: Operation::Push,
                    ..
                }
            ));
        }
    }

    #[test]
    fn other_codes_are_left_unmapped() {
        assert!(classify(Some("42P01"), None, "relation does not exist", Operation::Filter).is_none());
        assert!(classify(None, None, "no code", Operation::Filter).is_none());
    }
}

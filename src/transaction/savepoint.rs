use lazy_static::lazy_static;
use regex::Regex;

use crate::error::DbError;
use crate::types::Provider;

lazy_static! {
    static ref SAVEPOINT_NAME: Regex =
        Regex::new(r"^[A-Za-z0-9_-]+$").expect("static savepoint name pattern");
}

fn checked(name: &str) -> Result<&str, DbError> {
    if SAVEPOINT_NAME.is_match(name) {
        Ok(name)
    } else {
        Err(DbError::Validation(format!("invalid savepoint name '{name}'")))
    }
}

/// Statement that creates a savepoint.
///
/// # Errors
/// Returns `DbError::Validation` if `name` is not `[A-Za-z0-9_-]+`.
pub fn begin_sql(provider: Provider, name: &str) -> Result<String, DbError> {
    let name = checked(name)?;
    Ok(match provider {
        Provider::SqlServer => format!("SAVE TRANSACTION {name}"),
        Provider::Postgres | Provider::Oracle => format!("SAVEPOINT {name}"),
    })
}

/// Statement that rolls back to a savepoint.
///
/// # Errors
/// Returns `DbError::Validation` if `name` is not `[A-Za-z0-9_-]+`.
pub fn rollback_sql(provider: Provider, name: &str) -> Result<String, DbError> {
    let name = checked(name)?;
    Ok(match provider {
        Provider::SqlServer => format!("ROLLBACK TRANSACTION {name}"),
        Provider::Postgres | Provider::Oracle => format!("ROLLBACK TO SAVEPOINT {name}"),
    })
}

/// Statement that releases a savepoint, or `None` where the provider has no release.
///
/// # Errors
/// Returns `DbError::Validation` if `name` is not `[A-Za-z0-9_-]+`.
pub fn release_sql(provider: Provider, name: &str) -> Result<Option<String>, DbError> {
    let name = checked(name)?;
    Ok(match provider {
        Provider::Postgres => Some(format!("RELEASE SAVEPOINT {name}")),
        Provider::SqlServer | Provider::Oracle => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_statements() {
        assert_eq!(
            begin_sql(Provider::SqlServer, "sp1").unwrap(),
            "SAVE TRANSACTION sp1"
        );
        assert_eq!(
            rollback_sql(Provider::SqlServer, "sp1").unwrap(),
            "ROLLBACK TRANSACTION sp1"
        );
        assert_eq!(release_sql(Provider::SqlServer, "sp1").unwrap(), None);

        assert_eq!(begin_sql(Provider::Postgres, "sp-1").unwrap(), "SAVEPOINT sp-1");
        assert_eq!(
            rollback_sql(Provider::Postgres, "sp-1").unwrap(),
            "ROLLBACK TO SAVEPOINT sp-1"
        );
        assert_eq!(
            release_sql(Provider::Postgres, "sp-1").unwrap().as_deref(),
            Some("RELEASE SAVEPOINT sp-1")
        );

        assert_eq!(begin_sql(Provider::Oracle, "A_1").unwrap(), "SAVEPOINT A_1");
        assert_eq!(release_sql(Provider::Oracle, "A_1").unwrap(), None);
    }

    #[test]
    fn rejects_injection_in_names() {
        for bad in ["", "sp 1", "sp;drop table t", "sp'"] {
            assert!(matches!(
                begin_sql(Provider::Postgres, bad),
                Err(DbError::Validation(_))
            ));
        }
    }
}

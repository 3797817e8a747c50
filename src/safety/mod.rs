//! SQL safety enforcement.
//!
//! Every generated statement passes through [`SqlValidator`] before it
//! reaches a database.

mod validator;

pub use validator::SqlValidator;

use crate::config::SecurityPolicy;
use crate::error::Result;

/// Validates `sql` against `policy` without keeping a validator around.
pub fn validate_or_raise(sql: &str, policy: &SecurityPolicy) -> Result<()> {
    SqlValidator::new(policy.clone()).validate_or_raise(sql)
}

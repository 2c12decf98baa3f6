//! Identifier validation and quoting.
//!
//! SQLite cannot bind identifiers as parameters, so table and column names
//! are interpolated into DDL text. Every name that reaches this module has
//! already been read back from the catalog; quoting here is the second line.

use crate::error::{RelinkError, RelinkResult};

/// SQLite has no hard limit; this guards against garbage input.
const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Validate an identifier before it is interpolated into SQL.
///
/// Rejects empty names, names containing NUL bytes and overlong names.
pub fn validate_identifier(name: &str) -> RelinkResult<()> {
    if name.is_empty() {
        return Err(RelinkError::invalid_identifier(name, "identifier is empty"));
    }

    if name.contains('\0') {
        return Err(RelinkError::invalid_identifier(
            name,
            "identifier contains a NUL byte",
        ));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(RelinkError::invalid_identifier(
            name,
            "identifier exceeds maximum length",
        ));
    }

    Ok(())
}

/// Quote an identifier for SQLite.
///
/// Doubles embedded double quotes and wraps the name in double quotes.
///
/// ```
/// use relink::sql::quote_ident;
/// assert_eq!(quote_ident("requestVar").unwrap(), "\"requestVar\"");
/// assert_eq!(quote_ident("odd\"name").unwrap(), "\"odd\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> RelinkResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a list of identifiers and join them with `, `.
pub fn quote_list<S: AsRef<str>>(names: &[S]) -> RelinkResult<String> {
    let quoted = names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<RelinkResult<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

//! Bundled connectors.

pub mod jira;
pub mod mbox;
pub mod stackexchange;

pub use jira::Jira;
pub use mbox::MBox;
pub use stackexchange::StackExchange;

use crate::contract::Item;
use crate::error::ValidationError;

/// Look up `field` in `item`, failing if it is absent or null.
pub(crate) fn required<'a>(item: &'a Item, field: &str) -> Result<&'a Item, ValidationError> {
    match item.get(field) {
        Some(value) if !value.is_null() => Ok(value),
        _ => Err(ValidationError::missing(field)),
    }
}

/// A string or integer identifier, rendered as a non-empty string.
pub(crate) fn identifier(item: &Item, field: &str) -> Result<String, ValidationError> {
    let id = match required(item, field)? {
        Item::String(s) => s.clone(),
        Item::Number(n) => n.to_string(),
        _ => return Err(ValidationError::unexpected_type(field)),
    };
    if id.is_empty() {
        return Err(ValidationError::empty(field));
    }
    Ok(id)
}

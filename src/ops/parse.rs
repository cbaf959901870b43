//! Parsing of compact `key=value` parameter strings.
//!
//! Listener and rule arguments arrive as `a=1,b=2;c=3,d=4`: entries are
//! separated by `;`, fields within an entry by `,`.

use std::collections::BTreeMap;

use super::LifecycleError;

/// Parses `input` into one map per `;`-separated entry.
///
/// # Errors
///
/// Returns [`LifecycleError::InvalidParameter`] when a field lacks `=`.
///
/// # Examples
///
/// ```
/// use cirrus::ops::parse::parse_str_parameters;
///
/// let entries = parse_str_parameters("protocol=tcp,from-port=22;protocol=udp")
///     .expect("well formed");
/// assert_eq!(entries.len(), 2);
/// assert_eq!(entries[0]["from-port"], "22");
/// ```
pub fn parse_str_parameters(input: &str) -> Result<Vec<BTreeMap<String, String>>, LifecycleError> {
    input
        .split(';')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            entry
                .split(',')
                .filter(|field| !field.trim().is_empty())
                .map(|field| {
                    field
                        .split_once('=')
                        .map(|(key, value)| (key.trim().to_owned(), value.trim().to_owned()))
                        .ok_or_else(|| {
                            LifecycleError::InvalidParameter(format!(
                                "expected key=value, found '{field}'"
                            ))
                        })
                })
                .collect()
        })
        .collect()
}

/// Splits a `;`-separated list, dropping empty entries.
#[must_use]
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

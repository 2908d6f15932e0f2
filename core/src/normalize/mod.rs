//! Typed payload schemas per source and their conversion into [`Series`].
//!
//! Missing numeric fields map to documented defaults; a payload whose
//! overall shape is wrong is a [`ParseError`](crate::error::ParseError).
//!
//! [`Series`]: crate::model::Series

pub mod billing;
pub mod thermostat;
pub mod utility;

use std::fmt;

use serde::Deserialize;
use serde::Deserializer;

/// Treats an explicit `null` like an absent field.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Identifier that upstream sends either as a string or as a number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum LooseId {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for LooseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LooseId::Text(text) => f.write_str(text.trim()),
            LooseId::Number(number) => write!(f, "{number}"),
        }
    }
}

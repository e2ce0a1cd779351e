//! Serde helpers for tolerant decoding of server payloads.
//!
//! When the `tracing` feature is enabled, this module also logs any unknown fields
//! encountered during deserialization, which helps spot protocol drift.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ws::WsError;

/// Deserialize an identifier sent either as a JSON integer or as a numeric string.
///
/// Use with `#[serde(deserialize_with = "id_from_any")]` on `i64` fields.
pub(crate) fn id_from_any<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use std::fmt;

    use serde::de::{self, Visitor};

    struct IdVisitor;

    impl Visitor<'_> for IdVisitor {
        type Value = i64;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("integer or numeric string")
        }

        fn visit_i64<E>(self, v: i64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(v)
        }

        fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            i64::try_from(v).map_err(|_e| E::invalid_value(de::Unexpected::Unsigned(v), &self))
        }

        fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
        where
            E: de::Error,
        {
            v.parse()
                .map_err(|_e| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(IdVisitor)
}

/// Deserialize JSON while reporting fields the target type does not capture.
///
/// Unknown fields are logged at `debug` and never fail the call. On failure the
/// offending path is logged at `warn` and the error is returned as a
/// [`WsError::MessageParse`], i.e. a [`Kind::Protocol`](crate::error::Kind::Protocol) error.
///
/// # Example
///
/// ```ignore
/// let json = serde_json::json!({ "id": 1, "someNewField": true });
/// let chat: Chat = deserialize_with_warnings(json)?;
/// // Logs: DEBUG unknown field in server payload field="someNewField"
/// ```
#[cfg(feature = "tracing")]
pub(crate) fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    use std::any::type_name;

    tracing::trace!(
        type_name = %type_name::<T>(),
        json = %value,
        "deserializing JSON"
    );

    // Clone the value so we can look up unknown field values later
    let original = value.clone();

    let mut unknown_paths: Vec<String> = Vec::new();

    let result: T = serde_ignored::deserialize(value, |path| {
        unknown_paths.push(path.to_string());
    })
    .map_err(|e| {
        // Re-run with serde_path_to_error to find where it broke
        let path_result: Result<T, _> = serde_path_to_error::deserialize(&original);
        if let Err(path_err) = path_result {
            let path = path_err.path().to_string();
            let value_display = format_value(lookup_value(&original, &path));

            tracing::warn!(
                type_name = %type_name::<T>(),
                path = %path,
                value = %value_display,
                error = %path_err.inner(),
                "deserialization failed"
            );
        }
        WsError::MessageParse(e)
    })?;

    for path in unknown_paths {
        let value_display = format_value(lookup_value(&original, &path));

        tracing::debug!(
            type_name = %type_name::<T>(),
            field = %path,
            value = %value_display,
            "unknown field in server payload"
        );
    }

    Ok(result)
}

/// Pass-through deserialization when tracing is disabled.
#[cfg(not(feature = "tracing"))]
pub(crate) fn deserialize_with_warnings<T: DeserializeOwned>(value: Value) -> crate::Result<T> {
    Ok(serde_json::from_value(value).map_err(WsError::MessageParse)?)
}

/// Look up a value in a JSON structure by a `serde_ignored`/`serde_path_to_error` path.
///
/// `?` segments (Option wrappers) are skipped. Returns `None` when the path does not
/// exist or runs through a primitive.
#[cfg(feature = "tracing")]
fn lookup_value<'value>(value: &'value Value, path: &str) -> Option<&'value Value> {
    let mut current = value;

    for segment in parse_path_segments(path) {
        if segment.is_empty() || segment == "?" {
            continue;
        }

        match current {
            Value::Object(map) => current = map.get(&segment)?,
            Value::Array(arr) => current = arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }

    Some(current)
}

/// Split `"chats[3].lastMessage.id"` into `["chats", "3", "lastMessage", "id"]`.
#[cfg(feature = "tracing")]
fn parse_path_segments(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '.' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    current.push(inner);
                }
                if !current.is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
            }
            ']' => {}
            _ => current.push(ch),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

#[cfg(feature = "tracing")]
fn format_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<unable to retrieve>".to_owned(),
    }
}

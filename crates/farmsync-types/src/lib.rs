//! Wire types for farm-wide cache refresh instructions.
//!
//! An instruction row in the shared log carries an [`InstructionPayload`]: an ordered list of
//! [`RefresherCommand`]s serialized as one JSON array. Publishers build payloads with the
//! constructors on [`RefresherCommand`]; consumers decode rows with [`InstructionPayload::decode`].

use std::borrow::Borrow;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Identifies the refresher that owns a cache domain (for example `"content"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefresherId(String);

impl RefresherId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefresherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for RefresherId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RefresherId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RefresherId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Key of a single cache entry inside a refresher's domain.
///
/// Serialized untagged: integers stay JSON numbers and text stays a JSON string, so every key
/// decodes back to the variant it was published as. UUIDs are carried as their hyphenated text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefreshKey {
    Int(i64),
    Text(String),
}

impl fmt::Display for RefreshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshKey::Int(value) => write!(f, "{value}"),
            RefreshKey::Text(value) => f.write_str(value),
        }
    }
}

impl From<i64> for RefreshKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Uuid> for RefreshKey {
    fn from(value: Uuid) -> Self {
        Self::Text(value.hyphenated().to_string())
    }
}

impl From<&str> for RefreshKey {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RefreshKey {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Reads integers as such; anything else becomes text verbatim.
impl FromStr for RefreshKey {
    type Err = Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.parse::<i64>() {
            Ok(int) => Ok(Self::Int(int)),
            Err(_) => Ok(Self::Text(value.to_string())),
        }
    }
}

/// What a refresher should do with its cache domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RefreshAction {
    /// Clear or reload the whole domain.
    RefreshAll,
    /// Invalidate one entry; it reloads lazily on next read.
    RefreshByKey { key: RefreshKey },
    /// Invalidate several entries.
    RefreshByKeys { keys: Vec<RefreshKey> },
    /// Evict one entry without reloading it.
    RemoveByKey { key: RefreshKey },
    /// Refresher-specific data, opaque to the log.
    RefreshByPayload { payload: Value },
}

impl RefreshAction {
    pub fn name(&self) -> &'static str {
        match self {
            RefreshAction::RefreshAll => "refresh_all",
            RefreshAction::RefreshByKey { .. } => "refresh_by_key",
            RefreshAction::RefreshByKeys { .. } => "refresh_by_keys",
            RefreshAction::RemoveByKey { .. } => "remove_by_key",
            RefreshAction::RefreshByPayload { .. } => "refresh_by_payload",
        }
    }

    /// Number of keyed effects this action carries. Whole-domain and payload actions count once.
    pub fn effect_count(&self) -> usize {
        match self {
            RefreshAction::RefreshByKeys { keys } => keys.len().max(1),
            _ => 1,
        }
    }
}

/// A single typed refresh action addressed to one refresher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefresherCommand {
    pub refresher: RefresherId,
    #[serde(flatten)]
    pub action: RefreshAction,
}

impl RefresherCommand {
    pub fn new(refresher: impl Into<RefresherId>, action: RefreshAction) -> Self {
        Self {
            refresher: refresher.into(),
            action,
        }
    }

    pub fn refresh_all(refresher: impl Into<RefresherId>) -> Self {
        Self::new(refresher, RefreshAction::RefreshAll)
    }

    pub fn refresh_key(refresher: impl Into<RefresherId>, key: impl Into<RefreshKey>) -> Self {
        Self::new(refresher, RefreshAction::RefreshByKey { key: key.into() })
    }

    pub fn refresh_keys<I, K>(refresher: impl Into<RefresherId>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<RefreshKey>,
    {
        Self::new(
            refresher,
            RefreshAction::RefreshByKeys {
                keys: keys.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn remove_key(refresher: impl Into<RefresherId>, key: impl Into<RefreshKey>) -> Self {
        Self::new(refresher, RefreshAction::RemoveByKey { key: key.into() })
    }

    pub fn refresh_payload(refresher: impl Into<RefresherId>, payload: Value) -> Self {
        Self::new(refresher, RefreshAction::RefreshByPayload { payload })
    }

    pub fn effect_count(&self) -> usize {
        self.action.effect_count()
    }

    /// Canonical JSON text of the command, used to recognise repeated commands.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload element at index {index} is a {found}, expected a command object or array")]
    UnexpectedElement { index: usize, found: &'static str },
    #[error("payload root must be a JSON array, found {found}")]
    NotAnArray { found: &'static str },
}

/// Ordered commands stored in one instruction row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstructionPayload {
    commands: Vec<RefresherCommand>,
}

impl InstructionPayload {
    pub fn new(commands: Vec<RefresherCommand>) -> Self {
        Self { commands }
    }

    pub fn commands(&self) -> &[RefresherCommand] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<RefresherCommand> {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Total keyed effects across all commands; stored alongside the row for backlog estimates.
    pub fn command_count(&self) -> usize {
        self.commands.iter().map(RefresherCommand::effect_count).sum()
    }

    pub fn to_value(&self) -> Result<Value, PayloadError> {
        Ok(serde_json::to_value(&self.commands)?)
    }

    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(&self.commands)?)
    }

    pub fn decode(raw: &str) -> Result<Self, PayloadError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Decode a payload, flattening nested arrays of commands in document order.
    pub fn from_value(value: Value) -> Result<Self, PayloadError> {
        let Value::Array(items) = value else {
            return Err(PayloadError::NotAnArray {
                found: json_kind(&value),
            });
        };

        let mut commands = Vec::with_capacity(items.len());
        collect_commands(items, &mut commands)?;
        Ok(Self { commands })
    }

    /// Split into payloads whose keyed effect count stays within `max_per_row`.
    ///
    /// Command order is preserved across the returned payloads. A `RefreshByKeys` command
    /// larger than the limit is broken into several `RefreshByKeys` commands.
    pub fn split(self, max_per_row: usize) -> Vec<InstructionPayload> {
        let max_per_row = max_per_row.max(1);
        let mut rows = Vec::new();
        let mut current = Vec::new();
        let mut current_count = 0;

        for command in self.commands {
            for piece in split_command(command, max_per_row) {
                let count = piece.effect_count();
                if current_count + count > max_per_row && !current.is_empty() {
                    rows.push(InstructionPayload::new(std::mem::take(&mut current)));
                    current_count = 0;
                }
                current_count += count;
                current.push(piece);
            }
        }

        if !current.is_empty() {
            rows.push(InstructionPayload::new(current));
        }
        rows
    }
}

impl From<Vec<RefresherCommand>> for InstructionPayload {
    fn from(commands: Vec<RefresherCommand>) -> Self {
        Self::new(commands)
    }
}

fn split_command(command: RefresherCommand, max_per_row: usize) -> Vec<RefresherCommand> {
    match command.action {
        RefreshAction::RefreshByKeys { keys } if keys.len() > max_per_row => keys
            .chunks(max_per_row)
            .map(|chunk| RefresherCommand::refresh_keys(command.refresher.clone(), chunk.to_vec()))
            .collect(),
        action => vec![RefresherCommand {
            refresher: command.refresher,
            action,
        }],
    }
}

fn collect_commands(items: Vec<Value>, out: &mut Vec<RefresherCommand>) -> Result<(), PayloadError> {
    for (index, item) in items.into_iter().enumerate() {
        match item {
            Value::Array(nested) => collect_commands(nested, out)?,
            Value::Object(_) => out.push(serde_json::from_value(item)?),
            other => {
                return Err(PayloadError::UnexpectedElement {
                    index,
                    found: json_kind(&other),
                });
            }
        }
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn command_serializes_flat_with_action_tag() {
        let command = RefresherCommand::refresh_key("content", "A");
        let value = serde_json::to_value(&command).expect("serialize");
        assert_eq!(
            value,
            json!({"refresher": "content", "action": "refresh_by_key", "key": "A"})
        );
    }

    #[test]
    fn keys_parse_from_cli_text() {
        let id = Uuid::new_v4();
        assert_eq!("17".parse::<RefreshKey>(), Ok(RefreshKey::Int(17)));
        assert_eq!(id.to_string().parse::<RefreshKey>(), Ok(RefreshKey::from(id)));
        assert_eq!(
            "about-us".parse::<RefreshKey>(),
            Ok(RefreshKey::Text("about-us".to_string()))
        );
    }

    #[test]
    fn keys_survive_the_log_unchanged() {
        let id = Uuid::new_v4();
        let keys = vec![
            RefreshKey::Int(42),
            RefreshKey::from(id),
            RefreshKey::Text("550e8400-e29b-41d4-a716-446655440000".into()),
            RefreshKey::Text("42".into()),
            RefreshKey::Text("slug".into()),
        ];
        let payload = InstructionPayload::new(vec![
            RefresherCommand::refresh_keys("media", keys.clone()),
            RefresherCommand::remove_key("content", "550e8400-e29b-41d4-a716-446655440000"),
        ]);

        let decoded =
            InstructionPayload::from_value(payload.to_value().expect("encode")).expect("decode");

        assert_eq!(decoded, payload);
        let RefreshAction::RefreshByKeys { keys: decoded_keys } = &decoded.commands()[0].action
        else {
            panic!("unexpected action");
        };
        assert_eq!(decoded_keys, &keys);
    }

    #[test]
    fn keys_decode_by_json_shape() {
        let id = Uuid::new_v4();
        let raw = json!([
            {"refresher": "media", "action": "refresh_by_keys", "keys": [42, id.to_string(), "slug"]}
        ]);
        let payload = InstructionPayload::from_value(raw).expect("decode");

        let RefreshAction::RefreshByKeys { keys } = &payload.commands()[0].action else {
            panic!("unexpected action");
        };
        assert_eq!(
            keys,
            &vec![
                RefreshKey::Int(42),
                RefreshKey::Text(id.to_string()),
                RefreshKey::Text("slug".into())
            ]
        );
    }

    #[test]
    fn decode_flattens_nested_arrays_in_order() {
        let raw = r#"[
            {"refresher": "content", "action": "refresh_all"},
            [
                {"refresher": "media", "action": "remove_by_key", "key": 7},
                [{"refresher": "members", "action": "refresh_by_payload", "payload": {"ids": [1]}}]
            ]
        ]"#;

        let payload = InstructionPayload::decode(raw).expect("decode");
        let refreshers: Vec<&str> = payload
            .commands()
            .iter()
            .map(|command| command.refresher.as_str())
            .collect();
        assert_eq!(refreshers, ["content", "media", "members"]);
    }

    #[test]
    fn decode_rejects_scalars() {
        assert!(matches!(
            InstructionPayload::decode(r#"{"refresher": "content"}"#),
            Err(PayloadError::NotAnArray { found: "object" })
        ));
        assert!(matches!(
            InstructionPayload::decode(r#"[{"refresher": "content", "action": "refresh_all"}, 3]"#),
            Err(PayloadError::UnexpectedElement {
                index: 1,
                found: "number"
            })
        ));
        assert!(matches!(
            InstructionPayload::decode("not json"),
            Err(PayloadError::Json(_))
        ));
    }

    #[test]
    fn unknown_action_is_a_decode_error() {
        let raw = r#"[{"refresher": "content", "action": "explode"}]"#;
        assert!(InstructionPayload::decode(raw).is_err());
    }

    #[test]
    fn command_count_sums_keyed_effects() {
        let payload = InstructionPayload::new(vec![
            RefresherCommand::refresh_all("content"),
            RefresherCommand::refresh_keys("content", [1_i64, 2, 3]),
            RefresherCommand::remove_key("media", 9_i64),
        ]);
        assert_eq!(payload.command_count(), 5);
    }

    #[test]
    fn split_respects_limit_and_order() {
        let payload = InstructionPayload::new(vec![
            RefresherCommand::refresh_key("content", 1_i64),
            RefresherCommand::refresh_keys("content", (10_i64..15).collect::<Vec<_>>()),
            RefresherCommand::remove_key("media", 2_i64),
        ]);

        let rows = payload.split(2);
        let counts: Vec<usize> = rows.iter().map(InstructionPayload::command_count).collect();
        assert!(counts.iter().all(|count| *count <= 2));
        assert_eq!(counts.iter().sum::<usize>(), 7);

        let flattened: Vec<RefresherCommand> =
            rows.into_iter().flat_map(InstructionPayload::into_commands).collect();
        assert_eq!(flattened[0], RefresherCommand::refresh_key("content", 1_i64));
        assert_eq!(
            flattened.last(),
            Some(&RefresherCommand::remove_key("media", 2_i64))
        );
    }

    #[test]
    fn split_keeps_small_payload_in_one_row() {
        let payload = InstructionPayload::new(vec![
            RefresherCommand::refresh_all("content"),
            RefresherCommand::refresh_all("media"),
        ]);
        assert_eq!(payload.clone().split(1000), vec![payload]);
    }

    #[test]
    fn fingerprint_distinguishes_commands() {
        let a = RefresherCommand::refresh_key("content", "A");
        let b = RefresherCommand::remove_key("content", "A");
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}

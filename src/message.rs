//! Wire formats shared by the producer and consumer.
//!
//! The envelope field names (`BatchID`, `XMLList`, `JSONList`, `Action`,
//! `Data`, `TableName`) are part of the transport contract and must not be
//! renamed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Envelope for one batch of DDL log rows. Each element of `xml_list` is a
/// serialized `DDLData` event document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdlMessage {
    #[serde(rename = "BatchID")]
    pub batch_id: i64,
    #[serde(rename = "XMLList")]
    pub xml_list: Vec<String>,
}

/// Envelope for one batch of DML log rows. Each element of `json_list` is a
/// serialized entry object with `Action` and `Data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DmlMessage {
    #[serde(rename = "BatchID")]
    pub batch_id: i64,
    #[serde(rename = "JSONList")]
    pub json_list: Vec<String>,
}

/// DDL event document. Only the command text nested under
/// `EventData/EVENT_INSTANCE/TSQLCommand` is consumed; the surrounding
/// audit fields are ignored.
#[derive(Debug, Deserialize)]
pub struct DdlEvent {
    #[serde(rename = "EventData")]
    pub event_data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    #[serde(rename = "EVENT_INSTANCE")]
    pub instance: EventInstance,
}

#[derive(Debug, Deserialize)]
pub struct EventInstance {
    #[serde(rename = "TSQLCommand", default)]
    pub command: TsqlCommand,
}

#[derive(Debug, Default, Deserialize)]
pub struct TsqlCommand {
    #[serde(rename = "CommandText", default)]
    pub command_text: String,
}

impl DdlEvent {
    pub fn from_xml(xml: &str) -> Result<Self> {
        quick_xml::de::from_str(xml).map_err(Error::Xml)
    }

    pub fn command_text(&self) -> &str {
        &self.event_data.instance.command.command_text
    }
}

/// Row-change action carried by a DML entry. Anything other than `Insert`
/// or `Delete` is ignored by the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert,
    Delete,
    Other,
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "Insert" => Action::Insert,
            "Delete" => Action::Delete,
            _ => Action::Other,
        })
    }
}

/// One DML entry: an action plus the row image, including the `TableName`
/// discriminator.
#[derive(Debug, Clone, Deserialize)]
pub struct DmlEntry {
    #[serde(rename = "Action")]
    pub action: Action,
    #[serde(rename = "Data")]
    pub data: serde_json::Map<String, Value>,
}

impl DmlEntry {
    /// Table the entry targets, if present and non-empty.
    pub fn table_name(&self) -> Option<&str> {
        self.data
            .get("TableName")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Escapes any backslash that does not start a legal JSON escape sequence.
///
/// Upstream capture occasionally emits payloads with raw `\5`-style
/// sequences; this turns them into `\\5` so a second parse attempt can
/// succeed. Legal escapes are passed through untouched.
pub fn repair_escapes(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(n) if matches!(n, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                out.push('\\');
                out.push(n);
                chars.next();
            }
            _ => out.push_str("\\\\"),
        }
    }
    out
}

/// Parses the raw entry strings of a [`DmlMessage`].
///
/// A type mismatch or a syntax error unrelated to escaping fails the whole
/// message. A syntax error caused by an invalid escape sequence gets one
/// repair pass via [`repair_escapes`]; entries that still fail afterwards
/// are skipped with a warning, which is the accepted data-loss tradeoff for
/// resilience against producer-side string encoding bugs.
pub fn parse_entries(json_list: &[String]) -> Result<Vec<DmlEntry>> {
    let mut entries = Vec::with_capacity(json_list.len());
    for (idx, raw) in json_list.iter().enumerate() {
        let err = match serde_json::from_str::<DmlEntry>(raw) {
            Ok(entry) => {
                entries.push(entry);
                continue;
            }
            Err(err) => err,
        };

        if err.classify() == serde_json::error::Category::Data {
            return Err(Error::InvalidMessage {
                message: format!("entry {idx}: type mismatch: {err}"),
            });
        }
        if !err.to_string().contains("escape") {
            return Err(Error::InvalidMessage {
                message: format!("entry {idx}: parse failure: {err}"),
            });
        }

        match serde_json::from_str::<DmlEntry>(&repair_escapes(raw)) {
            Ok(entry) => {
                debug!(index = idx, "entry parsed after escape repair");
                entries.push(entry);
            }
            Err(err) => {
                warn!(index = idx, error = %err, "entry unparsable after escape repair, skipping");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DDL_XML: &str = r#"<DDLData><EventData><EVENT_INSTANCE><EventType>ALTER_TABLE</EventType><PostTime>2025-05-28T09:21:48.627</PostTime><SPID>59</SPID><ObjectName>orders</ObjectName><TSQLCommand><SetOptions ANSI_NULLS="ON" QUOTED_IDENTIFIER="ON" /><CommandText>ALTER TABLE orders ALTER COLUMN note varchar(50) NOT NULL</CommandText></TSQLCommand></EVENT_INSTANCE></EventData><Timestamp>2025-05-28T09:21:48.627</Timestamp></DDLData>"#;

    #[test]
    fn test_envelope_wire_format() {
        let msg = DdlMessage {
            batch_id: 42,
            xml_list: vec!["<DDLData/>".to_string()],
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["BatchID"], 42);
        assert_eq!(value["XMLList"][0], "<DDLData/>");

        let msg = DmlMessage {
            batch_id: 7,
            json_list: vec!["{}".to_string()],
        };
        let value: Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(value["BatchID"], 7);
        assert_eq!(value["JSONList"][0], "{}");
    }

    #[test]
    fn test_ddl_event_command_text() {
        let event = DdlEvent::from_xml(DDL_XML).unwrap();
        assert_eq!(
            event.command_text(),
            "ALTER TABLE orders ALTER COLUMN note varchar(50) NOT NULL"
        );
    }

    #[test]
    fn test_ddl_event_missing_command_text() {
        let xml = "<DDLData><EventData><EVENT_INSTANCE><EventType>X</EventType></EVENT_INSTANCE></EventData></DDLData>";
        let event = DdlEvent::from_xml(xml).unwrap();
        assert_eq!(event.command_text(), "");
    }

    #[test]
    fn test_repair_escapes() {
        assert_eq!(repair_escapes(r#"a\5b"#), r#"a\\5b"#);
        assert_eq!(repair_escapes(r#"a\nb"#), r#"a\nb"#);
        assert_eq!(repair_escapes(r#"a\\5"#), r#"a\\5"#);
        assert_eq!(repair_escapes(r#"tail\"#), r#"tail\\"#);
        assert_eq!(repair_escapes("plain"), "plain");
    }

    #[test]
    fn test_parse_entries_repairs_bad_escape() {
        let raw = r#"{"Action":"Insert","Data":{"TableName":"t","path":"C:\5users"}}"#.to_string();
        let entries = parse_entries(&[raw]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::Insert);
        assert_eq!(entries[0].data["path"], json!("C:\\5users"));
    }

    #[test]
    fn test_parse_entries_type_error_fails_message() {
        let raw = r#"{"Action":"Insert","Data":[1,2]}"#.to_string();
        let err = parse_entries(&[raw]).unwrap_err();
        assert!(matches!(err, Error::InvalidMessage { .. }));
    }

    #[test]
    fn test_parse_entries_skips_unrepairable() {
        // Unbalanced brace after the escape problem: repair cannot help.
        let good = r#"{"Action":"Delete","Data":{"TableName":"t","id":1}}"#.to_string();
        let bad = r#"{"Action":"Insert","Data":{"note":"x\5y"#.to_string();
        let entries = parse_entries(&[good, bad]).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, Action::Delete);
    }

    #[test]
    fn test_unknown_action_tolerated() {
        let raw = r#"{"Action":"Upsert","Data":{"TableName":"t"}}"#.to_string();
        let entries = parse_entries(&[raw]).unwrap();
        assert_eq!(entries[0].action, Action::Other);
    }

    #[test]
    fn test_table_name_extraction() {
        let entry: DmlEntry =
            serde_json::from_str(r#"{"Action":"Insert","Data":{"TableName":"orders","id":1}}"#)
                .unwrap();
        assert_eq!(entry.table_name(), Some("orders"));

        let entry: DmlEntry =
            serde_json::from_str(r#"{"Action":"Insert","Data":{"TableName":"","id":1}}"#).unwrap();
        assert_eq!(entry.table_name(), None);
    }
}

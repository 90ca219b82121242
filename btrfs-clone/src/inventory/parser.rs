//! Parser for `btrfs subvolume list -qRu` lines.
//!
//! A line looks like
//!
//! ```text
//! ID 11352 gen 2308972 top level 5 parent_uuid -   received_uuid 3f1c...  uuid 8d2b... path host/230525-1205
//! ```
//!
//! Labels are followed by one value, `top level` is two words, absent
//! identities print as `-` (padded with spaces to uuid width) and `path` takes
//! the rest of the line, spaces included.

use super::SnapshotRecord;
use crate::utils::{CloneError, Result};

/// Token btrfs prints for a missing identity
pub const NO_IDENTITY: &str = "-";

/// Parse one listing line into a record.
pub fn parse_line(line: &str) -> Result<SnapshotRecord> {
    parse_fields(line).map_err(|reason| CloneError::Parse {
        line: line.to_string(),
        reason,
    })
}

fn parse_fields(line: &str) -> std::result::Result<SnapshotRecord, String> {
    let mut cursor = Cursor { rest: line };
    let mut id = None;
    let mut parent = None;
    let mut received = None;
    let mut identity = None;

    let relative_path = loop {
        let label = cursor.token().ok_or("missing `path` field")?;
        match label {
            "ID" => id = Some(cursor.number("ID")?),
            "gen" | "cgen" => {
                cursor.number(label)?;
            }
            "top" => {
                cursor.expect("level")?;
                cursor.number("top level")?;
            }
            "parent_uuid" => parent = Some(cursor.value(label)?),
            "received_uuid" => received = Some(cursor.value(label)?),
            "uuid" => identity = Some(cursor.value(label)?),
            "path" => break cursor.remainder().ok_or("empty `path` field")?,
            other => return Err(format!("unexpected field `{}`", other)),
        }
    };

    Ok(SnapshotRecord {
        id: id.ok_or("missing `ID` field")?,
        identity: normalize_identity(identity.ok_or("missing `uuid` field")?),
        relative_path: relative_path.to_string(),
        parent_identity: normalize_identity(parent.ok_or("missing `parent_uuid` field")?),
        received_identity: normalize_identity(received.ok_or("missing `received_uuid` field")?),
    })
}

/// `-` means "no identity"; everything downstream uses an empty string.
pub fn normalize_identity(token: &str) -> String {
    if token == NO_IDENTITY {
        String::new()
    } else {
        token.to_string()
    }
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn token(&mut self) -> Option<&'a str> {
        let s = self.rest.trim_start();
        if s.is_empty() {
            self.rest = s;
            return None;
        }
        let end = s.find(char::is_whitespace).unwrap_or(s.len());
        let (token, rest) = s.split_at(end);
        self.rest = rest;
        Some(token)
    }

    fn expect(&mut self, word: &str) -> std::result::Result<(), String> {
        match self.token() {
            Some(t) if t == word => Ok(()),
            Some(t) => Err(format!("expected `{}`, found `{}`", word, t)),
            None => Err(format!("expected `{}`", word)),
        }
    }

    fn value(&mut self, label: &str) -> std::result::Result<&'a str, String> {
        self.token()
            .ok_or_else(|| format!("missing value for `{}`", label))
    }

    fn number(&mut self, label: &str) -> std::result::Result<u64, String> {
        let value = self.value(label)?;
        value
            .parse()
            .map_err(|_| format!("`{}` is not a number: {}", label, value))
    }

    /// Everything after the single separator following `path`
    fn remainder(&mut self) -> Option<&'a str> {
        let rest = self.rest.strip_prefix(' ').unwrap_or(self.rest);
        self.rest = "";
        (!rest.is_empty()).then_some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "8d2b4a1c-8a6f-4c7e-9a51-0d3a7c1e2b4f";
    const UUID_B: &str = "3f1c6e2a-1b7d-4f0a-8e9c-5d2b7a4c6e1f";

    #[test]
    fn test_parse_plain_line() -> Result<()> {
        let line = format!(
            "ID 257 gen 31 top level 5 parent_uuid - received_uuid - uuid {} path host/230525-1205",
            UUID_A
        );
        let record = parse_line(&line)?;
        assert_eq!(record.id, 257);
        assert_eq!(record.identity, UUID_A);
        assert_eq!(record.relative_path, "host/230525-1205");
        assert_eq!(record.parent_identity, "");
        assert_eq!(record.received_identity, "");
        Ok(())
    }

    #[test]
    fn test_parse_padded_sentinels_and_received() -> Result<()> {
        let line = format!(
            "ID 11352 gen 2308972 top level 5 parent_uuid -                                    received_uuid {}      uuid {} path host/230526-0100",
            UUID_B, UUID_A
        );
        let record = parse_line(&line)?;
        assert_eq!(record.id, 11352);
        assert_eq!(record.parent_identity, "");
        assert_eq!(record.received_identity, UUID_B);
        Ok(())
    }

    #[test]
    fn test_path_keeps_spaces() -> Result<()> {
        let line = format!(
            "ID 300 gen 1 top level 5 parent_uuid {} received_uuid - uuid {} path My Laptop/230601-0930 (copy)",
            UUID_B, UUID_A
        );
        let record = parse_line(&line)?;
        assert_eq!(record.relative_path, "My Laptop/230601-0930 (copy)");
        assert_eq!(record.parent_identity, UUID_B);
        Ok(())
    }

    #[test]
    fn test_non_numeric_id_is_rejected() {
        let line = format!(
            "ID x gen 1 top level 5 parent_uuid - received_uuid - uuid {} path a",
            UUID_A
        );
        assert!(matches!(parse_line(&line), Err(CloneError::Parse { .. })));
    }

    #[test]
    fn test_missing_path_is_rejected() {
        let line = format!("ID 1 gen 1 top level 5 parent_uuid - received_uuid - uuid {}", UUID_A);
        let err = parse_line(&line).unwrap_err();
        match err {
            CloneError::Parse { reason, .. } => assert!(reason.contains("path")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_uuid_field_is_rejected() {
        let line = "ID 1 gen 1 top level 5 parent_uuid - received_uuid - path a";
        assert!(parse_line(line).is_err());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(parse_line("ERROR: can't perform the search: Operation not permitted").is_err());
        assert!(parse_line("").is_err());
    }
}

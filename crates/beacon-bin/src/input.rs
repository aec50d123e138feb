//! JSONL event input.

use anyhow::Context as _;
use beacon_context::{Context, Event};
use std::io::BufRead;
use std::path::Path;

/// Read one event per line from `path`; blank lines are skipped.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Context>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    parse_events(std::io::BufReader::new(file))
}

/// Parse JSONL events into contexts. An event carrying a `messageId`
/// keeps it as its context id, so a replay dedups against a persisted queue.
pub fn parse_events(reader: impl BufRead) -> anyhow::Result<Vec<Context>> {
    let mut contexts = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)
            .with_context(|| format!("invalid event on line {}", index + 1))?;
        let ctx = match event.message_id.clone() {
            Some(id) => Context::with_id(id, event),
            None => Context::new(event),
        };
        contexts.push(ctx);
    }
    Ok(contexts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_context::EventType;
    use std::io::Cursor;

    #[test]
    fn parses_each_line() {
        let input = concat!(
            r#"{"type":"track","event":"Signed Up","userId":"u1"}"#,
            "\n\n",
            r#"{"type":"identify","userId":"u1","traits":{"plan":"pro"}}"#,
            "\n",
        );

        let contexts = parse_events(Cursor::new(input)).unwrap();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].event().event_type, EventType::Track);
        assert_eq!(contexts[0].event().event.as_deref(), Some("Signed Up"));
        assert_eq!(contexts[1].event().event_type, EventType::Identify);
    }

    #[test]
    fn message_id_becomes_context_id() {
        let input = r#"{"type":"page","messageId":"msg-7"}"#;

        let contexts = parse_events(Cursor::new(input)).unwrap();
        assert_eq!(contexts[0].id(), "msg-7");
    }

    #[test]
    fn reports_the_bad_line() {
        let input = "{\"type\":\"track\",\"event\":\"ok\"}\nnot json\n";

        let err = parse_events(Cursor::new(input)).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_events(&dir.path().join("absent.jsonl")).is_err());
    }
}

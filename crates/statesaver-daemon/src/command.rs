//! Line-oriented control commands.
//!
//! One command per line. Blank lines and lines starting with `#` are
//! ignored.
//!
//! | Command | Effect |
//! |---|---|
//! | `ready` | Components are up, start the startup replay |
//! | `classify <prefix> <priority>` | Register a classification |
//! | `persist <json>` | Persist the event described by the payload |
//! | `remove <uid>` | Delete every row for `uid` |
//! | `swap <path>` | Hot-swap to the file store at `path` |
//! | `zeroize` | Destroy the active store |
//! | `status` | Print a JSON status report |

use std::path::PathBuf;

use statesaver_types::NewEvent;

use crate::error::DaemonError;

/// A parsed command line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `ready`
    Ready,
    /// `classify <prefix> <priority>`
    Classify {
        /// Event-type prefix.
        prefix: String,
        /// Replay priority.
        priority: i32,
    },
    /// `persist <json>`
    Persist(NewEvent),
    /// `remove <uid>`
    Remove(String),
    /// `swap <path>`
    Swap(PathBuf),
    /// `zeroize`
    Zeroize,
    /// `status`
    Status,
}

impl Command {
    /// Parse one input line. Returns `Ok(None)` for blank and comment
    /// lines.
    pub fn parse(line: &str) -> Result<Option<Self>, DaemonError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map_or((line, ""), |(verb, rest)| (verb, rest.trim()));
        let bad = |message: &str| DaemonError::Command {
            line: line.to_owned(),
            message: message.to_owned(),
        };

        let command = match verb {
            "ready" => Self::Ready,
            "zeroize" => Self::Zeroize,
            "status" => Self::Status,
            "classify" => {
                let mut parts = rest.split_whitespace();
                let (Some(prefix), Some(priority), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return Err(bad("expected `classify <prefix> <priority>`"));
                };
                let priority = priority
                    .parse()
                    .map_err(|e| bad(&format!("priority: {e}")))?;
                Self::Classify {
                    prefix: prefix.to_owned(),
                    priority,
                }
            }
            "persist" => {
                if rest.is_empty() {
                    return Err(bad("expected `persist <json>`"));
                }
                let event = NewEvent::from_payload(rest).map_err(|e| bad(&e.to_string()))?;
                Self::Persist(event)
            }
            "remove" if !rest.is_empty() => Self::Remove(rest.to_owned()),
            "swap" if !rest.is_empty() => Self::Swap(PathBuf::from(rest)),
            "remove" | "swap" => return Err(bad("missing argument")),
            _ => return Err(bad("unknown command")),
        };
        Ok(Some(command))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        assert_eq!(Command::parse("   ").unwrap(), None);
        assert_eq!(Command::parse("# warm-up").unwrap(), None);
    }

    #[test]
    fn parses_simple_verbs() {
        assert_eq!(Command::parse("ready").unwrap(), Some(Command::Ready));
        assert_eq!(Command::parse(" status ").unwrap(), Some(Command::Status));
        assert_eq!(Command::parse("zeroize").unwrap(), Some(Command::Zeroize));
        assert_eq!(
            Command::parse("remove track-7").unwrap(),
            Some(Command::Remove("track-7".to_owned()))
        );
        assert_eq!(
            Command::parse("swap /var/lib/state/other.sqlite").unwrap(),
            Some(Command::Swap(PathBuf::from("/var/lib/state/other.sqlite")))
        );
    }

    #[test]
    fn parses_classification() {
        assert_eq!(
            Command::parse("classify a-h 5").unwrap(),
            Some(Command::Classify {
                prefix: "a-h".to_owned(),
                priority: 5,
            })
        );
        assert!(Command::parse("classify a-h").is_err());
        assert!(Command::parse("classify a-h high").is_err());
        assert!(Command::parse("classify a-h 5 extra").is_err());
    }

    #[test]
    fn persist_derives_the_event_from_the_payload() {
        let line = r#"persist {"uid":"u1","type":"a-f-G","time":"2024-05-01T12:00:00Z","point":{"lat":1.5,"lon":2.5}}"#;
        let Some(Command::Persist(event)) = Command::parse(line).unwrap() else {
            panic!("expected a persist command");
        };
        assert_eq!(event.uid(), "u1");
        assert_eq!(event.event_type(), "a-f-G");
    }

    #[test]
    fn rejects_unknown_and_incomplete_commands() {
        assert!(Command::parse("explode").is_err());
        assert!(Command::parse("remove").is_err());
        assert!(Command::parse("swap").is_err());
        assert!(Command::parse("persist").is_err());
        assert!(Command::parse("persist {not json").is_err());
    }
}

use std::sync::LazyLock;

use regex::Regex;

static COMMAND_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/cmd\s+([a-z0-9]+:\d+|[A-Z0-9]{8})\s+(.+)$").unwrap()
});

static CALLBACK_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:personal|group|session):(\d+)$").unwrap());

/// A parsed chat command (spec §4.8 "Parsing").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    /// Anything that didn't match a known form; reply with usage.
    Usage,
    Run { identifier: String, command: String },
}

pub fn parse_command(text: &str) -> Command {
    let trimmed = text.trim();
    match trimmed {
        "/start" => return Command::Start,
        "/help" => return Command::Help,
        _ => {}
    }
    if let Some(captures) = COMMAND_LINE.captures(trimmed) {
        return Command::Run {
            identifier: captures[1].to_string(),
            command: captures[2].to_string(),
        };
    }
    Command::Usage
}

/// Extracts `N` from a `personal:N` / `group:N` / `session:N` callback
/// payload (spec §4.8 "Callback buttons").
pub fn parse_callback_number(data: &str) -> Option<i64> {
    CALLBACK_DATA
        .captures(data)
        .and_then(|c| c[1].parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cmd_with_identifier_pair() {
        let command = parse_command("/cmd kr4:1 ls -la");
        assert_eq!(
            command,
            Command::Run {
                identifier: "kr4:1".to_string(),
                command: "ls -la".to_string(),
            }
        );
    }

    #[test]
    fn parses_cmd_with_token() {
        let command = parse_command("/cmd A1B2C3D4 pwd");
        assert_eq!(
            command,
            Command::Run {
                identifier: "A1B2C3D4".to_string(),
                command: "pwd".to_string(),
            }
        );
    }

    #[test]
    fn start_and_help_are_recognised() {
        assert_eq!(parse_command("/start"), Command::Start);
        assert_eq!(parse_command("/help"), Command::Help);
    }

    #[test]
    fn unrecognised_input_is_usage() {
        assert_eq!(parse_command("hello there"), Command::Usage);
        assert_eq!(parse_command("/cmd badid ls"), Command::Usage);
    }

    #[test]
    fn callback_numbers_parse_for_all_prefixes() {
        assert_eq!(parse_callback_number("personal:3"), Some(3));
        assert_eq!(parse_callback_number("group:7"), Some(7));
        assert_eq!(parse_callback_number("session:1"), Some(1));
        assert_eq!(parse_callback_number("bogus:1"), None);
    }
}

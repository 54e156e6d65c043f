//! Wire message type.
//!
//! A frame is `[":" prefix SPACE] command *(SPACE param) [SPACE ":" trailing]`
//! with CR-LF termination handled by the codec. Parsing works on the line
//! content only; NUL or a stray terminator anywhere in it is a framing
//! violation.
use std::fmt;

/// A decoded IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Sender prefix (`nick!user@host` or a server name), when present.
    pub prefix: Option<String>,
    /// Command word or three-digit numeric.
    pub command: String,
    /// Parameters; a trailing parameter keeps its embedded spaces.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix present but missing command")]
    MissingCommand,
    #[error("NUL or stray line terminator inside message")]
    FramingViolation,
}

/// Take the next space-delimited word off the front of `rest`.
fn next_word(rest: &str) -> (&str, &str) {
    match rest.split_once(' ') {
        Some((word, tail)) => (word, tail),
        None => (rest, ""),
    }
}

impl Message {
    /// Build a message with no prefix.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params,
        }
    }

    /// Build a message carrying a sender prefix.
    pub fn with_prefix(
        prefix: impl Into<String>,
        command: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            prefix: Some(prefix.into()),
            command: command.into(),
            params,
        }
    }

    /// Parse one line (without its CR-LF terminator).
    pub fn parse(input: &str) -> Result<Self, ParseError> {
        let line = input.trim_end_matches("\r\n");
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        if line.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
            return Err(ParseError::FramingViolation);
        }

        let mut rest = line;

        let prefix = match rest.strip_prefix(':') {
            Some(tagged) => {
                let (prefix, tail) = tagged.split_once(' ').ok_or(ParseError::MissingCommand)?;
                rest = tail;
                Some(prefix.to_owned())
            }
            None => None,
        };

        let (command, mut rest) = next_word(rest);
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            // A colon-led parameter swallows the remainder of the line.
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            let (word, tail) = next_word(rest);
            params.push(word.to_owned());
            rest = tail;
        }

        Ok(Self {
            prefix,
            command: command.to_owned(),
            params,
        })
    }

    /// The last parameter, or empty when there is none.
    pub fn trailing(&self) -> &str {
        self.params.last().map(String::as_str).unwrap_or("")
    }

    /// Render the wire form, without the CR-LF terminator.
    pub fn to_wire(&self) -> String {
        let mut out = match &self.prefix {
            Some(prefix) => format!(":{prefix} {}", self.command),
            None => self.command.clone(),
        };

        if let Some((trailing, middles)) = self.params.split_last() {
            for param in middles {
                out.push(' ');
                out.push_str(param);
            }
            // The final parameter always rides behind a colon, which is
            // valid regardless of content and keeps empty or spaced
            // values unambiguous.
            out.push_str(" :");
            out.push_str(trailing);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parsed(line: &str) -> Message {
        Message::parse(line).unwrap()
    }

    #[test]
    fn bare_command() {
        let msg = parsed("QUIT");
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert!(msg.params.is_empty());
        assert_eq!(msg.trailing(), "");
    }

    #[test]
    fn middle_params_split_on_spaces() {
        let msg = parsed("MODE #lobby +kl key 10");
        assert_eq!(msg.command, "MODE");
        assert_eq!(msg.params, vec!["#lobby", "+kl", "key", "10"]);
    }

    #[test]
    fn trailing_keeps_spaces() {
        let msg = parsed("PRIVMSG #lobby :Hello everyone!");
        assert_eq!(msg.params, vec!["#lobby", "Hello everyone!"]);
        assert_eq!(msg.trailing(), "Hello everyone!");
    }

    #[test]
    fn trailing_may_be_empty_or_start_with_colon() {
        assert_eq!(parsed("TOPIC #lobby :").params, vec!["#lobby", ""]);
        assert_eq!(parsed("PRIVMSG #lobby ::)").params, vec!["#lobby", ":)"]);
    }

    #[test]
    fn prefix_is_separated_from_command() {
        let msg = parsed(":Anonymous2!Anon@IRC PRIVMSG #lobby :hey");
        assert_eq!(msg.prefix.as_deref(), Some("Anonymous2!Anon@IRC"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#lobby", "hey"]);
    }

    #[test]
    fn numeric_command_parses_like_any_other() {
        let msg = parsed(":AnonIRC 001 tee :Welcome to AnonIRC");
        assert_eq!(msg.prefix.as_deref(), Some("AnonIRC"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["tee", "Welcome to AnonIRC"]);
    }

    #[test]
    fn terminator_is_tolerated_on_input() {
        assert_eq!(parsed("PING :server\r\n").params, vec!["server"]);
    }

    #[test]
    fn rejects_empty_and_prefix_only_lines() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
        assert_eq!(Message::parse(":lonely"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn rejects_embedded_control_bytes() {
        assert_eq!(
            Message::parse("PRIVMSG #lobby :he\0llo"),
            Err(ParseError::FramingViolation)
        );
        assert_eq!(
            Message::parse("PRIVMSG #lobby :a\nQUIT"),
            Err(ParseError::FramingViolation)
        );
    }

    #[test]
    fn wire_form_without_params() {
        assert_eq!(Message::new("QUIT", vec![]).to_wire(), "QUIT");
    }

    #[test]
    fn wire_form_colons_the_last_param() {
        let msg = Message::new("PRIVMSG", vec!["#lobby".into(), "Hello everyone!".into()]);
        assert_eq!(msg.to_wire(), "PRIVMSG #lobby :Hello everyone!");

        let msg = Message::new("TOPIC", vec!["#lobby".into(), String::new()]);
        assert_eq!(msg.to_wire(), "TOPIC #lobby :");
    }

    #[test]
    fn wire_form_leads_with_the_prefix() {
        let msg = Message::with_prefix(
            "Anonymous!Anon@IRC",
            "PRIVMSG",
            vec!["#lobby".into(), "hey".into()],
        );
        assert_eq!(msg.to_wire(), ":Anonymous!Anon@IRC PRIVMSG #lobby :hey");
    }

    #[test]
    fn reparsing_the_wire_form_is_lossless() {
        for line in [
            "NICK :tee",
            "PING :anonirc12345",
            ":AnonIRC 001 tee :Welcome to AnonIRC",
            ":Anonymous2!Anon@IRC PRIVMSG #lobby :Hello everyone!",
            "USER tee 0 localhost :tee",
        ] {
            let msg = parsed(line);
            assert_eq!(parsed(&msg.to_wire()), msg, "through {line}");
        }
    }

    #[test]
    fn serializer_output_reparses_even_when_input_had_no_colon() {
        let msg = parsed("MODE #lobby +c");
        assert_eq!(msg.to_wire(), "MODE #lobby :+c");
        assert_eq!(parsed(&msg.to_wire()), msg);
    }
}

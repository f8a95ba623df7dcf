use std::borrow::Cow;

/// Size of the fixed read buffer used by both sides of the relay.
pub const DEFAULT_MAX_MESSAGE: usize = 256;

/// Payload that makes the server tear down the sending connection.
pub const QUIT: &str = "quit";

/// Payloads that end a client session after they have been sent.
pub const CLIENT_EXIT_TOKENS: &[&str] = &[QUIT, "exit"];

const LABEL_DELIMITER: char = ':';
const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// One read's worth of text, split into the optional sender label and the payload.
///
/// The wire is unframed: a single read may hold part of a message or several
/// concatenated ones. Only the first `:` is significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<'a> {
    text: Cow<'a, str>,
    split: Option<usize>,
}

impl<'a> Message<'a> {
    pub fn parse(bytes: &'a [u8]) -> Self {
        let text = String::from_utf8_lossy(bytes);
        let split = text.find(LABEL_DELIMITER);
        Self { text, split }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text before the first delimiter, if the message carries one.
    pub fn label(&self) -> Option<&str> {
        self.split.map(|at| &self.text[..at])
    }

    pub fn payload(&self) -> &str {
        match self.split {
            Some(at) => &self.text[at + LABEL_DELIMITER.len_utf8()..],
            None => &self.text,
        }
    }

    pub fn is_quit(&self) -> bool {
        self.payload().trim_end_matches(LINE_ENDINGS) == QUIT
    }
}

/// Builds the `<username>:<text>` form a client puts on the wire.
pub fn compose(username: &str, text: &str) -> String {
    format!("{username}{LABEL_DELIMITER}{text}")
}

pub fn is_client_exit(line: &str) -> bool {
    CLIENT_EXIT_TOKENS.contains(&line)
}

/// Usernames become the sender label, so they must be non-empty and free of the delimiter.
pub fn validate_username(username: &str) -> Result<(), &'static str> {
    if username.is_empty() {
        return Err("username cannot be empty");
    }
    if username.contains(LABEL_DELIMITER) {
        return Err("username cannot contain ':'");
    }
    Ok(())
}

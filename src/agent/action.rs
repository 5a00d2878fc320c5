//! Action extraction and completion detection

use regex::Regex;

/// A single shell command taken from an assistant reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub raw_text: String,
}

/// Pulls the command out of a fenced block in the model's reply
#[derive(Debug, Clone)]
pub struct ActionParser {
    pattern: Regex,
}

impl ActionParser {
    /// Compile `pattern`; its first capture group is the command. The pattern
    /// is matched with `.` spanning newlines.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = Regex::new(&format!("(?s){pattern}"))?;
        Ok(Self { pattern })
    }

    /// Exactly one match yields the trimmed command; otherwise the number of
    /// matches found is returned as the error.
    pub fn parse(&self, content: &str) -> Result<Action, usize> {
        let mut matches = self
            .pattern
            .captures_iter(content)
            .filter_map(|c| c.get(1).map(|m| m.as_str()));

        match (matches.next(), matches.next()) {
            (Some(command), None) => Ok(Action {
                raw_text: command.trim().to_string(),
            }),
            (None, _) => Err(0),
            (Some(_), Some(_)) => Err(2 + matches.count()),
        }
    }
}

/// If the first non-blank line of `output` is one of `markers`, return the
/// text after that line.
pub fn completion_output(output: &str, markers: &[String]) -> Option<String> {
    let mut lines = output.trim_start().split_inclusive('\n');
    let first = lines.next()?;
    if markers.iter().any(|m| m == first.trim()) {
        Some(lines.collect())
    } else {
        None
    }
}

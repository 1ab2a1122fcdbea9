//! Parsing of clamd response lines: `<path>: [<description>[(<hash>:<size>)] ]<status>`.

use regex::Regex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Found,
    Error,
    ParseError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Found => "FOUND",
            Status::Error => "ERROR",
            Status::ParseError => "PARSE ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One response line. `raw` is always the line as received (trailing whitespace trimmed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub raw: String,
    pub path: String,
    pub description: String,
    pub hash: String,
    pub size: u64,
    pub status: Status,
}

impl CommandResult {
    fn parse_error(raw: &str, description: String) -> Self {
        CommandResult {
            raw: raw.to_string(),
            path: String::new(),
            description,
            hash: String::new(),
            size: 0,
            status: Status::ParseError,
        }
    }

    pub fn is_found(&self) -> bool {
        self.status == Status::Found
    }
}

/// Owns the compiled line grammar; build once and reuse for every line.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    line: Regex,
}

impl ResponseParser {
    pub fn new() -> Result<Self, regex::Error> {
        let line = Regex::new(r"^([^:]+): (?:([^:]+?)(?:\(([^:]+):([^)]*)\))? )?(\S+)$")?;
        Ok(ResponseParser { line })
    }

    /// Never fails: lines outside the grammar come back as [`Status::ParseError`].
    pub fn parse(&self, raw: &str) -> CommandResult {
        let caps = match self.line.captures(raw) {
            Some(c) => c,
            None => return CommandResult::parse_error(raw, "line does not match response grammar".into()),
        };
        let token = caps.get(5).map_or("", |m| m.as_str());
        let status = match token {
            "OK" => Status::Ok,
            "FOUND" => Status::Found,
            "ERROR" => Status::Error,
            other => return CommandResult::parse_error(raw, format!("invalid status field: {}", other)),
        };
        let text = |i: usize| caps.get(i).map_or(String::new(), |m| m.as_str().to_string());
        CommandResult {
            raw: raw.to_string(),
            path: text(1),
            description: text(2),
            hash: text(3),
            // malformed sizes read as zero
            size: caps.get(4).and_then(|m| m.as_str().parse().ok()).unwrap_or(0),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ResponseParser {
        ResponseParser::new().unwrap()
    }

    #[test]
    fn clean_stream() {
        let r = parser().parse("stream: OK");
        assert_eq!(r.status, Status::Ok);
        assert_eq!(r.path, "stream");
        assert_eq!(r.description, "");
        assert_eq!(r.size, 0);
    }

    #[test]
    fn found_with_signature() {
        let r = parser().parse("stream: Eicar-Test-Signature FOUND");
        assert_eq!(r.status, Status::Found);
        assert_eq!(r.path, "stream");
        assert_eq!(r.description, "Eicar-Test-Signature");
        assert!(r.is_found());
    }

    #[test]
    fn found_with_hash_and_size() {
        let line = format!("{}: {}({}:{}) {}", "/tmp/eicar.com", "Win.Test.EICAR_HDB-1", "44d88612fea8a8f36de82e1278abb02f", 68, "FOUND");
        let r = parser().parse(&line);
        assert_eq!(r.path, "/tmp/eicar.com");
        assert_eq!(r.description, "Win.Test.EICAR_HDB-1");
        assert_eq!(r.hash, "44d88612fea8a8f36de82e1278abb02f");
        assert_eq!(r.size, 68);
        assert_eq!(r.status, Status::Found);
        assert_eq!(r.raw, line);
    }

    #[test]
    fn malformed_size_reads_as_zero() {
        let r = parser().parse("stream: Sig(abcd:12x) FOUND");
        assert_eq!(r.status, Status::Found);
        assert_eq!(r.hash, "abcd");
        assert_eq!(r.size, 0);
    }

    #[test]
    fn error_status() {
        let r = parser().parse("stream: Size limit reached ERROR");
        assert_eq!(r.status, Status::Error);
        assert_eq!(r.description, "Size limit reached");
    }

    #[test]
    fn unknown_status_token_is_parse_error() {
        let r = parser().parse("stream: Something WEIRD");
        assert_eq!(r.status, Status::ParseError);
        assert_eq!(r.description, "invalid status field: WEIRD");
        assert_eq!(r.raw, "stream: Something WEIRD");
    }

    #[test]
    fn non_grammar_lines_keep_raw() {
        for line in ["PONG", "ClamAV 0.102.1/25701/Mon Jan 20 12:41:43 2020", ""] {
            let r = parser().parse(line);
            assert_eq!(r.status, Status::ParseError);
            assert_eq!(r.raw, line);
        }
    }
}

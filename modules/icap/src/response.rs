//! Verdict extraction from raw ICAP responses.
//!
//! The three patterns are matched independently and unanchored over the whole response,
//! so a threat header anywhere in the bytes counts as a detection.

use regex::bytes::Regex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IcapResponse {
    /// Version from a `Server: C-ICAP/<version>` header; empty when absent.
    pub server_version: String,
    pub code: Option<u16>,
    /// Name captured from `X-Infection-Found: ... Threat=<name>;`.
    pub threat: Option<String>,
}

impl IcapResponse {
    pub fn detected(&self) -> bool {
        self.threat.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct IcapParser {
    server_version: Regex,
    code: Regex,
    threat: Regex,
}

impl IcapParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(IcapParser {
            server_version: Regex::new(r"Server: C-ICAP/(.+?)\r?\n")?,
            code: Regex::new(r"ICAP/1\.0 (\d+)")?,
            threat: Regex::new(r"X-Infection-Found: .*Threat=(.*);")?,
        })
    }

    pub fn parse(&self, raw: &[u8]) -> IcapResponse {
        let text = |re: &Regex| re.captures(raw).and_then(|c| c.get(1)).map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned());
        IcapResponse {
            server_version: text(&self.server_version).unwrap_or_default(),
            code: text(&self.code).and_then(|c| c.parse().ok()),
            threat: text(&self.threat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> IcapParser {
        IcapParser::new().unwrap()
    }

    #[test]
    fn clean_response() {
        let r = parser().parse(b"ICAP/1.0 200 OK\r\nServer: C-ICAP/0.5.6\r\nISTag: CI0001-XXXXXXXXX\r\nEncapsulated: res-hdr=0, res-body=20\r\n\r\n");
        assert_eq!(r.code, Some(200));
        assert_eq!(r.server_version, "0.5.6");
        assert!(!r.detected());
    }

    #[test]
    fn infection_header_sets_detected() {
        let r = parser().parse(
            b"ICAP/1.0 200 OK\r\nServer: C-ICAP/0.5.6\r\nX-Infection-Found: Type=0; Resolution=2; Threat=Eicar-Test-Signature;\r\n\r\n",
        );
        assert_eq!(r.code, Some(200));
        assert!(r.detected());
        assert_eq!(r.threat.as_deref(), Some("Eicar-Test-Signature"));
    }

    #[test]
    fn detection_does_not_depend_on_code() {
        let r = parser().parse(b"ICAP/1.0 204 No Content\r\nX-Infection-Found: Type=0; Resolution=2; Threat=;\r\n\r\n");
        assert_eq!(r.code, Some(204));
        assert!(r.detected());
    }

    #[test]
    fn missing_or_bad_code_is_unknown() {
        assert_eq!(parser().parse(b"HTTP/1.1 400 Bad Request\r\n\r\n").code, None);
        assert_eq!(parser().parse(b"ICAP/1.0 99999999 Huge\r\n").code, None);
        assert_eq!(parser().parse(b""), IcapResponse::default());
    }
}

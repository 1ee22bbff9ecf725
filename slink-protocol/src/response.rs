use crate::error::{ProtocolError, Result};

/// Error code carried by v4 (and extended v3) `ERROR` replies.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Unsupported,
    Unexpected,
    Unauthorized,
    Limit,
    Arguments,
    Auth,
    Internal,
}

impl ErrorCode {
    fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "UNSUPPORTED" => Some(Self::Unsupported),
            "UNEXPECTED" => Some(Self::Unexpected),
            "UNAUTHORIZED" => Some(Self::Unauthorized),
            "LIMIT" => Some(Self::Limit),
            "ARGUMENTS" => Some(Self::Arguments),
            "AUTH" => Some(Self::Auth),
            "INTERNAL" => Some(Self::Internal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "UNSUPPORTED",
            Self::Unexpected => "UNEXPECTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Limit => "LIMIT",
            Self::Arguments => "ARGUMENTS",
            Self::Auth => "AUTH",
            Self::Internal => "INTERNAL",
        }
    }
}

/// A single-line server reply to a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error {
        code: Option<ErrorCode>,
        description: String,
    },
    End,
}

impl Response {
    /// Parse a reply line; trailing CR/LF is tolerated.
    ///
    /// With extended replies active the status token may be followed by a
    /// human-readable explanation, which lands in `description`.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);

        let is_ok = line.eq_ignore_ascii_case("OK")
            || (line.len() > 3 && line[..3].eq_ignore_ascii_case("OK "));
        if is_ok {
            return Ok(Self::Ok);
        }
        if line.eq_ignore_ascii_case("END") {
            return Ok(Self::End);
        }
        if line.len() >= 5 && line[..5].eq_ignore_ascii_case("ERROR") {
            let rest = line[5..].trim();
            if rest.is_empty() {
                return Ok(Self::Error {
                    code: None,
                    description: String::new(),
                });
            }
            let mut parts = rest.splitn(2, ' ');
            let first = parts.next().unwrap_or("");
            let remainder = parts.next().unwrap_or("").trim().to_owned();
            return Ok(match ErrorCode::parse(first) {
                Some(code) => Self::Error {
                    code: Some(code),
                    description: remainder,
                },
                None => Self::Error {
                    code: None,
                    description: rest.to_owned(),
                },
            });
        }

        Err(ProtocolError::InvalidResponse(line.to_owned()))
    }
}

/// Parsed two-line `HELLO` response.
///
/// The first line has the shape `<software> v<major>.<minor> <extra>`,
/// optionally followed by `:: <capability flags>`. A server whose version
/// cannot be parsed is reported as `0.0`, meaning minimum functionality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub software: String,
    pub major: u8,
    pub minor: u8,
    pub capabilities: Vec<String>,
    pub organization: String,
}

impl Hello {
    pub fn parse(line1: &str, line2: &str) -> Self {
        let line1 = line1.trim_end_matches(['\r', '\n']);
        let organization = line2.trim_end_matches(['\r', '\n']).to_owned();

        let (ident, caps) = match line1.find("::") {
            Some(idx) => (line1[..idx].trim(), line1[idx + 2..].trim()),
            None => (line1.trim(), ""),
        };

        let capabilities: Vec<String> =
            caps.split_whitespace().map(|s| s.to_owned()).collect();

        let software = ident
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_owned();

        // Scan for a "v<major>.<minor>" token anywhere in the identifier.
        let (major, minor) = ident
            .split_whitespace()
            .find_map(|token| {
                let tail = token.strip_prefix(['v', 'V'])?;
                parse_version(tail)
            })
            .unwrap_or((0, 0));

        Self {
            software,
            major,
            minor,
            capabilities,
            organization,
        }
    }

    /// Compare the server version against `(major, minor)`.
    pub fn at_least(&self, major: u8, minor: u8) -> bool {
        (self.major, self.minor) >= (major, minor)
    }

    pub fn has_capability(&self, flag: &str) -> bool {
        self.capabilities.iter().any(|c| c == flag)
    }
}

/// Parse `"<major>.<minor>"`; a bare major is accepted with minor 0.
pub fn parse_version(text: &str) -> Option<(u8, u8)> {
    let text = text.trim_end_matches(|c: char| !c.is_ascii_digit());
    match text.split_once('.') {
        Some((major, minor)) => Some((major.parse().ok()?, minor.parse().ok()?)),
        None => Some((text.parse().ok()?, 0)),
    }
}

//! G/M/T-codes: the unit of work a channel schedules.
//!
//! A [`Code`] is parsed from one line of text, either submitted by a client or
//! read from a macro file, and later serialized into a Code packet by
//! `request::encode_code`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::wire::WireError;

// ── Channels ──────────────────────────────────────────────────────────────────

/// Independent input queue of the firmware. The discriminant is the channel
/// number on the wire and its bit in reply flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodeChannel {
    Http = 0,
    Telnet = 1,
    File = 2,
    Usb = 3,
    Aux = 4,
    Trigger = 5,
    Queue = 6,
    Lcd = 7,
    Sbc = 8,
    Daemon = 9,
    Aux2 = 10,
    Autopause = 11,
}

impl CodeChannel {
    pub const ALL: [CodeChannel; 12] = [
        Self::Http,
        Self::Telnet,
        Self::File,
        Self::Usb,
        Self::Aux,
        Self::Trigger,
        Self::Queue,
        Self::Lcd,
        Self::Sbc,
        Self::Daemon,
        Self::Aux2,
        Self::Autopause,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Telnet => "telnet",
            Self::File => "file",
            Self::Usb => "usb",
            Self::Aux => "aux",
            Self::Trigger => "trigger",
            Self::Queue => "queue",
            Self::Lcd => "lcd",
            Self::Sbc => "sbc",
            Self::Daemon => "daemon",
            Self::Aux2 => "aux2",
            Self::Autopause => "autopause",
        }
    }
}

impl TryFrom<u8> for CodeChannel {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownChannel(value))
    }
}

impl fmt::Display for CodeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CodeChannel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| ParseError::UnknownChannel(s.to_string()))
    }
}

// ── Codes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeType {
    G,
    M,
    T,
}

impl CodeType {
    pub fn letter(self) -> u8 {
        match self {
            Self::G => b'G',
            Self::M => b'M',
            Self::T => b'T',
        }
    }
}

/// Bit flags carried in the code header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeFlags(pub u8);

impl CodeFlags {
    pub const HAS_FILE_POSITION: Self = Self(0x01);
    pub const FROM_MACRO: Self = Self(0x02);
    pub const ENFORCE_ABSOLUTE_POSITION: Self = Self(0x04);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterValue {
    Int(i32),
    UInt(u32),
    Float(f32),
    String(String),
    /// `{...}` expression, evaluated by the firmware.
    Expression(String),
    IntArray(Vec<i32>),
    UIntArray(Vec<u32>),
    FloatArray(Vec<f32>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    pub letter: char,
    pub value: ParameterValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    pub channel: CodeChannel,
    pub kind: CodeType,
    /// -1 for a bare `T` that only queries the current tool.
    pub major: i32,
    pub minor: Option<i32>,
    pub parameters: Vec<CodeParameter>,
    /// Byte offset of the line within its macro file.
    pub file_position: Option<u32>,
    pub flags: CodeFlags,
}

impl Code {
    pub fn new(channel: CodeChannel, kind: CodeType, major: i32) -> Self {
        Self {
            channel,
            kind,
            major,
            minor: None,
            parameters: Vec::new(),
            file_position: None,
            flags: CodeFlags::default(),
        }
    }

    /// Parse one line. Returns `Ok(None)` for blank and comment-only lines.
    pub fn parse(line: &str, channel: CodeChannel) -> Result<Option<Code>, ParseError> {
        let text = strip_comments(line);
        let mut text = text.trim();
        if text.is_empty() {
            return Ok(None);
        }

        // line number prefix and trailing checksum as sent by serial hosts
        if let Some(rest) = text.strip_prefix(['N', 'n']) {
            let digits = rest.trim_start_matches(|c: char| c.is_ascii_digit());
            if digits.len() < rest.len() {
                text = digits.trim_start();
            }
        }
        if let Some(star) = text.rfind('*') {
            if text[star + 1..].chars().all(|c| c.is_ascii_digit()) && !in_quotes(text, star) {
                text = text[..star].trim_end();
            }
        }
        if text.is_empty() {
            return Ok(None);
        }

        let kind = match text.chars().next().map(|c| c.to_ascii_uppercase()) {
            Some('G') => CodeType::G,
            Some('M') => CodeType::M,
            Some('T') => CodeType::T,
            _ => return Err(ParseError::UnknownCode(text.to_string())),
        };

        let number_end = text[1..]
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
            .map(|i| i + 1)
            .unwrap_or(text.len());
        let number = &text[1..number_end];
        let (major, minor) = if number.is_empty() {
            if kind != CodeType::T {
                return Err(ParseError::MissingNumber(text.to_string()));
            }
            (-1, None)
        } else {
            match number.split_once('.') {
                Some((major, minor)) => (
                    parse_int(major, text)?,
                    Some(parse_int(minor, text)?),
                ),
                None => (parse_int(number, text)?, None),
            }
        };

        let mut code = Code::new(channel, kind, major);
        code.minor = minor;
        let rest = text[number_end..].trim();
        code.parameters = if kind == CodeType::M
            && UNPRECEDENTED_STRING_CODES.contains(&major)
            && !rest.is_empty()
            && !starts_with_parameter(rest)
        {
            vec![CodeParameter {
                letter: UNPRECEDENTED_LETTER,
                value: ParameterValue::String(rest.to_string()),
            }]
        } else {
            parse_parameters(rest)?
        };
        Ok(Some(code))
    }

    pub fn parameter(&self, letter: char) -> Option<&ParameterValue> {
        let letter = letter.to_ascii_uppercase();
        self.parameters.iter().find(|p| p.letter == letter).map(|p| &p.value)
    }

    /// Short form like `G1` or `M98.1`, used in logs.
    pub fn short_name(&self) -> String {
        match (self.kind, self.minor) {
            (CodeType::T, _) if self.major < 0 => "T".to_string(),
            (kind, Some(minor)) => format!("{}{}.{}", kind.letter() as char, self.major, minor),
            (kind, None) => format!("{}{}", kind.letter() as char, self.major),
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_name())?;
        for p in &self.parameters {
            if let (UNPRECEDENTED_LETTER, ParameterValue::String(s)) = (p.letter, &p.value) {
                write!(f, " {s}")?;
                continue;
            }
            write!(f, " {}", p.letter)?;
            match &p.value {
                ParameterValue::Int(v) => write!(f, "{v}")?,
                ParameterValue::UInt(v) => write!(f, "{v}")?,
                ParameterValue::Float(v) => write!(f, "{v}")?,
                ParameterValue::String(s) => write!(f, "\"{}\"", s.replace('"', "\"\""))?,
                ParameterValue::Expression(e) => f.write_str(e)?,
                ParameterValue::IntArray(v) => write_array(f, v)?,
                ParameterValue::UIntArray(v) => write_array(f, v)?,
                ParameterValue::FloatArray(v) => write_array(f, v)?,
            }
        }
        Ok(())
    }
}

fn write_array<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(":")?;
        }
        write!(f, "{v}")?;
    }
    Ok(())
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// M-codes whose argument may be a bare string, e.g. `M23 job.g`.
const UNPRECEDENTED_STRING_CODES: [i32; 7] = [23, 28, 30, 32, 36, 38, 117];

/// Letter recorded for a bare string argument.
pub const UNPRECEDENTED_LETTER: char = '@';

fn starts_with_parameter(rest: &str) -> bool {
    let mut chars = rest.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(l), Some('"')) if l.is_ascii_alphabetic()
    )
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("not a G, M or T code: {0}")]
    UnknownCode(String),

    #[error("code without a number: {0}")]
    MissingNumber(String),

    #[error("invalid code number in {0}")]
    InvalidNumber(String),

    #[error("unterminated string in parameter {0}")]
    UnterminatedString(char),

    #[error("unterminated expression in parameter {0}")]
    UnterminatedExpression(char),

    #[error("unexpected character {0:?} in parameter list")]
    UnexpectedCharacter(char),

    #[error("unknown code channel: {0}")]
    UnknownChannel(String),
}

fn parse_int(s: &str, line: &str) -> Result<i32, ParseError> {
    s.parse().map_err(|_| ParseError::InvalidNumber(line.to_string()))
}

fn in_quotes(text: &str, pos: usize) -> bool {
    text[..pos].chars().filter(|&c| c == '"').count() % 2 == 1
}

/// Drop `;` line comments and `( )` inline comments outside of strings.
fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_string = false;
    let mut paren_depth = 0usize;
    let mut brace_depth = 0usize;
    for c in line.chars() {
        match c {
            '"' if paren_depth == 0 => {
                in_string = !in_string;
                out.push(c);
            }
            ';' if !in_string && paren_depth == 0 => break,
            '{' if !in_string && paren_depth == 0 => {
                brace_depth += 1;
                out.push(c);
            }
            '}' if !in_string && paren_depth == 0 => {
                brace_depth = brace_depth.saturating_sub(1);
                out.push(c);
            }
            '(' if !in_string && brace_depth == 0 => paren_depth += 1,
            ')' if !in_string && paren_depth > 0 => paren_depth -= 1,
            _ if paren_depth > 0 => {}
            _ => out.push(c),
        }
    }
    out
}

fn parse_parameters(text: &str) -> Result<Vec<CodeParameter>, ParseError> {
    let mut params = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if !c.is_ascii_alphabetic() {
            return Err(ParseError::UnexpectedCharacter(c));
        }

        let letter = c.to_ascii_uppercase();
        i += 1;

        let value = match chars.get(i) {
            Some('"') => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::UnterminatedString(letter)),
                        Some('"') if chars.get(i + 1) == Some(&'"') => {
                            s.push('"');
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                    }
                }
                ParameterValue::String(s)
            }
            Some('{') => {
                let start = i;
                let mut depth = 0usize;
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::UnterminatedExpression(letter)),
                        Some('{') => depth += 1,
                        Some('}') => {
                            depth -= 1;
                            if depth == 0 {
                                i += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
                ParameterValue::Expression(chars[start..i].iter().collect())
            }
            _ => {
                let start = i;
                while i < chars.len() && !chars[i].is_whitespace() && !chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let token: String = chars[start..i].iter().collect();
                parse_value(&token)
            }
        };
        params.push(CodeParameter { letter, value });
    }

    Ok(params)
}

fn parse_value(token: &str) -> ParameterValue {
    if token.contains(':') {
        let parts: Vec<&str> = token.split(':').collect();
        if let Ok(v) = parts.iter().map(|p| p.parse::<i32>()).collect::<Result<Vec<_>, _>>() {
            return ParameterValue::IntArray(v);
        }
        if let Ok(v) = parts.iter().map(|p| p.parse::<u32>()).collect::<Result<Vec<_>, _>>() {
            return ParameterValue::UIntArray(v);
        }
        if let Ok(v) = parts.iter().map(|p| p.parse::<f32>()).collect::<Result<Vec<_>, _>>() {
            return ParameterValue::FloatArray(v);
        }
        return ParameterValue::String(token.to_string());
    }
    if let Ok(v) = token.parse::<i32>() {
        ParameterValue::Int(v)
    } else if let Ok(v) = token.parse::<u32>() {
        ParameterValue::UInt(v)
    } else if let Ok(v) = token.parse::<f32>() {
        ParameterValue::Float(v)
    } else {
        ParameterValue::String(token.to_string())
    }
}

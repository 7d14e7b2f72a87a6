//! Parser for the stored AI-insight column.
//!
//! The column holds a literal list of `(title, description)` pairs, e.g.
//! `[("Claim", "States a statistic"), ("Source", "None given")]`. Only that
//! shape is accepted: a list whose items are two-element tuples or lists of
//! quoted strings. Anything else is rejected with an [`InsightParseError`].

use std::{iter::Peekable, str::CharIndices};

use thiserror::Error;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InsightEntry {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum InsightParseError {
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("expected {expected} at byte {offset}, found {found:?}")]
    Unexpected {
        expected: &'static str,
        found: char,
        offset: usize,
    },
    #[error("invalid escape sequence at byte {offset}")]
    InvalidEscape { offset: usize },
    #[error("trailing content at byte {offset}")]
    TrailingContent { offset: usize },
}

/// Parse a stored insight value. Blank input and the `nan` placeholder written by
/// spreadsheet exports both mean "no insight".
pub fn parse_insight(raw: &str) -> Result<Vec<InsightEntry>, InsightParseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        return Ok(Vec::new());
    }

    let mut parser = Parser {
        chars: raw.char_indices().peekable(),
    };
    let entries = parser.list()?;
    parser.skip_whitespace();
    if let Some((offset, _)) = parser.chars.peek() {
        return Err(InsightParseError::TrailingContent { offset: *offset });
    }
    Ok(entries)
}

struct Parser<'a> {
    chars: Peekable<CharIndices<'a>>,
}

impl Parser<'_> {
    fn list(&mut self) -> Result<Vec<InsightEntry>, InsightParseError> {
        self.skip_whitespace();
        self.expect('[', "`[`")?;

        let mut entries = Vec::new();
        loop {
            self.skip_whitespace();
            if self.eat(']') {
                return Ok(entries);
            }
            entries.push(self.pair()?);
            self.skip_whitespace();
            if self.eat(',') {
                continue;
            }
            self.expect(']', "`,` or `]`")?;
            return Ok(entries);
        }
    }

    fn pair(&mut self) -> Result<InsightEntry, InsightParseError> {
        let close = match self.next()? {
            (_, '(') => ')',
            (_, '[') => ']',
            (offset, found) => {
                return Err(InsightParseError::Unexpected {
                    expected: "`(` or `[`",
                    found,
                    offset,
                });
            }
        };

        self.skip_whitespace();
        let title = self.string()?;
        self.skip_whitespace();
        self.expect(',', "`,`")?;
        self.skip_whitespace();
        let description = self.string()?;
        self.skip_whitespace();
        if self.eat(',') {
            self.skip_whitespace();
        }
        self.expect(close, "closing bracket")?;

        Ok(InsightEntry { title, description })
    }

    fn string(&mut self) -> Result<String, InsightParseError> {
        let quote = match self.next()? {
            (_, quote @ ('\'' | '"')) => quote,
            (offset, found) => {
                return Err(InsightParseError::Unexpected {
                    expected: "quoted string",
                    found,
                    offset,
                });
            }
        };

        let mut value = String::new();
        loop {
            match self.next()? {
                (_, c) if c == quote => return Ok(value),
                (offset, '\\') => value.push(self.escape(offset)?),
                (_, c) => value.push(c),
            }
        }
    }

    fn escape(&mut self, offset: usize) -> Result<char, InsightParseError> {
        let (_, c) = self.next()?;
        let decoded = match c {
            '\\' => '\\',
            '\'' => '\'',
            '"' => '"',
            'n' => '\n',
            't' => '\t',
            'r' => '\r',
            '0' => '\0',
            'x' => self.hex_escape(2, offset)?,
            'u' => self.hex_escape(4, offset)?,
            'U' => self.hex_escape(8, offset)?,
            _ => return Err(InsightParseError::InvalidEscape { offset }),
        };
        Ok(decoded)
    }

    fn hex_escape(&mut self, digits: usize, offset: usize) -> Result<char, InsightParseError> {
        let mut code = 0u32;
        for _ in 0..digits {
            let (_, c) = self.next()?;
            let digit = c
                .to_digit(16)
                .ok_or(InsightParseError::InvalidEscape { offset })?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or(InsightParseError::InvalidEscape { offset })
    }

    fn next(&mut self) -> Result<(usize, char), InsightParseError> {
        self.chars.next().ok_or(InsightParseError::UnexpectedEnd)
    }

    fn eat(&mut self, expected: char) -> bool {
        if matches!(self.chars.peek(), Some((_, c)) if *c == expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: char, label: &'static str) -> Result<(), InsightParseError> {
        match self.next()? {
            (_, c) if c == expected => Ok(()),
            (offset, found) => Err(InsightParseError::Unexpected {
                expected: label,
                found,
                offset,
            }),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }
}

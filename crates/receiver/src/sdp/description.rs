//! Session descriptions exchanged during negotiation

use crate::{Error, Result};
use std::fmt;

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

/// One line of a description with its stable position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpLine<'a> {
    pub index: usize,
    pub text: &'a str,
}

impl<'a> SdpLine<'a> {
    /// Line type letter (`v`, `o`, `m`, `a`, ...)
    pub fn kind(&self) -> Option<char> {
        self.text.chars().next()
    }

    /// Everything after `<type>=`
    pub fn value(&self) -> &'a str {
        self.text.get(2..).unwrap_or("")
    }
}

/// An immutable, validated session description
///
/// The text is kept exactly as produced (or pasted after sanitization); the
/// engine requires a local offer to be applied byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    sdp_type: SdpType,
    text: String,
}

impl SessionDescription {
    /// Validate `text` and wrap it
    ///
    /// The first line must be the version line and every line must have the
    /// `<letter>=<value>` shape.
    pub fn parse(sdp_type: SdpType, text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let mut lines = split_lines(&text).peekable();

        match lines.peek() {
            None => {
                return Err(Error::SdpError(format!("empty {} description", sdp_type)));
            }
            Some(first) if !first.starts_with("v=") => {
                return Err(Error::SdpError(format!(
                    "{} must start with a version line, got '{}'",
                    sdp_type, first
                )));
            }
            _ => {}
        }

        for (index, line) in lines.enumerate() {
            let mut chars = line.chars();
            let well_formed = matches!(
                (chars.next(), chars.next()),
                (Some(c), Some('=')) if c.is_ascii_lowercase()
            );
            if !well_formed {
                return Err(Error::SdpError(format!(
                    "malformed {} line {}: '{}'",
                    sdp_type, index, line
                )));
            }
        }

        Ok(Self { sdp_type, text })
    }

    pub fn offer(text: impl Into<String>) -> Result<Self> {
        Self::parse(SdpType::Offer, text)
    }

    pub fn answer(text: impl Into<String>) -> Result<Self> {
        Self::parse(SdpType::Answer, text)
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    /// Lines in order, without terminators
    pub fn lines(&self) -> impl Iterator<Item = SdpLine<'_>> {
        split_lines(&self.text)
            .enumerate()
            .map(|(index, text)| SdpLine { index, text })
    }
}

fn split_lines(text: &str) -> impl Iterator<Item = &str> {
    text.split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .filter(|l| !l.is_empty())
}

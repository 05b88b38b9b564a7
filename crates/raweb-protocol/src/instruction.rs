//! Guacamole instruction framing.
//!
//! An instruction is a comma-separated list of length-prefixed parts
//! terminated by `;`:
//!
//! ```text
//! 6.select,3.rdp;
//! ```
//!
//! Each part is `<length>.<content>` where `<length>` counts the Unicode
//! scalar values of `<content>`, not bytes. Because content is opaque once
//! its length is known, parts may freely contain `,` and `;`.
//!
//! Decoding is incremental: [`decode`] consumes as many complete
//! instructions as the buffer holds and hands back the unconsumed tail.
//! Running out of bytes is never an error.

use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;

/// Upper bound on buffered bytes that do not yet form a complete instruction.
pub const DEFAULT_MAX_PENDING: usize = 1024 * 1024;

// ---------------------------------------------------------------------------
// Instruction
// ---------------------------------------------------------------------------

/// One decoded protocol instruction. Part 0 is the opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    parts: Vec<String>,
}

impl Instruction {
    /// Build an instruction from an opcode and its arguments.
    pub fn new<I, S>(opcode: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parts = vec![opcode.into()];
        parts.extend(args.into_iter().map(Into::into));
        Self { parts }
    }

    /// Instruction with no arguments, e.g. `nop` or `disconnect`.
    pub fn bare(opcode: impl Into<String>) -> Self {
        Self {
            parts: vec![opcode.into()],
        }
    }

    /// Build from raw parts. Returns `None` for an empty list, which has no opcode.
    pub fn from_parts(parts: Vec<String>) -> Option<Self> {
        if parts.is_empty() {
            None
        } else {
            Some(Self { parts })
        }
    }

    pub fn opcode(&self) -> &str {
        &self.parts[0]
    }

    pub fn args(&self) -> &[String] {
        &self.parts[1..]
    }

    /// Argument at `index` (0 = first argument after the opcode).
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args().get(index).map(String::as_str)
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn into_parts(self) -> Vec<String> {
        self.parts
    }

    /// Wire form of this instruction.
    pub fn encode(&self) -> String {
        encode(&self.parts)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a list of parts into a single wire instruction.
pub fn encode<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        let part = part.as_ref();
        if i > 0 {
            out.push(',');
        }
        out.push_str(&part.chars().count().to_string());
        out.push('.');
        out.push_str(part);
    }
    out.push(';');
    out
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Result of scanning one instruction starting at some offset.
enum Scan {
    /// A full instruction ending (exclusive) at `end`.
    Complete { parts: Vec<String>, end: usize },
    /// The buffer ends before the instruction does.
    Incomplete,
}

/// Decode every complete instruction at the front of `buf`.
///
/// Returns the decoded instructions and the unconsumed remainder. The
/// remainder starts at the first incomplete instruction (or is empty).
pub fn decode(buf: &[u8]) -> Result<(Vec<Instruction>, &[u8]), CodecError> {
    let mut instructions = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        match scan_instruction(buf, pos, true)? {
            Scan::Complete { parts, end } => {
                // scan_instruction always yields at least one part
                if let Some(instruction) = Instruction::from_parts(parts) {
                    instructions.push(instruction);
                }
                pos = end;
            }
            Scan::Incomplete => break,
        }
    }

    Ok((instructions, &buf[pos..]))
}

/// Byte length of the longest prefix of `buf` made only of complete
/// instructions. Used to cut outgoing frames at instruction boundaries.
pub fn complete_len(buf: &[u8]) -> Result<usize, CodecError> {
    let mut pos = 0;
    while pos < buf.len() {
        match scan_instruction(buf, pos, false)? {
            Scan::Complete { end, .. } => pos = end,
            Scan::Incomplete => break,
        }
    }
    Ok(pos)
}

fn scan_instruction(buf: &[u8], start: usize, collect: bool) -> Result<Scan, CodecError> {
    let mut parts = Vec::new();
    let mut pos = start;

    loop {
        // Length prefix: digits up to '.'.
        let Some(dot) = buf[pos..].iter().position(|&b| b == b'.') else {
            return Ok(Scan::Incomplete);
        };
        let digits = &buf[pos..pos + dot];
        let Some(length) = parse_length(digits) else {
            return Ok(Scan::Incomplete);
        };
        let content_start = pos + dot + 1;

        let Some(content_end) = advance_chars(buf, content_start, length) else {
            return Ok(Scan::Incomplete);
        };

        if collect {
            let content = std::str::from_utf8(&buf[content_start..content_end])
                .map_err(|_| CodecError::InvalidUtf8 {
                    offset: content_start,
                })?;
            parts.push(content.to_owned());
        } else {
            std::str::from_utf8(&buf[content_start..content_end]).map_err(|_| {
                CodecError::InvalidUtf8 {
                    offset: content_start,
                }
            })?;
        }

        match buf.get(content_end) {
            None => return Ok(Scan::Incomplete),
            Some(b',') => pos = content_end + 1,
            Some(b';') => {
                return Ok(Scan::Complete {
                    parts,
                    end: content_end + 1,
                });
            }
            Some(&other) => {
                return Err(CodecError::UnexpectedTerminator {
                    offset: content_end,
                    byte: other,
                });
            }
        }
    }
}

fn parse_length(digits: &[u8]) -> Option<usize> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Byte offset reached after skipping `count` UTF-8 characters from `start`,
/// or `None` if the buffer runs out first.
fn advance_chars(buf: &[u8], start: usize, count: usize) -> Option<usize> {
    let mut pos = start;
    for _ in 0..count {
        let lead = *buf.get(pos)?;
        let width = match lead {
            0x00..=0x7F => 1,
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            // Stray continuation or invalid byte; let the UTF-8 check report it.
            _ => 1,
        };
        if pos + width > buf.len() {
            return None;
        }
        pos += width;
    }
    Some(pos)
}

// ---------------------------------------------------------------------------
// InstructionReader
// ---------------------------------------------------------------------------

/// Growing receive buffer that yields instructions as they complete.
#[derive(Debug)]
pub struct InstructionReader {
    buf: BytesMut,
    max_pending: usize,
}

impl InstructionReader {
    pub fn new() -> Self {
        Self::with_max_pending(DEFAULT_MAX_PENDING)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_pending,
        }
    }

    /// Append `data` and decode every instruction that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Instruction>, CodecError> {
        self.buf.extend_from_slice(data);
        let (instructions, rest) = decode(&self.buf)?;
        let consumed = self.buf.len() - rest.len();
        let _ = self.buf.split_to(consumed);
        self.check_pending()?;
        Ok(instructions)
    }

    /// Append `data` and split off the complete-instruction prefix without
    /// decoding it into parts. Returns `None` while no instruction is complete.
    pub fn push_raw(&mut self, data: &[u8]) -> Result<Option<Bytes>, CodecError> {
        self.buf.extend_from_slice(data);
        let len = complete_len(&self.buf)?;
        let chunk = if len == 0 {
            None
        } else {
            Some(self.buf.split_to(len).freeze())
        };
        self.check_pending()?;
        Ok(chunk)
    }

    /// Bytes held back because they do not yet form a complete instruction.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Hand over the buffered partial data, leaving the reader empty.
    pub fn take_pending(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn check_pending(&self) -> Result<(), CodecError> {
        if self.buf.len() > self.max_pending {
            return Err(CodecError::Overflow {
                pending: self.buf.len(),
                max: self.max_pending,
            });
        }
        Ok(())
    }
}

impl Default for InstructionReader {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

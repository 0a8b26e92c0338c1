//! # Handoff channel
//!
//! The victim publishes the runtime address of the target object through a
//! plain text file: one or two whitespace separated hexadecimal integers,
//! `[objectAddress] baseAddress`, each optionally `0x` prefixed.

use crate::deserializers::parse_hex;
use log::debug;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Size of one target word in bytes
pub const WORD_SIZE: u64 = 8;

/// Errors of the handoff channel and of target site resolution
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("handoff file {0} not found")]
    NotFound(PathBuf),
    #[error("handoff file is empty")]
    Empty,
    #[error("malformed handoff content: {0}")]
    MalformedHex(String),
    #[error("instruction index {index} out of range, routine {routine} has {count} instructions")]
    InstructionIndexOutOfRange {
        routine: String,
        index: usize,
        count: usize,
    },
    #[error("handoff file could not be read: {0}")]
    Io(String),
}

/// Addresses published by the victim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffRecord {
    /// Address of the enclosing object, passed to the reformat routine
    pub object_address: Option<u64>,
    /// Address of word zero of the target array
    pub base_address: u64,
}

impl HandoffRecord {
    /// Absolute address of word `index`, `None` on address overflow
    pub fn target_address(&self, index: usize) -> Option<u64> {
        (index as u64)
            .checked_mul(WORD_SIZE)
            .and_then(|offset| self.base_address.checked_add(offset))
    }
}

impl FromStr for HandoffRecord {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let parse = |token: &str| {
            let token = token.strip_prefix("0X").unwrap_or(token);
            parse_hex(token).map_err(ChannelError::MalformedHex)
        };
        match tokens.as_slice() {
            [] => Err(ChannelError::Empty),
            [base] => Ok(HandoffRecord {
                object_address: None,
                base_address: parse(base)?,
            }),
            [object, base] => Ok(HandoffRecord {
                object_address: Some(parse(object)?),
                base_address: parse(base)?,
            }),
            _ => Err(ChannelError::MalformedHex(format!(
                "expected one or two addresses, found {}",
                tokens.len()
            ))),
        }
    }
}

impl fmt::Display for HandoffRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(object) = self.object_address {
            writeln!(f, "{object:x}")?;
        }
        writeln!(f, "{:x}", self.base_address)
    }
}

/// Reader side of the handoff file.
///
/// Reading has no side effects and can be repeated; retrying after a failed
/// read is left to the caller.
#[derive(Debug, Clone)]
pub struct HandoffChannel {
    path: PathBuf,
}

impl HandoffChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<HandoffRecord, ChannelError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ChannelError::NotFound(self.path.clone()),
            _ => ChannelError::Io(e.to_string()),
        })?;
        let record = content.parse::<HandoffRecord>()?;
        debug!(
            "Handoff {}: object {:x?} base 0x{:x}",
            self.path.display(),
            record.object_address,
            record.base_address
        );
        Ok(record)
    }
}

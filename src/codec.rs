//! Bytecode form of a statement tree.
//!
//! The payload is a fixed header followed by the tree as JSON. Decoding yields a
//! tree identical to the encoded one; there are no execution semantics of its own.

use thiserror::Error;

use crate::ast::Stmt;

pub const MAGIC: &[u8; 4] = b"RVSB";
pub const FORMAT_VERSION: u8 = 1;

const HEADER_LEN: usize = MAGIC.len() + 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("missing bytecode header")]
    MissingHeader,
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed bytecode body: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type CodecResult<T> = Result<T, CodecError>;

pub fn encode(statements: &[Stmt]) -> CodecResult<Vec<u8>> {
    let mut bytes = Vec::with_capacity(HEADER_LEN + 64 * statements.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(FORMAT_VERSION);
    serde_json::to_writer(&mut bytes, statements)?;
    Ok(bytes)
}

pub fn decode(bytes: &[u8]) -> CodecResult<Vec<Stmt>> {
    if !is_bytecode(bytes) {
        return Err(CodecError::MissingHeader);
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(serde_json::from_slice(&bytes[HEADER_LEN..])?)
}

pub fn is_bytecode(bytes: &[u8]) -> bool {
    bytes.len() >= HEADER_LEN && bytes.starts_with(MAGIC)
}

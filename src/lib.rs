use std::{
    error::Error,
    fmt::{self, Display, Formatter},
    num::IntErrorKind,
    str::{self, FromStr},
};

use indexmap::IndexMap;
use serde_derive::Deserialize;

/// Every mnemonic is exactly this many bytes.
pub const MNEMONIC_LEN: usize = 5;

/// Width of a patched label address in the bytecode stream.
pub const ADDR_BYTES: usize = 8;

/// Bytes that terminate a label name or literal payload.
const DELIMITERS: [u8; 6] = [b' ', b'\n', b'#', b'!', b':', b'&'];

/// Bytes of source shown after the failure point in diagnostics.
const SNIPPET_MAX: usize = 256;

/// The built-in Xia instruction set. Position in the table is the opcode.
const XIA_MNEMONICS: &[&[u8; MNEMONIC_LEN]] = &[
    b"NOOP0", b"HALT0", b"PUSHC", b"PUSHS", b"PUSHI", b"PUSHL", b"DROP0", b"DUPE0", b"SWAP0",
    b"ADD01", b"SUB01", b"MUL01", b"DIV01", b"MOD01", b"NEG01", b"AND01", b"IOR01", b"XOR01",
    b"NOT01", b"SHLF0", b"SHRT0", b"CMPEQ", b"CMPLT", b"CMPGT", b"JUMP0", b"JZRO0", b"JNZR0",
    b"CALL0", b"RETRN", b"LOAD1", b"LOAD2", b"LOAD4", b"LOAD8", b"STOR1", b"STOR2", b"STOR4",
    b"STOR8", b"PRNT0", b"READ0",
];

#[derive(Debug)]
pub enum AsmError {
    Scan { offset: usize, snippet: String },
    TruncatedMnemonic { offset: usize, snippet: String },
    UnknownMnemonic { offset: usize, mnemonic: String },
    Literal { offset: usize, reason: LiteralError, snippet: String },
    Table { reason: String },
}

impl Display for AsmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan { offset, snippet } => {
                write!(f, "unknown token at offset {offset}:\n{snippet}")
            }
            Self::TruncatedMnemonic { offset, snippet } => {
                write!(f, "truncated mnemonic at offset {offset}:\n{snippet}")
            }
            Self::UnknownMnemonic { offset, mnemonic } => {
                write!(f, "unknown mnemonic \"{mnemonic}\" at offset {offset}")
            }
            Self::Literal {
                offset,
                reason,
                snippet,
            } => {
                write!(f, "{reason} at offset {offset}:\n{snippet}")
            }
            Self::Table { reason } => write!(f, "invalid opcode table: {reason}"),
        }
    }
}

impl Error for AsmError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralError {
    Malformed,
    OutOfRange,
}

impl Display for LiteralError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed decimal literal"),
            Self::OutOfRange => write!(f, "literal out of range for its width"),
        }
    }
}

impl Error for LiteralError {}

/// Width of a decoded literal. The single source of truth for how many
/// bytes a tag reserves, decodes to, and advances the write offset by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Short,
    Int,
    Long,
}

impl Width {
    pub const fn bytes(self) -> usize {
        match self {
            Self::Byte => 1,
            Self::Short => 2,
            Self::Int => 4,
            Self::Long => 8,
        }
    }

    fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            b'c' => Some(Self::Byte),
            b's' => Some(Self::Short),
            b'i' => Some(Self::Int),
            b'l' => Some(Self::Long),
            _ => None,
        }
    }

    fn fits(self, value: i64) -> bool {
        match self {
            Self::Byte => i8::try_from(value).is_ok(),
            Self::Short => i16::try_from(value).is_ok(),
            Self::Int => i32::try_from(value).is_ok(),
            Self::Long => true,
        }
    }
}

/// Parse a decimal ASCII span, optionally signed, checking that the value
/// fits `width` as a signed integer.
pub fn decode_literal(digits: &[u8], width: Width) -> Result<i64, LiteralError> {
    let text = str::from_utf8(digits).map_err(|_| LiteralError::Malformed)?;
    let value = i64::from_str(text).map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => LiteralError::OutOfRange,
        _ => LiteralError::Malformed,
    })?;
    if !width.fits(value) {
        return Err(LiteralError::OutOfRange);
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    /// Byte offset of the marker character in the source.
    pub offset: usize,
    pub kind: TokenKind<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind<'a> {
    Whitespace,
    Comment,
    Instruction(&'a [u8]),
    LabelDecl(&'a [u8]),
    LabelRef(&'a [u8]),
    Literal(Width, &'a [u8]),
}

/// Walks the source buffer left to right, classifying each position by its
/// leading marker character. Payload slices borrow from the source.
pub struct Scanner<'a> {
    src: &'a [u8],
    offset: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        Self { src, offset: 0 }
    }

    pub fn next(&mut self) -> Result<Option<Token<'a>>, AsmError> {
        let offset = self.offset;
        let marker = match self.src.get(offset) {
            Some(marker) => *marker,
            None => return Ok(None),
        };
        let kind = match marker {
            b' ' | b'\n' => {
                self.offset += 1;
                TokenKind::Whitespace
            }
            b'#' => {
                let rest = &self.src[offset..];
                // the newline is part of the advance
                self.offset += match rest.iter().position(|&b| b == b'\n') {
                    Some(index) => index + 1,
                    None => rest.len(),
                };
                TokenKind::Comment
            }
            b'!' => {
                if self.src.len() - offset < 1 + MNEMONIC_LEN {
                    return Err(AsmError::TruncatedMnemonic {
                        offset,
                        snippet: snippet(self.src, offset),
                    });
                }
                let mnemonic = &self.src[offset + 1..offset + 1 + MNEMONIC_LEN];
                self.offset += 1 + MNEMONIC_LEN;
                TokenKind::Instruction(mnemonic)
            }
            b':' => TokenKind::LabelDecl(self.payload()),
            b'&' => TokenKind::LabelRef(self.payload()),
            _ => match Width::from_marker(marker) {
                Some(width) => TokenKind::Literal(width, self.payload()),
                None => {
                    return Err(AsmError::Scan {
                        offset,
                        snippet: snippet(self.src, offset),
                    });
                }
            },
        };
        Ok(Some(Token { offset, kind }))
    }

    /// Span from the byte after the marker to the next delimiter (or EOF),
    /// advancing past the marker and the payload.
    fn payload(&mut self) -> &'a [u8] {
        let start = (self.offset + 1).min(self.src.len());
        let rest = &self.src[start..];
        let len = rest
            .iter()
            .position(|b| DELIMITERS.contains(b))
            .unwrap_or(rest.len());
        self.offset = start + len;
        &rest[..len]
    }
}

fn snippet(src: &[u8], offset: usize) -> String {
    let end = (offset + SNIPPET_MAX).min(src.len());
    String::from_utf8_lossy(&src[offset..end]).into_owned()
}

#[derive(Deserialize)]
struct OpcodeFile {
    mnemonics: Vec<String>,
}

/// Ordered list of fixed-width mnemonic names; position is the opcode.
pub struct OpcodeTable {
    names: Vec<[u8; MNEMONIC_LEN]>,
}

impl Default for OpcodeTable {
    fn default() -> Self {
        Self {
            names: XIA_MNEMONICS.iter().map(|name| **name).collect(),
        }
    }
}

impl OpcodeTable {
    /// Load a replacement table from a TOML document of the form
    /// `mnemonics = ["NAME1", ...]`.
    pub fn from_toml_str(text: &str) -> Result<Self, AsmError> {
        let file: OpcodeFile = toml::from_str(text).map_err(|e| AsmError::Table {
            reason: e.to_string(),
        })?;
        if file.mnemonics.is_empty() || file.mnemonics.len() > 256 {
            return Err(AsmError::Table {
                reason: format!("expected 1 to 256 mnemonics, got {}", file.mnemonics.len()),
            });
        }
        let mut names = Vec::with_capacity(file.mnemonics.len());
        for mnemonic in &file.mnemonics {
            let name: [u8; MNEMONIC_LEN] =
                mnemonic
                    .as_bytes()
                    .try_into()
                    .map_err(|_| AsmError::Table {
                        reason: format!("mnemonic \"{mnemonic}\" is not {MNEMONIC_LEN} bytes"),
                    })?;
            if names.contains(&name) {
                return Err(AsmError::Table {
                    reason: format!("duplicate mnemonic \"{mnemonic}\""),
                });
            }
            names.push(name);
        }
        Ok(Self { names })
    }

    pub fn opcode(&self, mnemonic: &[u8]) -> Option<u8> {
        self.names
            .iter()
            .position(|name| &name[..] == mnemonic)
            .map(|index| index as u8)
    }
}

/// The single destination for all emitted opcodes, literals, and patched
/// addresses. Its length is the current write offset.
#[derive(Default)]
pub struct BytecodeBuffer {
    data: Vec<u8>,
}

impl BytecodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append bytes, returning the offset they were written at.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        offset
    }

    /// Append `width` zero bytes, returning the offset reserved.
    pub fn reserve(&mut self, width: usize) -> usize {
        let offset = self.data.len();
        self.data.resize(offset + width, 0);
        offset
    }

    /// Overwrite existing bytes in place. Only resolution patching writes
    /// here, always within a previously reserved span.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(
            offset + bytes.len() <= self.data.len(),
            "write past end of buffer"
        );
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

struct LabelRef<'a> {
    name: &'a [u8],
    patch_site: usize,
}

/// The finished byte stream plus the names of references that matched no
/// declaration. An unresolved name is non-fatal for emission but marks the
/// build as failed; its patch site keeps its reserved zero bytes.
pub struct Output {
    pub bytes: Vec<u8>,
    pub unresolved: Vec<String>,
}

/// One forward pass over the source feeding the buffer and both symbol
/// tables, then one resolution pass patching every reference.
pub struct Assembler<'a> {
    table: &'a OpcodeTable,
    src: &'a [u8],
    buffer: BytecodeBuffer,
    labels: IndexMap<&'a [u8], u64>,
    refs: Vec<LabelRef<'a>>,
}

impl<'a> Assembler<'a> {
    pub fn new(table: &'a OpcodeTable, src: &'a [u8]) -> Self {
        Self {
            table,
            src,
            buffer: BytecodeBuffer::new(),
            labels: IndexMap::new(),
            refs: Vec::new(),
        }
    }

    /// Bind a label ahead of the scan. The first declaration of a name wins,
    /// so a predeclared label shadows any source declaration of it.
    pub fn declare(&mut self, name: &'a [u8], destination: u64) {
        self.labels.entry(name).or_insert(destination);
    }

    pub fn assemble(mut self) -> Result<Output, AsmError> {
        self.scan()?;
        let unresolved = self.resolve();
        Ok(Output {
            bytes: self.buffer.into_bytes(),
            unresolved,
        })
    }

    fn scan(&mut self) -> Result<(), AsmError> {
        let mut scanner = Scanner::new(self.src);
        while let Some(tok) = scanner.next()? {
            match tok.kind {
                TokenKind::Whitespace | TokenKind::Comment => {}
                TokenKind::Instruction(mnemonic) => {
                    let opcode =
                        self.table
                            .opcode(mnemonic)
                            .ok_or_else(|| AsmError::UnknownMnemonic {
                                offset: tok.offset,
                                mnemonic: String::from_utf8_lossy(mnemonic).into_owned(),
                            })?;
                    self.buffer.append(&[opcode]);
                }
                TokenKind::LabelDecl(name) => {
                    let destination = self.buffer.len() as u64;
                    self.declare(name, destination);
                }
                TokenKind::LabelRef(name) => {
                    let patch_site = self.buffer.reserve(ADDR_BYTES);
                    self.refs.push(LabelRef { name, patch_site });
                }
                TokenKind::Literal(width, digits) => {
                    let value =
                        decode_literal(digits, width).map_err(|reason| AsmError::Literal {
                            offset: tok.offset,
                            reason,
                            snippet: snippet(self.src, tok.offset),
                        })?;
                    self.buffer.append(&value.to_le_bytes()[..width.bytes()]);
                }
            }
        }
        Ok(())
    }

    /// Patch every reference, in scan order, with its label's destination as
    /// a little-endian address. Returns the names that matched nothing, one
    /// entry per unresolved reference.
    fn resolve(&mut self) -> Vec<String> {
        let mut unresolved = Vec::new();
        for reference in &self.refs {
            match self.labels.get(reference.name) {
                Some(destination) => {
                    self.buffer
                        .write_at(reference.patch_site, &destination.to_le_bytes());
                }
                None => unresolved.push(String::from_utf8_lossy(reference.name).into_owned()),
            }
        }
        unresolved
    }
}

/// Parse a `NAME=value` pair for predefined labels.
pub fn parse_defines<T, U>(s: &str) -> Result<(T, U), Box<dyn Error + Send + Sync + 'static>>
where
    T: FromStr,
    T::Err: Error + Send + Sync + 'static,
    U: FromStr,
    U::Err: Error + Send + Sync + 'static,
{
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid LABEL=addr: no `=` found in `{s}`"))?;
    Ok((name.parse()?, addr.parse()?))
}

//! Bytecode image parsing: magic/version validation, the constant-string
//! pool, and the raw code buffer.
//!
//! Wire format (little-endian throughout):
//!
//! | Field        | Type                         | Notes               |
//! |--------------|------------------------------|----------------------|
//! | Magic        | 4 bytes                      | ASCII `"VLBC"`       |
//! | Version      | u8                           | must equal 1         |
//! | String count | u32                          | N                    |
//! | Strings      | N × `{u32 len; byte[len]}`   | order-preserving     |
//! | Code size    | u32                          | M                    |
//! | Code         | byte[M]                      | raw opcodes          |

use crate::error::{Error, ErrorRecord};
use vlcore::VlStr;

const MAGIC: &[u8; 4] = b"VLBC";
const SUPPORTED_VERSION: u8 = 1;

/// A loaded program image: the constant-string pool and the owned code
/// buffer.
#[derive(Default)]
pub struct Image {
    strings: Vec<VlStr>,
    code: Vec<u8>,
}

impl Image {
    /// Parses and validates `bytes` into a fresh `Image`.
    ///
    /// Fails with `BadArg` for a null-equivalent (empty or too-short) input,
    /// `BadBytecode` for a structural violation (bad magic, unsupported
    /// version, or truncation), and `Oom` only in the sense of a `try_reserve`
    /// failure while materialising the string/code buffers.
    pub fn load(bytes: &[u8]) -> Result<Image, ErrorRecord> {
        if bytes.len() < 5 {
            return Err(ErrorRecord::new(
                Error::BadArg,
                format!("image too short: {} bytes, need at least 5", bytes.len()),
            ));
        }

        let mut cursor = Cursor::new(bytes);

        let magic = cursor.take(4).ok_or_else(truncated)?;
        if magic != MAGIC {
            return Err(ErrorRecord::new(
                Error::BadBytecode,
                format!("bad magic: {magic:?}"),
            ));
        }

        let version = cursor.take_u8().ok_or_else(truncated)?;
        if version != SUPPORTED_VERSION {
            return Err(ErrorRecord::new(
                Error::BadBytecode,
                format!("unsupported version: {version}"),
            ));
        }

        let string_count = cursor.take_u32().ok_or_else(truncated)?;
        let mut strings = Vec::new();
        strings
            .try_reserve_exact(string_count as usize)
            .map_err(|_| ErrorRecord::new(Error::Oom, "string pool allocation refused"))?;
        for _ in 0..string_count {
            let len = cursor.take_u32().ok_or_else(truncated)?;
            let data = cursor.take(len as usize).ok_or_else(truncated)?;
            strings.push(VlStr::new(data));
        }

        let code_size = cursor.take_u32().ok_or_else(truncated)?;
        let code = cursor.take(code_size as usize).ok_or_else(truncated)?;

        if !cursor.at_end() {
            return Err(ErrorRecord::new(
                Error::BadBytecode,
                "trailing bytes after declared code size",
            ));
        }

        let mut owned_code = Vec::new();
        owned_code
            .try_reserve_exact(code.len())
            .map_err(|_| ErrorRecord::new(Error::Oom, "code buffer allocation refused"))?;
        owned_code.extend_from_slice(code);

        Ok(Image {
            strings,
            code: owned_code,
        })
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    /// Fetches constant-pool string `idx`, or `None` if out of range (the
    /// caller turns that into `BadBytecode`).
    pub fn string_at(&self, idx: u32) -> Option<&VlStr> {
        self.strings.get(idx as usize)
    }

    /// Renders the code buffer as `ip: MNEMONIC operand` lines, for
    /// debugging and the CLI's `--disasm` flag. Stops (without erroring) at
    /// the first instruction it cannot fully decode, since a disassembly
    /// request must never panic on attacker-controlled bytes.
    pub fn disassemble(&self) -> String {
        use crate::opcode::Opcode;
        let mut out = String::new();
        let mut ip = 0usize;
        while ip < self.code.len() {
            let start = ip;
            let op = self.code[ip];
            ip += 1;
            let rendered = match Opcode::from_u8(op) {
                Some(Opcode::PushI) => read_i64(&self.code, &mut ip).map(|v| format!("PushI {v}")),
                Some(Opcode::PushF) => {
                    read_f64(&self.code, &mut ip).map(|v| format!("PushF {v}"))
                }
                Some(Opcode::PushS) => {
                    read_u32(&self.code, &mut ip).map(|v| format!("PushS {v}"))
                }
                Some(Opcode::StoreG) => {
                    read_u32(&self.code, &mut ip).map(|v| format!("StoreG {v}"))
                }
                Some(Opcode::LoadG) => {
                    read_u32(&self.code, &mut ip).map(|v| format!("LoadG {v}"))
                }
                Some(Opcode::CallN) => read_u32(&self.code, &mut ip).and_then(|name| {
                    read_u8(&self.code, &mut ip).map(|argc| format!("CallN {name} argc={argc}"))
                }),
                Some(other) => Some(format!("{other:?}")),
                None => None,
            };
            match rendered {
                Some(text) => out.push_str(&format!("{start}: {text}\n")),
                None => {
                    out.push_str(&format!("{start}: <truncated or unknown opcode {op}>\n"));
                    break;
                }
            }
        }
        out
    }
}

fn read_u8(code: &[u8], ip: &mut usize) -> Option<u8> {
    let b = *code.get(*ip)?;
    *ip += 1;
    Some(b)
}

fn read_u32(code: &[u8], ip: &mut usize) -> Option<u32> {
    let bytes = code.get(*ip..*ip + 4)?;
    *ip += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_i64(code: &[u8], ip: &mut usize) -> Option<i64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(i64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_f64(code: &[u8], ip: &mut usize) -> Option<f64> {
    let bytes = code.get(*ip..*ip + 8)?;
    *ip += 8;
    Some(f64::from_bits(u64::from_le_bytes(bytes.try_into().unwrap())))
}

fn truncated() -> ErrorRecord {
    ErrorRecord::new(Error::BadBytecode, "truncated image")
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn take_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn take_u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Encodes `strings` and `code` into the on-wire image format. Used by
/// tests (and by any future compiler front-end) to build sample images
/// without hand-assembling bytes.
pub fn encode_image(strings: &[&[u8]], code: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.push(SUPPORTED_VERSION);
    out.extend_from_slice(&(strings.len() as u32).to_le_bytes());
    for s in strings {
        out.extend_from_slice(&(s.len() as u32).to_le_bytes());
        out.extend_from_slice(s);
    }
    out.extend_from_slice(&(code.len() as u32).to_le_bytes());
    out.extend_from_slice(code);
    out
}

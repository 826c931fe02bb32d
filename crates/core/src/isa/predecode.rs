//! Predecoded instruction files.
//!
//! The predecoder writes a small header followed by one fixed-size record
//! per instruction, in program order. The simulator maps the file read-only,
//! validates and decodes every record up front, and then serves fetch
//! requests out of the decoded table: a PC is valid if it is word-aligned
//! and falls inside `[text_base, text_base + 4 * count)`.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;

use crate::common::{SimError, VirtAddr};

use super::instr::{Instr, RECORD_SIZE};

/// File magic: "MPSD".
const MAGIC: u32 = 0x4d50_5344;
/// Format version this reader understands.
const VERSION: u32 = 1;
/// Header size in bytes.
const HEADER_SIZE: usize = 32;

/// A validated, fully decoded predecoded-instruction file.
pub struct InstrFile {
    /// Simulated address of the first instruction.
    pub text_base: VirtAddr,
    /// Simulated address execution starts at.
    pub entry_pc: VirtAddr,
    instrs: Vec<Instr>,
}

impl InstrFile {
    /// Maps and decodes a predecoded file.
    pub fn open(path: &Path) -> Result<Self, SimError> {
        let file = File::open(path)
            .map_err(|e| SimError::Input(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| SimError::Input(e.to_string()))?
            .len() as usize;
        if len < HEADER_SIZE {
            return Err(SimError::Input("predecoded file too short".into()));
        }

        // SAFETY: mapping `len` readable bytes of a file we hold open; the
        // mapping is private, read-only, and unmapped before return.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(SimError::Input(format!(
                "mmap of {} failed",
                path.display()
            )));
        }
        // SAFETY: base..base+len is a valid readable mapping until munmap.
        let bytes = unsafe { std::slice::from_raw_parts(base.cast::<u8>(), len) };
        let result = Self::from_bytes(bytes);
        // SAFETY: unmapping exactly what mmap returned.
        unsafe {
            let _ = libc::munmap(base, len);
        }
        result
    }

    /// Decodes a predecoded file image from memory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SimError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SimError::Input("predecoded file too short".into()));
        }
        let word = |o: usize| u32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        let quad = |o: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[o..o + 8]);
            u64::from_le_bytes(b)
        };

        if word(0) != MAGIC {
            return Err(SimError::Input("bad predecoded-file magic".into()));
        }
        if word(4) != VERSION {
            return Err(SimError::Input(format!(
                "predecoded-file version {} unsupported",
                word(4)
            )));
        }
        let count = quad(8) as usize;
        let text_base = VirtAddr(quad(16));
        let entry_pc = VirtAddr(quad(24));

        let need = HEADER_SIZE + count * RECORD_SIZE;
        if bytes.len() < need {
            return Err(SimError::Input(format!(
                "predecoded file truncated: {} < {need}",
                bytes.len()
            )));
        }
        if text_base.0 % 4 != 0 || entry_pc.0 % 4 != 0 {
            return Err(SimError::Input("unaligned text base or entry".into()));
        }

        let mut instrs = Vec::with_capacity(count);
        for i in 0..count {
            let off = HEADER_SIZE + i * RECORD_SIZE;
            instrs.push(Instr::decode(&bytes[off..off + RECORD_SIZE])?);
        }
        Ok(Self {
            text_base,
            entry_pc,
            instrs,
        })
    }

    /// Builds an in-memory instruction stream for tests and tools.
    pub fn from_instrs(text_base: VirtAddr, entry_pc: VirtAddr, instrs: Vec<Instr>) -> Self {
        Self {
            text_base,
            entry_pc,
            instrs,
        }
    }

    /// Serializes header + records (the predecoder's output path).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.instrs.len() * RECORD_SIZE);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.instrs.len() as u64).to_le_bytes());
        out.extend_from_slice(&self.text_base.0.to_le_bytes());
        out.extend_from_slice(&self.entry_pc.0.to_le_bytes());
        for i in &self.instrs {
            out.extend_from_slice(&i.encode());
        }
        out
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    /// True if the file holds no instructions.
    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// The instruction at `pc`, or `None` if `pc` is misaligned or outside
    /// the text segment (the caller raises `BadPc`).
    #[inline]
    pub fn instr_at(&self, pc: VirtAddr) -> Option<&Instr> {
        if pc.0 % 4 != 0 || pc.0 < self.text_base.0 {
            return None;
        }
        let idx = ((pc.0 - self.text_base.0) / 4) as usize;
        self.instrs.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::opcode::Opcode;
    use std::io::Write;

    fn sample() -> InstrFile {
        let mk = |op| Instr {
            op,
            ..Instr::default()
        };
        InstrFile::from_instrs(
            VirtAddr(0x1_0000),
            VirtAddr(0x1_0004),
            vec![mk(Opcode::Sethi), mk(Opcode::Add), mk(Opcode::Jmpl)],
        )
    }

    #[test]
    fn test_bytes_roundtrip() {
        let f = sample();
        let g = InstrFile::from_bytes(&f.to_bytes()).unwrap();
        assert_eq!(g.len(), 3);
        assert_eq!(g.text_base, VirtAddr(0x1_0000));
        assert_eq!(g.entry_pc, VirtAddr(0x1_0004));
        assert_eq!(g.instr_at(VirtAddr(0x1_0008)).map(|i| i.op), Some(Opcode::Jmpl));
    }

    #[test]
    fn test_pc_bounds() {
        let f = sample();
        assert!(f.instr_at(VirtAddr(0x1_0002)).is_none()); // misaligned
        assert!(f.instr_at(VirtAddr(0xffff)).is_none()); // below base
        assert!(f.instr_at(VirtAddr(0x1_000c)).is_none()); // past end
    }

    #[test]
    fn test_open_via_mmap() {
        let f = sample();
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&f.to_bytes()).unwrap();
        tmp.flush().unwrap();
        let g = InstrFile::open(tmp.path()).unwrap();
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xff;
        assert!(InstrFile::from_bytes(&bytes).is_err());
    }
}

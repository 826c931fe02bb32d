//! Application loading.
//!
//! Two inputs make a runnable simulation: the predecoded instruction file
//! (see `isa::predecode`) and the application's data image. The image is a
//! SPARC ELF whose loadable segments populate the simulated address space —
//! per-process pages below the `lowshared` boundary are replicated into
//! every node's private mapping, pages above it land in the shared region
//! once. Each node also gets an initial stack page under the stack top.

use std::fs;
use std::path::Path;

use object::{Object, ObjectSegment};
use tracing::info;

use crate::common::{SimError, VirtAddr};
use crate::mem::addrspace::AddrSpace;

/// Reads a file into memory, mapping errors to input failures.
pub fn read_file(path: &Path) -> Result<Vec<u8>, SimError> {
    fs::read(path).map_err(|e| SimError::Input(format!("{}: {e}", path.display())))
}

/// Loads a SPARC ELF application image into the address space.
///
/// Returns the ELF entry point (informational; execution starts at the
/// predecoded file's entry, which the predecoder derived from the same ELF).
pub fn load_app(
    space: &mut AddrSpace,
    num_procs: usize,
    path: &Path,
) -> Result<VirtAddr, SimError> {
    let data = read_file(path)?;
    let file = object::File::parse(&*data)
        .map_err(|e| SimError::Input(format!("{}: {e}", path.display())))?;

    let mut loaded = 0u64;
    for seg in file.segments() {
        let addr = seg.address();
        let memsz = seg.size();
        if memsz == 0 {
            continue;
        }
        let bytes = seg
            .data()
            .map_err(|e| SimError::Input(e.to_string()))?;
        let shared = addr >= space.lowshared();
        let targets: Vec<usize> = if shared {
            vec![0]
        } else {
            (0..num_procs).collect()
        };
        for &p in &targets {
            space.write_image(p, VirtAddr(addr), bytes);
            // Zero-fill the bss tail past the file-backed bytes.
            if memsz > bytes.len() as u64 {
                space.map_range(p, VirtAddr(addr + bytes.len() as u64), memsz - bytes.len() as u64);
            }
        }
        loaded += memsz;
    }

    // An initial stack page per node.
    for p in 0..num_procs {
        let top = space.stack_top();
        space.map_range(p, VirtAddr(top - space.page_size()), space.page_size());
    }

    info!(target: "loader", bytes = loaded, path = %path.display(), "application image loaded");
    Ok(VirtAddr(file.entry()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::addrspace::DEFAULT_STACK_TOP;

    #[test]
    fn test_stack_premapped_after_empty_image() {
        // Loading maps a stack page even with no segments; emulate by hand.
        let mut space = AddrSpace::new(2);
        for p in 0..2 {
            let top = space.stack_top();
            space.map_range(p, VirtAddr(top - space.page_size()), space.page_size());
        }
        assert!(space.is_mapped(0, VirtAddr(DEFAULT_STACK_TOP - 8), 8));
        assert!(space.is_mapped(1, VirtAddr(DEFAULT_STACK_TOP - 8), 8));
    }

    #[test]
    fn test_read_file_missing() {
        assert!(read_file(Path::new("/nonexistent/app.elf")).is_err());
    }
}

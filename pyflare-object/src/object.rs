use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use memmap2::Mmap;

use object::elf::{DT_NEEDED, ET_DYN, PT_LOAD, SHT_DYNSYM, SHT_SYMTAB};
use object::read::elf::{Dyn, FileHeader, ProgramHeader, SectionHeader, Sym};
use object::Endianness;
use object::FileKind;
use object::SectionIndex;

// The profiler and its target share a word size, so only the host's ELF
// class needs to be understood.
#[cfg(target_pointer_width = "64")]
type Elf = object::elf::FileHeader64<Endianness>;
#[cfg(target_pointer_width = "32")]
type Elf = object::elf::FileHeader32<Endianness>;

#[cfg(target_pointer_width = "64")]
const HOST_FILE_KIND: FileKind = FileKind::Elf64;
#[cfg(target_pointer_width = "32")]
const HOST_FILE_KIND: FileKind = FileKind::Elf32;

/// Which of the two ELF symbol tables to walk. The dynamic table is always
/// present in the binaries we care about; the debug table is dropped by
/// `strip` and may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolTableKind {
    Dynamic,
    Debug,
}

/// A memory-mapped ELF executable or shared object.
///
/// Parsing happens lazily against the mapped bytes; the constructor only
/// validates the magic and that the file's class matches the host
/// architecture.
#[derive(Debug)]
pub struct ObjectFile {
    mmap: Mmap,
}

impl ObjectFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)?;
        Self::from_file(&file)
    }

    /// Build from an already-open file. Useful when the file was opened in
    /// another mount namespace and only the descriptor is meaningful here.
    pub fn from_file(file: &fs::File) -> Result<Self> {
        let mmap = unsafe { Mmap::map(file) }?;

        match FileKind::parse(&*mmap) {
            Ok(kind) if kind == HOST_FILE_KIND => {}
            Ok(other_file_kind) => {
                bail!(
                    "object is not an ELF matching the host class but {:?}",
                    other_file_kind
                );
            }
            Err(e) => bail!("FileKind failed with {:?}", e),
        }

        Ok(ObjectFile { mmap })
    }

    fn header(&self) -> Result<(&Elf, Endianness)> {
        let header = Elf::parse(&*self.mmap)?;
        let endian = header.endian()?;
        Ok((header, endian))
    }

    /// Whether this is an `ET_DYN` object: a shared library, or a
    /// position-independent executable whose symbol values are offsets from
    /// a randomized base rather than absolute addresses.
    pub fn is_dynamic(&self) -> Result<bool> {
        let (header, endian) = self.header()?;
        Ok(header.e_type(endian) == ET_DYN)
    }

    /// The virtual address of the first `PT_LOAD` program header. Symbol
    /// values in position-independent objects are relative to this.
    pub fn base_load_address(&self) -> Result<u64> {
        let (header, endian) = self.header()?;
        for segment in header.program_headers(endian, &*self.mmap)? {
            if segment.p_type(endian) == PT_LOAD {
                return Ok(segment.p_vaddr(endian).into());
            }
        }
        Err(anyhow!("no PT_LOAD program header"))
    }

    /// The `DT_NEEDED` entries of the dynamic section, resolved through the
    /// dynamic string table. This is similar to what ldd(1) prints.
    pub fn needed_libraries(&self) -> Result<Vec<String>> {
        let (header, endian) = self.header()?;
        let data = &*self.mmap;
        let sections = header.sections(endian, data)?;

        let Some((entries, dynamic_idx)) = sections.dynamic(endian, data)? else {
            return Ok(Vec::new());
        };
        let strings_idx = sections.section(dynamic_idx)?.sh_link(endian);
        let strings = sections.strings(endian, data, SectionIndex(strings_idx as usize))?;

        let mut needed = Vec::new();
        for entry in entries {
            if u64::from(entry.d_tag(endian)) != u64::from(DT_NEEDED) {
                continue;
            }
            let offset: u64 = entry.d_val(endian).into();
            let name = strings
                .get(offset as u32)
                .map_err(|()| anyhow!("DT_NEEDED string out of bounds at {}", offset))?;
            needed.push(String::from_utf8_lossy(name).into_owned());
        }
        Ok(needed)
    }

    /// Walk one of the symbol tables, handing `(name, value)` pairs to the
    /// visitor. A missing table is not an error; the walk is just empty.
    pub fn visit_symbols(
        &self,
        kind: SymbolTableKind,
        visit: &mut dyn FnMut(&[u8], u64),
    ) -> Result<()> {
        let (header, endian) = self.header()?;
        let data = &*self.mmap;
        let sections = header.sections(endian, data)?;

        let sh_type = match kind {
            SymbolTableKind::Dynamic => SHT_DYNSYM,
            SymbolTableKind::Debug => SHT_SYMTAB,
        };
        let symbols = sections.symbols(endian, data, sh_type)?;
        for symbol in symbols.iter() {
            let Ok(name) = symbol.name(endian, symbols.strings()) else {
                continue;
            };
            visit(name, symbol.st_value(endian).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn own_binary() -> ObjectFile {
        ObjectFile::from_path(&PathBuf::from("/proc/self/exe")).unwrap()
    }

    #[test]
    fn parses_own_binary() {
        let object = own_binary();
        // Rust test binaries are dynamically linked against libc on glibc
        // systems and carry at least one PT_LOAD segment.
        object.base_load_address().unwrap();
        object.is_dynamic().unwrap();
    }

    #[test]
    fn own_binary_has_symbols() {
        let object = own_binary();
        let mut count = 0usize;
        object
            .visit_symbols(SymbolTableKind::Dynamic, &mut |_, _| count += 1)
            .unwrap();
        assert!(count > 0, "expected dynamic symbols in the test binary");
    }

    #[test]
    fn needed_libraries_resolve() {
        let object = own_binary();
        let needed = object.needed_libraries().unwrap();
        // Either statically linked (none) or every entry is a readable name.
        for lib in needed {
            assert!(!lib.is_empty());
        }
    }

    #[test]
    fn rejects_non_elf() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hello\n").unwrap();
        assert!(ObjectFile::from_path(file.path()).is_err());
    }
}

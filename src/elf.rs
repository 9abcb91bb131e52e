//! ELF loading.
//!
//! GDB normally pushes a program into the target itself through `X`
//! packets. As a faster alternative the stub can be handed an ELF path
//! (`monitor elf_load`), parse it here, and stream the whole image through
//! the back end's memory writer in one go. Only little-endian RISC-V
//! executables are accepted; the ELF class additionally decides the
//! target's register width.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use object::elf;
use object::read::elf::{ElfFile, FileHeader, SectionHeader};
use object::{Endianness, Object, ObjectSymbol};
use thiserror::Error;

use crate::Xlen;

/// Byte offset of the ELF class field within `e_ident`.
const EI_CLASS: usize = 4;

/// Base of the load window the loader accepts.
pub const LOAD_BASE: u64 = 0x8000_0000;

/// Size of the load window (256 MiB above [`LOAD_BASE`]).
pub const LOAD_WINDOW: u64 = 0x1000_0000;

/// Errors from ELF loading.
#[derive(Debug, Error)]
pub enum ElfLoadError {
    /// Reading or writing a file failed.
    #[error("failed to access {path}: {source}")]
    Io {
        /// The offending path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not a parseable ELF.
    #[error("failed to parse ELF file: {0}")]
    Parse(#[from] object::read::Error),
    /// `EI_CLASS` is neither ELF32 nor ELF64.
    #[error("ELF class is neither ELF32 nor ELF64")]
    UnknownClass,
    /// The machine field is not RISC-V.
    #[error("not a RISC-V ELF file (machine {0:#x})")]
    NotRiscv(u16),
    /// Big-endian images are not supported.
    #[error("big-endian ELF files are not supported")]
    BigEndian,
    /// No section contributes any loadable bytes.
    #[error("no loadable sections found")]
    Empty,
    /// The image does not fit the supported load window.
    #[error("image range {min:#x}..={max:#x} is outside the supported load window")]
    RangeOutOfBounds {
        /// Lowest loaded address.
        min: u64,
        /// Highest loaded address.
        max: u64,
    },
}

/// Addresses of the well-known symbols the loader looks for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SymbolAddrs {
    /// Address of `_start`.
    pub start: Option<u64>,
    /// Address of `exit`.
    pub exit: Option<u64>,
    /// Address of `tohost`.
    pub tohost: Option<u64>,
}

impl SymbolAddrs {
    /// Write the diagnostic `symbol_table.txt` listing.
    pub fn write_table(&self, path: &Path) -> Result<(), ElfLoadError> {
        let mut table = String::new();
        if let Some(addr) = self.start {
            let _ = writeln!(table, "_start    {addr:#x}");
        }
        if let Some(addr) = self.exit {
            let _ = writeln!(table, "exit      {addr:#x}");
        }
        if let Some(addr) = self.tohost {
            let _ = writeln!(table, "tohost    {addr:#x}");
        }
        fs::write(path, table).map_err(|source| ElfLoadError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

/// A flattened memory image extracted from an ELF file.
#[derive(Debug)]
pub struct ElfImage {
    /// Register width implied by the ELF class.
    pub xlen: Xlen,
    /// Lowest loaded address.
    pub min_addr: u64,
    /// Highest loaded address.
    pub max_addr: u64,
    /// Image bytes covering `min_addr..=max_addr`; gaps and NOBITS
    /// sections read as zero.
    pub data: Vec<u8>,
    /// Well-known symbol addresses.
    pub symbols: SymbolAddrs,
}

impl ElfImage {
    /// Read and parse an ELF file from disk.
    pub fn from_file(path: &Path) -> Result<Self, ElfLoadError> {
        let data = fs::read(path).map_err(|source| ElfLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&data)
    }

    /// Parse an ELF image from memory.
    pub fn parse(data: &[u8]) -> Result<Self, ElfLoadError> {
        match data.get(EI_CLASS) {
            Some(&elf::ELFCLASS32) => parse_class::<elf::FileHeader32<Endianness>>(data, Xlen::Rv32),
            Some(&elf::ELFCLASS64) => parse_class::<elf::FileHeader64<Endianness>>(data, Xlen::Rv64),
            _ => Err(ElfLoadError::UnknownClass),
        }
    }
}

fn parse_class<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
    xlen: Xlen,
) -> Result<ElfImage, ElfLoadError> {
    let file = ElfFile::<Elf>::parse(data)?;
    let endian = file.endian();

    if !file.is_little_endian() {
        return Err(ElfLoadError::BigEndian);
    }
    let machine = file.elf_header().e_machine(endian);
    if machine != elf::EM_RISCV {
        return Err(ElfLoadError::NotRiscv(machine));
    }

    let mut extents: Vec<(u64, u64)> = Vec::new();
    let mut pieces: Vec<(u64, &[u8])> = Vec::new();
    for section in file.elf_section_table().iter() {
        let sh_type = section.sh_type(endian);
        if !loadable_section(sh_type, section.sh_flags(endian).into()) {
            continue;
        }
        let addr: u64 = section.sh_addr(endian).into();
        let size: u64 = section.sh_size(endian).into();
        if size == 0 {
            continue;
        }
        extents.push((addr, size));
        if sh_type != elf::SHT_NOBITS {
            pieces.push((addr, section.data(endian, data)?));
        }
        tracing::debug!("loadable section at {addr:#x}, {size:#x} bytes");
    }

    let (min_addr, max_addr) =
        image_bounds(extents.iter().copied()).ok_or(ElfLoadError::Empty)?;
    check_load_range(min_addr, max_addr)?;
    let image = assemble(min_addr, max_addr, &pieces);

    let mut symbols = SymbolAddrs::default();
    for symbol in file.symbols() {
        match symbol.name() {
            Ok("_start") => symbols.start = Some(symbol.address()),
            Ok("exit") => symbols.exit = Some(symbol.address()),
            Ok("tohost") => symbols.tohost = Some(symbol.address()),
            _ => {}
        }
    }

    Ok(ElfImage {
        xlen,
        min_addr,
        max_addr,
        data: image,
        symbols,
    })
}

/// Whether a section contributes to the loaded image: code/data-bearing
/// section types with at least one of the alloc/write/exec flags.
fn loadable_section(sh_type: u32, sh_flags: u64) -> bool {
    let wanted_type = matches!(
        sh_type,
        elf::SHT_PROGBITS | elf::SHT_NOBITS | elf::SHT_INIT_ARRAY | elf::SHT_FINI_ARRAY
    );
    let wanted_flags =
        sh_flags & u64::from(elf::SHF_WRITE | elf::SHF_ALLOC | elf::SHF_EXECINSTR) != 0;
    wanted_type && wanted_flags
}

/// Lowest and highest byte address covered by `(addr, size)` extents.
fn image_bounds(extents: impl Iterator<Item = (u64, u64)>) -> Option<(u64, u64)> {
    let mut bounds: Option<(u64, u64)> = None;
    for (addr, size) in extents {
        let last = addr + size - 1;
        bounds = Some(match bounds {
            None => (addr, last),
            Some((min, max)) => (min.min(addr), max.max(last)),
        });
    }
    bounds
}

fn check_load_range(min: u64, max: u64) -> Result<(), ElfLoadError> {
    if min < LOAD_BASE || max >= LOAD_BASE + LOAD_WINDOW {
        return Err(ElfLoadError::RangeOutOfBounds { min, max });
    }
    Ok(())
}

/// Overlay section bytes into a zero-filled image covering
/// `min_addr..=max_addr`.
fn assemble(min_addr: u64, max_addr: u64, pieces: &[(u64, &[u8])]) -> Vec<u8> {
    let mut image = vec![0u8; (max_addr - min_addr + 1) as usize];
    for &(addr, bytes) in pieces {
        let offset = (addr - min_addr) as usize;
        image[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
    image
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bounds_cover_all_extents() {
        let extents = [
            (0x8000_1000u64, 0x100u64),
            (0x8000_0000, 0x20),
            (0x8000_2000, 0x1), // NOBITS-style tail
        ];
        assert_eq!(
            image_bounds(extents.iter().copied()),
            Some((0x8000_0000, 0x8000_2000))
        );
        assert_eq!(image_bounds(std::iter::empty()), None);
    }

    #[test]
    fn load_range_is_enforced() {
        assert!(check_load_range(0x8000_0000, 0x8000_ffff).is_ok());
        assert!(matches!(
            check_load_range(0x7fff_0000, 0x8000_0000),
            Err(ElfLoadError::RangeOutOfBounds { .. })
        ));
        assert!(matches!(
            check_load_range(0x8fff_0000, 0x9000_0000),
            Err(ElfLoadError::RangeOutOfBounds { .. })
        ));
    }

    #[test]
    fn assemble_overlays_pieces_with_zero_gaps() {
        let text = [0xaau8, 0xbb];
        let data = [0x11u8, 0x22, 0x33];
        let image = assemble(
            0x8000_0000,
            0x8000_0009,
            &[(0x8000_0000, &text), (0x8000_0004, &data)],
        );
        assert_eq!(
            image,
            [0xaa, 0xbb, 0x00, 0x00, 0x11, 0x22, 0x33, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn section_selection() {
        let alloc_exec = u64::from(elf::SHF_ALLOC | elf::SHF_EXECINSTR);
        assert!(loadable_section(elf::SHT_PROGBITS, alloc_exec));
        assert!(loadable_section(elf::SHT_NOBITS, u64::from(elf::SHF_WRITE)));
        assert!(loadable_section(elf::SHT_INIT_ARRAY, u64::from(elf::SHF_ALLOC)));
        assert!(loadable_section(elf::SHT_FINI_ARRAY, u64::from(elf::SHF_ALLOC)));
        // Debug info and string tables carry no loadable flags.
        assert!(!loadable_section(elf::SHT_PROGBITS, 0));
        assert!(!loadable_section(elf::SHT_SYMTAB, 0));
        assert!(!loadable_section(elf::SHT_STRTAB, 0));
    }

    #[test]
    fn parse_rejects_non_elf_input() {
        assert!(matches!(
            ElfImage::parse(b"not an elf"),
            Err(ElfLoadError::UnknownClass)
        ));
        // A valid class byte alone is not enough.
        let mut junk = vec![0u8; 64];
        junk[..4].copy_from_slice(b"\x7fELF");
        junk[EI_CLASS] = elf::ELFCLASS64;
        assert!(ElfImage::parse(&junk).is_err());
    }

    #[test]
    fn symbol_table_formatting() {
        let symbols = SymbolAddrs {
            start: Some(0x8000_0000),
            exit: Some(0x8000_1234),
            tohost: None,
        };
        let dir = std::env::temp_dir().join("riscv-gdb-server-symtab-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("symbol_table.txt");
        symbols.write_table(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "_start    0x80000000\nexit      0x80001234\n");
    }
}

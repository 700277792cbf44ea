//! ELF32/ELF64 header records and the width-independent in-memory model.
//!
//! The on-disk structs are declared through `layout!`; the relocation
//! algorithm itself runs on widened (u64) models so there is exactly one
//! copy of the logic. [`ElfClass`] is the strategy object: it knows the
//! record sizes for its width, the natural alignment used when packing the
//! payload and project blobs, and how to decode/encode each record.

use crate::error::{DeployError, DeployResult};
use crate::layout;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const EI_CLASS: usize = 4;
pub const EI_DATA: usize = 5;
pub const EI_VERSION: usize = 6;
pub const ELFCLASS32: u8 = 1;
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EV_CURRENT: u8 = 1;

pub const ET_EXEC: u16 = 2;
pub const ET_DYN: u16 = 3;

pub const EM_386: u16 = 3;
pub const EM_ARM: u16 = 40;
pub const EM_X86_64: u16 = 62;
pub const EM_AARCH64: u16 = 183;

pub const PT_LOAD: u32 = 1;

/// Section names are matched including the terminating NUL so `.projectx`
/// never matches `.project`.
pub const PROJECT_SECTION: &str = ".project";
pub const PAYLOAD_SECTION: &str = ".payload";

layout! {
    le struct Elf32HeaderRaw {
        pub e_ident: [u8; 16],
        pub e_type: u16,
        pub e_machine: u16,
        pub e_version: u32,
        pub e_entry: u32,
        pub e_phoff: u32,
        pub e_shoff: u32,
        pub e_flags: u32,
        pub e_ehsize: u16,
        pub e_phentsize: u16,
        pub e_phnum: u16,
        pub e_shentsize: u16,
        pub e_shnum: u16,
        pub e_shstrndx: u16,
    }
}

layout! {
    le struct Elf64HeaderRaw {
        pub e_ident: [u8; 16],
        pub e_type: u16,
        pub e_machine: u16,
        pub e_version: u32,
        pub e_entry: u64,
        pub e_phoff: u64,
        pub e_shoff: u64,
        pub e_flags: u32,
        pub e_ehsize: u16,
        pub e_phentsize: u16,
        pub e_phnum: u16,
        pub e_shentsize: u16,
        pub e_shnum: u16,
        pub e_shstrndx: u16,
    }
}

layout! {
    le struct Elf32SectionRaw {
        pub sh_name: u32,
        pub sh_type: u32,
        pub sh_flags: u32,
        pub sh_addr: u32,
        pub sh_offset: u32,
        pub sh_size: u32,
        pub sh_link: u32,
        pub sh_info: u32,
        pub sh_addralign: u32,
        pub sh_entsize: u32,
    }
}

layout! {
    le struct Elf64SectionRaw {
        pub sh_name: u32,
        pub sh_type: u32,
        pub sh_flags: u64,
        pub sh_addr: u64,
        pub sh_offset: u64,
        pub sh_size: u64,
        pub sh_link: u32,
        pub sh_info: u32,
        pub sh_addralign: u64,
        pub sh_entsize: u64,
    }
}

layout! {
    le struct Elf32ProgramRaw {
        pub p_type: u32,
        pub p_offset: u32,
        pub p_vaddr: u32,
        pub p_paddr: u32,
        pub p_filesz: u32,
        pub p_memsz: u32,
        pub p_flags: u32,
        pub p_align: u32,
    }
}

layout! {
    le struct Elf64ProgramRaw {
        pub p_type: u32,
        pub p_flags: u32,
        pub p_offset: u64,
        pub p_vaddr: u64,
        pub p_paddr: u64,
        pub p_filesz: u64,
        pub p_memsz: u64,
        pub p_align: u64,
    }
}

/// Which flavor of ELF template is being patched. Desktop engines are
/// `ET_EXEC` executables; Android engines ship as `ET_DYN` shared objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfMode {
    Desktop,
    Android,
}

/// Width strategy, selected once by probing `EI_CLASS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    pub fn from_ident(ident: &[u8]) -> DeployResult<Self> {
        match ident[EI_CLASS] {
            ELFCLASS32 => Ok(ElfClass::Elf32),
            ELFCLASS64 => Ok(ElfClass::Elf64),
            other => Err(DeployError::BadClass(other)),
        }
    }

    pub fn header_size(self) -> usize {
        match self {
            ElfClass::Elf32 => Elf32HeaderRaw::SIZE,
            ElfClass::Elf64 => Elf64HeaderRaw::SIZE,
        }
    }

    pub fn section_entry_size(self) -> usize {
        match self {
            ElfClass::Elf32 => Elf32SectionRaw::SIZE,
            ElfClass::Elf64 => Elf64SectionRaw::SIZE,
        }
    }

    pub fn program_entry_size(self) -> usize {
        match self {
            ElfClass::Elf32 => Elf32ProgramRaw::SIZE,
            ElfClass::Elf64 => Elf64ProgramRaw::SIZE,
        }
    }

    /// Natural alignment applied between the payload and project blobs.
    pub fn round(self, value: u64) -> u64 {
        let align = match self {
            ElfClass::Elf32 => 4u64,
            ElfClass::Elf64 => 8u64,
        };
        (value + align - 1) & !(align - 1)
    }
}

fn narrow(value: u64, what: &'static str) -> DeployResult<u32> {
    u32::try_from(value).map_err(|_| DeployError::Overflow(what))
}

/// Width-independent ELF file header.
#[derive(Debug, Clone)]
pub struct ElfHeader {
    pub class: ElfClass,
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

impl ElfHeader {
    /// Parse and validate the file header: magic, class, little-endian data
    /// encoding, current version.
    pub fn parse(data: &[u8]) -> DeployResult<Self> {
        if data.len() < 16 {
            return Err(DeployError::Truncated("ELF identification"));
        }
        if data[..4] != ELF_MAGIC {
            return Err(DeployError::BadMagic("ELF"));
        }
        if data[EI_DATA] != ELFDATA2LSB {
            return Err(DeployError::BadEncoding);
        }
        if data[EI_VERSION] != EV_CURRENT {
            return Err(DeployError::BadVersion {
                format: "ELF",
                version: u32::from(data[EI_VERSION]),
            });
        }
        let class = ElfClass::from_ident(data)?;
        let header = match class {
            ElfClass::Elf32 => {
                let raw = Elf32HeaderRaw::read_from(data)?;
                ElfHeader {
                    class,
                    e_ident: raw.e_ident,
                    e_type: raw.e_type,
                    e_machine: raw.e_machine,
                    e_version: raw.e_version,
                    e_entry: u64::from(raw.e_entry),
                    e_phoff: u64::from(raw.e_phoff),
                    e_shoff: u64::from(raw.e_shoff),
                    e_flags: raw.e_flags,
                    e_ehsize: raw.e_ehsize,
                    e_phentsize: raw.e_phentsize,
                    e_phnum: raw.e_phnum,
                    e_shentsize: raw.e_shentsize,
                    e_shnum: raw.e_shnum,
                    e_shstrndx: raw.e_shstrndx,
                }
            }
            ElfClass::Elf64 => {
                let raw = Elf64HeaderRaw::read_from(data)?;
                ElfHeader {
                    class,
                    e_ident: raw.e_ident,
                    e_type: raw.e_type,
                    e_machine: raw.e_machine,
                    e_version: raw.e_version,
                    e_entry: raw.e_entry,
                    e_phoff: raw.e_phoff,
                    e_shoff: raw.e_shoff,
                    e_flags: raw.e_flags,
                    e_ehsize: raw.e_ehsize,
                    e_phentsize: raw.e_phentsize,
                    e_phnum: raw.e_phnum,
                    e_shentsize: raw.e_shentsize,
                    e_shnum: raw.e_shnum,
                    e_shstrndx: raw.e_shstrndx,
                }
            }
        };
        if header.e_version != u32::from(EV_CURRENT) {
            return Err(DeployError::BadVersion {
                format: "ELF",
                version: header.e_version,
            });
        }
        Ok(header)
    }

    pub fn encode(&self) -> DeployResult<Vec<u8>> {
        match self.class {
            ElfClass::Elf32 => Ok(Elf32HeaderRaw {
                e_ident: self.e_ident,
                e_type: self.e_type,
                e_machine: self.e_machine,
                e_version: self.e_version,
                e_entry: narrow(self.e_entry, "e_entry")?,
                e_phoff: narrow(self.e_phoff, "e_phoff")?,
                e_shoff: narrow(self.e_shoff, "e_shoff")?,
                e_flags: self.e_flags,
                e_ehsize: self.e_ehsize,
                e_phentsize: self.e_phentsize,
                e_phnum: self.e_phnum,
                e_shentsize: self.e_shentsize,
                e_shnum: self.e_shnum,
                e_shstrndx: self.e_shstrndx,
            }
            .to_bytes()),
            ElfClass::Elf64 => Ok(Elf64HeaderRaw {
                e_ident: self.e_ident,
                e_type: self.e_type,
                e_machine: self.e_machine,
                e_version: self.e_version,
                e_entry: self.e_entry,
                e_phoff: self.e_phoff,
                e_shoff: self.e_shoff,
                e_flags: self.e_flags,
                e_ehsize: self.e_ehsize,
                e_phentsize: self.e_phentsize,
                e_phnum: self.e_phnum,
                e_shentsize: self.e_shentsize,
                e_shnum: self.e_shnum,
                e_shstrndx: self.e_shstrndx,
            }
            .to_bytes()),
        }
    }
}

/// Width-independent section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

impl Section {
    fn from_raw32(raw: Elf32SectionRaw) -> Self {
        Section {
            sh_name: raw.sh_name,
            sh_type: raw.sh_type,
            sh_flags: u64::from(raw.sh_flags),
            sh_addr: u64::from(raw.sh_addr),
            sh_offset: u64::from(raw.sh_offset),
            sh_size: u64::from(raw.sh_size),
            sh_link: raw.sh_link,
            sh_info: raw.sh_info,
            sh_addralign: u64::from(raw.sh_addralign),
            sh_entsize: u64::from(raw.sh_entsize),
        }
    }

    fn from_raw64(raw: Elf64SectionRaw) -> Self {
        Section {
            sh_name: raw.sh_name,
            sh_type: raw.sh_type,
            sh_flags: raw.sh_flags,
            sh_addr: raw.sh_addr,
            sh_offset: raw.sh_offset,
            sh_size: raw.sh_size,
            sh_link: raw.sh_link,
            sh_info: raw.sh_info,
            sh_addralign: raw.sh_addralign,
            sh_entsize: raw.sh_entsize,
        }
    }

    pub fn encode(&self, class: ElfClass) -> DeployResult<Vec<u8>> {
        match class {
            ElfClass::Elf32 => Ok(Elf32SectionRaw {
                sh_name: self.sh_name,
                sh_type: self.sh_type,
                sh_flags: narrow(self.sh_flags, "sh_flags")?,
                sh_addr: narrow(self.sh_addr, "sh_addr")?,
                sh_offset: narrow(self.sh_offset, "sh_offset")?,
                sh_size: narrow(self.sh_size, "sh_size")?,
                sh_link: self.sh_link,
                sh_info: self.sh_info,
                sh_addralign: narrow(self.sh_addralign, "sh_addralign")?,
                sh_entsize: narrow(self.sh_entsize, "sh_entsize")?,
            }
            .to_bytes()),
            ElfClass::Elf64 => Ok(Elf64SectionRaw {
                sh_name: self.sh_name,
                sh_type: self.sh_type,
                sh_flags: self.sh_flags,
                sh_addr: self.sh_addr,
                sh_offset: self.sh_offset,
                sh_size: self.sh_size,
                sh_link: self.sh_link,
                sh_info: self.sh_info,
                sh_addralign: self.sh_addralign,
                sh_entsize: self.sh_entsize,
            }
            .to_bytes()),
        }
    }
}

/// Width-independent program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

impl Segment {
    fn from_raw32(raw: Elf32ProgramRaw) -> Self {
        Segment {
            p_type: raw.p_type,
            p_flags: raw.p_flags,
            p_offset: u64::from(raw.p_offset),
            p_vaddr: u64::from(raw.p_vaddr),
            p_paddr: u64::from(raw.p_paddr),
            p_filesz: u64::from(raw.p_filesz),
            p_memsz: u64::from(raw.p_memsz),
            p_align: u64::from(raw.p_align),
        }
    }

    fn from_raw64(raw: Elf64ProgramRaw) -> Self {
        Segment {
            p_type: raw.p_type,
            p_flags: raw.p_flags,
            p_offset: raw.p_offset,
            p_vaddr: raw.p_vaddr,
            p_paddr: raw.p_paddr,
            p_filesz: raw.p_filesz,
            p_memsz: raw.p_memsz,
            p_align: raw.p_align,
        }
    }

    pub fn encode(&self, class: ElfClass) -> DeployResult<Vec<u8>> {
        match class {
            ElfClass::Elf32 => Ok(Elf32ProgramRaw {
                p_type: self.p_type,
                p_offset: narrow(self.p_offset, "p_offset")?,
                p_vaddr: narrow(self.p_vaddr, "p_vaddr")?,
                p_paddr: narrow(self.p_paddr, "p_paddr")?,
                p_filesz: narrow(self.p_filesz, "p_filesz")?,
                p_memsz: narrow(self.p_memsz, "p_memsz")?,
                p_flags: self.p_flags,
                p_align: narrow(self.p_align, "p_align")?,
            }
            .to_bytes()),
            ElfClass::Elf64 => Ok(Elf64ProgramRaw {
                p_type: self.p_type,
                p_flags: self.p_flags,
                p_offset: self.p_offset,
                p_vaddr: self.p_vaddr,
                p_paddr: self.p_paddr,
                p_filesz: self.p_filesz,
                p_memsz: self.p_memsz,
                p_align: self.p_align,
            }
            .to_bytes()),
        }
    }

    /// Whether `addr..addr+size` lies entirely inside this segment's
    /// virtual-address range.
    pub fn contains_range(&self, addr: u64, size: u64) -> bool {
        addr >= self.p_vaddr && addr + size <= self.p_vaddr + self.p_memsz
    }
}

/// Read the section header table, checking the on-disk entry size against
/// the expected struct size first. A mismatch means the template came from a
/// different toolchain layout and nothing downstream can be trusted.
pub fn read_sections(data: &[u8], header: &ElfHeader) -> DeployResult<Vec<Section>> {
    let entry_size = header.class.section_entry_size();
    if usize::from(header.e_shentsize) != entry_size {
        return Err(DeployError::HeaderSizeMismatch {
            what: "section header",
            got: u64::from(header.e_shentsize),
            expected: entry_size as u64,
        });
    }
    let mut sections = Vec::with_capacity(usize::from(header.e_shnum));
    for index in 0..usize::from(header.e_shnum) {
        let offset = usize::try_from(header.e_shoff)
            .map_err(|_| DeployError::Overflow("e_shoff"))?
            + index * entry_size;
        let end = offset + entry_size;
        if end > data.len() {
            return Err(DeployError::Truncated("section header table"));
        }
        let section = match header.class {
            ElfClass::Elf32 => Section::from_raw32(Elf32SectionRaw::read_from(&data[offset..])?),
            ElfClass::Elf64 => Section::from_raw64(Elf64SectionRaw::read_from(&data[offset..])?),
        };
        sections.push(section);
    }
    Ok(sections)
}

/// Read the program header table with the same entry-size guard.
pub fn read_segments(data: &[u8], header: &ElfHeader) -> DeployResult<Vec<Segment>> {
    let entry_size = header.class.program_entry_size();
    if usize::from(header.e_phentsize) != entry_size {
        return Err(DeployError::HeaderSizeMismatch {
            what: "program header",
            got: u64::from(header.e_phentsize),
            expected: entry_size as u64,
        });
    }
    let mut segments = Vec::with_capacity(usize::from(header.e_phnum));
    for index in 0..usize::from(header.e_phnum) {
        let offset = usize::try_from(header.e_phoff)
            .map_err(|_| DeployError::Overflow("e_phoff"))?
            + index * entry_size;
        let end = offset + entry_size;
        if end > data.len() {
            return Err(DeployError::Truncated("program header table"));
        }
        let segment = match header.class {
            ElfClass::Elf32 => Segment::from_raw32(Elf32ProgramRaw::read_from(&data[offset..])?),
            ElfClass::Elf64 => Segment::from_raw64(Elf64ProgramRaw::read_from(&data[offset..])?),
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// NUL-terminated lookup into the section-name string table. Reads in
/// bounded 32-byte chunks and never looks past the end of the table.
pub fn read_string(data: &[u8], strtab: &Section, index: u32) -> DeployResult<String> {
    let index = u64::from(index);
    if index >= strtab.sh_size {
        return Err(DeployError::BadStringIndex(index));
    }
    let start = usize::try_from(strtab.sh_offset + index)
        .map_err(|_| DeployError::Overflow("string table offset"))?;
    let table_end = usize::try_from(strtab.sh_offset + strtab.sh_size)
        .map_err(|_| DeployError::Overflow("string table size"))?;
    if table_end > data.len() {
        return Err(DeployError::Truncated("string table"));
    }

    let mut out = Vec::new();
    let mut cursor = start;
    while cursor < table_end {
        let chunk_end = (cursor + 32).min(table_end);
        let chunk = &data[cursor..chunk_end];
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(out).map_err(|_| DeployError::UnterminatedString(index));
        }
        out.extend_from_slice(chunk);
        cursor = chunk_end;
    }
    Err(DeployError::UnterminatedString(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(Elf32HeaderRaw::SIZE, 52);
        assert_eq!(Elf64HeaderRaw::SIZE, 64);
        assert_eq!(Elf32SectionRaw::SIZE, 40);
        assert_eq!(Elf64SectionRaw::SIZE, 64);
        assert_eq!(Elf32ProgramRaw::SIZE, 32);
        assert_eq!(Elf64ProgramRaw::SIZE, 56);
    }

    #[test]
    fn test_class_round() {
        assert_eq!(ElfClass::Elf32.round(5), 8);
        assert_eq!(ElfClass::Elf32.round(8), 8);
        assert_eq!(ElfClass::Elf64.round(5), 8);
        assert_eq!(ElfClass::Elf64.round(9), 16);
        assert_eq!(ElfClass::Elf32.round(9), 12);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let data = vec![0u8; 64];
        assert!(matches!(
            ElfHeader::parse(&data),
            Err(DeployError::BadMagic("ELF"))
        ));
    }

    #[test]
    fn test_big_endian_rejected() {
        let mut data = vec![0u8; 64];
        data[..4].copy_from_slice(&ELF_MAGIC);
        data[EI_CLASS] = ELFCLASS32;
        data[EI_DATA] = 2; // ELFDATA2MSB
        data[EI_VERSION] = EV_CURRENT;
        assert!(matches!(
            ElfHeader::parse(&data),
            Err(DeployError::BadEncoding)
        ));
    }

    #[test]
    fn test_read_string_bounded() {
        // String table blob with the section overlay pointing into it.
        let mut data = vec![0u8; 128];
        data[64..73].copy_from_slice(b".project\0");
        let strtab = Section {
            sh_name: 0,
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 64,
            sh_size: 9,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        };
        assert_eq!(read_string(&data, &strtab, 0).unwrap(), ".project");
        assert!(read_string(&data, &strtab, 9).is_err());
    }

    #[test]
    fn test_read_string_missing_nul() {
        let mut data = vec![0x41u8; 64];
        data[0] = b'x';
        let strtab = Section {
            sh_name: 0,
            sh_type: 3,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 64,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        };
        assert!(matches!(
            read_string(&data, &strtab, 0),
            Err(DeployError::UnterminatedString(0))
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let header = ElfHeader {
            class: ElfClass::Elf64,
            e_ident: {
                let mut ident = [0u8; 16];
                ident[..4].copy_from_slice(&ELF_MAGIC);
                ident[EI_CLASS] = ELFCLASS64;
                ident[EI_DATA] = ELFDATA2LSB;
                ident[EI_VERSION] = EV_CURRENT;
                ident
            },
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: 0x400000,
            e_phoff: 64,
            e_shoff: 0x2000,
            e_flags: 0,
            e_ehsize: 64,
            e_phentsize: 56,
            e_phnum: 2,
            e_shentsize: 64,
            e_shnum: 5,
            e_shstrndx: 4,
        };
        let bytes = header.encode().unwrap();
        let parsed = ElfHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.encode().unwrap(), bytes);
    }
}

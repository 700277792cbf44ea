//! PE/COFF header records and the parsed image model.
//!
//! The optional header comes in two widths (PE32 magic `0x10b`, PE32+ magic
//! `0x20b`), probed from the magic field before a struct layout is
//! committed to. [`PeFormat`] is the width strategy: it carries the
//! historical fixed offsets of the checksum field and the security data
//! directory, which downstream signature verifiers depend on.

use crate::error::{DeployError, DeployResult};
use crate::layout;

pub const DOS_MAGIC: &[u8; 2] = b"MZ";
pub const PE_SIGNATURE: &[u8; 4] = b"PE\0\0";
pub const E_LFANEW_OFFSET: usize = 0x3c;

pub const OPTIONAL_MAGIC_PE32: u16 = 0x10b;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20b;

pub const IMAGE_DIRECTORY_ENTRY_RESOURCE: usize = 2;
pub const IMAGE_DIRECTORY_ENTRY_SECURITY: usize = 4;

pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;

/// File alignment used by every engine template this patcher accepts.
pub const PAGE_SIZE: u32 = 4096;

pub const PROJECT_SECTION: &[u8] = b".project";
pub const PAYLOAD_SECTION: &[u8] = b".payload";
pub const RESOURCE_SECTION: &[u8] = b".rsrc";

layout! {
    le struct CoffHeader {
        pub machine: u16,
        pub number_of_sections: u16,
        pub time_date_stamp: u32,
        pub pointer_to_symbol_table: u32,
        pub number_of_symbols: u32,
        pub size_of_optional_header: u16,
        pub characteristics: u16,
    }
}

layout! {
    le struct OptionalHeader32Raw {
        pub magic: u16,
        pub major_linker_version: u8,
        pub minor_linker_version: u8,
        pub size_of_code: u32,
        pub size_of_initialized_data: u32,
        pub size_of_uninitialized_data: u32,
        pub address_of_entry_point: u32,
        pub base_of_code: u32,
        pub base_of_data: u32,
        pub image_base: u32,
        pub section_alignment: u32,
        pub file_alignment: u32,
        pub major_operating_system_version: u16,
        pub minor_operating_system_version: u16,
        pub major_image_version: u16,
        pub minor_image_version: u16,
        pub major_subsystem_version: u16,
        pub minor_subsystem_version: u16,
        pub win32_version_value: u32,
        pub size_of_image: u32,
        pub size_of_headers: u32,
        pub checksum: u32,
        pub subsystem: u16,
        pub dll_characteristics: u16,
        pub size_of_stack_reserve: u32,
        pub size_of_stack_commit: u32,
        pub size_of_heap_reserve: u32,
        pub size_of_heap_commit: u32,
        pub loader_flags: u32,
        pub number_of_rva_and_sizes: u32,
    }
}

layout! {
    le struct OptionalHeader64Raw {
        pub magic: u16,
        pub major_linker_version: u8,
        pub minor_linker_version: u8,
        pub size_of_code: u32,
        pub size_of_initialized_data: u32,
        pub size_of_uninitialized_data: u32,
        pub address_of_entry_point: u32,
        pub base_of_code: u32,
        pub image_base: u64,
        pub section_alignment: u32,
        pub file_alignment: u32,
        pub major_operating_system_version: u16,
        pub minor_operating_system_version: u16,
        pub major_image_version: u16,
        pub minor_image_version: u16,
        pub major_subsystem_version: u16,
        pub minor_subsystem_version: u16,
        pub win32_version_value: u32,
        pub size_of_image: u32,
        pub size_of_headers: u32,
        pub checksum: u32,
        pub subsystem: u16,
        pub dll_characteristics: u16,
        pub size_of_stack_reserve: u64,
        pub size_of_stack_commit: u64,
        pub size_of_heap_reserve: u64,
        pub size_of_heap_commit: u64,
        pub loader_flags: u32,
        pub number_of_rva_and_sizes: u32,
    }
}

layout! {
    le struct DataDirectory {
        pub virtual_address: u32,
        pub size: u32,
    }
}

layout! {
    le struct SectionHeader {
        pub name: [u8; 8],
        pub virtual_size: u32,
        pub virtual_address: u32,
        pub size_of_raw_data: u32,
        pub pointer_to_raw_data: u32,
        pub pointer_to_relocations: u32,
        pub pointer_to_linenumbers: u32,
        pub number_of_relocations: u16,
        pub number_of_linenumbers: u16,
        pub characteristics: u32,
    }
}

impl SectionHeader {
    /// Compare against a section name, honoring the 8-byte padded field.
    pub fn name_is(&self, name: &[u8]) -> bool {
        let mut padded = [0u8; 8];
        if name.len() > 8 {
            return false;
        }
        padded[..name.len()].copy_from_slice(name);
        self.name == padded
    }
}

/// Width strategy probed from the optional header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeFormat {
    Pe32,
    Pe32Plus,
}

impl PeFormat {
    pub fn from_magic(magic: u16) -> DeployResult<Self> {
        match magic {
            OPTIONAL_MAGIC_PE32 => Ok(PeFormat::Pe32),
            OPTIONAL_MAGIC_PE32_PLUS => Ok(PeFormat::Pe32Plus),
            other => Err(DeployError::BadOptionalMagic(other)),
        }
    }

    /// Size of the optional header before the data directories.
    pub fn fixed_size(self) -> usize {
        match self {
            PeFormat::Pe32 => OptionalHeader32Raw::SIZE,
            PeFormat::Pe32Plus => OptionalHeader64Raw::SIZE,
        }
    }

    /// Offset of the security data-directory entry from the PE signature.
    ///
    /// These constants are load-bearing for existing signed binaries; they
    /// are deliberately not derived from the field list.
    pub fn security_entry_offset(self) -> usize {
        match self {
            PeFormat::Pe32 => 152,
            PeFormat::Pe32Plus => 168,
        }
    }

    /// Offset of the checksum field from the start of the optional header
    /// (identical at both widths).
    pub fn checksum_offset(self) -> usize {
        64
    }
}

/// Width-independent view of the optional header, preserving every field so
/// a zero-delta rewrite is byte-identical.
#[derive(Debug, Clone)]
pub struct OptionalHeader {
    pub format: PeFormat,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    /// PE32 only; retained verbatim and ignored for PE32+.
    pub base_of_data: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_operating_system_version: u16,
    pub minor_operating_system_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
    pub data_directories: Vec<DataDirectory>,
}

impl OptionalHeader {
    pub fn parse(buf: &[u8]) -> DeployResult<Self> {
        if buf.len() < 2 {
            return Err(DeployError::Truncated("optional header"));
        }
        let magic = u16::from_le_bytes([buf[0], buf[1]]);
        let format = PeFormat::from_magic(magic)?;
        let (header, dir_count) = match format {
            PeFormat::Pe32 => {
                let raw = OptionalHeader32Raw::read_from(buf)?;
                (
                    OptionalHeader {
                        format,
                        major_linker_version: raw.major_linker_version,
                        minor_linker_version: raw.minor_linker_version,
                        size_of_code: raw.size_of_code,
                        size_of_initialized_data: raw.size_of_initialized_data,
                        size_of_uninitialized_data: raw.size_of_uninitialized_data,
                        address_of_entry_point: raw.address_of_entry_point,
                        base_of_code: raw.base_of_code,
                        base_of_data: raw.base_of_data,
                        image_base: u64::from(raw.image_base),
                        section_alignment: raw.section_alignment,
                        file_alignment: raw.file_alignment,
                        major_operating_system_version: raw.major_operating_system_version,
                        minor_operating_system_version: raw.minor_operating_system_version,
                        major_image_version: raw.major_image_version,
                        minor_image_version: raw.minor_image_version,
                        major_subsystem_version: raw.major_subsystem_version,
                        minor_subsystem_version: raw.minor_subsystem_version,
                        win32_version_value: raw.win32_version_value,
                        size_of_image: raw.size_of_image,
                        size_of_headers: raw.size_of_headers,
                        checksum: raw.checksum,
                        subsystem: raw.subsystem,
                        dll_characteristics: raw.dll_characteristics,
                        size_of_stack_reserve: u64::from(raw.size_of_stack_reserve),
                        size_of_stack_commit: u64::from(raw.size_of_stack_commit),
                        size_of_heap_reserve: u64::from(raw.size_of_heap_reserve),
                        size_of_heap_commit: u64::from(raw.size_of_heap_commit),
                        loader_flags: raw.loader_flags,
                        number_of_rva_and_sizes: raw.number_of_rva_and_sizes,
                        data_directories: Vec::new(),
                    },
                    raw.number_of_rva_and_sizes as usize,
                )
            }
            PeFormat::Pe32Plus => {
                let raw = OptionalHeader64Raw::read_from(buf)?;
                (
                    OptionalHeader {
                        format,
                        major_linker_version: raw.major_linker_version,
                        minor_linker_version: raw.minor_linker_version,
                        size_of_code: raw.size_of_code,
                        size_of_initialized_data: raw.size_of_initialized_data,
                        size_of_uninitialized_data: raw.size_of_uninitialized_data,
                        address_of_entry_point: raw.address_of_entry_point,
                        base_of_code: raw.base_of_code,
                        base_of_data: 0,
                        image_base: raw.image_base,
                        section_alignment: raw.section_alignment,
                        file_alignment: raw.file_alignment,
                        major_operating_system_version: raw.major_operating_system_version,
                        minor_operating_system_version: raw.minor_operating_system_version,
                        major_image_version: raw.major_image_version,
                        minor_image_version: raw.minor_image_version,
                        major_subsystem_version: raw.major_subsystem_version,
                        minor_subsystem_version: raw.minor_subsystem_version,
                        win32_version_value: raw.win32_version_value,
                        size_of_image: raw.size_of_image,
                        size_of_headers: raw.size_of_headers,
                        checksum: raw.checksum,
                        subsystem: raw.subsystem,
                        dll_characteristics: raw.dll_characteristics,
                        size_of_stack_reserve: raw.size_of_stack_reserve,
                        size_of_stack_commit: raw.size_of_stack_commit,
                        size_of_heap_reserve: raw.size_of_heap_reserve,
                        size_of_heap_commit: raw.size_of_heap_commit,
                        loader_flags: raw.loader_flags,
                        number_of_rva_and_sizes: raw.number_of_rva_and_sizes,
                        data_directories: Vec::new(),
                    },
                    raw.number_of_rva_and_sizes as usize,
                )
            }
        };

        let mut header = header;
        let mut cursor = format.fixed_size();
        for _ in 0..dir_count {
            header
                .data_directories
                .push(DataDirectory::read_from(&buf[cursor..])?);
            cursor += DataDirectory::SIZE;
        }
        Ok(header)
    }

    /// Total encoded size: fixed part plus data directories.
    pub fn encoded_size(&self) -> usize {
        self.format.fixed_size() + self.data_directories.len() * DataDirectory::SIZE
    }

    pub fn encode(&self) -> DeployResult<Vec<u8>> {
        let mut out = vec![0u8; self.encoded_size()];
        match self.format {
            PeFormat::Pe32 => {
                let narrow = |v: u64, what: &'static str| -> DeployResult<u32> {
                    u32::try_from(v).map_err(|_| DeployError::Overflow(what))
                };
                OptionalHeader32Raw {
                    magic: OPTIONAL_MAGIC_PE32,
                    major_linker_version: self.major_linker_version,
                    minor_linker_version: self.minor_linker_version,
                    size_of_code: self.size_of_code,
                    size_of_initialized_data: self.size_of_initialized_data,
                    size_of_uninitialized_data: self.size_of_uninitialized_data,
                    address_of_entry_point: self.address_of_entry_point,
                    base_of_code: self.base_of_code,
                    base_of_data: self.base_of_data,
                    image_base: narrow(self.image_base, "image_base")?,
                    section_alignment: self.section_alignment,
                    file_alignment: self.file_alignment,
                    major_operating_system_version: self.major_operating_system_version,
                    minor_operating_system_version: self.minor_operating_system_version,
                    major_image_version: self.major_image_version,
                    minor_image_version: self.minor_image_version,
                    major_subsystem_version: self.major_subsystem_version,
                    minor_subsystem_version: self.minor_subsystem_version,
                    win32_version_value: self.win32_version_value,
                    size_of_image: self.size_of_image,
                    size_of_headers: self.size_of_headers,
                    checksum: self.checksum,
                    subsystem: self.subsystem,
                    dll_characteristics: self.dll_characteristics,
                    size_of_stack_reserve: narrow(self.size_of_stack_reserve, "stack reserve")?,
                    size_of_stack_commit: narrow(self.size_of_stack_commit, "stack commit")?,
                    size_of_heap_reserve: narrow(self.size_of_heap_reserve, "heap reserve")?,
                    size_of_heap_commit: narrow(self.size_of_heap_commit, "heap commit")?,
                    loader_flags: self.loader_flags,
                    number_of_rva_and_sizes: self.number_of_rva_and_sizes,
                }
                .write_to(&mut out);
            }
            PeFormat::Pe32Plus => {
                OptionalHeader64Raw {
                    magic: OPTIONAL_MAGIC_PE32_PLUS,
                    major_linker_version: self.major_linker_version,
                    minor_linker_version: self.minor_linker_version,
                    size_of_code: self.size_of_code,
                    size_of_initialized_data: self.size_of_initialized_data,
                    size_of_uninitialized_data: self.size_of_uninitialized_data,
                    address_of_entry_point: self.address_of_entry_point,
                    base_of_code: self.base_of_code,
                    image_base: self.image_base,
                    section_alignment: self.section_alignment,
                    file_alignment: self.file_alignment,
                    major_operating_system_version: self.major_operating_system_version,
                    minor_operating_system_version: self.minor_operating_system_version,
                    major_image_version: self.major_image_version,
                    minor_image_version: self.minor_image_version,
                    major_subsystem_version: self.major_subsystem_version,
                    minor_subsystem_version: self.minor_subsystem_version,
                    win32_version_value: self.win32_version_value,
                    size_of_image: self.size_of_image,
                    size_of_headers: self.size_of_headers,
                    checksum: self.checksum,
                    subsystem: self.subsystem,
                    dll_characteristics: self.dll_characteristics,
                    size_of_stack_reserve: self.size_of_stack_reserve,
                    size_of_stack_commit: self.size_of_stack_commit,
                    size_of_heap_reserve: self.size_of_heap_reserve,
                    size_of_heap_commit: self.size_of_heap_commit,
                    loader_flags: self.loader_flags,
                    number_of_rva_and_sizes: self.number_of_rva_and_sizes,
                }
                .write_to(&mut out);
            }
        }
        let mut cursor = self.format.fixed_size();
        for dir in &self.data_directories {
            dir.write_to(&mut out[cursor..]);
            cursor += DataDirectory::SIZE;
        }
        Ok(out)
    }
}

/// Parsed view of a PE file's headers. The raw file bytes are kept by the
/// caller; this struct only records structure and offsets.
#[derive(Debug, Clone)]
pub struct PeImage {
    /// Offset of the `PE\0\0` signature (`e_lfanew`).
    pub pe_offset: usize,
    pub coff: CoffHeader,
    pub optional: OptionalHeader,
    pub sections: Vec<SectionHeader>,
}

impl PeImage {
    /// Parse DOS header, NT headers and the section table.
    pub fn parse(data: &[u8]) -> DeployResult<Self> {
        if data.len() < 64 {
            return Err(DeployError::Truncated("DOS header"));
        }
        if &data[..2] != DOS_MAGIC {
            return Err(DeployError::BadMagic("PE"));
        }
        let pe_offset = u32::from_le_bytes([
            data[E_LFANEW_OFFSET],
            data[E_LFANEW_OFFSET + 1],
            data[E_LFANEW_OFFSET + 2],
            data[E_LFANEW_OFFSET + 3],
        ]) as usize;
        if pe_offset + 4 + CoffHeader::SIZE > data.len() {
            return Err(DeployError::Truncated("NT headers"));
        }
        if &data[pe_offset..pe_offset + 4] != PE_SIGNATURE {
            return Err(DeployError::BadMagic("PE"));
        }

        let coff = CoffHeader::read_from(&data[pe_offset + 4..])?;
        let optional_offset = pe_offset + 4 + CoffHeader::SIZE;
        let optional_end = optional_offset + usize::from(coff.size_of_optional_header);
        if optional_end > data.len() {
            return Err(DeployError::Truncated("optional header"));
        }
        let optional = OptionalHeader::parse(&data[optional_offset..optional_end])?;
        if optional.encoded_size() != usize::from(coff.size_of_optional_header) {
            return Err(DeployError::HeaderSizeMismatch {
                what: "optional header",
                got: u64::from(coff.size_of_optional_header),
                expected: optional.encoded_size() as u64,
            });
        }

        let mut sections = Vec::with_capacity(usize::from(coff.number_of_sections));
        let mut cursor = optional_end;
        for _ in 0..coff.number_of_sections {
            if cursor + SectionHeader::SIZE > data.len() {
                return Err(DeployError::Truncated("section table"));
            }
            sections.push(SectionHeader::read_from(&data[cursor..])?);
            cursor += SectionHeader::SIZE;
        }

        Ok(PeImage {
            pe_offset,
            coff,
            optional,
            sections,
        })
    }

    /// File offset of the optional header.
    pub fn optional_header_offset(&self) -> usize {
        self.pe_offset + 4 + CoffHeader::SIZE
    }

    /// File offset of the section header table.
    pub fn section_table_offset(&self) -> usize {
        self.optional_header_offset() + self.optional.encoded_size()
    }

    /// File offset of the checksum field.
    pub fn checksum_offset(&self) -> usize {
        self.optional_header_offset() + self.optional.format.checksum_offset()
    }

    /// File offset of the security data-directory entry.
    pub fn security_entry_offset(&self) -> usize {
        self.pe_offset + self.optional.format.security_entry_offset()
    }

    pub fn find_section(&self, name: &[u8]) -> Option<usize> {
        self.sections.iter().position(|s| s.name_is(name))
    }

    /// Re-encode the optional header and section table over `out`.
    pub fn patch_headers(&self, out: &mut [u8]) -> DeployResult<()> {
        let optional_offset = self.optional_header_offset();
        let encoded = self.optional.encode()?;
        let end = optional_offset + encoded.len();
        if end > out.len() {
            return Err(DeployError::Truncated("output headers"));
        }
        out[optional_offset..end].copy_from_slice(&encoded);

        let mut cursor = self.section_table_offset();
        for section in &self.sections {
            if cursor + SectionHeader::SIZE > out.len() {
                return Err(DeployError::Truncated("output section table"));
            }
            section.write_to(&mut out[cursor..]);
            cursor += SectionHeader::SIZE;
        }
        Ok(())
    }
}

/// Round up to the given power-of-two alignment.
pub fn align_up(value: u32, align: u32) -> u32 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

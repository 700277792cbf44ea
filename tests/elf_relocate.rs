//! End-to-end ELF relocation against synthetic engine templates.

use standalone_deploy::elf::relocate;
use standalone_deploy::elf::types::{
    read_sections, read_segments, read_string, ElfClass, ElfHeader, ElfMode, Section, Segment,
    ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELF_MAGIC, EI_CLASS, EI_DATA, EI_VERSION, EM_AARCH64,
    EM_X86_64, ET_DYN, ET_EXEC, EV_CURRENT, PT_LOAD,
};
use standalone_deploy::DeployError;

// Offsets into the fixture's section-name table.
const NAMES: &[u8] = b"\0.text\0.payload\0.project\0.shstrtab\0";
const NAME_TEXT: u32 = 1;
const NAME_PAYLOAD: u32 = 7;
const NAME_PROJECT: u32 = 16;
const NAME_SHSTRTAB: u32 = 25;

const BASE_ADDR: u64 = 0x40_0000;

struct TemplateSpec {
    class: ElfClass,
    e_type: u16,
    e_machine: u16,
    with_payload: bool,
    /// Adds a section after `.project` with a higher address, violating the
    /// link-script layout the relocator depends on.
    with_high_section: bool,
}

impl TemplateSpec {
    fn exec64() -> Self {
        TemplateSpec {
            class: ElfClass::Elf64,
            e_type: ET_EXEC,
            e_machine: EM_X86_64,
            with_payload: true,
            with_high_section: false,
        }
    }
}

fn build_template(spec: &TemplateSpec) -> Vec<u8> {
    let class = spec.class;
    let progbits = |name: u32, addr: u64, offset: u64, size: u64| Section {
        sh_name: name,
        sh_type: 1,
        sh_flags: 0x2, // SHF_ALLOC
        sh_addr: addr,
        sh_offset: offset,
        sh_size: size,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    };

    let mut cursor = 128u64;
    let text = progbits(NAME_TEXT, BASE_ADDR + cursor, cursor, 16);
    cursor += 16;
    let payload = if spec.with_payload {
        let s = progbits(NAME_PAYLOAD, BASE_ADDR + cursor, cursor, 16);
        cursor += 16;
        Some(s)
    } else {
        None
    };
    let project = progbits(NAME_PROJECT, BASE_ADDR + cursor, cursor, 32);
    cursor += 32;
    let strtab = Section {
        sh_name: NAME_SHSTRTAB,
        sh_type: 3,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: cursor,
        sh_size: NAMES.len() as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    };
    cursor += NAMES.len() as u64;
    let shoff = (cursor + 7) & !7;

    let mut sections = vec![
        Section {
            sh_name: 0,
            sh_type: 0,
            sh_flags: 0,
            sh_addr: 0,
            sh_offset: 0,
            sh_size: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
        },
        text,
    ];
    if let Some(payload) = payload {
        sections.push(payload);
    }
    sections.push(project);
    if spec.with_high_section {
        sections.push(progbits(NAME_TEXT, project.sh_addr + 0x1000, 64, 0));
    }
    let shstrndx = sections.len() as u16;
    sections.push(strtab);

    let segment = Segment {
        p_type: PT_LOAD,
        p_flags: 5,
        p_offset: 0,
        p_vaddr: BASE_ADDR,
        p_paddr: BASE_ADDR,
        p_filesz: project.sh_offset + project.sh_size,
        p_memsz: project.sh_offset + project.sh_size,
        p_align: 0x1000,
    };

    let mut ident = [0u8; 16];
    ident[..4].copy_from_slice(&ELF_MAGIC);
    ident[EI_CLASS] = match class {
        ElfClass::Elf32 => ELFCLASS32,
        ElfClass::Elf64 => ELFCLASS64,
    };
    ident[EI_DATA] = ELFDATA2LSB;
    ident[EI_VERSION] = EV_CURRENT;
    let header = ElfHeader {
        class,
        e_ident: ident,
        e_type: spec.e_type,
        e_machine: spec.e_machine,
        e_version: 1,
        e_entry: BASE_ADDR + 128,
        e_phoff: 64,
        e_shoff: shoff,
        e_flags: 0,
        e_ehsize: class.header_size() as u16,
        e_phentsize: class.program_entry_size() as u16,
        e_phnum: 1,
        e_shentsize: class.section_entry_size() as u16,
        e_shnum: sections.len() as u16,
        e_shstrndx: shstrndx,
    };

    let file_len = shoff as usize + sections.len() * class.section_entry_size();
    let mut out = vec![0u8; file_len];
    out[..header.encode().unwrap().len()].copy_from_slice(&header.encode().unwrap());
    let seg_bytes = segment.encode(class).unwrap();
    out[64..64 + seg_bytes.len()].copy_from_slice(&seg_bytes);

    // Recognizable data contents.
    out[text.sh_offset as usize..(text.sh_offset + text.sh_size) as usize].fill(0x11);
    out[project.sh_offset as usize..(project.sh_offset + project.sh_size) as usize].fill(0xAA);
    if let Some(payload) = sections.iter().find(|s| s.sh_name == NAME_PAYLOAD) {
        out[payload.sh_offset as usize..(payload.sh_offset + payload.sh_size) as usize].fill(0xBB);
    }
    out[strtab.sh_offset as usize..(strtab.sh_offset + strtab.sh_size) as usize]
        .copy_from_slice(NAMES);

    let mut sh_cursor = shoff as usize;
    for section in &sections {
        let bytes = section.encode(class).unwrap();
        out[sh_cursor..sh_cursor + bytes.len()].copy_from_slice(&bytes);
        sh_cursor += bytes.len();
    }
    out
}

fn sections_by_name(data: &[u8]) -> Vec<(String, Section)> {
    let header = ElfHeader::parse(data).unwrap();
    let sections = read_sections(data, &header).unwrap();
    let strtab = sections[usize::from(header.e_shstrndx)];
    sections
        .iter()
        .map(|s| (read_string(data, &strtab, s.sh_name).unwrap(), *s))
        .collect()
}

#[test]
fn test_project_grows_and_offsets_shift() {
    let template = build_template(&TemplateSpec::exec64());
    let project = vec![0xCC; 96];
    let patched = relocate(&template, &project, None, ElfMode::Desktop).unwrap();

    // Old project was 32 bytes; net delta is 64.
    assert_eq!(patched.len(), template.len() + 64);

    let old = sections_by_name(&template);
    let new = sections_by_name(&patched);
    for ((old_name, old_section), (new_name, new_section)) in old.iter().zip(&new) {
        assert_eq!(old_name, new_name);
        if new_name == ".project" {
            assert_eq!(new_section.sh_size, 96);
            assert_eq!(new_section.sh_offset, old_section.sh_offset);
            let start = new_section.sh_offset as usize;
            assert_eq!(&patched[start..start + 96], &project[..]);
        } else if old_section.sh_offset >= old_section_end(&old, ".project") {
            // Offset-shift invariant: everything stored after the old end
            // of the project data moves by exactly the delta.
            assert_eq!(new_section.sh_offset, old_section.sh_offset + 64);
        }
    }

    let old_header = ElfHeader::parse(&template).unwrap();
    let new_header = ElfHeader::parse(&patched).unwrap();
    assert_eq!(new_header.e_shoff, old_header.e_shoff + 64);

    let segments = read_segments(&patched, &new_header).unwrap();
    let old_segments = read_segments(&template, &old_header).unwrap();
    assert_eq!(segments[0].p_filesz, old_segments[0].p_filesz + 64);
    assert_eq!(segments[0].p_memsz, old_segments[0].p_memsz + 64);
}

fn old_section_end(sections: &[(String, Section)], name: &str) -> u64 {
    let (_, s) = sections.iter().find(|(n, _)| n == name).unwrap();
    s.sh_offset + s.sh_size
}

#[test]
fn test_payload_written_before_project() {
    let template = build_template(&TemplateSpec::exec64());
    let project = vec![0xCC; 40];
    let payload = vec![0xDD; 21]; // deliberately unaligned
    let patched = relocate(&template, &project, Some(&payload), ElfMode::Desktop).unwrap();

    let new = sections_by_name(&patched);
    let (_, pay) = new.iter().find(|(n, _)| n == ".payload").unwrap();
    let (_, proj) = new.iter().find(|(n, _)| n == ".project").unwrap();

    assert_eq!(pay.sh_size, 21);
    // Project lands on the next 8-byte boundary after the payload.
    assert_eq!(proj.sh_offset, (pay.sh_offset + 21 + 7) & !7);
    assert_eq!(proj.sh_size, 40);

    let pay_start = pay.sh_offset as usize;
    assert_eq!(&patched[pay_start..pay_start + 21], &payload[..]);
    let proj_start = proj.sh_offset as usize;
    assert_eq!(&patched[proj_start..proj_start + 40], &project[..]);
}

#[test]
fn test_zero_delta_preserves_header_region() {
    // Same-size replacement: every header byte must survive untouched.
    for class in [ElfClass::Elf32, ElfClass::Elf64] {
        let mut spec = TemplateSpec::exec64();
        spec.class = class;
        let template = build_template(&spec);
        let project = vec![0x5A; 32];
        let patched = relocate(&template, &project, None, ElfMode::Desktop).unwrap();

        assert_eq!(patched.len(), template.len());
        let proj = sections_by_name(&template)
            .into_iter()
            .find(|(n, _)| n == ".project")
            .unwrap()
            .1;
        let start = proj.sh_offset as usize;
        let end = start + 32;
        assert_eq!(&patched[..start], &template[..start]);
        assert_eq!(&patched[start..end], &project[..]);
        assert_eq!(&patched[end..], &template[end..]);
    }
}

#[test]
fn test_desktop_requires_et_exec() {
    let mut spec = TemplateSpec::exec64();
    spec.e_type = ET_DYN;
    let template = build_template(&spec);
    assert!(matches!(
        relocate(&template, &[0; 8], None, ElfMode::Desktop),
        Err(DeployError::BadObjectType { .. })
    ));
    // The same template is fine as an Android engine.
    assert!(relocate(&template, &[0; 8], None, ElfMode::Android).is_ok());
}

#[test]
fn test_android_machine_whitelist() {
    let mut spec = TemplateSpec::exec64();
    spec.e_type = ET_DYN;
    spec.e_machine = EM_AARCH64;
    assert!(relocate(&build_template(&spec), &[0; 8], None, ElfMode::Android).is_ok());

    spec.e_machine = 0x1234;
    assert!(matches!(
        relocate(&build_template(&spec), &[0; 8], None, ElfMode::Android),
        Err(DeployError::BadMachine(0x1234))
    ));
}

#[test]
fn test_section_after_project_rejected() {
    let mut spec = TemplateSpec::exec64();
    spec.with_high_section = true;
    let template = build_template(&spec);
    assert!(matches!(
        relocate(&template, &[0; 8], None, ElfMode::Desktop),
        Err(DeployError::BadSectionOrder)
    ));
}

#[test]
fn test_payload_without_section_rejected() {
    let mut spec = TemplateSpec::exec64();
    spec.with_payload = false;
    let template = build_template(&spec);
    assert!(matches!(
        relocate(&template, &[0; 8], Some(&[1, 2, 3]), ElfMode::Desktop),
        Err(DeployError::PayloadOutsideProjectSegment)
    ));
}

#[test]
fn test_missing_project_section_rejected() {
    // Rename the project entry so lookup fails.
    let template = build_template(&TemplateSpec::exec64());
    let header = ElfHeader::parse(&template).unwrap();
    let mut broken = template.clone();
    let entry_size = header.class.section_entry_size();
    // Entry 3 is .project (null, .text, .payload, .project, .shstrtab).
    let entry_offset = header.e_shoff as usize + 3 * entry_size;
    broken[entry_offset..entry_offset + 4].copy_from_slice(&u32::to_le_bytes(NAME_TEXT));
    assert!(matches!(
        relocate(&broken, &[0; 8], None, ElfMode::Desktop),
        Err(DeployError::NoProjectSection)
    ));
}

//! The shared ELF relocation algorithm.
//!
//! One copy of the logic runs for both widths; everything width-specific
//! lives behind [`ElfClass`]. The algorithm is a single linear pipeline with
//! no backtracking: validate, locate, rewrite offsets, emit.

use log::debug;

use super::types::{
    read_sections, read_segments, read_string, ElfHeader, ElfMode, Section, Segment,
    EM_386, EM_AARCH64, EM_ARM, EM_X86_64, ET_DYN, ET_EXEC, PAYLOAD_SECTION, PROJECT_SECTION,
    PT_LOAD,
};
use crate::error::{DeployError, DeployResult};

/// Patch `template`, replacing the contents of its `.project` section with
/// `project` and (optionally) its `.payload` section with `payload`, and
/// return the rewritten image.
pub fn relocate(
    template: &[u8],
    project: &[u8],
    payload: Option<&[u8]>,
    mode: ElfMode,
) -> DeployResult<Vec<u8>> {
    let mut header = ElfHeader::parse(template)?;
    validate_mode(&header, mode)?;

    let mut sections = read_sections(template, &header)?;
    let mut segments = read_segments(template, &header)?;

    let strtab_index = usize::from(header.e_shstrndx);
    let strtab = *sections
        .get(strtab_index)
        .ok_or(DeployError::Truncated("section name string table"))?;

    let project_index = find_section(template, &sections, &strtab, PROJECT_SECTION)?
        .ok_or(DeployError::NoProjectSection)?;
    let payload_index = find_section(template, &sections, &strtab, PAYLOAD_SECTION)?;

    let proj = sections[project_index];

    // Layout invariant: the project section must be last by load order. Any
    // section with a higher virtual address means the link script this
    // template was built with is not the one this patcher understands.
    for (index, section) in sections.iter().enumerate() {
        if index != project_index && section.sh_addr > proj.sh_addr {
            return Err(DeployError::BadSectionOrder);
        }
    }

    // Locate the segment the loader maps the project with.
    let segment_index = segments
        .iter()
        .position(|s| s.contains_range(proj.sh_addr, proj.sh_size))
        .ok_or(DeployError::NoProjectSegment)?;

    // A payload blob without a .payload section to hold it is a template
    // mismatch; a .payload section without a blob is simply left alone.
    let payload_pair: Option<(usize, &[u8])> = match (payload_index, payload) {
        (Some(index), Some(bytes)) => Some((index, bytes)),
        (None, Some(_)) => return Err(DeployError::PayloadOutsideProjectSegment),
        _ => None,
    };
    if let Some((index, _)) = payload_pair {
        let pay = sections[index];
        if !segments[segment_index].contains_range(pay.sh_addr, pay.sh_size) {
            return Err(DeployError::PayloadOutsideProjectSegment);
        }
    }

    // The mutated byte range of the original file: from the first blob being
    // replaced to the end of the old project data.
    let start = if let Some((index, _)) = payload_pair {
        sections[index].sh_offset
    } else {
        proj.sh_offset
    };
    let old_end = proj.sh_offset + proj.sh_size;
    if start > old_end || usize::try_from(old_end).map_err(|_| DeployError::Overflow("section end"))? > template.len() {
        return Err(DeployError::Truncated("project section data"));
    }

    // New layout: payload (if any) at its old offset, project rounded up to
    // the width's natural alignment right behind it.
    let new_proj_offset = if let Some((_, bytes)) = payload_pair {
        header.class.round(start + bytes.len() as u64)
    } else {
        start
    };
    let new_end = new_proj_offset + project.len() as u64;
    let delta = new_end as i64 - old_end as i64;
    debug!(
        "elf relocate: start={start:#x} old_end={old_end:#x} new_end={new_end:#x} delta={delta}"
    );

    // Rewrite the mutated section entries.
    {
        let addr_shift = new_proj_offset as i64 - proj.sh_offset as i64;
        let entry = &mut sections[project_index];
        entry.sh_offset = new_proj_offset;
        entry.sh_size = project.len() as u64;
        entry.sh_addr = shift(entry.sh_addr, addr_shift)?;
    }
    if let Some((index, bytes)) = payload_pair {
        sections[index].sh_size = bytes.len() as u64;
    }

    // Grow the containing segment by the net delta.
    {
        let seg = &mut segments[segment_index];
        seg.p_filesz = shift(seg.p_filesz, delta)?;
        seg.p_memsz = shift(seg.p_memsz, delta)?;
    }

    // Shift every section stored at or after the old end of the project data.
    for (index, section) in sections.iter_mut().enumerate() {
        if index == project_index || Some(index) == payload_index {
            continue;
        }
        if section.sh_offset >= old_end {
            section.sh_offset = shift(section.sh_offset, delta)?;
        }
    }

    // Shift the header tables if they live past the mutated region.
    if header.e_shoff >= old_end {
        header.e_shoff = shift(header.e_shoff, delta)?;
    }
    if header.e_phoff >= old_end {
        header.e_phoff = shift(header.e_phoff, delta)?;
    }

    // Any other segment past the region shifts too; a loadable one there
    // means the link-script assumption is broken and the output would not
    // run, so fail instead of emitting garbage.
    for (index, segment) in segments.iter_mut().enumerate() {
        if index == segment_index {
            continue;
        }
        if segment.p_offset >= old_end {
            if segment.p_type == PT_LOAD {
                return Err(DeployError::BadSectionOrder);
            }
            segment.p_offset = shift(segment.p_offset, delta)?;
        }
    }

    // Emit: head verbatim, payload + pad, project, tail verbatim, then patch
    // the header and both tables in place at their (shifted) offsets.
    let start_usize = usize::try_from(start).map_err(|_| DeployError::Overflow("start offset"))?;
    let old_end_usize =
        usize::try_from(old_end).map_err(|_| DeployError::Overflow("old end offset"))?;

    let mut out = Vec::with_capacity(template.len().saturating_add_signed(delta as isize));
    out.extend_from_slice(&template[..start_usize]);
    if let Some((_, bytes)) = payload_pair {
        out.extend_from_slice(bytes);
        out.resize(
            usize::try_from(new_proj_offset).map_err(|_| DeployError::Overflow("project offset"))?,
            0,
        );
    }
    out.extend_from_slice(project);
    out.extend_from_slice(&template[old_end_usize..]);

    patch_at(&mut out, 0, &header.encode()?)?;

    let phoff = usize::try_from(header.e_phoff).map_err(|_| DeployError::Overflow("e_phoff"))?;
    let mut cursor = phoff;
    for segment in &segments {
        let bytes = segment.encode(header.class)?;
        patch_at(&mut out, cursor, &bytes)?;
        cursor += bytes.len();
    }

    let shoff = usize::try_from(header.e_shoff).map_err(|_| DeployError::Overflow("e_shoff"))?;
    let mut cursor = shoff;
    for section in &sections {
        let bytes = section.encode(header.class)?;
        patch_at(&mut out, cursor, &bytes)?;
        cursor += bytes.len();
    }

    Ok(out)
}

fn validate_mode(header: &ElfHeader, mode: ElfMode) -> DeployResult<()> {
    match mode {
        ElfMode::Desktop => {
            if header.e_type != ET_EXEC {
                return Err(DeployError::BadObjectType {
                    got: header.e_type,
                    expected: ET_EXEC,
                });
            }
        }
        ElfMode::Android => {
            if header.e_type != ET_DYN {
                return Err(DeployError::BadObjectType {
                    got: header.e_type,
                    expected: ET_DYN,
                });
            }
            if !matches!(header.e_machine, EM_ARM | EM_AARCH64 | EM_386 | EM_X86_64) {
                return Err(DeployError::BadMachine(header.e_machine));
            }
        }
    }
    Ok(())
}

/// Find a section by exact name (the NUL-inclusive comparison falls out of
/// full-string equality).
fn find_section(
    data: &[u8],
    sections: &[Section],
    strtab: &Section,
    name: &str,
) -> DeployResult<Option<usize>> {
    for (index, section) in sections.iter().enumerate() {
        if section.sh_name == 0 {
            continue;
        }
        if read_string(data, strtab, section.sh_name)? == name {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn shift(value: u64, delta: i64) -> DeployResult<u64> {
    value
        .checked_add_signed(delta)
        .ok_or(DeployError::Overflow("shifted offset"))
}

fn patch_at(out: &mut [u8], offset: usize, bytes: &[u8]) -> DeployResult<()> {
    let end = offset
        .checked_add(bytes.len())
        .ok_or(DeployError::Overflow("patch range"))?;
    if end > out.len() {
        return Err(DeployError::Truncated("output image"));
    }
    out[offset..end].copy_from_slice(bytes);
    Ok(())
}

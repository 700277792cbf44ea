//! The PE relocation pipeline.
//!
//! A single linear pass: parse headers, classify the trailing sections,
//! regenerate the resource tree, lay payload/project/resource back down as
//! the last three sections on fresh page boundaries, then patch the
//! optional header and section table over the rebuilt image.

use log::debug;

use super::icon::add_icon;
use super::resource::{
    self, clear_icon_resources, install, read_resource_tree, ResourceData, ResourceNode,
    DEFAULT_LOCALE, RT_MANIFEST,
};
use super::types::{
    align_up, PeImage, IMAGE_DIRECTORY_ENTRY_RESOURCE, IMAGE_SCN_CNT_INITIALIZED_DATA, PAGE_SIZE,
    PAYLOAD_SECTION, PROJECT_SECTION, RESOURCE_SECTION,
};
use crate::error::{DeployError, DeployResult};

/// Resource mutations to apply while the tree is open. All byte slices are
/// already loaded from disk by the caller.
#[derive(Debug, Default)]
pub struct ResourceUpdates<'a> {
    pub app_icon: Option<&'a [u8]>,
    pub doc_icon: Option<&'a [u8]>,
    pub version_info: &'a [(String, String)],
    pub manifest: Option<&'a [u8]>,
}

impl ResourceUpdates<'_> {
    fn is_empty(&self) -> bool {
        self.app_icon.is_none()
            && self.doc_icon.is_none()
            && self.version_info.is_empty()
            && self.manifest.is_none()
    }
}

/// Patch `template`: replace the `.project` (and optionally `.payload`)
/// section contents and rebuild `.rsrc` with the requested updates.
///
/// `project == None` selects icons-only mode: the project bytes are carried
/// through verbatim and only the resource section is regenerated.
pub fn relocate(
    template: &[u8],
    project: Option<&[u8]>,
    payload: Option<&[u8]>,
    updates: &ResourceUpdates<'_>,
) -> DeployResult<Vec<u8>> {
    let image = PeImage::parse(template)?;
    let count = image.sections.len();

    let rsrc_index = image
        .find_section(RESOURCE_SECTION)
        .ok_or(DeployError::NoResourceSection)?;
    let project_index = image.find_section(PROJECT_SECTION);
    let payload_index = image.find_section(PAYLOAD_SECTION);

    if project.is_some() && project_index.is_none() {
        return Err(DeployError::NoProjectSection);
    }
    if payload.is_some() && payload_index.is_none() {
        return Err(DeployError::Unsupported(
            "payload blob requires a .payload section in the template",
        ));
    }
    if payload.is_some() && project.is_none() {
        return Err(DeployError::Unsupported(
            "payload blob requires project data",
        ));
    }

    // The resource section must be the file's final section; everything the
    // relocator writes goes at the tail.
    if rsrc_index != count - 1 {
        return Err(DeployError::BadSectionOrder);
    }

    // Rebuild the resource tree before any layout math: its size feeds the
    // new section table.
    let rsrc_header = image.sections[rsrc_index];
    let mut root = read_resource_tree(
        template,
        rsrc_header.virtual_address,
        rsrc_header.pointer_to_raw_data as usize,
        rsrc_header.size_of_raw_data as usize,
    )?;
    apply_updates(&mut root, updates)?;

    match project {
        Some(project) => relocate_full(template, image, root, project, payload, rsrc_index),
        None => relocate_icons_only(template, image, root, rsrc_index),
    }
}

fn apply_updates(root: &mut ResourceNode, updates: &ResourceUpdates<'_>) -> DeployResult<()> {
    if updates.is_empty() {
        return Ok(());
    }
    if updates.app_icon.is_some() || updates.doc_icon.is_some() {
        clear_icon_resources(root)?;
    }
    if let Some(ico) = updates.app_icon {
        add_icon(root, ico, 1, DEFAULT_LOCALE)?;
    }
    if let Some(ico) = updates.doc_icon {
        add_icon(root, ico, 2, DEFAULT_LOCALE)?;
    }
    if !updates.version_info.is_empty() {
        super::version::add_version_info(root, updates.version_info)?;
    }
    if let Some(manifest) = updates.manifest {
        install(
            root,
            RT_MANIFEST,
            1,
            DEFAULT_LOCALE,
            ResourceData::Owned(manifest.to_vec()),
        )?;
    }
    Ok(())
}

/// Full relocation: payload (optional), project and resource rewritten as
/// the last three sections.
fn relocate_full(
    template: &[u8],
    mut image: PeImage,
    root: ResourceNode,
    project: &[u8],
    payload: Option<&[u8]>,
    rsrc_index: usize,
) -> DeployResult<Vec<u8>> {
    let count = image.sections.len();
    let project_index = image
        .find_section(PROJECT_SECTION)
        .ok_or(DeployError::NoProjectSection)?;
    let payload_index = image.find_section(PAYLOAD_SECTION);

    // Header-order constraint: project directly before resource, payload
    // (when present) directly before project. A template whose linker
    // emitted payload and project the other way round gets its two header
    // entries swapped rather than rejected.
    let mut project_index = project_index;
    if let Some(pay) = payload_index {
        let slots = [count - 3, count - 2];
        if !slots.contains(&pay) || !slots.contains(&project_index) {
            return Err(DeployError::BadSectionOrder);
        }
        if pay > project_index {
            image.sections.swap(pay, project_index);
            project_index = pay;
        }
    } else if project_index != count - 2 {
        return Err(DeployError::BadSectionOrder);
    }
    let payload_index = payload_index.map(|_| count - 3);

    // Mutation begins at the lowest offset of the rewritten sections; every
    // other section must end before it.
    let mut mutated = vec![project_index, rsrc_index];
    if payload_index.is_some() {
        mutated.push(count - 3);
    }
    let base_offset = mutated
        .iter()
        .map(|&i| image.sections[i].pointer_to_raw_data)
        .min()
        .unwrap_or(0);
    let base_rva = mutated
        .iter()
        .map(|&i| image.sections[i].virtual_address)
        .min()
        .unwrap_or(0);
    for (index, section) in image.sections.iter().enumerate() {
        if mutated.contains(&index) {
            continue;
        }
        // Widened: a corrupt header extent must fail the ordering check,
        // not wrap.
        let end =
            u64::from(section.pointer_to_raw_data) + u64::from(section.size_of_raw_data);
        if end > u64::from(base_offset) {
            return Err(DeployError::BadSectionOrder);
        }
    }

    let mut out = Vec::with_capacity(template.len());
    out.extend_from_slice(&template[..base_offset as usize]);

    let mut file_cursor = base_offset;
    let mut rva_cursor = base_rva;

    if let (Some(index), Some(bytes)) = (payload_index, payload) {
        place_section(&mut image, index, file_cursor, rva_cursor, bytes.len())?;
        out.extend_from_slice(bytes);
        pad_to_page(&mut out, &mut file_cursor, bytes.len())?;
        rva_cursor = advance_rva(rva_cursor, bytes.len())?;
    } else if let Some(index) = payload_index {
        // Payload section exists but no blob was supplied: carry the old
        // bytes through at the new location.
        let old = image.sections[index];
        let range = old.pointer_to_raw_data as usize
            ..(old.pointer_to_raw_data + old.size_of_raw_data) as usize;
        let bytes = template
            .get(range)
            .ok_or(DeployError::Truncated("payload section data"))?;
        place_section(
            &mut image,
            index,
            file_cursor,
            rva_cursor,
            old.virtual_size as usize,
        )?;
        out.extend_from_slice(bytes);
        pad_to_page(&mut out, &mut file_cursor, bytes.len())?;
        rva_cursor = advance_rva(rva_cursor, old.virtual_size as usize)?;
    }

    place_section(&mut image, project_index, file_cursor, rva_cursor, project.len())?;
    out.extend_from_slice(project);
    pad_to_page(&mut out, &mut file_cursor, project.len())?;
    rva_cursor = advance_rva(rva_cursor, project.len())?;

    finish(template, image, root, rsrc_index, out, file_cursor, rva_cursor)
}

/// Icons-only: everything up to the old resource section is carried through
/// verbatim (project bytes included); only `.rsrc` is regenerated in place.
fn relocate_icons_only(
    template: &[u8],
    image: PeImage,
    root: ResourceNode,
    rsrc_index: usize,
) -> DeployResult<Vec<u8>> {
    let rsrc = image.sections[rsrc_index];
    let base_offset = rsrc.pointer_to_raw_data;
    if base_offset as usize > template.len() {
        return Err(DeployError::Truncated("resource section offset"));
    }
    let out = template[..base_offset as usize].to_vec();
    finish(
        template,
        image,
        root,
        rsrc_index,
        out,
        base_offset,
        rsrc.virtual_address,
    )
}

/// Shared tail: serialize the resource tree at its final address, fix the
/// section header, optional header totals and resource directory, zero the
/// checksum, and patch the headers into the output.
fn finish(
    template: &[u8],
    mut image: PeImage,
    root: ResourceNode,
    rsrc_index: usize,
    mut out: Vec<u8>,
    file_cursor: u32,
    rva_cursor: u32,
) -> DeployResult<Vec<u8>> {
    let rsrc_size = resource::measure(&root);
    let rsrc_bytes = resource::write(&root, rva_cursor, template)?;
    debug_assert_eq!(rsrc_bytes.len(), rsrc_size);
    out.extend_from_slice(&rsrc_bytes);

    {
        let section = &mut image.sections[rsrc_index];
        section.pointer_to_raw_data = file_cursor;
        section.virtual_address = rva_cursor;
        section.size_of_raw_data =
            u32::try_from(rsrc_size).map_err(|_| DeployError::Overflow("resource size"))?;
        section.virtual_size = section.size_of_raw_data;
    }

    let end_rva = advance_rva(rva_cursor, rsrc_size)?;
    image.optional.size_of_image = align_up(end_rva, image.optional.section_alignment.max(1));
    image.optional.size_of_initialized_data = image
        .sections
        .iter()
        .filter(|s| s.characteristics & IMAGE_SCN_CNT_INITIALIZED_DATA != 0)
        .try_fold(0u32, |sum, s| {
            sum.checked_add(align_up(s.size_of_raw_data, PAGE_SIZE))
        })
        .ok_or(DeployError::Overflow("initialized data size"))?;

    if let Some(dir) = image
        .optional
        .data_directories
        .get_mut(IMAGE_DIRECTORY_ENTRY_RESOURCE)
    {
        dir.virtual_address = rva_cursor;
        dir.size =
            u32::try_from(rsrc_size).map_err(|_| DeployError::Overflow("resource size"))?;
    }

    // Left zeroed; the signer hashes around this field and the loader does
    // not require it for executables.
    image.optional.checksum = 0;

    debug!(
        "pe relocate: rsrc at {file_cursor:#x}/rva {rva_cursor:#x}, image size {:#x}",
        image.optional.size_of_image
    );

    image.patch_headers(&mut out)?;
    Ok(out)
}

fn place_section(
    image: &mut PeImage,
    index: usize,
    file_offset: u32,
    rva: u32,
    len: usize,
) -> DeployResult<()> {
    let len = u32::try_from(len).map_err(|_| DeployError::Overflow("section size"))?;
    let section = &mut image.sections[index];
    section.pointer_to_raw_data = file_offset;
    section.virtual_address = rva;
    section.size_of_raw_data = align_up(len, PAGE_SIZE);
    section.virtual_size = len;
    Ok(())
}

fn pad_to_page(out: &mut Vec<u8>, file_cursor: &mut u32, written: usize) -> DeployResult<()> {
    let written = u32::try_from(written).map_err(|_| DeployError::Overflow("section size"))?;
    let rounded = align_up(written, PAGE_SIZE);
    out.resize(out.len() + (rounded - written) as usize, 0);
    *file_cursor = file_cursor
        .checked_add(rounded)
        .ok_or(DeployError::Overflow("file offset"))?;
    Ok(())
}

fn advance_rva(rva: u32, len: usize) -> DeployResult<u32> {
    let len = u32::try_from(len).map_err(|_| DeployError::Overflow("virtual size"))?;
    rva.checked_add(align_up(len, PAGE_SIZE))
        .ok_or(DeployError::Overflow("virtual address"))
}

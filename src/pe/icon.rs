//! `.ico` parsing and icon resource injection.
//!
//! An `.ico` container becomes two kinds of resources: one RT_GROUP_ICON
//! leaf holding a `GRPICONDIR` descriptor, and one RT_ICON leaf per image.
//! Image IDs are allocated after the highest icon ID already present so an
//! engine template's remaining icons are never clobbered by number reuse.

use crate::error::{DeployError, DeployResult};
use crate::layout;
use crate::pe::resource::{
    highest_icon_id, install, ResourceData, ResourceNode, RT_GROUP_ICON, RT_ICON,
};

layout! {
    le struct IconDir {
        pub reserved: u16,
        pub icon_type: u16,
        pub count: u16,
    }
}

layout! {
    le struct IconDirEntry {
        pub width: u8,
        pub height: u8,
        pub color_count: u8,
        pub reserved: u8,
        pub planes: u16,
        pub bit_count: u16,
        pub bytes_in_res: u32,
        pub image_offset: u32,
    }
}

layout! {
    le struct GrpIconDirEntry {
        pub width: u8,
        pub height: u8,
        pub color_count: u8,
        pub reserved: u8,
        pub planes: u16,
        pub bit_count: u16,
        pub bytes_in_res: u32,
        pub icon_id: u16,
    }
}

/// One image slice out of a parsed `.ico` file.
struct IconImage<'a> {
    entry: IconDirEntry,
    data: &'a [u8],
}

fn parse_ico(bytes: &[u8]) -> DeployResult<Vec<IconImage<'_>>> {
    let header = IconDir::read_from(bytes)
        .map_err(|_| DeployError::BadIconFile("file too short for ICONDIR header".into()))?;
    if header.reserved != 0 || header.icon_type != 1 {
        return Err(DeployError::BadIconFile(format!(
            "not an icon container (reserved={}, type={})",
            header.reserved, header.icon_type
        )));
    }
    if header.count == 0 {
        return Err(DeployError::BadIconFile("icon container is empty".into()));
    }

    let mut images = Vec::with_capacity(usize::from(header.count));
    let mut cursor = IconDir::SIZE;
    for index in 0..header.count {
        let entry = bytes
            .get(cursor..)
            .and_then(|tail| IconDirEntry::read_from(tail).ok())
            .ok_or_else(|| {
                DeployError::BadIconFile(format!("truncated ICONDIRENTRY {index}"))
            })?;
        cursor += IconDirEntry::SIZE;

        let start = entry.image_offset as usize;
        let end = start
            .checked_add(entry.bytes_in_res as usize)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| {
                DeployError::BadIconFile(format!("image {index} range exceeds the file"))
            })?;
        images.push(IconImage {
            entry,
            data: &bytes[start..end],
        });
    }
    Ok(images)
}

/// Inject the icon container `ico` into the tree: a group descriptor at
/// RT_GROUP_ICON → `id` → `locale` and one RT_ICON leaf per image.
pub fn add_icon(
    root: &mut ResourceNode,
    ico: &[u8],
    id: u32,
    locale: u32,
) -> DeployResult<()> {
    let images = parse_ico(ico)?;
    let first_id = highest_icon_id(root) + 1;

    let mut group = Vec::with_capacity(IconDir::SIZE + images.len() * GrpIconDirEntry::SIZE);
    group.extend_from_slice(
        &IconDir {
            reserved: 0,
            icon_type: 1,
            count: u16::try_from(images.len())
                .map_err(|_| DeployError::BadIconFile("too many images".into()))?,
        }
        .to_bytes(),
    );

    for (index, image) in images.iter().enumerate() {
        let icon_id = first_id + index as u32;
        group.extend_from_slice(
            &GrpIconDirEntry {
                width: image.entry.width,
                height: image.entry.height,
                color_count: image.entry.color_count,
                reserved: image.entry.reserved,
                planes: image.entry.planes,
                bit_count: image.entry.bit_count,
                bytes_in_res: image.entry.bytes_in_res,
                icon_id: u16::try_from(icon_id)
                    .map_err(|_| DeployError::BadIconFile("icon ID space exhausted".into()))?,
            }
            .to_bytes(),
        );
        install(
            root,
            RT_ICON,
            icon_id,
            locale,
            ResourceData::Owned(image.data.to_vec()),
        )?;
    }

    install(root, RT_GROUP_ICON, id, locale, ResourceData::Owned(group))
}

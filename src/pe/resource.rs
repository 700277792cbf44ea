//! In-memory model of the PE `.rsrc` directory tree.
//!
//! The tree is read lazily: leaves record a byte range into the source file
//! and are only copied when the tree is serialized, so icon and bitmap data
//! never lives in memory twice. Injectors replace leaves with owned buffers.
//!
//! Serialized layout is four consecutive streams: directory headers and
//! entries, name strings (rounded to 8), data-entry descriptors, then the
//! data itself with each datum rounded to 8. The grand total is rounded to
//! 4096. Rounding data first and the total last determines the final file
//! layout and must not be reordered.

use crate::error::{DeployError, DeployResult};
use crate::layout;

pub const RT_ICON: u32 = 3;
pub const RT_GROUP_ICON: u32 = 14;
pub const RT_VERSION: u32 = 16;
pub const RT_MANIFEST: u32 = 24;

/// `LANG_ENGLISH | SUBLANG_ENGLISH_US`, the locale every injected resource
/// is filed under.
pub const DEFAULT_LOCALE: u32 = 0x0409;

const SUBDIRECTORY_FLAG: u32 = 0x8000_0000;
const NAME_FLAG: u32 = 0x8000_0000;

/// Directory nesting never exceeds three levels in a well-formed file; the
/// cap only exists to reject self-referencing offsets in corrupt input.
const MAX_DEPTH: usize = 8;

layout! {
    le struct ResourceDirectoryRaw {
        pub characteristics: u32,
        pub time_date_stamp: u32,
        pub major_version: u16,
        pub minor_version: u16,
        pub number_of_named_entries: u16,
        pub number_of_id_entries: u16,
    }
}

layout! {
    le struct ResourceEntryRaw {
        pub name: u32,
        pub offset: u32,
    }
}

layout! {
    le struct ResourceDataEntryRaw {
        pub data_rva: u32,
        pub size: u32,
        pub codepage: u32,
        pub reserved: u32,
    }
}

/// Entry key: resources are looked up by numeric ID or by UTF-16 name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    Name(String),
    Id(u32),
}

/// Leaf payload: either a range of the source file (untouched resources) or
/// an owned buffer (injected resources).
#[derive(Debug, Clone)]
pub enum ResourceData {
    SourceRange { offset: usize, size: usize },
    Owned(Vec<u8>),
}

impl ResourceData {
    pub fn len(&self) -> usize {
        match self {
            ResourceData::SourceRange { size, .. } => *size,
            ResourceData::Owned(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub id: ResourceId,
    pub node: ResourceNode,
}

/// A node of the resource tree. The tagged variant replaces the on-disk
/// union so a repurposed leaf can never leak stale fields.
#[derive(Debug, Clone)]
pub enum ResourceNode {
    Directory {
        characteristics: u32,
        time_date_stamp: u32,
        major_version: u16,
        minor_version: u16,
        children: Vec<ResourceEntry>,
    },
    Leaf {
        data: ResourceData,
        codepage: u32,
    },
}

impl ResourceNode {
    pub fn directory() -> Self {
        ResourceNode::Directory {
            characteristics: 0,
            time_date_stamp: 0,
            major_version: 0,
            minor_version: 0,
            children: Vec::new(),
        }
    }

    pub fn children(&self) -> DeployResult<&[ResourceEntry]> {
        match self {
            ResourceNode::Directory { children, .. } => Ok(children),
            ResourceNode::Leaf { .. } => Err(DeployError::BadResourceTree(
                "expected a directory, found a leaf".into(),
            )),
        }
    }

    fn children_mut(&mut self) -> DeployResult<&mut Vec<ResourceEntry>> {
        match self {
            ResourceNode::Directory { children, .. } => Ok(children),
            ResourceNode::Leaf { .. } => Err(DeployError::BadResourceTree(
                "expected a directory, found a leaf".into(),
            )),
        }
    }

    /// Look up or insert the subdirectory child with the given ID. A leaf
    /// already present under that ID is repurposed into an empty directory.
    pub fn subdirectory(&mut self, id: u32) -> DeployResult<&mut ResourceNode> {
        let children = self.children_mut()?;
        let index = match children
            .iter()
            .position(|entry| entry.id == ResourceId::Id(id))
        {
            Some(index) => {
                if matches!(children[index].node, ResourceNode::Leaf { .. }) {
                    children[index].node = ResourceNode::directory();
                }
                index
            }
            None => {
                children.push(ResourceEntry {
                    id: ResourceId::Id(id),
                    node: ResourceNode::directory(),
                });
                children.len() - 1
            }
        };
        Ok(&mut children[index].node)
    }

    /// Install a leaf under the given ID, replacing whatever was there.
    pub fn set_leaf(&mut self, id: u32, data: ResourceData, codepage: u32) -> DeployResult<()> {
        let children = self.children_mut()?;
        let node = ResourceNode::Leaf { data, codepage };
        match children
            .iter()
            .position(|entry| entry.id == ResourceId::Id(id))
        {
            Some(index) => children[index].node = node,
            None => children.push(ResourceEntry {
                id: ResourceId::Id(id),
                node,
            }),
        }
        Ok(())
    }

    pub fn find(&self, id: u32) -> Option<&ResourceNode> {
        match self {
            ResourceNode::Directory { children, .. } => children
                .iter()
                .find(|entry| entry.id == ResourceId::Id(id))
                .map(|entry| &entry.node),
            ResourceNode::Leaf { .. } => None,
        }
    }
}

/// Install `data` at `type_id` → `id` → `locale`, the shape every injector
/// needs.
pub fn install(
    root: &mut ResourceNode,
    type_id: u32,
    id: u32,
    locale: u32,
    data: ResourceData,
) -> DeployResult<()> {
    root.subdirectory(type_id)?
        .subdirectory(id)?
        .set_leaf(locale, data, 0)
}

/// Empty the RT_ICON and RT_GROUP_ICON subtrees so a full icon replacement
/// leaves no orphaned image data reachable.
pub fn clear_icon_resources(root: &mut ResourceNode) -> DeployResult<()> {
    for type_id in [RT_ICON, RT_GROUP_ICON] {
        if root.find(type_id).is_some() {
            *root.subdirectory(type_id)? = ResourceNode::directory();
        }
    }
    Ok(())
}

/// Highest icon ID in use under RT_ICON; new icon images are numbered after
/// it.
pub fn highest_icon_id(root: &ResourceNode) -> u32 {
    let mut highest = 0;
    if let Some(ResourceNode::Directory { children, .. }) = root.find(RT_ICON) {
        for entry in children {
            if let ResourceId::Id(id) = entry.id {
                highest = highest.max(id);
            }
        }
    }
    highest
}

/// Parse the resource tree rooted at `section_start` in `data`. Leaf data
/// entries hold RVAs; `virtual_address` converts them back to file offsets.
pub fn read_resource_tree(
    data: &[u8],
    virtual_address: u32,
    section_start: usize,
    section_size: usize,
) -> DeployResult<ResourceNode> {
    let end = section_start
        .checked_add(section_size)
        .filter(|end| *end <= data.len())
        .ok_or(DeployError::Truncated("resource section"))?;
    let section = &data[section_start..end];
    read_directory(data, section, virtual_address, section_start, 0, 0)
}

fn read_directory(
    data: &[u8],
    section: &[u8],
    virtual_address: u32,
    section_start: usize,
    offset: usize,
    depth: usize,
) -> DeployResult<ResourceNode> {
    if depth > MAX_DEPTH {
        return Err(DeployError::BadResourceTree(
            "directory nesting too deep".into(),
        ));
    }
    let dir = ResourceDirectoryRaw::read_from(
        section
            .get(offset..)
            .ok_or(DeployError::Truncated("resource directory"))?,
    )?;

    let count = usize::from(dir.number_of_named_entries) + usize::from(dir.number_of_id_entries);
    let mut children = Vec::with_capacity(count);
    let mut cursor = offset + ResourceDirectoryRaw::SIZE;
    for _ in 0..count {
        let entry = ResourceEntryRaw::read_from(
            section
                .get(cursor..)
                .ok_or(DeployError::Truncated("resource directory entry"))?,
        )?;
        cursor += ResourceEntryRaw::SIZE;

        let id = if entry.name & NAME_FLAG != 0 {
            ResourceId::Name(read_name(section, (entry.name & !NAME_FLAG) as usize)?)
        } else {
            ResourceId::Id(entry.name)
        };

        let node = if entry.offset & SUBDIRECTORY_FLAG != 0 {
            read_directory(
                data,
                section,
                virtual_address,
                section_start,
                (entry.offset & !SUBDIRECTORY_FLAG) as usize,
                depth + 1,
            )?
        } else {
            let descriptor = ResourceDataEntryRaw::read_from(
                section
                    .get(entry.offset as usize..)
                    .ok_or(DeployError::Truncated("resource data entry"))?,
            )?;
            let file_offset = descriptor
                .data_rva
                .checked_sub(virtual_address)
                .map(|rel| rel as usize + section_start)
                .ok_or_else(|| {
                    DeployError::BadResourceTree("resource data below section base".into())
                })?;
            if file_offset + descriptor.size as usize > data.len() {
                return Err(DeployError::Truncated("resource data"));
            }
            ResourceNode::Leaf {
                data: ResourceData::SourceRange {
                    offset: file_offset,
                    size: descriptor.size as usize,
                },
                codepage: descriptor.codepage,
            }
        };
        children.push(ResourceEntry { id, node });
    }

    Ok(ResourceNode::Directory {
        characteristics: dir.characteristics,
        time_date_stamp: dir.time_date_stamp,
        major_version: dir.major_version,
        minor_version: dir.minor_version,
        children,
    })
}

fn read_name(section: &[u8], offset: usize) -> DeployResult<String> {
    let bytes = section
        .get(offset..offset + 2)
        .ok_or(DeployError::Truncated("resource name"))?;
    let count = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let mut units = Vec::with_capacity(count);
    for index in 0..count {
        let at = offset + 2 + index * 2;
        let pair = section
            .get(at..at + 2)
            .ok_or(DeployError::Truncated("resource name"))?;
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    String::from_utf16(&units)
        .map_err(|_| DeployError::BadResourceTree("resource name is not valid UTF-16".into()))
}

fn round8(value: usize) -> usize {
    (value + 7) & !7
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamSizes {
    headers: usize,
    names: usize,
    descriptors: usize,
    data: usize,
}

fn measure_streams(node: &ResourceNode, sizes: &mut StreamSizes) {
    match node {
        ResourceNode::Directory { children, .. } => {
            sizes.headers += ResourceDirectoryRaw::SIZE + children.len() * ResourceEntryRaw::SIZE;
            for entry in children {
                if let ResourceId::Name(name) = &entry.id {
                    sizes.names += 2 + name.encode_utf16().count() * 2;
                }
                measure_streams(&entry.node, sizes);
            }
        }
        ResourceNode::Leaf { data, .. } => {
            sizes.descriptors += ResourceDataEntryRaw::SIZE;
            sizes.data += round8(data.len());
        }
    }
}

/// Serialized size of the tree: the four streams summed, rounded to 4096.
pub fn measure(root: &ResourceNode) -> usize {
    let mut sizes = StreamSizes::default();
    measure_streams(root, &mut sizes);
    let total = sizes.headers + round8(sizes.names) + sizes.descriptors + sizes.data;
    (total + 4095) & !4095
}

struct TreeWriter<'a> {
    buf: Vec<u8>,
    source: &'a [u8],
    virtual_address: u32,
    names_cursor: usize,
    descriptor_cursor: usize,
    data_cursor: usize,
}

/// Serialize the tree into a fresh `.rsrc` section image of exactly
/// [`measure`] bytes. `virtual_address` is where the section will be mapped;
/// `source` backs any leaves still referencing the template file.
pub fn write(
    root: &ResourceNode,
    virtual_address: u32,
    source: &[u8],
) -> DeployResult<Vec<u8>> {
    let mut sizes = StreamSizes::default();
    measure_streams(root, &mut sizes);
    let names_base = sizes.headers;
    let descriptor_base = names_base + round8(sizes.names);
    let data_base = descriptor_base + sizes.descriptors;

    let mut writer = TreeWriter {
        buf: vec![0u8; measure(root)],
        source,
        virtual_address,
        names_cursor: names_base,
        descriptor_cursor: descriptor_base,
        data_cursor: data_base,
    };

    // Root directory sits at offset zero; siblings are laid out before any
    // child directory's own table (the header cursor runs ahead of the
    // recursion).
    let mut header_cursor = directory_table_size(root)?;
    writer.write_directory(root, 0, &mut header_cursor)?;
    Ok(writer.buf)
}

fn directory_table_size(node: &ResourceNode) -> DeployResult<usize> {
    Ok(ResourceDirectoryRaw::SIZE + node.children()?.len() * ResourceEntryRaw::SIZE)
}

impl TreeWriter<'_> {
    fn write_directory(
        &mut self,
        node: &ResourceNode,
        offset: usize,
        header_cursor: &mut usize,
    ) -> DeployResult<()> {
        let (characteristics, time_date_stamp, major_version, minor_version, children) =
            match node {
                ResourceNode::Directory {
                    characteristics,
                    time_date_stamp,
                    major_version,
                    minor_version,
                    children,
                } => (
                    *characteristics,
                    *time_date_stamp,
                    *major_version,
                    *minor_version,
                    children,
                ),
                ResourceNode::Leaf { .. } => {
                    return Err(DeployError::BadResourceTree(
                        "resource tree root is a leaf".into(),
                    ))
                }
            };

        // Named entries precede ID entries in the on-disk table.
        let ordered: Vec<&ResourceEntry> = children
            .iter()
            .filter(|entry| matches!(entry.id, ResourceId::Name(_)))
            .chain(
                children
                    .iter()
                    .filter(|entry| matches!(entry.id, ResourceId::Id(_))),
            )
            .collect();
        let named = ordered
            .iter()
            .filter(|entry| matches!(entry.id, ResourceId::Name(_)))
            .count();

        ResourceDirectoryRaw {
            characteristics,
            time_date_stamp,
            major_version,
            minor_version,
            number_of_named_entries: u16::try_from(named)
                .map_err(|_| DeployError::Overflow("resource entry count"))?,
            number_of_id_entries: u16::try_from(ordered.len() - named)
                .map_err(|_| DeployError::Overflow("resource entry count"))?,
        }
        .write_to(&mut self.buf[offset..offset + ResourceDirectoryRaw::SIZE]);

        // First pass over the entries: claim space and record where each
        // child directory's own table will live, so the entry table can be
        // written before the recursion fills those tables in.
        let mut entry_cursor = offset + ResourceDirectoryRaw::SIZE;
        let mut child_offsets = Vec::with_capacity(ordered.len());
        for entry in &ordered {
            let name = match &entry.id {
                ResourceId::Name(name) => self.write_name(name)? | NAME_FLAG,
                ResourceId::Id(id) => *id,
            };
            let target = match &entry.node {
                ResourceNode::Directory { .. } => {
                    let child_offset = *header_cursor;
                    *header_cursor += directory_table_size(&entry.node)?;
                    child_offsets.push(Some(child_offset));
                    u32::try_from(child_offset)
                        .map_err(|_| DeployError::Overflow("resource directory offset"))?
                        | SUBDIRECTORY_FLAG
                }
                ResourceNode::Leaf { data, codepage } => {
                    child_offsets.push(None);
                    self.write_leaf(data, *codepage)?
                }
            };
            ResourceEntryRaw {
                name,
                offset: target,
            }
            .write_to(&mut self.buf[entry_cursor..entry_cursor + ResourceEntryRaw::SIZE]);
            entry_cursor += ResourceEntryRaw::SIZE;
        }

        // Second pass: descend into child directories at their claimed
        // offsets.
        for (entry, child_offset) in ordered.iter().zip(child_offsets) {
            if let Some(child_offset) = child_offset {
                self.write_directory(&entry.node, child_offset, header_cursor)?;
            }
        }
        Ok(())
    }

    fn write_name(&mut self, name: &str) -> DeployResult<u32> {
        let offset = self.names_cursor;
        let units: Vec<u16> = name.encode_utf16().collect();
        let count =
            u16::try_from(units.len()).map_err(|_| DeployError::Overflow("resource name"))?;
        self.buf[offset..offset + 2].copy_from_slice(&count.to_le_bytes());
        let mut cursor = offset + 2;
        for unit in units {
            self.buf[cursor..cursor + 2].copy_from_slice(&unit.to_le_bytes());
            cursor += 2;
        }
        self.names_cursor = cursor;
        u32::try_from(offset).map_err(|_| DeployError::Overflow("resource name offset"))
    }

    fn write_leaf(&mut self, data: &ResourceData, codepage: u32) -> DeployResult<u32> {
        let descriptor_offset = self.descriptor_cursor;
        self.descriptor_cursor += ResourceDataEntryRaw::SIZE;

        let data_offset = self.data_cursor;
        let size = data.len();
        let end = data_offset + size;
        if end > self.buf.len() {
            return Err(DeployError::Truncated("resource data stream"));
        }
        match data {
            ResourceData::SourceRange { offset, size } => {
                let range = self
                    .source
                    .get(*offset..*offset + *size)
                    .ok_or(DeployError::Truncated("source resource data"))?;
                self.buf[data_offset..end].copy_from_slice(range);
            }
            ResourceData::Owned(bytes) => {
                self.buf[data_offset..end].copy_from_slice(bytes);
            }
        }
        self.data_cursor = data_offset + round8(size);

        let rva = self
            .virtual_address
            .checked_add(
                u32::try_from(data_offset)
                    .map_err(|_| DeployError::Overflow("resource data offset"))?,
            )
            .ok_or(DeployError::Overflow("resource data RVA"))?;
        ResourceDataEntryRaw {
            data_rva: rva,
            size: u32::try_from(size).map_err(|_| DeployError::Overflow("resource data size"))?,
            codepage,
            reserved: 0,
        }
        .write_to(
            &mut self.buf[descriptor_offset..descriptor_offset + ResourceDataEntryRaw::SIZE],
        );
        u32::try_from(descriptor_offset)
            .map_err(|_| DeployError::Overflow("resource descriptor offset"))
    }
}

//! The chained-fixups encoder (`LC_DYLD_CHAINED_FIXUPS`).
//!
//! Pointers are grouped by segment and page; the fixup values are written
//! into the pointer slots themselves and a second pass threads the per-page
//! chains through their `next` fields. The blob carries the per-segment page
//! starts, the imports table and the import string pool.

use zerocopy::IntoBytes;

use crate::errors::{EncodeError, ExtractError};
use crate::image::ImageView;
use crate::layout::{
    self, chained_ptr_64_bind, chained_ptr_64_rebase, chained_ptr_arm64e_auth_bind,
    chained_ptr_arm64e_auth_rebase, chained_ptr_arm64e_bind, chained_ptr_arm64e_rebase,
    chained_ptr_set_next, ChainedFixupsHeader, LinkeditDataCommand, CPU_SUBTYPE_ARM64E,
    CPU_SUBTYPE_MASK, DYLD_CHAINED_IMPORT, DYLD_CHAINED_IMPORT_ADDEND64,
    DYLD_CHAINED_PTR_64_OFFSET, DYLD_CHAINED_PTR_ARM64E, DYLD_CHAINED_PTR_START_NONE,
    SIZEOF_CHAINED_STARTS_IN_SEGMENT,
};
use crate::linkedit::{LinkeditTracker, OffsetField, Tag};
use crate::slide::PointerTracker;

struct SegPages {
    start_addr: u64,
    pages: Vec<Vec<u16>>,
}

struct Import {
    name: String,
    lib_ordinal: u64,
    weak: bool,
}

/// Emits the chained-fixups encoding from the tracker's state. Only used on
/// arm64/arm64e; 32-bit pointers cannot hold the packed form.
pub fn encode_chained_fixups(
    image: &mut ImageView,
    ptr_tracker: &PointerTracker<'_>,
    le_tracker: &mut LinkeditTracker,
) -> Result<(), ExtractError> {
    let pointer_format = chained_pointer_format(image)?;
    let page_size = u64::from(ptr_tracker.page_size());
    let header_addr = image.base_addr();

    // Group fixup sites by segment and page.
    let mut segments = Vec::new();
    for seg in &image.segments {
        let mut pages: Vec<Vec<u16>> = Vec::new();
        let range = ptr_tracker
            .pointers()
            .range(seg.vmaddr..seg.vmaddr + seg.vmsize);
        for (&addr, _) in range {
            let page_index = ((addr - seg.vmaddr) / page_size) as usize;
            if page_index >= pages.len() {
                pages.resize_with(page_index + 1, Vec::new);
            }
            pages[page_index].push((addr - seg.vmaddr - page_index as u64 * page_size) as u16);
        }
        for page in &mut pages {
            page.sort_unstable();
        }
        segments.push(SegPages {
            start_addr: seg.vmaddr,
            pages,
        });
    }

    // Build the imports table, one entry per distinct symbol.
    let mut imports: Vec<Import> = Vec::new();
    let mut ordinal_of = std::collections::HashMap::new();
    let mut bind_ordinals = std::collections::HashMap::new();
    for (&addr, info) in ptr_tracker.binds() {
        if !ptr_tracker.pointers().contains_key(&addr) {
            log::error!("bind pointer at {addr:#x} does not have a corresponding pointer");
            continue;
        }
        let preferred = info.preferred();
        let key = (preferred.name.clone(), preferred.ordinal);
        let ordinal = *ordinal_of.entry(key).or_insert_with(|| {
            imports.push(Import {
                name: preferred.name.clone(),
                lib_ordinal: preferred.ordinal,
                weak: false,
            });
            (imports.len() - 1) as u32
        });
        bind_ordinals.insert(addr, ordinal);
    }

    // Write each fixup location with an initially-zero next field.
    for seg_i in 0..image.segments.len() {
        let seg_addr = image.segments[seg_i].vmaddr;
        let seg_end = seg_addr + image.segments[seg_i].vmsize;
        let sites: Vec<(u64, u64)> = ptr_tracker
            .pointers()
            .range(seg_addr..seg_end)
            .map(|(&a, &t)| (a, t))
            .collect();

        for (addr, mut target) in sites {
            let is_bind = bind_ordinals.contains_key(&addr);
            if !is_bind && !image.contains_addr(target) {
                log::error!(
                    "pointer target at {addr:#x} is not within the image, re-pointing to mach header"
                );
                target = header_addr;
            }

            let auth = ptr_tracker.auths().get(&addr).copied();
            let raw = match (pointer_format, is_bind, auth) {
                (DYLD_CHAINED_PTR_64_OFFSET, true, _) => {
                    chained_ptr_64_bind(bind_ordinals[&addr])
                }
                (DYLD_CHAINED_PTR_64_OFFSET, false, _) => {
                    chained_ptr_64_rebase(target - header_addr)
                }
                (_, true, Some(a)) => chained_ptr_arm64e_auth_bind(
                    bind_ordinals[&addr],
                    a.diversity,
                    a.has_addr_div,
                    a.key,
                ),
                (_, true, None) => chained_ptr_arm64e_bind(bind_ordinals[&addr]),
                (_, false, Some(a)) => chained_ptr_arm64e_auth_rebase(
                    target - header_addr,
                    a.diversity,
                    a.has_addr_div,
                    a.key,
                ),
                (_, false, None) => chained_ptr_arm64e_rebase(target),
            };
            image.write_u64(addr, raw)?;
        }
    }

    // Thread the per-page chains; the deltas always fit the next fields
    // because pages never exceed the field's reach at pointer alignment.
    let next_scale = match pointer_format {
        DYLD_CHAINED_PTR_64_OFFSET => 4,
        _ => 8,
    };
    for seg in &segments {
        for (page_i, page) in seg.pages.iter().enumerate() {
            for pair in page.windows(2) {
                let loc = seg.start_addr + page_i as u64 * page_size + u64::from(pair[0]);
                let delta = u64::from(pair[1] - pair[0]);
                let raw = image.read_u64(loc)?;
                image.write_u64(
                    loc,
                    chained_ptr_set_next(raw, pointer_format, delta / next_scale),
                )?;
            }
        }
    }

    let blob = encode_blob(&segments, &imports, pointer_format, page_size, image)?;

    // The load command goes right after the last segment command; the blob
    // goes at the front of the linkedit.
    let last_seg_cmd = image
        .segments
        .iter()
        .map(|s| s.cmd_offset)
        .max()
        .unwrap_or(image.header_size());
    let pos = last_seg_cmd + image.lc_u32(last_seg_cmd, 4) as usize;

    let lc = LinkeditDataCommand {
        cmd: layout::LC_DYLD_CHAINED_FIXUPS,
        cmdsize: size_of::<LinkeditDataCommand>() as u32,
        dataoff: 0, // updated by the linkedit tracker
        datasize: blob.len() as u32,
    };
    let lc_offset = le_tracker.insert_lc(image, Some(pos), lc.as_bytes())?;

    le_tracker.insert_data(
        image,
        0,
        Tag::ChainedFixups,
        OffsetField::new(lc_offset, Tag::ChainedFixups),
        &blob,
        layout::align(blob.len() as u64, image.pointer_size()) as u32,
    )?;
    Ok(())
}

fn chained_pointer_format(image: &ImageView) -> Result<u16, EncodeError> {
    if !image.is_64() {
        return Err(EncodeError::UnsupportedChainedArch);
    }
    if image.cpusubtype() & !CPU_SUBTYPE_MASK == CPU_SUBTYPE_ARM64E {
        Ok(DYLD_CHAINED_PTR_ARM64E)
    } else {
        Ok(DYLD_CHAINED_PTR_64_OFFSET)
    }
}

fn encode_blob(
    segments: &[SegPages],
    imports: &[Import],
    pointer_format: u16,
    page_size: u64,
    image: &ImageView,
) -> Result<Vec<u8>, ExtractError> {
    let mut data = Vec::with_capacity(1024);

    let imports_format = pick_import_format(imports);
    let header = ChainedFixupsHeader {
        fixups_version: 0,
        starts_offset: layout::align(size_of::<ChainedFixupsHeader>() as u64, 8) as u32,
        imports_offset: 0, // fixed up later
        symbols_offset: 0, // fixed up later
        imports_count: imports.len() as u32,
        imports_format,
        symbols_format: 0,
    };
    data.extend_from_slice(header.as_bytes());
    pad_to(&mut data, 8);

    // Starts table: seg_count then one info offset per segment.
    let segs_header_offset = data.len();
    data.extend_from_slice(&(segments.len() as u32).to_le_bytes());
    for _ in 0..segments.len() {
        data.extend_from_slice(&0u32.to_le_bytes());
    }

    let text_start = image.base_addr();
    for (seg_i, seg) in segments.iter().enumerate() {
        if seg.pages.is_empty() {
            continue;
        }
        pad_to(&mut data, 8);
        let info_offset = (data.len() - segs_header_offset) as u32;
        let slot = segs_header_offset + 4 + seg_i * 4;
        data[slot..slot + 4].copy_from_slice(&info_offset.to_le_bytes());

        let starts = layout::ChainedStartsInSegment {
            size: (SIZEOF_CHAINED_STARTS_IN_SEGMENT + seg.pages.len() * 2) as u32,
            page_size: page_size as u16,
            pointer_format,
            segment_offset: seg.start_addr - text_start,
            max_valid_pointer: 0,
            page_count: seg.pages.len() as u16,
        };
        starts.write_to(&mut data);
        for page in &seg.pages {
            let start = page.first().copied().unwrap_or(DYLD_CHAINED_PTR_START_NONE);
            data.extend_from_slice(&start.to_le_bytes());
        }
    }

    // Imports table and the null-terminated string pool.
    let mut string_pool = vec![0u8];
    pad_to(&mut data, if imports_format == DYLD_CHAINED_IMPORT { 4 } else { 8 });
    let imports_offset = data.len() as u32;
    for import in imports {
        let name_offset = string_pool.len() as u32;
        match imports_format {
            DYLD_CHAINED_IMPORT => {
                // lib_ordinal:8 weak_import:1 name_offset:23
                let packed = (import.lib_ordinal as u32 & 0xff)
                    | (u32::from(import.weak) << 8)
                    | ((name_offset & 0x007f_ffff) << 9);
                data.extend_from_slice(&packed.to_le_bytes());
            }
            layout::DYLD_CHAINED_IMPORT_ADDEND => {
                let packed = (import.lib_ordinal as u32 & 0xff)
                    | (u32::from(import.weak) << 8)
                    | ((name_offset & 0x007f_ffff) << 9);
                data.extend_from_slice(&packed.to_le_bytes());
                data.extend_from_slice(&0i32.to_le_bytes());
            }
            _ => {
                // lib_ordinal:16 weak_import:1 reserved:15 name_offset:32
                let packed = (import.lib_ordinal & 0xffff)
                    | (u64::from(import.weak) << 16)
                    | (u64::from(name_offset) << 32);
                data.extend_from_slice(&packed.to_le_bytes());
                data.extend_from_slice(&0u64.to_le_bytes());
            }
        }
        string_pool.extend_from_slice(import.name.as_bytes());
        string_pool.push(0);
    }

    let symbols_offset = data.len() as u32;
    data.extend_from_slice(&string_pool);

    data[8..12].copy_from_slice(&imports_offset.to_le_bytes());
    data[12..16].copy_from_slice(&symbols_offset.to_le_bytes());

    pad_to(&mut data, image.pointer_size() as usize);
    Ok(data)
}

/// Import records escalate when an addend cannot be expressed or the string
/// pool would exceed 8 MB; this pipeline only produces zero addends.
fn pick_import_format(imports: &[Import]) -> u32 {
    if imports.len() >= 10_000 {
        let total: usize = imports.iter().map(|i| i.name.len() + 1).sum();
        if total >= 0x0080_0000 {
            return DYLD_CHAINED_IMPORT_ADDEND64;
        }
    }
    DYLD_CHAINED_IMPORT
}

fn pad_to(data: &mut Vec<u8>, alignment: usize) {
    let len = layout::align(data.len() as u64, alignment as u64) as usize;
    data.resize(len, 0);
}

//! Placement, propagation and re-registration of the walked ObjC atoms.
//!
//! Atoms that already live inside the image keep their addresses; the rest
//! are packed into an extra data region that becomes either a new
//! `__OBJC_EXTRA` segment (when the load-command area has room for another
//! segment header) or an extension of the highest read/write segment.

use zerocopy::IntoBytes;

use crate::errors::ExtractError;
use crate::image::{make_name16, ImageView};
use crate::layout::{
    self, SegmentCommand32, SegmentCommand64, SEGMENT_ALIGNMENT, SEG_LINKEDIT, SEG_OBJC_EXTRA,
};
use crate::linkedit::symtab::{Nlist, SymbolBucket, SymbolTableTracker};
use crate::linkedit::LinkeditTracker;
use crate::slide::PointerTracker;
use crate::symbols::SharedSymbols;

use super::atoms::{AtomArena, AtomKind, FixKind, SectionPointer};

/// Placement order of the atom groups; pointer-bearing structures first,
/// byte-packed payloads last.
const PLACEMENT_ORDER: [AtomKind; 14] = [
    AtomKind::Class,
    AtomKind::ClassData,
    AtomKind::SmallMethodList,
    AtomKind::LargeMethodList,
    AtomKind::ProtocolList,
    AtomKind::PropertyList,
    AtomKind::IvarList,
    AtomKind::ExtendedMethodTypes,
    AtomKind::Protocol,
    AtomKind::Category,
    AtomKind::SelRef,
    AtomKind::String,
    AtomKind::IvarLayout,
    AtomKind::IvarOffset,
];

pub fn place_and_commit(
    mut arena: AtomArena,
    section_pointers: Vec<SectionPointer>,
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'_>,
    st_tracker: &mut SymbolTableTracker,
    le_tracker: &mut LinkeditTracker,
) -> Result<(), ExtractError> {
    let ptr_size = image.pointer_size();

    // Decide where the extra region will live before assigning addresses.
    let seg_cmd_size = if image.is_64() {
        size_of::<SegmentCommand64>()
    } else {
        size_of::<SegmentCommand32>()
    };
    let free_lc_space = image.max_commands_size() - image.sizeofcmds() as usize;
    let new_segment = free_lc_space >= seg_cmd_size;

    let mut by_addr: Vec<usize> = (0..image.segments.len()).collect();
    by_addr.sort_by_key(|&i| image.segments[i].vmaddr);

    let mut extend_target = None;
    let region_base = if new_segment {
        // After the highest segment below linkedit, segment aligned.
        let below = by_addr
            .iter()
            .rev()
            .map(|&i| &image.segments[i])
            .find(|s| s.name != SEG_LINKEDIT);
        let Some(below) = below else {
            return Ok(());
        };
        layout::align(below.vmaddr + below.vmsize, SEGMENT_ALIGNMENT)
    } else {
        // Extend the highest read/write segment, pointer aligned.
        let target = by_addr
            .iter()
            .rev()
            .copied()
            .find(|&i| {
                let s = &image.segments[i];
                s.name != SEG_LINKEDIT && s.maxprot & 3 == 3 && s.initprot & 3 == 3
            });
        let Some(target) = target else {
            log::error!(
                "unable to find segment with read and write permissions for extra objc data"
            );
            return Ok(());
        };
        extend_target = Some(target);
        let s = &image.segments[target];
        layout::align(s.vmaddr + s.vmsize, ptr_size)
    };

    // Assign addresses. In-image atoms keep their originals; the rest pack
    // into the region, pointer aligned except for byte-packed payloads.
    let mut cursor = region_base;
    for kind in PLACEMENT_ORDER {
        for id in arena.ids_of_kind(kind) {
            let in_image = image.contains_addr(arena.get(id).source_addr);
            let atom = arena.get_mut(id);
            if atom.final_addr.is_some() {
                continue; // imps were pinned during the walk
            }
            if in_image && !kind.force_extra() {
                atom.final_addr = Some(atom.source_addr);
                atom.placed_in_image = true;
            } else {
                atom.final_addr = Some(cursor);
                let len = atom.payload.len() as u64;
                cursor += if kind.byte_packed() {
                    len
                } else {
                    layout::align(len, ptr_size)
                };
            }
        }
        cursor = layout::align(cursor, ptr_size);
    }
    let region_size = cursor - region_base;

    if region_size > 0 {
        if let Some(seg) = extend_target {
            extend_rw_segment(image, seg, region_base, region_size);
        } else {
            insert_extra_segment(image, le_tracker, region_base, region_size)?;
        }
    }

    propagate(&mut arena, ptr_size);
    write_atoms(&arena, image)?;
    track_atoms(&arena, ptr_tracker, st_tracker)?;
    track_section_pointers(&arena, &section_pointers, image, ptr_tracker, st_tracker)?;
    Ok(())
}

fn insert_extra_segment(
    image: &mut ImageView,
    le_tracker: &mut LinkeditTracker,
    base: u64,
    size: u64,
) -> Result<(), ExtractError> {
    let linkedit_cmd = image
        .segments
        .iter()
        .find(|s| s.name == SEG_LINKEDIT)
        .map(|s| s.cmd_offset);

    let lc: Vec<u8> = if image.is_64() {
        SegmentCommand64 {
            cmd: layout::LC_SEGMENT_64,
            cmdsize: size_of::<SegmentCommand64>() as u32,
            segname: make_name16(SEG_OBJC_EXTRA),
            vmaddr: base,
            vmsize: size,
            fileoff: 0,
            filesize: size,
            maxprot: 3, // read and write
            initprot: 3,
            nsects: 0,
            flags: 0,
        }
        .as_bytes()
        .to_vec()
    } else {
        SegmentCommand32 {
            cmd: layout::LC_SEGMENT,
            cmdsize: size_of::<SegmentCommand32>() as u32,
            segname: make_name16(SEG_OBJC_EXTRA),
            vmaddr: base as u32,
            vmsize: size as u32,
            fileoff: 0,
            filesize: size as u32,
            maxprot: 3,
            initprot: 3,
            nsects: 0,
            flags: 0,
        }
        .as_bytes()
        .to_vec()
    };

    le_tracker.insert_lc(image, linkedit_cmd, &lc)?;

    let seg = image
        .segment_index(SEG_OBJC_EXTRA)
        .expect("extra segment indexed after insertion");
    image.segments[seg].data = vec![0; size as usize];
    Ok(())
}

fn extend_rw_segment(image: &mut ImageView, seg: usize, base: u64, size: u64) {
    let new_end = base + size - image.segments[seg].vmaddr;
    image.segments[seg].data.resize(new_end as usize, 0);
    image.set_segment_vmsize(seg, new_end);
    image.set_segment_filesize(seg, new_end);
}

/// Writes each fixup's resolved value into its atom payload.
fn propagate(arena: &mut AtomArena, ptr_size: u64) {
    for id in 0..arena.len() {
        let atom_final = arena.get(id).final_addr();
        let resolved: Vec<(u64, u64, bool)> = arena
            .get(id)
            .fixups
            .iter()
            .map(|fix| {
                let (value, rel) = match &fix.kind {
                    FixKind::Ptr(target) => (
                        target.map(|t| arena.get(t).final_addr()).unwrap_or(0),
                        false,
                    ),
                    FixKind::PtrBits { target, bits } => (
                        target
                            .map(|t| arena.get(t).final_addr() | bits)
                            .unwrap_or(0),
                        false,
                    ),
                    // Binds take priority and leave the slot zeroed.
                    FixKind::BindPtr { target, bind } => {
                        if bind.is_some() {
                            (0, false)
                        } else {
                            (
                                target.map(|t| arena.get(t).final_addr()).unwrap_or(0),
                                false,
                            )
                        }
                    }
                    FixKind::Rel32(target) => (
                        target.map(|t| arena.get(t).final_addr()).unwrap_or(0),
                        true,
                    ),
                };
                (fix.offset, value, rel)
            })
            .collect();

        let atom = arena.get_mut(id);
        for (offset, value, rel) in resolved {
            let p = offset as usize;
            if rel {
                let value = if value == 0 {
                    0i32
                } else {
                    (value as i64 - (atom_final + offset) as i64) as i32
                };
                atom.payload[p..p + 4].copy_from_slice(&value.to_le_bytes());
            } else if ptr_size == 8 {
                atom.payload[p..p + 8].copy_from_slice(&value.to_le_bytes());
            } else {
                atom.payload[p..p + 4].copy_from_slice(&(value as u32).to_le_bytes());
            }
        }
    }
}

fn write_atoms(arena: &AtomArena, image: &mut ImageView) -> Result<(), ExtractError> {
    for (_, atom) in arena.iter() {
        if atom.kind == AtomKind::Imp || atom.payload.is_empty() {
            continue;
        }
        if atom.placed_in_image && atom.kind.byte_packed() {
            // Strings and layouts that stayed put are already correct.
            continue;
        }
        image
            .bytes_mut(atom.final_addr(), atom.payload.len())?
            .copy_from_slice(&atom.payload);
    }
    Ok(())
}

/// Evicts stale cache-era records under the moved atoms and re-registers
/// every pointer field, copying auth attributes from the original sites.
fn track_atoms(
    arena: &AtomArena,
    ptr_tracker: &mut PointerTracker<'_>,
    st_tracker: &mut SymbolTableTracker,
) -> Result<(), ExtractError> {
    // Evict everything in the extra region first.
    let mut region: Option<(u64, u64)> = None;
    for (_, atom) in arena.iter() {
        if !atom.placed_in_image && atom.kind != AtomKind::Imp {
            let start = atom.final_addr();
            let end = start + atom.payload.len() as u64;
            region = Some(match region {
                None => (start, end),
                Some((s, e)) => (s.min(start), e.max(end)),
            });
        }
    }
    if let Some((start, end)) = region {
        ptr_tracker.remove_range(start, end);
    }

    for (_, atom) in arena.iter() {
        let base = match atom.final_addr {
            Some(a) => a,
            None => continue,
        };
        for fix in &atom.fixups {
            let site = base + fix.offset;
            let source_site = atom.source_addr + fix.offset;
            match &fix.kind {
                FixKind::Ptr(target) | FixKind::PtrBits { target, .. } => {
                    if let Some(t) = target {
                        let value = match &fix.kind {
                            FixKind::PtrBits { bits, .. } => arena.get(*t).final_addr() | bits,
                            _ => arena.get(*t).final_addr(),
                        };
                        ptr_tracker.add(site, value);
                        ptr_tracker.copy_auth(site, source_site);
                    }
                }
                FixKind::BindPtr { target, bind } => {
                    if let Some(bind) = bind {
                        ptr_tracker.add(site, 0);
                        ptr_tracker.copy_auth(site, source_site);
                        ptr_tracker.add_bind(site, bind.clone());
                        ensure_bind_symbol(st_tracker, bind);
                    } else if let Some(t) = target {
                        ptr_tracker.add(site, arena.get(*t).final_addr());
                        ptr_tracker.copy_auth(site, source_site);
                    }
                }
                FixKind::Rel32(_) => {}
            }
        }
    }
    Ok(())
}

fn track_section_pointers(
    arena: &AtomArena,
    section_pointers: &[SectionPointer],
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'_>,
    st_tracker: &mut SymbolTableTracker,
) -> Result<(), ExtractError> {
    for ptr in section_pointers {
        let value = ptr
            .target
            .map(|t| arena.get(t).final_addr())
            .unwrap_or(0);
        image.write_ptr(ptr.addr, value)?;
        ptr_tracker.add(ptr.addr, value);
        if let Some(bind) = &ptr.bind {
            ptr_tracker.add_bind(ptr.addr, bind.clone());
            ensure_bind_symbol(st_tracker, bind);
        }
    }
    Ok(())
}

/// Keeps the linker view consistent: a bind whose symbol has no entry in
/// the symbol table gets a fresh undefined one.
fn ensure_bind_symbol(st_tracker: &mut SymbolTableTracker, bind: &SharedSymbols) {
    let preferred = bind.preferred();
    if st_tracker.contains_string(&preferred.name) {
        return;
    }
    let s = st_tracker.add_string(&preferred.name);
    let mut n_desc = 0u16;
    layout::set_library_ordinal(&mut n_desc, preferred.ordinal as u16);
    st_tracker.add_sym(
        SymbolBucket::Undefined,
        s,
        Nlist {
            n_type: 1,
            n_desc,
            ..Nlist::default()
        },
    );
}

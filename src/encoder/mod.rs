//! The metadata encoder: rebuilds the rebase/bind metadata from the pointer
//! tracker, choosing between the chained-fixups encoding and the legacy
//! opcode streams, then writes the symbol, string and indirect tables out of
//! the symbol-table tracker.

pub mod chained;
pub mod opcodes;

use zerocopy::IntoBytes;

use crate::bind_info::BindInfo;
use crate::cache::CacheArch;
use crate::errors::ExtractError;
use crate::image::ImageView;
use crate::layout::{self, DyldInfoCommand, BIND_SYMBOL_FLAGS_WEAK_IMPORT, BIND_TYPE_POINTER};
use crate::linkedit::symtab::{SymbolBucket, SymbolTableTracker};
use crate::linkedit::{LinkeditTracker, OffsetField, Tag};
use crate::slide::PointerTracker;

/// Emits rebase/bind metadata and the symbol tables. Chained fixups are
/// used on arm64/arm64e images that carry no `LC_DYLD_INFO`; everything
/// else gets the legacy opcode streams.
pub fn generate_metadata(
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'_>,
    le_tracker: &mut LinkeditTracker,
    st_tracker: &mut SymbolTableTracker,
    bind_info: &BindInfo,
) -> Result<(), ExtractError> {
    let dyld_info = image.find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO]);

    if image.arch == CacheArch::Arm64 && dyld_info.is_none() {
        chained::encode_chained_fixups(image, ptr_tracker, le_tracker)?;
        write_symbols(image, le_tracker, st_tracker)?;
        return Ok(());
    }

    generate_legacy(image, ptr_tracker, le_tracker, bind_info)?;
    write_symbols(image, le_tracker, st_tracker)?;
    Ok(())
}

fn generate_legacy(
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'_>,
    le_tracker: &mut LinkeditTracker,
    bind_info: &BindInfo,
) -> Result<(), ExtractError> {
    if image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        .is_none()
    {
        add_dyld_info(image, le_tracker)?;
    }

    apply_fixups(image, ptr_tracker)?;

    let dyld_info_lc = image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        .expect("dyld info command was just ensured")
        .clone();
    let segments: Vec<(u64, u64)> = image
        .segments
        .iter()
        .map(|s| (s.vmaddr, s.vmsize))
        .collect();
    let ptr_size = image.pointer_size();

    // Rebase stream from the tracker's sites, in address order.
    let addresses: Vec<u64> = ptr_tracker
        .pointers()
        .keys()
        .copied()
        .filter(|&a| segments.iter().any(|&(v, s)| a >= v && a < v + s))
        .collect();
    let rebase = opcodes::encode_rebase(&addresses, &segments, ptr_size)?;
    set_stream(
        image,
        le_tracker,
        Tag::Rebase,
        dyld_info_lc.offset,
        &rebase,
        12, // dyld_info_command.rebase_size
    )?;

    // Bind stream: records decoded from the original opcodes first, then the
    // tracker's binds overlay them.
    let mut entries: std::collections::BTreeMap<u64, opcodes::BindingEntry> =
        std::collections::BTreeMap::new();
    for rec in &bind_info.binds {
        entries.insert(
            rec.address,
            opcodes::BindingEntry {
                bind_type: rec.bind_type,
                flags: rec.flags,
                lib_ordinal: rec.lib_ordinal,
                symbol_name: rec.symbol_name.clone(),
                address: rec.address,
                addend: rec.addend,
            },
        );
    }

    let weak_ordinals: std::collections::BTreeSet<u64> = image
        .all_lcs(&[
            layout::LC_ID_DYLIB,
            layout::LC_LOAD_DYLIB,
            layout::LC_LOAD_WEAK_DYLIB,
            layout::LC_REEXPORT_DYLIB,
            layout::LC_LOAD_UPWARD_DYLIB,
            layout::LC_LAZY_LOAD_DYLIB,
        ])
        .iter()
        .enumerate()
        .filter(|(_, lc)| lc.cmd == layout::LC_LOAD_WEAK_DYLIB)
        .map(|(i, _)| i as u64)
        .collect();

    for (&addr, info) in ptr_tracker.binds() {
        if !segments.iter().any(|&(v, s)| addr >= v && addr < v + s) {
            continue;
        }
        let sym = info.preferred();
        entries.insert(
            addr,
            opcodes::BindingEntry {
                bind_type: BIND_TYPE_POINTER,
                flags: if weak_ordinals.contains(&sym.ordinal) {
                    BIND_SYMBOL_FLAGS_WEAK_IMPORT
                } else {
                    0
                },
                lib_ordinal: sym.ordinal as i32,
                symbol_name: sym.name,
                address: addr,
                addend: 0,
            },
        );
    }

    let mut bind_entries: Vec<opcodes::BindingEntry> = entries.into_values().collect();
    let bind = opcodes::encode_binding(&mut bind_entries, &segments, ptr_size)?;
    set_stream(
        image,
        le_tracker,
        Tag::Bind,
        dyld_info_lc.offset,
        &bind,
        20, // dyld_info_command.bind_size
    )?;

    Ok(())
}

/// Inserts a bare `LC_DYLD_INFO_ONLY` before `LC_SYMTAB` and folds a
/// detached export trie into it.
fn add_dyld_info(
    image: &mut ImageView,
    le_tracker: &mut LinkeditTracker,
) -> Result<(), ExtractError> {
    let symtab_offset = image.find_lc(&[layout::LC_SYMTAB]).map(|lc| lc.offset);
    let dyld_info = DyldInfoCommand {
        cmd: layout::LC_DYLD_INFO_ONLY,
        cmdsize: size_of::<DyldInfoCommand>() as u32,
        ..DyldInfoCommand::default()
    };
    let dyld_info_offset = le_tracker.insert_lc(image, symtab_offset, dyld_info.as_bytes())?;

    // Move the detached export trie into the new command.
    let Some(trie_index) = le_tracker.find(Tag::DetachedExportTrie) else {
        return Ok(());
    };
    let trie_lc = image
        .find_lc(&[layout::LC_DYLD_EXPORTS_TRIE])
        .map(|lc| lc.offset);

    let trie_record = le_tracker.records()[trie_index].clone();
    let trie_data = le_tracker.data(image, trie_index)?.to_vec();
    let true_size = trie_lc
        .map(|off| image.lc_u32(off, 12))
        .unwrap_or(trie_record.size);

    le_tracker.remove_data(image, trie_index)?;
    if let Some(trie_lc) = trie_lc {
        le_tracker.remove_lc(image, trie_lc)?;
    }

    // Removing the trie command shifted the dyld info command down.
    let dyld_info_offset = image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY])
        .map(|lc| lc.offset)
        .unwrap_or(dyld_info_offset);
    le_tracker.add_data(
        image,
        Tag::ExportTrie,
        OffsetField::new(dyld_info_offset, Tag::ExportTrie),
        &trie_data[..true_size as usize],
        trie_record.size,
    )?;
    image.set_lc_u32(dyld_info_offset, 44, true_size); // export_size
    Ok(())
}

/// Materializes every tracked pointer into memory; the opcode streams
/// describe what is already there. Out-of-image targets are retargeted to
/// the Mach header.
fn apply_fixups(image: &mut ImageView, ptr_tracker: &mut PointerTracker<'_>) -> Result<(), ExtractError> {
    let header_addr = image.base_addr();
    let sites: Vec<(u64, u64)> = image
        .segments
        .iter()
        .flat_map(|seg| {
            ptr_tracker
                .pointers()
                .range(seg.vmaddr..seg.vmaddr + seg.vmsize)
                .map(|(&a, &t)| (a, t))
                .collect::<Vec<_>>()
        })
        .collect();

    for (addr, target) in sites {
        let target = if !ptr_tracker.binds().contains_key(&addr)
            && target != 0
            && !image.contains_addr(target)
        {
            log::error!(
                "pointer target at {addr:#x} is not within the image, re-pointing to mach header"
            );
            ptr_tracker.add(addr, header_addr);
            header_addr
        } else {
            target
        };
        // Classic rebase carries no auth info.
        image.write_ptr(addr, target)?;
    }
    Ok(())
}

/// Installs or replaces one dyld-info stream in the tracked linkedit and
/// updates the command's size field.
fn set_stream(
    image: &mut ImageView,
    le_tracker: &mut LinkeditTracker,
    tag: Tag,
    lc_offset: usize,
    data: &[u8],
    size_field: usize,
) -> Result<(), ExtractError> {
    if data.is_empty() {
        if let Some(index) = le_tracker.find(tag) {
            le_tracker.remove_data(image, index)?;
        }
        image.set_lc_u32(lc_offset, tag.lc_field_offset(), 0);
        image.set_lc_u32(lc_offset, size_field, 0);
        return Ok(());
    }

    match le_tracker.find(tag) {
        Some(index) => {
            le_tracker.resize_data(image, index, data.len() as u32)?;
            le_tracker.write_data(image, index, data)?;
        }
        None => {
            le_tracker.add_data(
                image,
                tag,
                OffsetField::new(lc_offset, tag),
                data,
                data.len() as u32,
            )?;
        }
    }
    image.set_lc_u32(lc_offset, size_field, data.len() as u32);
    Ok(())
}

/// Flattens the symbol-table tracker into the linkedit: string pool, nlists
/// in bucket order and the indirect table, then points the symtab/dysymtab
/// commands at them.
fn write_symbols(
    image: &mut ImageView,
    le_tracker: &mut LinkeditTracker,
    st_tracker: &mut SymbolTableTracker,
) -> Result<(), ExtractError> {
    let built = st_tracker.build();
    let ptr_size = image.pointer_size();

    let symtab_offset = image
        .find_lc(&[layout::LC_SYMTAB])
        .ok_or(crate::errors::MachoError::MissingCommand("LC_SYMTAB"))?
        .offset;
    let dysymtab_offset = image
        .find_lc(&[layout::LC_DYSYMTAB])
        .ok_or(crate::errors::MachoError::MissingCommand("LC_DYSYMTAB"))?
        .offset;

    // String pool.
    let str_size = built.string_pool.len() as u32;
    le_tracker.add_data(
        image,
        Tag::StringPool,
        OffsetField::new(symtab_offset, Tag::StringPool),
        &built.string_pool,
        layout::align(u64::from(str_size), ptr_size) as u32,
    )?;
    image.set_lc_u32(symtab_offset, 20, str_size); // strsize

    // Symbol entries.
    let mut nlists = Vec::new();
    for &(strx, nlist) in &built.symbols {
        if image.is_64() {
            nlists.extend_from_slice(nlist.encode_64(strx).as_bytes());
        } else {
            nlists.extend_from_slice(nlist.encode_32(strx).as_bytes());
        }
    }
    le_tracker.add_data(
        image,
        Tag::SymbolEntries,
        OffsetField::new(symtab_offset, Tag::SymbolEntries),
        &nlists,
        layout::align(nlists.len() as u64, ptr_size) as u32,
    )?;
    image.set_lc_u32(symtab_offset, 12, built.symbols.len() as u32); // nsyms

    // Indirect symbol table.
    let mut indirect = Vec::with_capacity(built.indirect.len() * 4);
    for entry in &built.indirect {
        indirect.extend_from_slice(&entry.to_le_bytes());
    }
    if !indirect.is_empty() {
        le_tracker.add_data(
            image,
            Tag::IndirectSymtab,
            OffsetField::new(dysymtab_offset, Tag::IndirectSymtab),
            &indirect,
            layout::align(indirect.len() as u64, ptr_size) as u32,
        )?;
    }
    image.set_lc_u32(dysymtab_offset, 60, built.indirect.len() as u32); // nindirectsyms

    // Bucket index ranges.
    image.set_lc_u32(
        dysymtab_offset,
        8,
        st_tracker.bucket_start(SymbolBucket::Local),
    );
    image.set_lc_u32(dysymtab_offset, 12, st_tracker.bucket_len(SymbolBucket::Local));
    image.set_lc_u32(
        dysymtab_offset,
        16,
        st_tracker.bucket_start(SymbolBucket::External),
    );
    image.set_lc_u32(
        dysymtab_offset,
        20,
        st_tracker.bucket_len(SymbolBucket::External),
    );
    image.set_lc_u32(
        dysymtab_offset,
        24,
        st_tracker.bucket_start(SymbolBucket::Undefined),
    );
    image.set_lc_u32(
        dysymtab_offset,
        28,
        st_tracker.bucket_len(SymbolBucket::Undefined),
    );

    Ok(())
}

//! The linkedit optimizer: copies the image's scattered linkedit data from
//! cache layout into a single contiguous tracked region, and recovers local
//! symbols from the cache's stripped-symbols side file.

use zerocopy::FromBytes;

use crate::cache::{DyldCache, SubCache};
use crate::errors::{ExtractError, MachoError};
use crate::image::ImageView;
use crate::layout::{
    self, CacheLocalSymbolsEntry, CacheLocalSymbolsEntry64, CacheLocalSymbolsInfo, DyldInfoCommand,
    DysymtabCommand, LinkeditDataCommand, Nlist32, Nlist64, SymtabCommand, SEG_TEXT,
    OFFSET_OF_SYMBOL_FILE_UUID,
};
use crate::linkedit::symtab::{Nlist, SymbolBucket, SymbolIndex, SymbolTableTracker};
use crate::linkedit::{is_redacted_indirect, linkedit_index, LinkeditTracker, OffsetField, Tag, TrackedData};

pub struct OptimizedLinkedit {
    pub tracker: LinkeditTracker,
    pub symbols: SymbolTableTracker,
}

struct Optimizer<'a> {
    cache: &'a DyldCache,
    le_sub: &'a SubCache,
    new_data: Vec<u8>,
    records: Vec<TrackedData>,
    symbols: SymbolTableTracker,
    /// Original symbol index to tracker index, for the indirect table.
    index_map: std::collections::HashMap<u32, SymbolIndex>,
    ptr_size: u64,
}

pub fn optimize_linkedit(
    cache: &DyldCache,
    image: &mut ImageView,
) -> Result<OptimizedLinkedit, ExtractError> {
    check_load_commands(image);

    let le_index = linkedit_index(image)?;
    let le_vmaddr = image.segments[le_index].vmaddr;
    let original_filesize = image.segments[le_index].filesize;
    let (_, le_sub) = cache
        .convert_addr(le_vmaddr)
        .ok_or(MachoError::UnmappedAddress(le_vmaddr))?;

    let symtab_lc = image
        .find_lc(&[layout::LC_SYMTAB])
        .ok_or(MachoError::MissingCommand("LC_SYMTAB"))?
        .clone();
    let dysymtab_lc = image
        .find_lc(&[layout::LC_DYSYMTAB])
        .ok_or(MachoError::MissingCommand("LC_DYSYMTAB"))?
        .clone();
    let dyld_info_lc = image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        .cloned();
    let export_trie_lc = image.find_lc(&[layout::LC_DYLD_EXPORTS_TRIE]).cloned();

    let symtab: SymtabCommand = image.lc_struct(symtab_lc.offset)?;
    let dysymtab: DysymtabCommand = image.lc_struct(dysymtab_lc.offset)?;

    let mut opt = Optimizer {
        cache,
        le_sub,
        new_data: Vec::new(),
        records: Vec::new(),
        symbols: SymbolTableTracker::new(),
        index_map: std::collections::HashMap::new(),
        ptr_size: image.pointer_size(),
    };

    // Dyld info blobs first, in command order.
    if let Some(di_lc) = &dyld_info_lc {
        let di: DyldInfoCommand = image.lc_struct(di_lc.offset)?;
        opt.copy_blob(image, di.rebase_off, di.rebase_size, Tag::Rebase, di_lc.offset);
        opt.copy_blob(image, di.bind_off, di.bind_size, Tag::Bind, di_lc.offset);
        opt.copy_blob(image, di.weak_bind_off, di.weak_bind_size, Tag::WeakBind, di_lc.offset);
        opt.copy_blob(image, di.lazy_bind_off, di.lazy_bind_size, Tag::LazyBind, di_lc.offset);
        opt.copy_blob(image, di.export_off, di.export_size, Tag::ExportTrie, di_lc.offset);
    } else if let Some(et_lc) = &export_trie_lc {
        let et: LinkeditDataCommand = image.lc_struct(et_lc.offset)?;
        opt.copy_blob(image, et.dataoff, et.datasize, Tag::DetachedExportTrie, et_lc.offset);
    }

    if let Some(fs_lc) = image.find_lc(&[layout::LC_FUNCTION_STARTS]).cloned() {
        let fs: LinkeditDataCommand = image.lc_struct(fs_lc.offset)?;
        opt.copy_blob(image, fs.dataoff, fs.datasize, Tag::FunctionStarts, fs_lc.offset);
    }
    if let Some(dic_lc) = image.find_lc(&[layout::LC_DATA_IN_CODE]).cloned() {
        let dic: LinkeditDataCommand = image.lc_struct(dic_lc.offset)?;
        // Most data in code is zero sized but still track it.
        opt.copy_blob(image, dic.dataoff, dic.datasize, Tag::DataInCode, dic_lc.offset);
    }

    opt.copy_public_local_symbols(&symtab, &dysymtab);
    opt.copy_redacted_local_symbols(image);
    opt.copy_symbol_range(&symtab, dysymtab.iextdefsym, dysymtab.nextdefsym, SymbolBucket::External);
    opt.copy_symbol_range(&symtab, dysymtab.iundefsym, dysymtab.nundefsym, SymbolBucket::Undefined);
    opt.copy_indirect_symbols(&dysymtab);

    // Commit: the rebuilt buffer replaces the linkedit segment contents and
    // the original load commands are reduced to bare symtab/dysymtab.
    let Optimizer {
        new_data,
        records,
        symbols,
        ..
    } = opt;

    let new_size = new_data.len() as u64;
    image.segments[le_index].data = new_data;
    image.set_segment_vmsize(le_index, new_size);
    image.set_segment_filesize(le_index, new_size);

    let zeroed_symtab = SymtabCommand {
        cmd: layout::LC_SYMTAB,
        cmdsize: size_of::<SymtabCommand>() as u32,
        ..SymtabCommand::default()
    };
    image.write_lc_struct(symtab_lc.offset, &zeroed_symtab)?;
    let zeroed_dysymtab = DysymtabCommand {
        cmd: layout::LC_DYSYMTAB,
        cmdsize: size_of::<DysymtabCommand>() as u32,
        ..DysymtabCommand::default()
    };
    image.write_lc_struct(dysymtab_lc.offset, &zeroed_dysymtab)?;

    let tracker = LinkeditTracker::new(image, original_filesize, records)?;
    Ok(OptimizedLinkedit { tracker, symbols })
}

impl Optimizer<'_> {
    /// Appends one blob from the original linkedit file to the rebuilt
    /// region, tracking it against its load command. Absent blobs get their
    /// offset field cleared instead.
    fn copy_blob(&mut self, image: &mut ImageView, off: u32, size: u32, tag: Tag, lc_offset: usize) {
        let field = OffsetField::new(lc_offset, tag);
        if size == 0 {
            image.set_lc_u32(lc_offset, field.field_offset, 0);
            return;
        }
        let Some(bytes) = self.le_sub.bytes_at(u64::from(off), size as usize) else {
            log::error!("linkedit blob at {off:#x} is outside the cache file");
            return;
        };
        let bytes = bytes.to_vec();
        self.push_record(&bytes, tag, field);
    }

    fn push_record(&mut self, bytes: &[u8], tag: Tag, field: OffsetField) {
        let aligned = layout::align(bytes.len() as u64, self.ptr_size);
        let offset = self.new_data.len() as u64;
        self.new_data.extend_from_slice(bytes);
        self.new_data.resize(offset as usize + aligned as usize, 0);
        self.records.push(TrackedData {
            tag,
            offset,
            size: aligned as u32,
            field,
        });
    }

    fn read_nlist(&self, base: u64, index: u32) -> Option<(u32, Nlist)> {
        let size = if self.ptr_size == 8 {
            size_of::<Nlist64>()
        } else {
            size_of::<Nlist32>()
        };
        let bytes = self
            .le_sub
            .bytes_at(base + u64::from(index) * size as u64, size)?;
        Some(if self.ptr_size == 8 {
            let n = Nlist64::read_from_bytes(bytes).ok()?;
            (
                n.n_strx,
                Nlist {
                    n_type: n.n_type,
                    n_sect: n.n_sect,
                    n_desc: n.n_desc,
                    n_value: n.n_value,
                },
            )
        } else {
            let n = Nlist32::read_from_bytes(bytes).ok()?;
            (
                n.n_strx,
                Nlist {
                    n_type: n.n_type,
                    n_sect: n.n_sect,
                    n_desc: n.n_desc,
                    n_value: u64::from(n.n_value),
                },
            )
        })
    }

    fn read_string(&self, strings_off: u64, strx: u32) -> String {
        let addr = strings_off + u64::from(strx);
        let mut out = Vec::new();
        let mut pos = addr;
        while let Some(bytes) = self.le_sub.bytes_at(pos, 1) {
            if bytes[0] == 0 {
                break;
            }
            out.push(bytes[0]);
            pos += 1;
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn copy_public_local_symbols(&mut self, symtab: &SymtabCommand, dysymtab: &DysymtabCommand) {
        if dysymtab.nlocalsym == 0 {
            return;
        }
        for i in dysymtab.ilocalsym..dysymtab.ilocalsym + dysymtab.nlocalsym {
            let Some((strx, nlist)) = self.read_nlist(u64::from(symtab.symoff), i) else {
                continue;
            };
            let name = self.read_string(u64::from(symtab.stroff), strx);
            if name == "<redacted>" {
                continue;
            }
            // Local symbol indices are not tracked for indirect symbols.
            let s = self.symbols.add_string(&name);
            self.symbols.add_sym(SymbolBucket::Local, s, nlist);
        }
    }

    /// Recovers the locals that the cache builder moved into its side file.
    fn copy_redacted_local_symbols(&mut self, image: &ImageView) {
        let Some(sym_cache) = self.cache.symbols_cache() else {
            return;
        };
        if sym_cache.header.local_symbols_offset == 0 {
            return;
        }
        let info_off = sym_cache.header.local_symbols_offset;
        let Some(info_bytes) = sym_cache.bytes_at(info_off, size_of::<CacheLocalSymbolsInfo>())
        else {
            return;
        };
        let Ok(info) = CacheLocalSymbolsInfo::read_from_bytes(info_bytes) else {
            return;
        };

        let Some(text) = image.segments.iter().find(|s| s.name == SEG_TEXT) else {
            return;
        };

        // Newer caches key their entries by vm offset, older ones by file
        // offset; the presence of the symbol-file UUID tells them apart.
        let entry = if self.cache.header_contains(OFFSET_OF_SYMBOL_FILE_UUID) {
            let target = text.vmaddr - self.cache.main.header.shared_region_start;
            self.find_symbols_entry_64(sym_cache, &info, info_off, target)
        } else {
            let target = self
                .cache
                .convert_addr(text.vmaddr)
                .map(|(off, _)| off)
                .unwrap_or(0);
            self.find_symbols_entry_32(sym_cache, &info, info_off, target as u32)
        };

        let Some((nlist_start_index, nlist_count)) = entry else {
            log::error!("unable to find local symbol entries");
            return;
        };

        let nlist_base = info_off + u64::from(info.nlist_offset);
        let strings_base = info_off + u64::from(info.strings_offset);
        for i in nlist_start_index..nlist_start_index + nlist_count {
            let Some((strx, nlist)) = self.read_side_nlist(sym_cache, nlist_base, i) else {
                continue;
            };
            let name = read_side_string(sym_cache, strings_base, strx);
            let s = self.symbols.add_string(&name);
            self.symbols.add_sym(SymbolBucket::Local, s, nlist);
        }
    }

    fn find_symbols_entry_64(
        &self,
        sym_cache: &SubCache,
        info: &CacheLocalSymbolsInfo,
        info_off: u64,
        target: u64,
    ) -> Option<(u32, u32)> {
        let base = info_off + u64::from(info.entries_offset);
        for i in 0..info.entries_count {
            let off = base + u64::from(i) * size_of::<CacheLocalSymbolsEntry64>() as u64;
            let bytes = sym_cache.bytes_at(off, size_of::<CacheLocalSymbolsEntry64>())?;
            let entry = CacheLocalSymbolsEntry64::read_from_bytes(bytes).ok()?;
            if entry.dylib_offset == target {
                return Some((entry.nlist_start_index, entry.nlist_count));
            }
        }
        None
    }

    fn find_symbols_entry_32(
        &self,
        sym_cache: &SubCache,
        info: &CacheLocalSymbolsInfo,
        info_off: u64,
        target: u32,
    ) -> Option<(u32, u32)> {
        let base = info_off + u64::from(info.entries_offset);
        for i in 0..info.entries_count {
            let off = base + u64::from(i) * size_of::<CacheLocalSymbolsEntry>() as u64;
            let bytes = sym_cache.bytes_at(off, size_of::<CacheLocalSymbolsEntry>())?;
            let entry = CacheLocalSymbolsEntry::read_from_bytes(bytes).ok()?;
            if entry.dylib_offset == target {
                return Some((entry.nlist_start_index, entry.nlist_count));
            }
        }
        None
    }

    fn read_side_nlist(
        &self,
        sym_cache: &SubCache,
        base: u64,
        index: u32,
    ) -> Option<(u32, Nlist)> {
        let size = if self.ptr_size == 8 {
            size_of::<Nlist64>()
        } else {
            size_of::<Nlist32>()
        };
        let bytes = sym_cache.bytes_at(base + u64::from(index) * size as u64, size)?;
        Some(if self.ptr_size == 8 {
            let n = Nlist64::read_from_bytes(bytes).ok()?;
            (
                n.n_strx,
                Nlist {
                    n_type: n.n_type,
                    n_sect: n.n_sect,
                    n_desc: n.n_desc,
                    n_value: n.n_value,
                },
            )
        } else {
            let n = Nlist32::read_from_bytes(bytes).ok()?;
            (
                n.n_strx,
                Nlist {
                    n_type: n.n_type,
                    n_sect: n.n_sect,
                    n_desc: n.n_desc,
                    n_value: u64::from(n.n_value),
                },
            )
        })
    }

    fn copy_symbol_range(
        &mut self,
        symtab: &SymtabCommand,
        start: u32,
        count: u32,
        bucket: SymbolBucket,
    ) {
        for i in start..start + count {
            let Some((strx, nlist)) = self.read_nlist(u64::from(symtab.symoff), i) else {
                continue;
            };
            let name = self.read_string(u64::from(symtab.stroff), strx);
            let s = self.symbols.add_string(&name);
            let new_index = self.symbols.add_sym(bucket, s, nlist);
            self.index_map.insert(i, new_index);
        }
    }

    fn copy_indirect_symbols(&mut self, dysymtab: &DysymtabCommand) {
        for i in 0..dysymtab.nindirectsyms {
            let off = u64::from(dysymtab.indirectsymoff) + u64::from(i) * 4;
            let entry = self
                .le_sub
                .bytes_at(off, 4)
                .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0);
            let index = if is_redacted_indirect(entry) {
                self.symbols.get_or_make_redacted()
            } else if let Some(&mapped) = self.index_map.get(&entry) {
                mapped
            } else {
                log::debug!("indirect entry {entry} does not map to a copied symbol");
                self.symbols.get_or_make_redacted()
            };
            self.symbols.indirect_syms.push(index);
        }
    }
}

fn read_side_string(sym_cache: &SubCache, strings_base: u64, strx: u32) -> String {
    let mut out = Vec::new();
    let mut pos = strings_base + u64::from(strx);
    while let Some(bytes) = sym_cache.bytes_at(pos, 1) {
        if bytes[0] == 0 {
            break;
        }
        out.push(bytes[0]);
        pos += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Warns about load commands whose linkedit data this pipeline does not
/// carry over.
fn check_load_commands(image: &ImageView) {
    for lc in &image.commands {
        match lc.cmd {
            layout::LC_SEGMENT
            | layout::LC_SEGMENT_64
            | layout::LC_ID_DYLIB
            | layout::LC_LOAD_DYLIB
            | layout::LC_LOAD_WEAK_DYLIB
            | layout::LC_REEXPORT_DYLIB
            | layout::LC_LOAD_UPWARD_DYLIB
            | layout::LC_LAZY_LOAD_DYLIB
            | layout::LC_SUB_FRAMEWORK
            | layout::LC_SUB_CLIENT
            | layout::LC_SUB_UMBRELLA
            | layout::LC_SUB_LIBRARY
            | layout::LC_ID_DYLINKER
            | layout::LC_LOAD_DYLINKER
            | layout::LC_DYLD_ENVIRONMENT
            | layout::LC_UUID
            | layout::LC_RPATH
            | layout::LC_VERSION_MIN_MACOSX
            | layout::LC_VERSION_MIN_IPHONEOS
            | layout::LC_VERSION_MIN_WATCHOS
            | layout::LC_VERSION_MIN_TVOS
            | layout::LC_BUILD_VERSION
            | layout::LC_MAIN
            | layout::LC_SOURCE_VERSION => {
                // No linkedit data.
            }

            layout::LC_DYSYMTAB => {
                let dysymtab: DysymtabCommand = match image.lc_struct(lc.offset) {
                    Ok(d) => d,
                    Err(_) => continue,
                };
                if dysymtab.ntoc != 0 {
                    log::warn!("dysymtab's table of contents not processed");
                }
                if dysymtab.nmodtab != 0 {
                    log::warn!("dysymtab's module table not processed");
                }
                if dysymtab.nextrefsyms != 0 {
                    log::warn!("dysymtab's referenced symbol table not processed");
                }
                if dysymtab.nextrel != 0 {
                    log::warn!("dysymtab's external relocation entries not processed");
                }
                if dysymtab.nlocrel != 0 {
                    log::warn!("dysymtab's local relocation entries not processed");
                }
            }

            layout::LC_SYMTAB
            | layout::LC_DYLD_EXPORTS_TRIE
            | layout::LC_FUNCTION_STARTS
            | layout::LC_DATA_IN_CODE
            | layout::LC_DYLD_INFO
            | layout::LC_DYLD_INFO_ONLY => {
                // Contains linkedit data, properly handled.
            }

            layout::LC_TWOLEVEL_HINTS
            | layout::LC_CODE_SIGNATURE
            | layout::LC_SEGMENT_SPLIT_INFO
            | layout::LC_DYLIB_CODE_SIGN_DRS
            | layout::LC_LINKER_OPTIMIZATION_HINT
            | layout::LC_DYLD_CHAINED_FIXUPS
            | layout::LC_SYMSEG
            | layout::LC_ROUTINES
            | layout::LC_ROUTINES_64
            | layout::LC_NOTE => {
                log::warn!(
                    "unhandled load command: {:#x}, may contain linkedit data",
                    lc.cmd
                );
            }

            cmd => {
                log::warn!("unknown load command: {cmd:#x}, may contain linkedit data");
            }
        }
    }
}

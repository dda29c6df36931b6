//! The Objective-C rebuilder.
//!
//! If the image was optimized by dyld, its ObjC metadata points into the
//! cache-wide interned pool. The walker follows every `__objc_*` section
//! through the whole structure graph, building an atom per distinct source
//! address; the placer then packs the atoms that escaped the image into an
//! extra data region, rewrites relative-method encodings and re-registers
//! every pointer with the tracker.

pub mod atoms;
pub mod placer;

use std::collections::HashMap;

use crate::bind_info::BindInfo;
use crate::cache::{CacheArch, DyldCache};
use crate::errors::ExtractError;
use crate::image::{CacheImageRef, ImageView};
use crate::layout::{
    relative_list_image_index, relative_list_offset, CLASS_DATA_BITS_MASK_32,
    CLASS_DATA_BITS_MASK_64, CLASS_RO_FLAG_ROOT, METHOD_LIST_ENTSIZE_MASK, METHOD_LIST_IS_SMALL,
    METHOD_LIST_SELECTORS_ARE_DIRECT, OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES,
    OBJC_IMAGE_OPTIMIZED_BY_DYLD, RELATIVE_METHOD_MAGIC_SELECTOR,
};
use crate::linkedit::symtab::SymbolTableTracker;
use crate::linkedit::LinkeditTracker;
use crate::slide::PointerTracker;
use crate::symbols::{Symbol, SymbolicInfo, Symbolizer};

use self::atoms::{AtomArena, AtomId, AtomKind, FixKind, Fixup, SectionPointer};

/// Entry point for the ObjC pass. Exits quietly when the image was not
/// optimized by dyld; on failure the remaining pipeline continues.
pub fn fix_objc(
    cache: &DyldCache,
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'_>,
    symbolizer: &Symbolizer,
    st_tracker: &mut SymbolTableTracker,
    le_tracker: &mut LinkeditTracker,
    bind_info: &BindInfo,
) -> Result<(), ExtractError> {
    let Some((ii_seg, ii_sect)) = image.section_at("", "__objc_imageinfo") else {
        return Ok(());
    };
    let ii_addr = image.segments[ii_seg].sections[ii_sect].addr;
    let flags = image.read_u32(ii_addr + 4)?;
    if flags & OBJC_IMAGE_OPTIMIZED_BY_DYLD == 0 {
        return Ok(());
    }

    let mut walker = Walker::new(cache, image, ptr_tracker, symbolizer, bind_info);
    if !walker.walk_all() {
        return Ok(());
    }

    let Walker {
        arena,
        section_pointers,
        ..
    } = walker;

    placer::place_and_commit(
        arena,
        section_pointers,
        image,
        ptr_tracker,
        st_tracker,
        le_tracker,
    )?;

    // The output is no longer optimized by dyld.
    let flags = image.read_u32(ii_addr + 4)?;
    image.write_u32(ii_addr + 4, flags & !OBJC_IMAGE_OPTIMIZED_BY_DYLD)?;
    Ok(())
}

struct Walker<'e, 'c> {
    cache: &'c DyldCache,
    image: &'e ImageView,
    ptr_tracker: &'e PointerTracker<'c>,
    symbolizer: &'e Symbolizer,
    /// weak and regular bind records by site address.
    bind_records: HashMap<u64, (String, i32)>,
    ptr_size: u64,
    image_index: u16,
    has_category_class_properties: bool,
    /// Base address for decoding relative method selectors (version >= 16,
    /// otherwise selectors are self-relative).
    rel_sel_base: Option<u64>,
    arena: AtomArena,
    section_pointers: Vec<SectionPointer>,
}

impl<'e, 'c> Walker<'e, 'c> {
    fn new(
        cache: &'c DyldCache,
        image: &'e ImageView,
        ptr_tracker: &'e PointerTracker<'c>,
        symbolizer: &'e Symbolizer,
        bind_info: &BindInfo,
    ) -> Self {
        let mut bind_records = HashMap::new();
        for rec in bind_info.weak_binds.iter().chain(bind_info.binds.iter()) {
            bind_records.insert(rec.address, (rec.symbol_name.clone(), rec.lib_ordinal));
        }

        Walker {
            cache,
            image,
            ptr_tracker,
            symbolizer,
            bind_records,
            ptr_size: image.pointer_size(),
            image_index: 0,
            has_category_class_properties: false,
            rel_sel_base: None,
            arena: AtomArena::new(),
            section_pointers: Vec::new(),
        }
    }

    fn bits_mask(&self) -> u64 {
        if self.ptr_size == 8 {
            CLASS_DATA_BITS_MASK_64
        } else {
            CLASS_DATA_BITS_MASK_32
        }
    }

    /// The slid value of the pointer field at `base + offset`.
    fn ptr_at(&self, addr: u64) -> u64 {
        self.ptr_tracker.slide(addr)
    }

    fn raw_u32(&self, addr: u64) -> u32 {
        self.cache.read_u32_at(addr).unwrap_or(0)
    }

    fn raw_i32(&self, addr: u64) -> i32 {
        self.raw_u32(addr) as i32
    }

    /// Reads `size` raw bytes and replaces each pointer field with its slid
    /// value.
    fn read_slid(&self, addr: u64, size: usize, ptr_offsets: &[u64]) -> Vec<u8> {
        let mut payload = self
            .cache
            .read_at(addr, size)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0; size]);
        for &off in ptr_offsets {
            let value = self.ptr_at(addr + off);
            let p = off as usize;
            if self.ptr_size == 8 {
                payload[p..p + 8].copy_from_slice(&value.to_le_bytes());
            } else {
                payload[p..p + 4].copy_from_slice(&(value as u32).to_le_bytes());
            }
        }
        payload
    }

    fn write_ptr_payload(&self, payload: &mut [u8], offset: u64, value: u64) {
        let p = offset as usize;
        if self.ptr_size == 8 {
            payload[p..p + 8].copy_from_slice(&value.to_le_bytes());
        } else {
            payload[p..p + 4].copy_from_slice(&(value as u32).to_le_bytes());
        }
    }

    fn payload_ptr(&self, payload: &[u8], offset: u64) -> u64 {
        let p = offset as usize;
        if self.ptr_size == 8 {
            u64::from_le_bytes(payload[p..p + 8].try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(payload[p..p + 4].try_into().unwrap()))
        }
    }

    fn walk_all(&mut self) -> bool {
        let flags = self
            .image
            .section_at("", "__objc_imageinfo")
            .map(|(si, ci)| self.image.segments[si].sections[ci].addr)
            .and_then(|addr| self.image.read_u32(addr + 4).ok())
            .unwrap_or(0);
        self.has_category_class_properties =
            flags & OBJC_IMAGE_HAS_CATEGORY_CLASS_PROPERTIES != 0;

        if !self.parse_opt_info() {
            return false;
        }

        let ptr_size = self.ptr_size;
        let objc_sections = self.image.sections_where(|_, sect| {
            let name = sect.sect_name();
            matches!(
                name.as_str(),
                "__objc_classlist"
                    | "__objc_catlist"
                    | "__objc_protolist"
                    | "__objc_selrefs"
                    | "__objc_protorefs"
                    | "__objc_classrefs"
                    | "__objc_superrefs"
            )
        });

        for (si, ci) in objc_sections {
            let sect = &self.image.segments[si].sections[ci];
            let name = sect.sect_name();
            let sect_addr = sect.addr;
            let sect_end = sect.addr + sect.size;

            let mut p_addr = sect_addr;
            while p_addr < sect_end {
                let target = self.ptr_at(p_addr);
                match name.as_str() {
                    "__objc_classlist" => {
                        if self.image.contains_addr(target) {
                            let id = self.walk_class(target);
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: id,
                                bind: None,
                            });
                        } else {
                            log::warn!("class pointer at {p_addr:#x} points outside of image");
                        }
                    }
                    "__objc_catlist" => {
                        if self.image.contains_addr(target) {
                            let id = self.walk_category(target);
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: id,
                                bind: None,
                            });
                        } else {
                            log::warn!("category pointer at {p_addr:#x} points outside of image");
                        }
                    }
                    "__objc_protolist" => {
                        if self.image.contains_addr(target) {
                            let id = self.walk_protocol(target);
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: id,
                                bind: None,
                            });
                        } else {
                            log::warn!("protocol pointer at {p_addr:#x} points outside of image");
                        }
                    }
                    "__objc_selrefs" => {
                        let id = self.walk_string(target);
                        self.section_pointers.push(SectionPointer {
                            addr: p_addr,
                            target: id,
                            bind: None,
                        });
                    }
                    "__objc_protorefs" => {
                        let id = self.walk_protocol(target);
                        self.section_pointers.push(SectionPointer {
                            addr: p_addr,
                            target: id,
                            bind: None,
                        });
                    }
                    "__objc_classrefs" | "__objc_superrefs" => {
                        if self.image.contains_addr(target) {
                            let id = self.walk_class(target);
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: id,
                                bind: None,
                            });
                        } else if let Some(info) = self.symbolizer.share(target) {
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: None,
                                bind: Some(info),
                            });
                        } else if let Some((sym, ordinal)) = self.bind_records.get(&p_addr) {
                            let info = SymbolicInfo::new(Symbol {
                                name: sym.clone(),
                                ordinal: *ordinal as u64,
                                export_flags: None,
                            });
                            self.section_pointers.push(SectionPointer {
                                addr: p_addr,
                                target: None,
                                bind: Some(info),
                            });
                        } else {
                            log::warn!("unable to fix class ref at {p_addr:#x} -> {target:#x}");
                        }
                    }
                    _ => {}
                }
                p_addr += ptr_size;
            }
        }

        true
    }

    /// Finds libobjc's optimization tables: the relative-selector base and
    /// this image's index within the optimized header table.
    fn parse_opt_info(&mut self) -> bool {
        let libobjc = self
            .cache
            .images
            .iter()
            .find(|i| self.cache.image_path(i).contains("/libobjc."));
        let Some(libobjc) = libobjc else {
            log::warn!("unable to find image info for libobjc");
            return false;
        };
        let Ok(libobjc) = CacheImageRef::parse(self.cache, libobjc.address) else {
            return false;
        };

        let Some(opt_ro) = libobjc.section(None, "__objc_opt_ro") else {
            log::error!("unable to find __objc_opt_ro");
            return false;
        };
        let opt_addr = opt_ro.addr;
        let version = self.raw_u32(opt_addr);

        let (headeropt_off, rel_sel_off) = match version {
            12 => (self.raw_i32(opt_addr + 8), None),
            13 => (self.raw_i32(opt_addr + 12), None),
            15 => (self.raw_i32(opt_addr + 12), None),
            16 => (
                self.raw_i32(opt_addr + 12),
                Some(self.raw_i32(opt_addr + 32)),
            ),
            v => {
                log::error!("unknown objc_opt_t version: {v}");
                return false;
            }
        };

        if let Some(rel_off) = rel_sel_off {
            if rel_off != 0 {
                let base = (opt_addr as i64 + i64::from(rel_off)) as u64;
                let magic = self
                    .cache
                    .read_at(base, RELATIVE_METHOD_MAGIC_SELECTOR.len());
                if magic != Some(RELATIVE_METHOD_MAGIC_SELECTOR) {
                    log::error!("relative methods cache does not start with magic selector");
                    return false;
                }
                self.rel_sel_base = Some(base);
            }
        }

        if headeropt_off == 0 {
            log::error!("objc_opt_t does not have header opt");
            return false;
        }
        let headeropt_addr = (opt_addr as i64 + i64::from(headeropt_off)) as u64;
        let count = self.raw_u32(headeropt_addr);
        let entsize = self.raw_u32(headeropt_addr + 4).max(8);

        let image_addr = self.image.base_addr();
        let mut found = None;
        for i in 0..count {
            let entry_addr = headeropt_addr + 8 + u64::from(i) * u64::from(entsize);
            let mhdr_offset = if entsize >= 16 {
                self.cache
                    .read_u64_at(entry_addr)
                    .map(|v| v as i64)
                    .unwrap_or(0)
            } else {
                i64::from(self.raw_i32(entry_addr))
            };
            if (entry_addr as i64 + mhdr_offset) as u64 == image_addr {
                found = Some(i as u16);
                break;
            }
        }

        match found {
            Some(index) => {
                self.image_index = index;
                true
            }
            None => {
                log::error!("unable to find objc image index");
                false
            }
        }
    }

    /// Selects the list belonging to this image from a
    /// `relative_list_list_t` of pre-attached category lists.
    fn find_in_image_rel_list(&self, addr: u64) -> Option<u64> {
        let entsize = self.raw_u32(addr);
        if entsize != 8 {
            log::warn!(
                "relative_list_list_t at {addr:#x} has entsize that does not match relative_list_t"
            );
            return None;
        }
        let count = self.raw_u32(addr + 4);
        // Iterate in reverse; the in-image list tends to be at the end.
        for i in (0..count).rev() {
            let entry_addr = addr + 8 + u64::from(i) * 8;
            let entry = self.cache.read_u64_at(entry_addr)?;
            if relative_list_image_index(entry) == self.image_index
                && relative_list_offset(entry) != 0
            {
                return Some((entry_addr as i64 + relative_list_offset(entry)) as u64);
            }
        }
        None
    }

    fn walk_class(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::Class, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let mut payload = self.read_slid(addr, (5 * p) as usize, &[0, p, 2 * p, 3 * p, 4 * p]);
        let isa = self.payload_ptr(&payload, 0);
        let superclass = self.payload_ptr(&payload, p);
        let data_word = self.payload_ptr(&payload, 4 * p);

        // The method cache and vtable are cache-era state.
        self.write_ptr_payload(&mut payload, 2 * p, 0);
        self.write_ptr_payload(&mut payload, 3 * p, 0);

        let id = self.arena.insert(AtomKind::Class, addr, payload);
        let mut fixups = Vec::new();

        if isa != 0 {
            if self.image.contains_addr(isa) {
                fixups.push(Fixup {
                    offset: 0,
                    kind: FixKind::Ptr(self.walk_class(isa)),
                });
            } else if let Some(info) = self.symbolizer.share(isa) {
                fixups.push(Fixup {
                    offset: 0,
                    kind: FixKind::BindPtr {
                        target: None,
                        bind: Some(info),
                    },
                });
            } else {
                log::warn!("unable to symbolize isa for class_t at {addr:#x}");
            }
        } else {
            log::warn!("class_t at {addr:#x} doesn't have an isa");
        }

        if superclass != 0 {
            if self.image.contains_addr(superclass) {
                fixups.push(Fixup {
                    offset: p,
                    kind: FixKind::Ptr(self.walk_class(superclass)),
                });
            } else if let Some(info) = self.symbolizer.share(superclass) {
                fixups.push(Fixup {
                    offset: p,
                    kind: FixKind::BindPtr {
                        target: None,
                        bind: Some(info),
                    },
                });
            } else if data_word != 0 {
                // This might be a root class.
                let flags = self.raw_u32(data_word & !self.bits_mask());
                if flags & CLASS_RO_FLAG_ROOT == 0 {
                    log::warn!(
                        "unable to symbolize superclass ({superclass:#x}) for non root class_t at {addr:#x}"
                    );
                }
            } else {
                log::warn!(
                    "potential root class_t at {addr:#x} does not have class data to verify"
                );
            }
        }

        if data_word != 0 {
            let bits = data_word & self.bits_mask();
            let data_atom = self.walk_class_data(data_word & !self.bits_mask());
            fixups.push(Fixup {
                offset: 4 * p,
                kind: FixKind::PtrBits {
                    target: data_atom,
                    bits,
                },
            });
        } else {
            log::warn!("class_t at {addr:#x} doesn't have class data");
        }

        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_class_data(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::ClassData, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let ptr_base = if p == 8 { 16u64 } else { 12 };
        let size = ptr_base + 7 * p;
        let ptr_offsets: Vec<u64> = (0..7).map(|i| ptr_base + i * p).collect();
        let mut payload = self.read_slid(addr, size as usize, &ptr_offsets);

        let id = self.arena.insert(AtomKind::ClassData, addr, payload.clone());
        let mut fixups = Vec::new();

        let ivar_layout = self.payload_ptr(&payload, ptr_base);
        let name = self.payload_ptr(&payload, ptr_base + p);
        let base_methods = self.payload_ptr(&payload, ptr_base + 2 * p);
        let base_protocols = self.payload_ptr(&payload, ptr_base + 3 * p);
        let ivars = self.payload_ptr(&payload, ptr_base + 4 * p);
        let weak_ivar_layout = self.payload_ptr(&payload, ptr_base + 5 * p);
        let base_properties = self.payload_ptr(&payload, ptr_base + 6 * p);

        if ivar_layout != 0 {
            fixups.push(Fixup {
                offset: ptr_base,
                kind: FixKind::Ptr(self.walk_ivar_layout(ivar_layout)),
            });
        }
        if name != 0 {
            fixups.push(Fixup {
                offset: ptr_base + p,
                kind: FixKind::Ptr(self.walk_string(name)),
            });
        } else {
            log::warn!("class_data_t at {addr:#x} doesn't have a name");
        }

        let walk_attached = |walker: &mut Self,
                                 value: u64,
                                 offset: u64,
                                 fixups: &mut Vec<Fixup>,
                                 payload: &mut Vec<u8>,
                                 walk: fn(&mut Self, u64) -> Option<AtomId>| {
            if value == 0 {
                return;
            }
            if value & 1 != 0 {
                // Pre-attached categories keep their lists in a
                // relative_list_list_t; take the in-image one.
                match walker.find_in_image_rel_list(value & !1) {
                    Some(list_addr) => fixups.push(Fixup {
                        offset,
                        kind: FixKind::Ptr(walk(walker, list_addr)),
                    }),
                    None => walker.write_ptr_payload(payload, offset, 0),
                }
            } else {
                fixups.push(Fixup {
                    offset,
                    kind: FixKind::Ptr(walk(walker, value)),
                });
            }
        };

        walk_attached(
            self,
            base_methods,
            ptr_base + 2 * p,
            &mut fixups,
            &mut payload,
            Self::walk_method_list,
        );
        walk_attached(
            self,
            base_protocols,
            ptr_base + 3 * p,
            &mut fixups,
            &mut payload,
            Self::walk_protocol_list,
        );

        if ivars != 0 {
            fixups.push(Fixup {
                offset: ptr_base + 4 * p,
                kind: FixKind::Ptr(self.walk_ivar_list(ivars)),
            });
        }
        if weak_ivar_layout != 0 {
            fixups.push(Fixup {
                offset: ptr_base + 5 * p,
                kind: FixKind::Ptr(self.walk_ivar_layout(weak_ivar_layout)),
            });
        }

        walk_attached(
            self,
            base_properties,
            ptr_base + 6 * p,
            &mut fixups,
            &mut payload,
            Self::walk_property_list,
        );

        let atom = self.arena.get_mut(id);
        atom.payload = payload;
        atom.fixups = fixups;
        Some(id)
    }

    fn walk_method_list(&mut self, addr: u64) -> Option<AtomId> {
        let entsize_and_flags = self.raw_u32(addr);
        if entsize_and_flags & METHOD_LIST_IS_SMALL != 0 {
            self.walk_small_method_list(addr)
        } else {
            self.walk_large_method_list(addr)
        }
    }

    fn walk_small_method_list(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::SmallMethodList, addr) {
            return Some(id);
        }

        let mut entsize_and_flags = self.raw_u32(addr);
        let count = self.raw_u32(addr + 4);
        let entsize = u64::from(entsize_and_flags & METHOD_LIST_ENTSIZE_MASK);

        let direct = entsize_and_flags & METHOD_LIST_SELECTORS_ARE_DIRECT != 0;
        if direct {
            entsize_and_flags &= !METHOD_LIST_SELECTORS_ARE_DIRECT;
        } else {
            log::warn!(
                "small style method_list_t at {addr:#x} doesn't have the direct selectors flag set"
            );
        }

        let size = 8 + u64::from(count) * entsize.max(12);
        let mut payload = self
            .cache
            .read_at(addr, size as usize)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0; size as usize]);
        payload[0..4].copy_from_slice(&entsize_and_flags.to_le_bytes());

        let id = self.arena.insert(AtomKind::SmallMethodList, addr, payload);
        if !direct {
            return Some(id);
        }
        if entsize != 12 {
            log::error!(
                "small style method_list_t at {addr:#x} has an entsize that doesn't match a small method"
            );
            return Some(id);
        }

        let mut fixups = Vec::new();
        for i in 0..u64::from(count) {
            let m_addr = addr + 8 + i * entsize;
            let m_off = 8 + i * entsize;

            let name = self.raw_i32(m_addr);
            if name != 0 {
                let string_addr = match self.rel_sel_base {
                    Some(base) => (base as i64 + i64::from(name)) as u64,
                    None => (m_addr as i64 + i64::from(name)) as u64,
                };
                // Each small method gets its own locally-owned selector
                // pointer after rewriting.
                let selref = self.make_small_method_selref(string_addr);
                fixups.push(Fixup {
                    offset: m_off,
                    kind: FixKind::Rel32(selref),
                });
            } else {
                log::warn!("method at {m_addr:#x} doesn't have a name");
            }

            let types = self.raw_i32(m_addr + 4);
            if types != 0 {
                let target = (m_addr as i64 + 4 + i64::from(types)) as u64;
                fixups.push(Fixup {
                    offset: m_off + 4,
                    kind: FixKind::Rel32(self.walk_string(target)),
                });
            } else {
                log::warn!("method at {m_addr:#x} doesn't have a type");
            }

            let imp = self.raw_i32(m_addr + 8);
            if imp != 0 {
                let target = (m_addr as i64 + 8 + i64::from(imp)) as u64;
                if self.image.contains_addr(target) {
                    fixups.push(Fixup {
                        offset: m_off + 8,
                        kind: FixKind::Rel32(self.walk_imp(target)),
                    });
                } else {
                    log::warn!("method at {m_addr:#x} has an implementation outside the image");
                }
            }
        }

        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_large_method_list(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::LargeMethodList, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let entsize_and_flags = self.raw_u32(addr);
        let count = self.raw_u32(addr + 4);
        let entsize = u64::from(entsize_and_flags & METHOD_LIST_ENTSIZE_MASK);
        if entsize != 3 * p {
            log::error!(
                "large style method_list_t at {addr:#x} has an entsize that doesn't match a large method"
            );
        }
        let entsize = entsize.max(3 * p);

        let size = 8 + u64::from(count) * entsize;
        let ptr_offsets: Vec<u64> = (0..u64::from(count))
            .flat_map(|i| {
                let base = 8 + i * entsize;
                [base, base + p, base + 2 * p]
            })
            .collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::LargeMethodList, addr, payload);

        let mut fixups = Vec::new();
        for i in 0..u64::from(count) {
            let m_off = 8 + i * entsize;
            let atom = self.arena.get(id);
            let name = self.payload_ptr(&atom.payload, m_off);
            let types = self.payload_ptr(&atom.payload, m_off + p);
            let imp = self.payload_ptr(&atom.payload, m_off + 2 * p);
            let m_addr = addr + m_off;

            if name != 0 {
                fixups.push(Fixup {
                    offset: m_off,
                    kind: FixKind::Ptr(self.walk_string(name)),
                });
            } else {
                log::warn!("method at {m_addr:#x} doesn't have a name");
            }
            if types != 0 {
                fixups.push(Fixup {
                    offset: m_off + p,
                    kind: FixKind::Ptr(self.walk_string(types)),
                });
            } else {
                log::warn!("method at {m_addr:#x} doesn't have a type");
            }
            if imp != 0 {
                if self.image.contains_addr(imp) {
                    fixups.push(Fixup {
                        offset: m_off + 2 * p,
                        kind: FixKind::Ptr(self.walk_imp(imp)),
                    });
                } else {
                    log::warn!("method at {m_addr:#x} has an implementation outside the image");
                }
            }
        }

        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn make_small_method_selref(&mut self, string_addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::SelRef, string_addr) {
            return Some(id);
        }
        let payload = vec![0u8; self.ptr_size as usize];
        let id = self.arena.insert(AtomKind::SelRef, string_addr, payload);
        let string = self.walk_string(string_addr);
        self.arena.get_mut(id).fixups = vec![Fixup {
            offset: 0,
            kind: FixKind::Ptr(string),
        }];
        Some(id)
    }

    fn walk_protocol_list(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::ProtocolList, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let count = self.cache.read_ptr_at(addr, p).unwrap_or(0);
        let size = p + count * p;
        let ptr_offsets: Vec<u64> = (0..count).map(|i| p + i * p).collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::ProtocolList, addr, payload);

        let mut fixups = Vec::new();
        for i in 0..count {
            let proto = self.payload_ptr(&self.arena.get(id).payload, p + i * p);
            fixups.push(Fixup {
                offset: p + i * p,
                kind: FixKind::Ptr(self.walk_protocol(proto)),
            });
        }
        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_protocol(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::Protocol, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let declared_size = self.raw_u32(addr + 8 * p);
        let full_size = 11 * p + 8;
        let size = if declared_size == 0 {
            full_size
        } else {
            u64::from(declared_size).min(full_size)
        };

        let mut ptr_offsets: Vec<u64> = (0..8).map(|i| i * p).collect();
        for extra in [8 * p + 8, 9 * p + 8, 10 * p + 8] {
            if extra + p <= size {
                ptr_offsets.push(extra);
            }
        }
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::Protocol, addr, payload);

        let mut fixups = Vec::new();
        let field = |walker: &Self, off: u64| walker.payload_ptr(&walker.arena.get(id).payload, off);

        let isa = field(self, 0);
        if isa != 0 {
            if let Some(info) = self.symbolizer.share(isa) {
                fixups.push(Fixup {
                    offset: 0,
                    kind: FixKind::BindPtr {
                        target: None,
                        bind: Some(info),
                    },
                });
            }
        }

        let name = field(self, p);
        if name != 0 {
            fixups.push(Fixup {
                offset: p,
                kind: FixKind::Ptr(self.walk_string(name)),
            });
        }
        let protocols = field(self, 2 * p);
        if protocols != 0 {
            fixups.push(Fixup {
                offset: 2 * p,
                kind: FixKind::Ptr(self.walk_protocol_list(protocols)),
            });
        }

        let mut method_count = 0u32;
        for off in [3 * p, 4 * p, 5 * p, 6 * p] {
            let list = field(self, off);
            if list != 0 {
                method_count += self.raw_u32(list + 4);
                fixups.push(Fixup {
                    offset: off,
                    kind: FixKind::Ptr(self.walk_method_list(list)),
                });
            }
        }

        let properties = field(self, 7 * p);
        if properties != 0 {
            fixups.push(Fixup {
                offset: 7 * p,
                kind: FixKind::Ptr(self.walk_property_list(properties)),
            });
        }

        if 8 * p + 8 + p <= size {
            let ext = field(self, 8 * p + 8);
            if ext != 0 {
                fixups.push(Fixup {
                    offset: 8 * p + 8,
                    kind: FixKind::Ptr(self.walk_extended_method_types(ext, method_count)),
                });
            }
        }
        if 9 * p + 8 + p <= size {
            let demangled = field(self, 9 * p + 8);
            if demangled != 0 {
                fixups.push(Fixup {
                    offset: 9 * p + 8,
                    kind: FixKind::Ptr(self.walk_string(demangled)),
                });
            }
        }
        if 10 * p + 8 + p <= size {
            let class_props = field(self, 10 * p + 8);
            if class_props != 0 {
                fixups.push(Fixup {
                    offset: 10 * p + 8,
                    kind: FixKind::Ptr(self.walk_property_list(class_props)),
                });
            }
        }

        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_extended_method_types(&mut self, addr: u64, count: u32) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::ExtendedMethodTypes, addr) {
            return Some(id);
        }
        let p = self.ptr_size;
        let size = u64::from(count) * p;
        let ptr_offsets: Vec<u64> = (0..u64::from(count)).map(|i| i * p).collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::ExtendedMethodTypes, addr, payload);

        let mut fixups = Vec::new();
        for i in 0..u64::from(count) {
            let types = self.payload_ptr(&self.arena.get(id).payload, i * p);
            if types != 0 {
                fixups.push(Fixup {
                    offset: i * p,
                    kind: FixKind::Ptr(self.walk_string(types)),
                });
            }
        }
        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_property_list(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::PropertyList, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let entsize = u64::from(self.raw_u32(addr)).max(2 * p);
        let count = self.raw_u32(addr + 4);
        let size = 8 + u64::from(count) * entsize;
        let ptr_offsets: Vec<u64> = (0..u64::from(count))
            .flat_map(|i| [8 + i * entsize, 8 + i * entsize + p])
            .collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::PropertyList, addr, payload);

        let mut fixups = Vec::new();
        for i in 0..u64::from(count) {
            let base = 8 + i * entsize;
            for off in [base, base + p] {
                let s = self.payload_ptr(&self.arena.get(id).payload, off);
                if s != 0 {
                    fixups.push(Fixup {
                        offset: off,
                        kind: FixKind::Ptr(self.walk_string(s)),
                    });
                }
            }
        }
        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_ivar_list(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::IvarList, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let entsize = u64::from(self.raw_u32(addr)).max(3 * p + 8);
        let count = self.raw_u32(addr + 4);
        let size = 8 + u64::from(count) * entsize;
        let ptr_offsets: Vec<u64> = (0..u64::from(count))
            .flat_map(|i| {
                let base = 8 + i * entsize;
                [base, base + p, base + 2 * p]
            })
            .collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::IvarList, addr, payload);

        let mut fixups = Vec::new();
        for i in 0..u64::from(count) {
            let base = 8 + i * entsize;
            let offset_ptr = self.payload_ptr(&self.arena.get(id).payload, base);
            let name = self.payload_ptr(&self.arena.get(id).payload, base + p);
            let ty = self.payload_ptr(&self.arena.get(id).payload, base + 2 * p);

            if offset_ptr != 0 {
                fixups.push(Fixup {
                    offset: base,
                    kind: FixKind::Ptr(self.walk_ivar_offset(offset_ptr)),
                });
            }
            if name != 0 {
                fixups.push(Fixup {
                    offset: base + p,
                    kind: FixKind::Ptr(self.walk_string(name)),
                });
            }
            if ty != 0 {
                fixups.push(Fixup {
                    offset: base + 2 * p,
                    kind: FixKind::Ptr(self.walk_string(ty)),
                });
            }
        }
        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_ivar_offset(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::IvarOffset, addr) {
            return Some(id);
        }
        let size = if self.image.arch == CacheArch::X86_64 { 8 } else { 4 };
        let payload = self
            .cache
            .read_at(addr, size)
            .map(<[u8]>::to_vec)
            .unwrap_or_else(|| vec![0; size]);
        Some(self.arena.insert(AtomKind::IvarOffset, addr, payload))
    }

    fn walk_category(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::Category, addr) {
            return Some(id);
        }

        let p = self.ptr_size;
        let field_count: u64 = if self.has_category_class_properties { 7 } else { 6 };
        let size = field_count * p;
        let ptr_offsets: Vec<u64> = (0..field_count).map(|i| i * p).collect();
        let payload = self.read_slid(addr, size as usize, &ptr_offsets);
        let id = self.arena.insert(AtomKind::Category, addr, payload);

        let mut fixups = Vec::new();
        let field = |walker: &Self, off: u64| walker.payload_ptr(&walker.arena.get(id).payload, off);

        let name = field(self, 0);
        if name != 0 {
            fixups.push(Fixup {
                offset: 0,
                kind: FixKind::Ptr(self.walk_string(name)),
            });
        }

        let cls = field(self, p);
        if cls != 0 {
            if self.image.contains_addr(cls) {
                fixups.push(Fixup {
                    offset: p,
                    kind: FixKind::Ptr(self.walk_class(cls)),
                });
            } else if let Some(info) = self.symbolizer.share(cls) {
                fixups.push(Fixup {
                    offset: p,
                    kind: FixKind::BindPtr {
                        target: None,
                        bind: Some(info),
                    },
                });
            } else {
                log::warn!("unable to symbolize class for category_t at {addr:#x}");
            }
        }

        for (off, is_methods) in [
            (2 * p, true),
            (3 * p, true),
            (4 * p, false),
            (5 * p, false),
            (6 * p, false),
        ] {
            if off >= size {
                break;
            }
            let value = field(self, off);
            if value == 0 {
                continue;
            }
            let target = if is_methods {
                self.walk_method_list(value)
            } else if off == 4 * p {
                self.walk_protocol_list(value)
            } else {
                self.walk_property_list(value)
            };
            fixups.push(Fixup {
                offset: off,
                kind: FixKind::Ptr(target),
            });
        }

        self.arena.get_mut(id).fixups = fixups;
        Some(id)
    }

    fn walk_string(&mut self, addr: u64) -> Option<AtomId> {
        if addr == 0 {
            return None;
        }
        if let Some(id) = self.arena.lookup(AtomKind::String, addr) {
            return Some(id);
        }
        let bytes = self.read_cstr_bytes(addr)?;
        Some(self.arena.insert(AtomKind::String, addr, bytes))
    }

    fn walk_ivar_layout(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::IvarLayout, addr) {
            return Some(id);
        }
        let bytes = self.read_cstr_bytes(addr)?;
        Some(self.arena.insert(AtomKind::IvarLayout, addr, bytes))
    }

    fn walk_imp(&mut self, addr: u64) -> Option<AtomId> {
        if let Some(id) = self.arena.lookup(AtomKind::Imp, addr) {
            return Some(id);
        }
        let id = self.arena.insert(AtomKind::Imp, addr, Vec::new());
        // Implementations never move; their address is final now.
        let atom = self.arena.get_mut(id);
        atom.final_addr = Some(addr);
        atom.placed_in_image = true;
        Some(id)
    }

    /// A NUL-terminated byte payload, terminator included.
    fn read_cstr_bytes(&self, addr: u64) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = addr;
        loop {
            let byte = self.cache.read_at(pos, 1)?[0];
            out.push(byte);
            if byte == 0 {
                return Some(out);
            }
            pos += 1;
        }
    }
}

//! The stub fixer: reverses cache-time stub optimization.
//!
//! Phase 0 re-points lazy symbol pointers at their stub helpers, phase 1
//! classifies every stub and keeps the ones that already load through an
//! in-image pointer, phase 2 rewrites optimized stubs to the normal shape
//! over a claimed symbol pointer, and phase 3 walks `__text` patching every
//! direct branch that escaped the image back through a local stub. The
//! indirect symbol table is repaired afterwards so disassemblers can name
//! what the cache redacted.

pub mod arm;
pub mod arm64;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::accelerator::Accelerator;
use crate::bind_info::BindInfo;
use crate::cache::{CacheArch, DyldCache};
use crate::errors::ExtractError;
use crate::image::{CacheImageRef, ImageView};
use crate::layout::{
    self, get_library_ordinal, set_library_ordinal, S_ATTR_SOME_INSTRUCTIONS,
    S_LAZY_SYMBOL_POINTERS, S_NON_LAZY_SYMBOL_POINTERS, S_SYMBOL_STUBS, SECTION_TYPE, SECT_TEXT,
    SEG_TEXT,
};
use crate::linkedit::symtab::{Nlist, SymbolBucket, SymbolTableTracker};
use crate::slide::PointerTracker;
use crate::symbols::{SharedSymbols, Symbol, SymbolicInfo, Symbolizer};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PointerType {
    /// Commonly in `__got`.
    Normal,
    /// Commonly in `__la_symbol_ptr`.
    Lazy,
    /// Commonly in `__auth_got`.
    Auth,
}

/// One kind's worth of symbol pointers: named, unnamed and consumed.
#[derive(Default)]
pub struct PtrGroup {
    pub named: BTreeMap<u64, SharedSymbols>,
    pub reverse: HashMap<String, BTreeSet<u64>>,
    pub unnamed: BTreeSet<u64>,
    pub used: BTreeSet<u64>,
}

impl PtrGroup {
    pub fn is_available(&self, addr: u64) -> bool {
        self.named.contains_key(&addr) && !self.used.contains(&addr)
    }

    fn add_info(&mut self, addr: u64, info: &SymbolicInfo) {
        let entry = match self.named.get(&addr) {
            Some(existing) => {
                existing.merge_from(info);
                Rc::clone(existing)
            }
            None => {
                let fresh = SymbolicInfo::from_set(info.symbols().clone());
                self.named.insert(addr, Rc::clone(&fresh));
                fresh
            }
        };
        for sym in entry.symbols().iter() {
            self.reverse.entry(sym.name.clone()).or_default().insert(addr);
        }
    }

    pub fn name_pointer(&mut self, addr: u64, info: &SymbolicInfo) {
        self.unnamed.remove(&addr);
        self.add_info(addr, info);
    }

    /// An unused pointer already carrying one of `info`'s names.
    fn find_named_unused(&self, info: &SymbolicInfo) -> Option<u64> {
        for sym in info.symbols().iter() {
            if let Some(addrs) = self.reverse.get(&sym.name) {
                for &addr in addrs {
                    if !self.used.contains(&addr) {
                        return Some(addr);
                    }
                }
            }
        }
        None
    }
}

/// Per-image index of `__got`/`__la_symbol_ptr`/`__auth_got` slots.
#[derive(Default)]
pub struct SymbolPointerCache {
    pub normal: PtrGroup,
    pub lazy: PtrGroup,
    pub auth: PtrGroup,
}

impl SymbolPointerCache {
    pub fn group(&self, t: PointerType) -> &PtrGroup {
        match t {
            PointerType::Normal => &self.normal,
            PointerType::Lazy => &self.lazy,
            PointerType::Auth => &self.auth,
        }
    }

    pub fn group_mut(&mut self, t: PointerType) -> &mut PtrGroup {
        match t {
            PointerType::Normal => &mut self.normal,
            PointerType::Lazy => &mut self.lazy,
            PointerType::Auth => &mut self.auth,
        }
    }

    pub fn pointer_info(&self, t: PointerType, addr: u64) -> Option<&SharedSymbols> {
        self.group(t).named.get(&addr)
    }
}

fn section_pointer_type(segname: &[u8; 16], sectname: &[u8; 16], flags: u32) -> PointerType {
    let is_auth = contains_bytes(segname, b"AUTH") || contains_bytes(sectname, b"auth");
    match flags & SECTION_TYPE {
        S_LAZY_SYMBOL_POINTERS => {
            if is_auth {
                log::error!("unknown section type combination");
                PointerType::Normal
            } else {
                PointerType::Lazy
            }
        }
        S_NON_LAZY_SYMBOL_POINTERS => {
            if is_auth {
                PointerType::Auth
            } else {
                PointerType::Normal
            }
        }
        t => {
            log::error!("unexpected section type {t:#x}");
            PointerType::Normal
        }
    }
}

fn contains_bytes(haystack: &[u8; 16], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|w| w == needle)
}

/// A stub that still needs repair after phase 1.
struct BrokenStub<F> {
    format: F,
    target: u64,
    addr: u64,
    size: u64,
}

/// Entry point: runs the whole stub-fixing pass for the image's arch.
/// Returns whether redacted indirect entries were synthesized and need
/// post-fix symbol recovery (they always get it here).
pub fn fix_stubs<'a>(
    cache: &'a DyldCache,
    accel: &mut Accelerator,
    image: &mut ImageView,
    ptr_tracker: &mut PointerTracker<'a>,
    st_tracker: &mut SymbolTableTracker,
    symbolizer: &Symbolizer,
    bind_info: &BindInfo,
) -> Result<(), ExtractError> {
    if !image.arch.has_stub_fixer() {
        // No stub fixing needed for x86_64.
        return Ok(());
    }

    fill_code_regions(cache, accel);
    let mut has_redacted = check_indirect_entries(image, st_tracker);
    if let Some(redacted) = st_tracker.redacted_index() {
        has_redacted |= st_tracker.indirect_syms.contains(&redacted);
    }

    let mut pointer_cache = SymbolPointerCache::default();

    match image.arch {
        CacheArch::Arm64 | CacheArch::Arm64_32 => {
            let utils = arm64::Arm64Utils::new(cache, image.is_64());
            scan_pointers(
                image,
                st_tracker,
                ptr_tracker,
                symbolizer,
                accel,
                &mut pointer_cache,
                |tracker, accel, addr| utils.resolve_stub_chain(tracker, accel, addr),
            );
            let mut fixer = Arm64Fixer {
                image: &mut *image,
                ptr_tracker: &mut *ptr_tracker,
                st_tracker: &mut *st_tracker,
                symbolizer,
                bind_info,
                pointer_cache: &mut pointer_cache,
                accel: &mut *accel,
                utils,
                stub_map: BTreeMap::new(),
                reverse_stub_map: HashMap::new(),
                broken_stubs: Vec::new(),
            };
            fixer.fix()?;
            let stub_map = fixer.stub_map;
            if has_redacted {
                fix_indirect_entries(image, st_tracker, &pointer_cache, &stub_map);
            }
        }
        CacheArch::Arm => {
            let utils = arm::ArmUtils::new(cache);
            scan_pointers(
                image,
                st_tracker,
                ptr_tracker,
                symbolizer,
                accel,
                &mut pointer_cache,
                |tracker, accel, addr| utils.resolve_stub_chain(tracker, accel, addr),
            );
            let mut fixer = ArmFixer {
                image: &mut *image,
                ptr_tracker: &mut *ptr_tracker,
                st_tracker: &*st_tracker,
                symbolizer,
                bind_info,
                pointer_cache: &mut pointer_cache,
                accel: &mut *accel,
                utils,
                stub_map: BTreeMap::new(),
                reverse_stub_map: HashMap::new(),
                broken_stubs: Vec::new(),
            };
            fixer.fix()?;
            let stub_map = fixer.stub_map;
            if has_redacted {
                fix_indirect_entries(image, st_tracker, &pointer_cache, &stub_map);
            }
        }
        CacheArch::X86_64 => unreachable!(),
    }

    bind_pointers(ptr_tracker, &pointer_cache);
    Ok(())
}

/// The union of every image's instruction sections, computed once per
/// accelerator; phase 3 consults it to suppress false-positive warnings.
fn fill_code_regions(cache: &DyldCache, accel: &mut Accelerator) {
    if !accel.code_regions.is_empty() {
        return;
    }
    for info in &cache.images {
        let Ok(image) = CacheImageRef::parse(cache, info.address) else {
            continue;
        };
        for seg in &image.segments {
            for sect in &seg.sections {
                if sect.flags & S_ATTR_SOME_INSTRUCTIONS != 0 {
                    accel.code_regions.insert((sect.addr, sect.addr + sect.size));
                }
            }
        }
    }
}

/// Rebuilds the indirect-symbol ordering against the section table and
/// restores the section type of `__got`-kind sections that the cache
/// builder cleared. Returns true when redacted entries were synthesized.
fn check_indirect_entries(image: &mut ImageView, st_tracker: &mut SymbolTableTracker) -> bool {
    let ptr_size = image.pointer_size();
    let old = st_tracker.indirect_syms.clone();
    let redacted = |st: &mut SymbolTableTracker| st.get_or_make_redacted();

    let mut new_entries = Vec::new();
    let mut changed = false;
    let mut has_stubs = false;
    let mut has_redacted = false;

    let sections = image.sections_where(|_, _| true);
    for (si, ci) in sections {
        let sect = &image.segments[si].sections[ci];
        let new_start = new_entries.len() as u32;
        let sect_type = sect.section_type();
        let (n, copy) = match sect_type {
            S_NON_LAZY_SYMBOL_POINTERS
            | S_LAZY_SYMBOL_POINTERS
            | layout::S_THREAD_LOCAL_VARIABLE_POINTERS
            | layout::S_LAZY_DYLIB_SYMBOL_POINTERS => ((sect.size / ptr_size) as u32, true),
            S_SYMBOL_STUBS => {
                has_stubs = true;
                ((sect.size / u64::from(sect.reserved2.max(1))) as u32, true)
            }
            0 if sect.sect_name() == "__got" || sect.sect_name() == "__auth_got" => {
                // Section type was stripped by the cache builder.
                let n = (sect.size / ptr_size) as u32;
                let flags = sect.flags | S_NON_LAZY_SYMBOL_POINTERS;
                let reserved1 = sect.reserved1;
                image.set_section_flags(si, ci, flags);

                if (has_stubs && reserved1 != 0) || (!has_stubs && reserved1 == 0) {
                    // Index is still valid.
                    (n, true)
                } else {
                    // Need to add redacted entries.
                    has_redacted = true;
                    changed = true;
                    let r = redacted(st_tracker);
                    for _ in 0..n {
                        new_entries.push(r);
                    }
                    image.set_section_reserved1(si, ci, new_start);
                    continue;
                }
            }
            _ => continue,
        };

        if copy {
            let start = image.segments[si].sections[ci].reserved1 as usize;
            for i in 0..n as usize {
                match old.get(start + i) {
                    Some(&e) => new_entries.push(e),
                    None => {
                        has_redacted = true;
                        let r = redacted(st_tracker);
                        new_entries.push(r);
                    }
                }
            }
            if image.segments[si].sections[ci].reserved1 != new_start {
                image.set_section_reserved1(si, ci, new_start);
                changed = true;
            }
        }
    }

    if changed || new_entries.len() != old.len() {
        st_tracker.indirect_syms = new_entries;
    }
    has_redacted
}

/// Scans every symbol-pointer section, naming slots through the indirect
/// table and through their slid targets.
fn scan_pointers(
    image: &ImageView,
    st_tracker: &SymbolTableTracker,
    ptr_tracker: &PointerTracker<'_>,
    symbolizer: &Symbolizer,
    accel: &mut Accelerator,
    cache_out: &mut SymbolPointerCache,
    mut resolve_chain: impl FnMut(&PointerTracker<'_>, &mut Accelerator, u64) -> u64,
) {
    let ptr_size = image.pointer_size();
    let sections = image.sections_where(|_, sect| {
        matches!(
            sect.section_type(),
            S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS
        )
    });

    for (si, ci) in sections {
        let sect = &image.segments[si].sections[ci];
        let ptype = section_pointer_type(&sect.segname, &sect.sectname, sect.flags);
        let sect_addr = sect.addr;
        let sect_size = sect.size;
        let reserved1 = sect.reserved1;

        let mut addr = sect_addr;
        let mut indirect_i = reserved1;
        while addr < sect_addr + sect_size {
            let mut symbols = BTreeSet::new();

            match st_tracker.indirect_syms.get(indirect_i as usize) {
                None => log::warn!(
                    "unable to symbolize pointer via indirect symbols as the index overruns the entries"
                ),
                Some(&index) => {
                    if Some(index) != st_tracker.redacted_index() {
                        if let Some((name, nlist)) = st_tracker.symbol(index) {
                            symbols.insert(Symbol {
                                name: name.to_owned(),
                                ordinal: u64::from(get_library_ordinal(nlist.n_desc)),
                                export_flags: None,
                            });
                        }
                    }
                }
            }

            let target = ptr_tracker.slide(addr);
            if target != 0 {
                let func = resolve_chain(ptr_tracker, accel, target);
                if let Some(info) = symbolizer.symbolize(func & !3) {
                    symbols.extend(info.symbols().iter().cloned());
                }
            }

            if symbols.is_empty() {
                cache_out.group_mut(ptype).unnamed.insert(addr);
            } else {
                let info = SymbolicInfo::from_set(symbols);
                cache_out.group_mut(ptype).add_info(addr, &info);
            }

            addr += ptr_size;
            indirect_i += 1;
        }
    }
}

/// Replaces redacted indirect entries whose pointer or stub got named
/// during fixing with fresh undefined symbols carrying the preferred
/// symbol's library ordinal.
fn fix_indirect_entries(
    image: &ImageView,
    st_tracker: &mut SymbolTableTracker,
    pointer_cache: &SymbolPointerCache,
    stub_map: &BTreeMap<u64, SharedSymbols>,
) {
    let ptr_size = image.pointer_size();
    let Some(redacted) = st_tracker.redacted_index() else {
        return;
    };

    let sections = image.sections_where(|_, _| true);
    for (si, ci) in sections {
        let sect = &image.segments[si].sections[ci];
        let sect_type = sect.section_type();
        let (stride, is_stub) = match sect_type {
            S_NON_LAZY_SYMBOL_POINTERS | S_LAZY_SYMBOL_POINTERS => (ptr_size, false),
            S_SYMBOL_STUBS => (u64::from(sect.reserved2.max(1)), true),
            layout::S_THREAD_LOCAL_VARIABLE_POINTERS => continue,
            layout::S_LAZY_DYLIB_SYMBOL_POINTERS => {
                log::warn!(
                    "unable to handle indirect entries for S_LAZY_DYLIB_SYMBOL_POINTERS section"
                );
                continue;
            }
            _ => continue,
        };
        let ptype = if is_stub {
            None
        } else {
            Some(section_pointer_type(
                &sect.segname,
                &sect.sectname,
                sect.flags,
            ))
        };

        let mut addr = sect.addr;
        let mut indirect_i = sect.reserved1 as usize;
        let end = sect.addr + sect.size;
        while addr < end {
            if st_tracker.indirect_syms.get(indirect_i) != Some(&redacted) {
                addr += stride;
                indirect_i += 1;
                continue;
            }

            let info = if let Some(ptype) = ptype {
                pointer_cache.pointer_info(ptype, addr).cloned()
            } else {
                stub_map.get(&addr).cloned()
            };
            let Some(info) = info else {
                log::debug!(
                    "unable to symbolize entry at {addr:#x} for redacted indirect symbol entry"
                );
                addr += stride;
                indirect_i += 1;
                continue;
            };

            let preferred = info.preferred();
            let mut n_desc = 0u16;
            set_library_ordinal(&mut n_desc, preferred.ordinal as u16);
            let s = st_tracker.add_string(&preferred.name);
            let index = st_tracker.add_sym(
                SymbolBucket::Undefined,
                s,
                Nlist {
                    n_type: 1,
                    n_desc,
                    ..Nlist::default()
                },
            );
            st_tracker.indirect_syms[indirect_i] = index;

            addr += stride;
            indirect_i += 1;
        }
    }
}

/// Records every named non-lazy pointer as a zeroed bind site.
fn bind_pointers(ptr_tracker: &mut PointerTracker<'_>, pointer_cache: &SymbolPointerCache) {
    for group in [&pointer_cache.normal, &pointer_cache.auth] {
        for (&addr, info) in &group.named {
            ptr_tracker.add(addr, 0);
            ptr_tracker.add_bind(addr, Rc::clone(info));
        }
    }
}

// ---------------------------------------------------------------------------
// arm64

struct Arm64Fixer<'e, 'c> {
    image: &'e mut ImageView,
    ptr_tracker: &'e mut PointerTracker<'c>,
    st_tracker: &'e mut SymbolTableTracker,
    symbolizer: &'e Symbolizer,
    bind_info: &'e BindInfo,
    pointer_cache: &'e mut SymbolPointerCache,
    accel: &'e mut Accelerator,
    utils: arm64::Arm64Utils<'c>,
    stub_map: BTreeMap<u64, SharedSymbols>,
    reverse_stub_map: HashMap<String, BTreeSet<u64>>,
    broken_stubs: Vec<BrokenStub<arm64::StubFormat>>,
}

impl Arm64Fixer<'_, '_> {
    fn fix(&mut self) -> Result<(), ExtractError> {
        self.fix_stub_helpers();
        self.scan_stubs();
        self.fix_pass1();
        self.fix_pass2()?;
        self.fix_callsites()?;
        Ok(())
    }

    /// Phase 0: re-point each helper's lazy pointer back at the helper so
    /// first-call lazy binding works as in a fresh image.
    fn fix_stub_helpers(&mut self) {
        const REG_HELPER_SIZE: u64 = 0xc;

        let Some((si, ci)) = self.image.section_at(SEG_TEXT, "__stub_helper") else {
            return;
        };
        let sect = &self.image.segments[si].sections[ci];
        let helper_end = sect.addr + sect.size;
        let mut helper_addr = sect.addr;

        let can_fix_reg = self.bind_info.has_lazy_binds();

        if self.utils.is_stub_binder(helper_addr) {
            helper_addr += 0x18; // size of binder
        }

        while helper_addr < helper_end {
            if let Some(bind_off) = self.utils.stub_helper_data(helper_addr) {
                if can_fix_reg {
                    match self.bind_info.lazy_bind(bind_off) {
                        Some(record) => {
                            self.ptr_tracker.add(record.address, helper_addr);
                        }
                        None => log::error!(
                            "unable to read bind info for stub helper at {helper_addr:#x}"
                        ),
                    }
                } else {
                    log::warn!("unable to fix stub helper at {helper_addr:#x} without bind info");
                }
                helper_addr += REG_HELPER_SIZE;
                continue;
            }

            if let Some(resolver) = self.utils.resolver_data(helper_addr) {
                // Resolvers stay in place; only their pointer is rebound.
                if !self.image.contains_addr(resolver.target_func) {
                    log::warn!("stub resolver at {helper_addr:#x} points outside of image");
                }
                self.ptr_tracker.add(resolver.target_ptr, helper_addr);
                helper_addr += resolver.size;
                continue;
            }

            log::error!("unknown stub helper format at {helper_addr:#x}");
            helper_addr += REG_HELPER_SIZE; // try to recover
        }
    }

    /// Phase 1 (scan): classify every stub and gather its symbolic info.
    fn scan_stubs(&mut self) {
        let sections = self
            .image
            .sections_where(|_, sect| sect.section_type() == S_SYMBOL_STUBS);

        for (si, ci) in sections {
            let sect = &self.image.segments[si].sections[ci];
            let sect_addr = sect.addr;
            let sect_size = sect.size;
            let stub_size = u64::from(sect.reserved2.max(4));
            let reserved1 = sect.reserved1;

            let mut addr = sect_addr;
            let mut indirect_i = reserved1;
            while addr < sect_addr + sect_size {
                let Some((target, format)) = self.utils.resolve_stub(self.ptr_tracker, addr)
                else {
                    log::error!("unknown arm64 stub format at {addr:#x}");
                    addr += stub_size;
                    indirect_i += 1;
                    continue;
                };

                let mut symbols = BTreeSet::new();
                if let Some(sym) = self.lookup_indirect(indirect_i) {
                    symbols.insert(sym);
                }

                if format == arm64::StubFormat::StubNormal {
                    if let Some(p_addr) = self.utils.stub_ldr_addr(addr) {
                        if self.image.contains_addr(p_addr) {
                            for group in [&self.pointer_cache.lazy, &self.pointer_cache.normal] {
                                if let Some(info) = group.named.get(&p_addr) {
                                    symbols.extend(info.symbols().iter().cloned());
                                    break;
                                }
                            }
                        }
                    }
                }
                if format == arm64::StubFormat::AuthStubNormal {
                    if let Some(p_addr) = self.utils.auth_stub_ldr_addr(addr) {
                        if self.image.contains_addr(p_addr) {
                            if let Some(info) = self.pointer_cache.auth.named.get(&p_addr) {
                                symbols.extend(info.symbols().iter().cloned());
                            }
                        }
                    }
                }

                let target_func = self
                    .utils
                    .resolve_stub_chain(self.ptr_tracker, self.accel, addr);
                if let Some(info) = self.symbolizer.symbolize(target_func) {
                    symbols.extend(info.symbols().iter().cloned());
                }

                if symbols.is_empty() {
                    log::warn!("unable to symbolize stub at {addr:#x}");
                } else {
                    self.add_stub_info(addr, symbols);
                    self.broken_stubs.push(BrokenStub {
                        format,
                        target: target_func,
                        addr,
                        size: stub_size,
                    });
                }

                addr += stub_size;
                indirect_i += 1;
            }
        }
    }

    fn lookup_indirect(&self, index: u32) -> Option<Symbol> {
        let &entry = self.st_tracker.indirect_syms.get(index as usize)?;
        if Some(entry) == self.st_tracker.redacted_index() {
            return None;
        }
        let (name, nlist) = self.st_tracker.symbol(entry)?;
        Some(Symbol {
            name: name.to_owned(),
            ordinal: u64::from(get_library_ordinal(nlist.n_desc)),
            export_flags: None,
        })
    }

    fn add_stub_info(&mut self, addr: u64, symbols: BTreeSet<Symbol>) {
        let info = match self.stub_map.get(&addr) {
            Some(existing) => {
                for sym in symbols {
                    existing.add(sym);
                }
                Rc::clone(existing)
            }
            None => {
                let fresh = SymbolicInfo::from_set(symbols);
                self.stub_map.insert(addr, Rc::clone(&fresh));
                fresh
            }
        };
        for sym in info.symbols().iter() {
            self.reverse_stub_map
                .entry(sym.name.clone())
                .or_default()
                .insert(addr);
        }
    }

    /// Phase 1: keep stubs that are not broken or trivially fixable.
    fn fix_pass1(&mut self) {
        let mut remaining = Vec::new();
        for stub in std::mem::take(&mut self.broken_stubs) {
            let symbols = Rc::clone(&self.stub_map[&stub.addr]);
            let mut fixed = false;

            match stub.format {
                arm64::StubFormat::StubNormal => {
                    if let Some(p_addr) = self.utils.stub_ldr_addr(stub.addr) {
                        if self.image.contains_addr(p_addr) {
                            if self.pointer_cache.lazy.is_available(p_addr) {
                                self.pointer_cache.lazy.used.insert(p_addr);
                                fixed = true;
                            } else if self.pointer_cache.normal.is_available(p_addr) {
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else if self.pointer_cache.lazy.unnamed.contains(&p_addr) {
                                self.pointer_cache.lazy.name_pointer(p_addr, &symbols);
                                self.pointer_cache.lazy.used.insert(p_addr);
                                fixed = true;
                            } else if self.pointer_cache.normal.unnamed.contains(&p_addr) {
                                self.pointer_cache.normal.name_pointer(p_addr, &symbols);
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else {
                                log::warn!(
                                    "unable to find the pointer a normal stub at {:#x} uses",
                                    stub.addr
                                );
                            }
                        }
                    }
                }

                arm64::StubFormat::AuthStubNormal => {
                    if let Some(p_addr) = self.utils.auth_stub_ldr_addr(stub.addr) {
                        if self.image.contains_addr(p_addr) {
                            if self.pointer_cache.auth.is_available(p_addr) {
                                self.pointer_cache.auth.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else if self.pointer_cache.normal.is_available(p_addr) {
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else if self.pointer_cache.auth.unnamed.contains(&p_addr) {
                                self.pointer_cache.auth.name_pointer(p_addr, &symbols);
                                self.pointer_cache.auth.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else if self.pointer_cache.normal.unnamed.contains(&p_addr) {
                                self.pointer_cache.normal.name_pointer(p_addr, &symbols);
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else {
                                log::warn!(
                                    "unable to find the pointer a normal auth stub at {:#x} uses",
                                    stub.addr
                                );
                            }
                        }
                    }
                }

                arm64::StubFormat::StubOptimized => {
                    if stub.size == 0x10 && !self.pointer_cache.auth.named.is_empty() {
                        // In older caches, optimized auth stubs resemble
                        // regular optimized stubs.
                        remaining.push(BrokenStub {
                            format: arm64::StubFormat::AuthStubOptimized,
                            ..stub
                        });
                        continue;
                    }
                }

                arm64::StubFormat::AuthStubResolver | arm64::StubFormat::Resolver => {
                    fixed = self.image.contains_addr(stub.target);
                }

                arm64::StubFormat::AuthStubOptimized => {}
            }

            if !fixed {
                remaining.push(stub);
            }
        }
        self.broken_stubs = remaining;
    }

    /// Phase 2: rewrite optimized stubs to the normal shape over a claimed
    /// symbol pointer.
    fn fix_pass2(&mut self) -> Result<(), ExtractError> {
        for stub in std::mem::take(&mut self.broken_stubs) {
            let symbols = Rc::clone(&self.stub_map[&stub.addr]);

            match stub.format {
                arm64::StubFormat::StubNormal | arm64::StubFormat::StubOptimized => {
                    // Prefer an unused named lazy pointer, then named
                    // normal, then claim an unnamed one.
                    let mut p_addr = None;
                    if let Some(p) = self.pointer_cache.lazy.find_named_unused(&symbols) {
                        self.pointer_cache.lazy.used.insert(p);
                        p_addr = Some(p);
                    } else if let Some(p) = self.pointer_cache.normal.find_named_unused(&symbols) {
                        self.pointer_cache.normal.used.insert(p);
                        self.ptr_tracker.add(p, 0);
                        p_addr = Some(p);
                    } else if let Some(&p) = self.pointer_cache.lazy.unnamed.iter().next() {
                        self.pointer_cache.lazy.name_pointer(p, &symbols);
                        self.pointer_cache.lazy.used.insert(p);
                        p_addr = Some(p);
                    } else if let Some(&p) = self.pointer_cache.normal.unnamed.iter().next() {
                        self.pointer_cache.normal.name_pointer(p, &symbols);
                        self.pointer_cache.normal.used.insert(p);
                        self.ptr_tracker.add(p, 0);
                        p_addr = Some(p);
                    }

                    let Some(p_addr) = p_addr else {
                        log::warn!("unable to fix optimized stub at {:#x}", stub.addr);
                        continue;
                    };
                    let loc = self.image.bytes_mut(stub.addr, 12)?;
                    self.utils.write_normal_stub(loc, stub.addr, p_addr);
                }

                arm64::StubFormat::AuthStubNormal | arm64::StubFormat::AuthStubOptimized => {
                    let mut p_addr = self.pointer_cache.auth.find_named_unused(&symbols);
                    if p_addr.is_none() {
                        if let Some(&p) = self.pointer_cache.auth.unnamed.iter().next() {
                            self.pointer_cache.auth.name_pointer(p, &symbols);
                            p_addr = Some(p);
                        }
                    }
                    let Some(p_addr) = p_addr else {
                        log::warn!("unable to fix optimized auth stub at {:#x}", stub.addr);
                        continue;
                    };

                    let loc = self.image.bytes_mut(stub.addr, 16)?;
                    arm64::write_normal_auth_stub(loc, stub.addr, p_addr);
                    self.pointer_cache.auth.used.insert(p_addr);
                    self.ptr_tracker.add(p_addr, 0);
                }

                arm64::StubFormat::AuthStubResolver => {
                    log::error!("unable to fix auth stub resolver at {:#x}", stub.addr);
                }
                arm64::StubFormat::Resolver => {
                    log::error!("unable to fix stub resolver at {:#x}", stub.addr);
                }
            }
        }
        Ok(())
    }

    /// Phase 3: patch direct branches whose target escaped the image back
    /// through the local stub carrying the same symbol.
    fn fix_callsites(&mut self) -> Result<(), ExtractError> {
        let Some((si, ci)) = self.image.section_at(SEG_TEXT, SECT_TEXT) else {
            return Ok(());
        };
        let sect = &self.image.segments[si].sections[ci];
        let sect_addr = sect.addr;
        let sect_end = sect.addr + sect.size;

        let mut addr = sect_addr;
        while addr + 4 <= sect_end {
            let instr = self.image.read_u32(addr)?;
            addr += 4;
            let i_addr = addr - 4;

            // Only b and bl instructions, identified by their top byte.
            let top = (instr >> 24) & 0xfc;
            if top != 0x94 && top != 0x14 {
                continue;
            }

            let off = arm64::sign_extend(u64::from(instr & 0x03ff_ffff) << 2, 28);
            let target = (i_addr as i64 + off) as u64;
            if self.image.contains_addr(target) {
                continue;
            }

            let target_func = self
                .utils
                .resolve_stub_chain(self.ptr_tracker, self.accel, target);
            let mut names = self.symbolizer.share(target_func);

            if names.is_none() {
                // A stub may hide the export name; walk the chain backwards.
                let chain = self
                    .utils
                    .resolve_stub_chain_extended(self.ptr_tracker, target);
                for (node, _) in chain.iter().rev().skip(1) {
                    names = self.symbolizer.share(*node);
                    if names.is_some() {
                        break;
                    }
                }
                if names.is_none() && !chain.is_empty() {
                    names = self.symbolizer.share(target); // try the very first stub
                }
            }

            let Some(names) = names else {
                // Data in the text section sometimes matches the branch
                // filter; such words tend to follow another branch.
                if i_addr > sect_addr {
                    let prev_top = (self.image.read_u32(i_addr - 4)? >> 24) & 0xfc;
                    if prev_top == 0x94 || prev_top == 0x14 || prev_top == 0xd4 {
                        continue;
                    }
                }
                if target == target_func {
                    // It probably isn't a branch if it didn't go through any
                    // stubs.
                    continue;
                }
                if !self.accel.is_in_code_regions(target_func) {
                    continue;
                }
                log::warn!(
                    "unable to symbolize branch at {i_addr:#x} with target {target:#x} and destination {target_func:#x}"
                );
                continue;
            };

            let mut fixed = false;
            for sym in names.symbols().iter() {
                if let Some(stubs) = self.reverse_stub_map.get(&sym.name) {
                    let stub_addr = *stubs.iter().next().unwrap();
                    let imm26 = ((stub_addr as i64 - i_addr as i64) >> 2) as u32 & 0x03ff_ffff;
                    let patched = (instr & 0xfc00_0000) | imm26;
                    self.image.write_u32(i_addr, patched)?;
                    fixed = true;
                    break;
                }
            }
            if !fixed {
                log::warn!(
                    "unable to find stub for branch at {i_addr:#x} with target {target:#x}"
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// arm

struct ArmFixer<'e, 'c> {
    image: &'e mut ImageView,
    ptr_tracker: &'e mut PointerTracker<'c>,
    st_tracker: &'e SymbolTableTracker,
    symbolizer: &'e Symbolizer,
    bind_info: &'e BindInfo,
    pointer_cache: &'e mut SymbolPointerCache,
    accel: &'e mut Accelerator,
    utils: arm::ArmUtils<'c>,
    stub_map: BTreeMap<u64, SharedSymbols>,
    reverse_stub_map: HashMap<String, BTreeSet<u64>>,
    broken_stubs: Vec<BrokenStub<arm::StubFormat>>,
}

impl ArmFixer<'_, '_> {
    fn fix(&mut self) -> Result<(), ExtractError> {
        self.fix_stub_helpers();
        self.scan_stubs();
        self.fix_pass1();
        self.fix_pass2()?;
        self.fix_callsites()?;
        Ok(())
    }

    fn fix_stub_helpers(&mut self) {
        const REG_HELPER_SIZE: u64 = 0xc;

        let Some((si, ci)) = self.image.section_at(SEG_TEXT, "__stub_helper") else {
            return;
        };
        let sect = &self.image.segments[si].sections[ci];
        let helper_end = sect.addr + sect.size;
        let mut helper_addr = sect.addr;

        if let Some(binder_size) = self.utils.stub_binder_info(helper_addr) {
            helper_addr += binder_size;
        }

        let can_fix_reg = self.bind_info.has_lazy_binds();
        while helper_addr < helper_end {
            if let Some(bind_off) = self.utils.stub_helper_data(helper_addr) {
                if can_fix_reg {
                    match self.bind_info.lazy_bind(bind_off) {
                        Some(record) => self.ptr_tracker.add(record.address, helper_addr),
                        None => log::error!(
                            "unable to read bind info for stub helper at {helper_addr:#x}"
                        ),
                    }
                } else {
                    log::warn!("unable to fix stub helper at {helper_addr:#x} without bind info");
                }
                helper_addr += REG_HELPER_SIZE;
                continue;
            }

            if let Some(resolver) = self.utils.resolver_data(helper_addr) {
                if !self.image.contains_addr(resolver.target_func) {
                    log::warn!("stub resolver at {helper_addr:#x} points outside of image");
                }
                self.ptr_tracker.add(resolver.target_ptr, helper_addr);
                helper_addr += resolver.size;
                continue;
            }

            log::error!("unknown stub helper format at {helper_addr:#x}");
            helper_addr += REG_HELPER_SIZE;
        }
    }

    fn scan_stubs(&mut self) {
        let sections = self
            .image
            .sections_where(|_, sect| sect.section_type() == S_SYMBOL_STUBS);

        for (si, ci) in sections {
            let sect = &self.image.segments[si].sections[ci];
            let sect_addr = sect.addr;
            let sect_size = sect.size;
            let stub_size = u64::from(sect.reserved2.max(4));
            let reserved1 = sect.reserved1;

            let mut addr = sect_addr;
            let mut indirect_i = reserved1;
            while addr < sect_addr + sect_size {
                let Some((_, format)) = self.utils.resolve_stub(self.ptr_tracker, addr) else {
                    log::error!("unknown arm stub format at {addr:#x}");
                    addr += stub_size;
                    indirect_i += 1;
                    continue;
                };

                let mut symbols = BTreeSet::new();
                if let Some(sym) = self.lookup_indirect(indirect_i) {
                    symbols.insert(sym);
                }

                if format == arm::StubFormat::NormalV4 {
                    if let Some(p_addr) = self.utils.normal_v4_ldr_addr(addr) {
                        if self.image.contains_addr(p_addr) {
                            for group in [&self.pointer_cache.lazy, &self.pointer_cache.normal] {
                                if let Some(info) = group.named.get(&p_addr) {
                                    symbols.extend(info.symbols().iter().cloned());
                                    break;
                                }
                            }
                        }
                    }
                }

                let target_func = self
                    .utils
                    .resolve_stub_chain(self.ptr_tracker, self.accel, addr);
                if let Some(info) = self.symbolizer.symbolize(target_func & !3) {
                    symbols.extend(info.symbols().iter().cloned());
                }

                if symbols.is_empty() {
                    log::warn!("unable to symbolize stub at {addr:#x}");
                } else {
                    let info = match self.stub_map.get(&addr) {
                        Some(existing) => {
                            for sym in symbols {
                                existing.add(sym);
                            }
                            Rc::clone(existing)
                        }
                        None => {
                            let fresh = SymbolicInfo::from_set(symbols);
                            self.stub_map.insert(addr, Rc::clone(&fresh));
                            fresh
                        }
                    };
                    for sym in info.symbols().iter() {
                        self.reverse_stub_map
                            .entry(sym.name.clone())
                            .or_default()
                            .insert(addr);
                    }
                    self.broken_stubs.push(BrokenStub {
                        format,
                        target: target_func,
                        addr,
                        size: stub_size,
                    });
                }

                addr += stub_size;
                indirect_i += 1;
            }
        }
    }

    fn lookup_indirect(&self, index: u32) -> Option<Symbol> {
        let &entry = self.st_tracker.indirect_syms.get(index as usize)?;
        if Some(entry) == self.st_tracker.redacted_index() {
            return None;
        }
        let (name, nlist) = self.st_tracker.symbol(entry)?;
        Some(Symbol {
            name: name.to_owned(),
            ordinal: u64::from(get_library_ordinal(nlist.n_desc)),
            export_flags: None,
        })
    }

    fn fix_pass1(&mut self) {
        let mut remaining = Vec::new();
        for stub in std::mem::take(&mut self.broken_stubs) {
            let symbols = Rc::clone(&self.stub_map[&stub.addr]);
            let mut fixed = false;

            match stub.format {
                arm::StubFormat::NormalV4 => {
                    if let Some(p_addr) = self.utils.normal_v4_ldr_addr(stub.addr) {
                        if self.image.contains_addr(p_addr) {
                            if self.pointer_cache.lazy.is_available(p_addr) {
                                self.pointer_cache.lazy.used.insert(p_addr);
                                fixed = true;
                            } else if self.pointer_cache.normal.is_available(p_addr) {
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else if self.pointer_cache.lazy.unnamed.contains(&p_addr) {
                                self.pointer_cache.lazy.name_pointer(p_addr, &symbols);
                                self.pointer_cache.lazy.used.insert(p_addr);
                                fixed = true;
                            } else if self.pointer_cache.normal.unnamed.contains(&p_addr) {
                                self.pointer_cache.normal.name_pointer(p_addr, &symbols);
                                self.pointer_cache.normal.used.insert(p_addr);
                                self.ptr_tracker.add(p_addr, 0);
                                fixed = true;
                            } else {
                                log::warn!(
                                    "unable to find the pointer a normal stub at {:#x} uses",
                                    stub.addr
                                );
                            }
                        }
                    }
                }
                arm::StubFormat::Resolver => {
                    fixed = self.image.contains_addr(stub.target);
                }
                arm::StubFormat::OptimizedV5 => {}
            }

            if !fixed {
                remaining.push(stub);
            }
        }
        self.broken_stubs = remaining;
    }

    fn fix_pass2(&mut self) -> Result<(), ExtractError> {
        for stub in std::mem::take(&mut self.broken_stubs) {
            let symbols = Rc::clone(&self.stub_map[&stub.addr]);

            match stub.format {
                arm::StubFormat::NormalV4 | arm::StubFormat::OptimizedV5 => {
                    let mut p_addr = None;
                    if let Some(p) = self.pointer_cache.lazy.find_named_unused(&symbols) {
                        self.pointer_cache.lazy.used.insert(p);
                        p_addr = Some(p);
                    } else if let Some(p) = self.pointer_cache.normal.find_named_unused(&symbols) {
                        self.pointer_cache.normal.used.insert(p);
                        self.ptr_tracker.add(p, 0);
                        p_addr = Some(p);
                    } else if let Some(&p) = self.pointer_cache.lazy.unnamed.iter().next() {
                        self.pointer_cache.lazy.name_pointer(p, &symbols);
                        self.pointer_cache.lazy.used.insert(p);
                        p_addr = Some(p);
                    } else if let Some(&p) = self.pointer_cache.normal.unnamed.iter().next() {
                        self.pointer_cache.normal.name_pointer(p, &symbols);
                        self.pointer_cache.normal.used.insert(p);
                        self.ptr_tracker.add(p, 0);
                        p_addr = Some(p);
                    }

                    let Some(p_addr) = p_addr else {
                        log::warn!("unable to fix optimized stub at {:#x}", stub.addr);
                        continue;
                    };
                    let loc = self.image.bytes_mut(stub.addr & !3, 16)?;
                    arm::write_normal_v4_stub(loc, stub.addr & !3, p_addr);
                }
                arm::StubFormat::Resolver => {
                    log::error!("unable to fix stub resolver at {:#x}", stub.addr);
                }
            }
        }
        Ok(())
    }

    /// Patches arm-mode `bl`/`blx` call sites whose target escaped the
    /// image. Thumb sites are left to the silent-data heuristics.
    fn fix_callsites(&mut self) -> Result<(), ExtractError> {
        let Some((si, ci)) = self.image.section_at(SEG_TEXT, SECT_TEXT) else {
            return Ok(());
        };
        let sect = &self.image.segments[si].sections[ci];
        let sect_addr = sect.addr;
        let sect_end = sect.addr + sect.size;

        let mut addr = sect_addr & !3;
        while addr + 4 <= sect_end {
            let i_addr = addr;
            let instr = self.image.read_u32(i_addr)?;
            addr += 4;

            // bl (cond=AL) or blx imm24.
            let is_bl = instr & 0x0f00_0000 == 0x0b00_0000 && instr >> 28 == 0xe;
            let is_blx = instr & 0xfe00_0000 == 0xfa00_0000;
            if !is_bl && !is_blx {
                continue;
            }

            let imm = arm64::sign_extend(u64::from(instr & 0x00ff_ffff) << 2, 26);
            let h = if is_blx {
                u64::from((instr >> 24) & 1) << 1
            } else {
                0
            };
            let target = ((i_addr as i64 + 8 + imm) as u64 + h) & !1;
            if self.image.contains_addr(target) {
                continue;
            }

            let target_func = self
                .utils
                .resolve_stub_chain(self.ptr_tracker, self.accel, target);
            let Some(names) = self.symbolizer.share(target_func & !3) else {
                if target == target_func || !self.accel.is_in_code_regions(target_func & !3) {
                    continue;
                }
                log::warn!(
                    "unable to symbolize branch at {i_addr:#x} with target {target:#x} and destination {target_func:#x}"
                );
                continue;
            };

            let mut fixed = false;
            for sym in names.symbols().iter() {
                if let Some(stubs) = self.reverse_stub_map.get(&sym.name) {
                    let stub_addr = *stubs.iter().next().unwrap() & !3;
                    let imm24 =
                        ((stub_addr as i64 - i_addr as i64 - 8) >> 2) as u32 & 0x00ff_ffff;
                    // Rewrite as a plain bl; the stub handles any mode switch.
                    let patched = 0xeb00_0000 | imm24;
                    self.image.write_u32(i_addr, patched)?;
                    fixed = true;
                    break;
                }
            }
            if !fixed {
                log::warn!(
                    "unable to find stub for branch at {i_addr:#x} with target {target:#x}"
                );
            }
        }
        Ok(())
    }
}

//! Symbolic information for addresses: the image's own symbols plus every
//! dependency's exports, with re-exports followed to their origin.

use std::cell::{Cell, Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use crate::accelerator::Accelerator;
use crate::cache::DyldCache;
use crate::image::{CacheImageRef, ImageView};
use crate::layout::{
    self, DyldInfoCommand, EXPORT_SYMBOL_FLAGS_REEXPORT, EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER,
    LinkeditDataCommand, N_SECT, N_TYPE, SELF_LIBRARY_ORDINAL,
};
use crate::leb::read_uleb128;
use crate::linkedit::symtab::SymbolTableTracker;

/// One symbol observed at an address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Symbol {
    pub name: String,
    /// Dylib-command index in the referencing image; 0 is the image itself.
    pub ordinal: u64,
    /// Export flags when the symbol came from an export trie.
    pub export_flags: Option<u64>,
}

impl Symbol {
    pub fn is_reexport(&self) -> bool {
        self.export_flags
            .is_some_and(|f| f & EXPORT_SYMBOL_FLAGS_REEXPORT != 0)
    }
}

/// The set of symbols co-located at one address.
///
/// Shared by many sites (several pointers and a stub may name the same
/// import), and append-only: a site holding a reference observes every
/// symbol merged in later.
#[derive(Debug, Default)]
pub struct SymbolicInfo {
    symbols: RefCell<BTreeSet<Symbol>>,
    /// Low address bits on arm, recording Thumb state.
    pub encoding: Cell<u8>,
}

pub type SharedSymbols = Rc<SymbolicInfo>;

impl SymbolicInfo {
    pub fn new(first: Symbol) -> SharedSymbols {
        let info = SymbolicInfo::default();
        info.symbols.borrow_mut().insert(first);
        Rc::new(info)
    }

    pub fn from_set(symbols: BTreeSet<Symbol>) -> SharedSymbols {
        debug_assert!(!symbols.is_empty());
        Rc::new(SymbolicInfo {
            symbols: RefCell::new(symbols),
            encoding: Cell::new(0),
        })
    }

    pub fn add(&self, sym: Symbol) {
        self.symbols.borrow_mut().insert(sym);
    }

    pub fn merge_from(&self, other: &SymbolicInfo) {
        let other_syms = other.symbols.borrow();
        self.symbols.borrow_mut().extend(other_syms.iter().cloned());
    }

    pub fn symbols(&self) -> Ref<'_, BTreeSet<Symbol>> {
        self.symbols.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.borrow().is_empty()
    }

    /// The canonical symbol: non-re-exports beat re-exports, then the
    /// lexicographically greatest name (biasing against `_`-prefixed private
    /// names), then the lowest ordinal.
    pub fn preferred(&self) -> Symbol {
        let symbols = self.symbols.borrow();
        let mut best: Option<&Symbol> = None;
        for sym in symbols.iter() {
            let Some(current) = best else {
                best = Some(sym);
                continue;
            };
            if current.is_reexport() != sym.is_reexport() {
                if current.is_reexport() {
                    best = Some(sym);
                }
                continue;
            }
            if current.name != sym.name {
                if current.name < sym.name {
                    best = Some(sym);
                }
                continue;
            }
            if sym.ordinal < current.ordinal {
                best = Some(sym);
            }
        }
        best.expect("symbolic info is never empty").clone()
    }
}

/// A parsed export-trie entry.
#[derive(Clone, Debug)]
pub struct TrieExport {
    pub name: String,
    pub flags: u64,
    pub address: u64,
    pub other: u64,
    pub import_name: Option<String>,
}

/// Parses a Mach-O export trie into a flat entry list. Malformed or cyclic
/// tries stop the walk and return what was parsed.
pub fn parse_export_trie(data: &[u8]) -> Vec<TrieExport> {
    let mut exports = Vec::new();
    let mut visited = BTreeSet::new();
    let mut stack = vec![(0usize, String::new())];

    while let Some((offset, prefix)) = stack.pop() {
        if !visited.insert(offset) {
            continue;
        }
        let mut pos = offset;
        let Some(terminal_size) = read_uleb128(data, &mut pos) else {
            continue;
        };

        if terminal_size > 0 {
            let mut tpos = pos;
            if let Some(flags) = read_uleb128(data, &mut tpos) {
                let mut entry = TrieExport {
                    name: prefix.clone(),
                    flags,
                    address: 0,
                    other: 0,
                    import_name: None,
                };
                if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
                    entry.other = read_uleb128(data, &mut tpos).unwrap_or(0);
                    let name_end = data
                        .get(tpos..)
                        .and_then(|tail| tail.iter().position(|&b| b == 0))
                        .map(|n| tpos + n);
                    if let Some(end) = name_end {
                        let s = String::from_utf8_lossy(&data[tpos..end]).into_owned();
                        if !s.is_empty() {
                            entry.import_name = Some(s);
                        }
                    }
                } else {
                    entry.address = read_uleb128(data, &mut tpos).unwrap_or(0);
                    if flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
                        entry.other = read_uleb128(data, &mut tpos).unwrap_or(0);
                    }
                }
                exports.push(entry);
            }
        }

        pos += terminal_size as usize;
        let Some(&child_count) = data.get(pos) else {
            continue;
        };
        pos += 1;
        for _ in 0..child_count {
            let label_start = pos;
            let Some(nul) = data
                .get(label_start..)
                .and_then(|tail| tail.iter().position(|&b| b == 0))
            else {
                break;
            };
            let label = String::from_utf8_lossy(&data[label_start..label_start + nul]);
            pos = label_start + nul + 1;
            let Some(child_off) = read_uleb128(data, &mut pos) else {
                break;
            };
            stack.push((child_off as usize, format!("{prefix}{label}")));
        }
    }

    exports
}

/// Exports of one dependency, indexed both ways.
#[derive(Debug, Default)]
pub struct DylibExports {
    pub by_addr: BTreeMap<u64, Vec<(String, u64)>>,
    pub by_name: HashMap<String, u64>,
}

impl DylibExports {
    fn insert(&mut self, addr: u64, name: &str, flags: u64) {
        self.by_addr
            .entry(addr)
            .or_default()
            .push((name.to_owned(), flags));
        self.by_name.entry(name.to_owned()).or_insert(addr);
    }
}

/// Address to symbolic-info map for one image.
pub struct Symbolizer {
    symbols: HashMap<u64, SharedSymbols>,
}

impl Symbolizer {
    /// Builds the map from the image's own `N_SECT` symbols (already moved
    /// into the symbol-table tracker) and every dependency's exports.
    pub fn enumerate(
        cache: &DyldCache,
        image: &ImageView,
        st_tracker: &SymbolTableTracker,
        accel: &mut Accelerator,
    ) -> Self {
        let mut symbolizer = Symbolizer {
            symbols: HashMap::new(),
        };
        symbolizer.enumerate_exports(cache, image, accel);
        symbolizer.enumerate_own_symbols(image, st_tracker);
        symbolizer
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.symbols.contains_key(&(addr & !3))
    }

    pub fn symbolize(&self, addr: u64) -> Option<&SharedSymbols> {
        self.symbols.get(&(addr & !3))
    }

    pub fn share(&self, addr: u64) -> Option<SharedSymbols> {
        self.symbolize(addr).cloned()
    }

    fn add(&mut self, addr: u64, sym: Symbol, is_arm: bool) {
        let key = addr & !3;
        match self.symbols.get(&key) {
            Some(info) => info.add(sym),
            None => {
                let info = SymbolicInfo::new(sym);
                if is_arm {
                    info.encoding.set((addr & 3) as u8);
                }
                self.symbols.insert(key, info);
            }
        }
    }

    fn enumerate_exports(&mut self, cache: &DyldCache, image: &ImageView, accel: &mut Accelerator) {
        if accel.path_to_image.is_empty() {
            for (i, info) in cache.images.iter().enumerate() {
                accel
                    .path_to_image
                    .insert(cache.image_path(info).to_owned(), i);
            }
        }

        let is_arm = !image.is_64() && image.arch == crate::cache::CacheArch::Arm;

        // Process all dylib commands including the image's own ID.
        let dylibs = image.all_lcs(&[
            layout::LC_ID_DYLIB,
            layout::LC_LOAD_DYLIB,
            layout::LC_LOAD_WEAK_DYLIB,
            layout::LC_REEXPORT_DYLIB,
            layout::LC_LOAD_UPWARD_DYLIB,
            layout::LC_LAZY_LOAD_DYLIB,
        ]);
        for (ordinal, lc) in dylibs.iter().enumerate() {
            let Some(path) = image.dylib_name(lc) else {
                continue;
            };
            let exports = dylib_exports(cache, accel, &path);
            for (&addr, entries) in &exports.by_addr {
                for (name, flags) in entries {
                    self.add(
                        addr,
                        Symbol {
                            name: name.clone(),
                            ordinal: ordinal as u64,
                            export_flags: Some(*flags),
                        },
                        is_arm,
                    );
                }
            }
        }
    }

    fn enumerate_own_symbols(&mut self, image: &ImageView, st_tracker: &SymbolTableTracker) {
        let is_arm = !image.is_64() && image.arch == crate::cache::CacheArch::Arm;
        for (name, nlist) in st_tracker.all_symbols() {
            if nlist.n_type & N_TYPE == N_SECT {
                self.add(
                    nlist.n_value,
                    Symbol {
                        name: name.to_owned(),
                        ordinal: SELF_LIBRARY_ORDINAL,
                        export_flags: None,
                    },
                    is_arm,
                );
            }
        }
    }
}

/// Exports of the dependency at `path`, parsed once per accelerator.
/// Re-exported symbols are resolved into their parents recursively and
/// `LC_REEXPORT_DYLIB` dependencies are inlined transitively.
pub fn dylib_exports(cache: &DyldCache, accel: &mut Accelerator, path: &str) -> Rc<DylibExports> {
    if let Some(cached) = accel.exports_cache.get(path) {
        return Rc::clone(cached);
    }
    if !accel.exports_in_progress.insert(path.to_owned()) {
        // Dependency cycle; the first parse wins.
        return Rc::new(DylibExports::default());
    }

    let exports = build_dylib_exports(cache, accel, path).unwrap_or_default();
    let exports = Rc::new(exports);
    accel.exports_in_progress.remove(path);
    accel
        .exports_cache
        .insert(path.to_owned(), Rc::clone(&exports));
    exports
}

fn build_dylib_exports(
    cache: &DyldCache,
    accel: &mut Accelerator,
    path: &str,
) -> Option<DylibExports> {
    let Some(&image_index) = accel.path_to_image.get(path) else {
        // It may refer to an image outside the cache; treat as empty.
        log::debug!("unable to find image with path {path}");
        return None;
    };
    let base = cache.images[image_index].address;
    let image = CacheImageRef::parse(cache, base).ok()?;

    let raw_exports = read_exports(&image)?;
    let mut exports = DylibExports::default();
    let mut reexports: BTreeMap<u64, Vec<TrieExport>> = BTreeMap::new();
    for e in raw_exports {
        if e.flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
            reexports.entry(e.other).or_default().push(e);
            continue;
        }
        if e.address == 0 {
            // Some exports like __objc_empty_vtable carry no address.
            continue;
        }

        exports.insert(base + e.address, &e.name, e.flags);
        if e.flags & EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER != 0 {
            // The address is the stub; "other" is the resolver itself.
            exports.insert(base + e.other, &e.name, e.flags);
        }
    }

    // Resolve re-exported symbols through their parent libraries.
    let deps: Vec<(u32, u64)> = image
        .dylib_commands()
        .into_iter()
        .filter(|(cmd, _)| *cmd != layout::LC_ID_DYLIB)
        .collect();
    for (ordinal, entries) in reexports {
        let Some(&(_, dep_addr)) = deps.get(ordinal.saturating_sub(1) as usize) else {
            continue;
        };
        let Some(dep_path) = image.dylib_name(dep_addr) else {
            continue;
        };
        let parent = dylib_exports(cache, accel, dep_path);
        if parent.by_name.is_empty() {
            continue;
        }
        for e in entries {
            let import_name = e.import_name.as_deref().unwrap_or(&e.name);
            match parent.by_name.get(import_name) {
                Some(&addr) => exports.insert(addr, &e.name, e.flags),
                None => log::debug!(
                    "unable to find parent export with name {import_name}, for re-export with name {}",
                    e.name
                ),
            }
        }
    }

    // Inline whole re-exported dependencies.
    for (cmd, dep_addr) in image.dylib_commands() {
        if cmd != layout::LC_REEXPORT_DYLIB {
            continue;
        }
        if let Some(dep_path) = image.dylib_name(dep_addr) {
            let inlined = dylib_exports(cache, accel, dep_path);
            for (&addr, entries) in &inlined.by_addr {
                for (name, flags) in entries {
                    exports.insert(addr, name, *flags);
                }
            }
        }
    }

    Some(exports)
}

fn read_exports(image: &CacheImageRef<'_>) -> Option<Vec<TrieExport>> {
    let linkedit = image.linkedit_file()?;
    let (start, size) =
        if let Some((_, lc_addr)) = image.find_lc(&[layout::LC_DYLD_EXPORTS_TRIE]) {
            let lc: LinkeditDataCommand = image.lc_struct(lc_addr)?;
            (lc.dataoff as u64, lc.datasize as usize)
        } else if let Some((_, lc_addr)) =
            image.find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        {
            let lc: DyldInfoCommand = image.lc_struct(lc_addr)?;
            (lc.export_off as u64, lc.export_size as usize)
        } else {
            log::error!("unable to get exports for an image");
            return None;
        };

    if size == 0 {
        // Some images don't have exports.
        return Some(Vec::new());
    }
    linkedit.bytes_at(start, size).map(parse_export_trie)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leb::append_uleb128;

    // Builds a two-symbol trie: _foo -> addr 0x100, _bar -> reexport of
    // "old_bar" in library 2.
    fn tiny_trie() -> Vec<u8> {
        let mut t = Vec::new();
        // node 0: no terminal, one child with label "_"
        t.push(0); // terminal size
        t.push(1); // child count
        t.extend(b"_\0");
        t.push(8); // child offset
        assert_eq!(t.len(), 5);
        t.extend([0, 0, 0]); // pad to offset 8

        // node at 8: no terminal, children "foo" and "bar"
        t.push(0);
        t.push(2);
        t.extend(b"foo\0");
        t.push(24);
        t.extend(b"bar\0");
        t.push(32);
        assert_eq!(t.len(), 20);
        t.extend([0, 0, 0, 0]); // pad to 24

        // node at 24: terminal _foo
        let mut term = Vec::new();
        append_uleb128(&mut term, 0); // flags
        append_uleb128(&mut term, 0x100); // address
        t.push(term.len() as u8);
        t.extend(&term);
        t.push(0); // no children
        assert_eq!(t.len(), 29);
        t.extend([0, 0, 0]); // pad to 32

        // node at 32: terminal _bar, re-export "old_bar" from ordinal 2
        let mut term = Vec::new();
        append_uleb128(&mut term, EXPORT_SYMBOL_FLAGS_REEXPORT);
        append_uleb128(&mut term, 2);
        term.extend(b"old_bar\0");
        t.push(term.len() as u8);
        t.extend(&term);
        t.push(0);
        t
    }

    #[test]
    fn trie_parses_plain_and_reexport() {
        let mut exports = parse_export_trie(&tiny_trie());
        exports.sort_by(|a, b| a.name.cmp(&b.name));

        assert_eq!(exports.len(), 2);
        assert_eq!(exports[0].name, "_bar");
        assert_eq!(exports[0].other, 2);
        assert_eq!(exports[0].import_name.as_deref(), Some("old_bar"));
        assert_eq!(exports[1].name, "_foo");
        assert_eq!(exports[1].address, 0x100);
    }

    #[test]
    fn preferred_prefers_plain_over_reexport_and_low_ordinal() {
        let info = SymbolicInfo::new(Symbol {
            name: "_malloc".into(),
            ordinal: 4,
            export_flags: Some(EXPORT_SYMBOL_FLAGS_REEXPORT),
        });
        info.add(Symbol {
            name: "_malloc".into(),
            ordinal: 3,
            export_flags: Some(0),
        });
        info.add(Symbol {
            name: "_malloc".into(),
            ordinal: 7,
            export_flags: Some(0),
        });

        let preferred = info.preferred();
        assert!(!preferred.is_reexport());
        assert_eq!(preferred.ordinal, 3);
    }

    #[test]
    fn preferred_biases_against_underscore_private_names() {
        let info = SymbolicInfo::new(Symbol {
            name: "__private_malloc".into(),
            ordinal: 1,
            export_flags: None,
        });
        info.add(Symbol {
            name: "malloc".into(),
            ordinal: 1,
            export_flags: None,
        });
        assert_eq!(info.preferred().name, "malloc");
    }
}

//! End-to-end extraction scenarios over synthetic single-file caches.
//!
//! The fixture builds a small but structurally real cache: a target dylib
//! with slid pointers, stubs, a `__got`, ObjC metadata and a stripped-locals
//! side table, plus the dependency images (including libobjc's optimization
//! tables) the pipeline consults.

use std::path::{Path, PathBuf};

use zerocopy::IntoBytes;

use dyld_cache_extractor::accelerator::Accelerator;
use dyld_cache_extractor::cache::{CacheArch, DyldCache};
use dyld_cache_extractor::extract::{
    extract_image, list_images, ExtractionOptions, SkipModules,
};
use dyld_cache_extractor::image::make_name16;
use dyld_cache_extractor::layout::{
    self, DysymtabCommand, DylibCommand, LinkeditDataCommand, Nlist64, Section64,
    SegmentCommand64, SymtabCommand,
};

const TEXT_REGION: u64 = 0x1_0000_0000;
const DATA_REGION: u64 = 0x1_0010_0000;
const LE_REGION: u64 = 0x1_0020_0000;
const TEXT_FOFF: u64 = 0x10000;
const DATA_FOFF: u64 = 0x50000;
const LE_FOFF: u64 = 0x60000;
const CACHE_SIZE: usize = 0x80000;

const MAPPINGS_OFF: u64 = 0x1c8;
const MWS_OFF: u64 = 0x228;
const IMAGES_OFF: u64 = 0x260;
const PATHS_OFF: u64 = 0x300;
const SLIDE_OFF: u64 = 0x400;
const LOCSYM_OFF: u64 = 0x500;

const FOO_BASE: u64 = TEXT_REGION;
const BAR_BASE: u64 = TEXT_REGION + 0x10000;
const BAZ_BASE: u64 = TEXT_REGION + 0x20000;
const MALLOC_BASE: u64 = TEXT_REGION + 0x30000;
const OBJC_BASE: u64 = TEXT_REGION + 0x8000;

struct CacheFile {
    data: Vec<u8>,
}

impl CacheFile {
    fn new(magic: &str) -> Self {
        let mut cache = CacheFile {
            data: vec![0u8; CACHE_SIZE],
        };
        cache.put(0, magic.as_bytes());
        cache.put_u32(0x10, MAPPINGS_OFF as u32); // mapping_offset
        cache.put_u32(0x14, 3); // mapping_count
        cache.put_u64(0x48, LOCSYM_OFF); // local_symbols_offset
        cache.put_u64(0xe0, TEXT_REGION); // shared_region_start
        cache.put_u32(0x138, MWS_OFF as u32); // mapping_with_slide_offset
        cache.put_u32(0x13c, 1); // mapping_with_slide_count

        // Mappings: text, data (slid), linkedit.
        let mut off = MAPPINGS_OFF;
        for (addr, size, foff) in [
            (TEXT_REGION, 0x40000u64, TEXT_FOFF),
            (DATA_REGION, 0x10000, DATA_FOFF),
            (LE_REGION, 0x20000, LE_FOFF),
        ] {
            cache.put_u64(off, addr);
            cache.put_u64(off + 8, size);
            cache.put_u64(off + 16, foff);
            cache.put_u32(off + 24, 3);
            cache.put_u32(off + 28, 3);
            off += 32;
        }

        // The slid data mapping.
        cache.put_u64(MWS_OFF, DATA_REGION);
        cache.put_u64(MWS_OFF + 8, 0x10000);
        cache.put_u64(MWS_OFF + 16, DATA_FOFF);
        cache.put_u64(MWS_OFF + 24, SLIDE_OFF); // slide_info_file_offset
        cache.put_u64(MWS_OFF + 32, 0x100); // slide_info_file_size

        // Slide info v3: page 0 chains from offset 0, other pages empty.
        cache.put_u32(SLIDE_OFF, 3); // version
        cache.put_u32(SLIDE_OFF + 4, 0x4000); // page_size
        cache.put_u32(SLIDE_OFF + 8, 4); // page_starts_count
        cache.put_u64(SLIDE_OFF + 16, 0); // auth_value_add
        cache.put_u16(SLIDE_OFF + 24, 0);
        for i in 1..4 {
            cache.put_u16(SLIDE_OFF + 24 + i * 2, 0xffff); // no rebase
        }

        cache
    }

    fn put(&mut self, off: u64, bytes: &[u8]) {
        let off = off as usize;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
    }

    fn put_u16(&mut self, off: u64, v: u16) {
        self.put(off, &v.to_le_bytes());
    }

    fn put_u32(&mut self, off: u64, v: u32) {
        self.put(off, &v.to_le_bytes());
    }

    fn put_u64(&mut self, off: u64, v: u64) {
        self.put(off, &v.to_le_bytes());
    }

    fn file_off(addr: u64) -> u64 {
        if addr >= LE_REGION {
            addr - LE_REGION + LE_FOFF
        } else if addr >= DATA_REGION {
            addr - DATA_REGION + DATA_FOFF
        } else {
            addr - TEXT_REGION + TEXT_FOFF
        }
    }

    fn put_vm(&mut self, addr: u64, bytes: &[u8]) {
        self.put(Self::file_off(addr), bytes);
    }

    fn put_vm_u32(&mut self, addr: u64, v: u32) {
        self.put_vm(addr, &v.to_le_bytes());
    }

    fn put_vm_u64(&mut self, addr: u64, v: u64) {
        self.put_vm(addr, &v.to_le_bytes());
    }

    fn set_images(&mut self, images: &[(u64, &str)]) {
        self.put_u32(0x1c0, IMAGES_OFF as u32);
        self.put_u32(0x1c4, images.len() as u32);
        let mut path_off = PATHS_OFF;
        for (i, (addr, path)) in images.iter().enumerate() {
            let entry = IMAGES_OFF + i as u64 * 32;
            self.put_u64(entry, *addr);
            self.put_u32(entry + 24, path_off as u32);
            self.put(path_off, path.as_bytes());
            path_off += path.len() as u64 + 1;
        }
    }

    fn write_local_symbols(&mut self) {
        // One stripped local for the target image (dylib vm offset 0).
        let nlist_off = 0x40u32;
        let strings_off = 0x60u32;
        let entries_off = 0x80u32;
        self.put_u32(LOCSYM_OFF, nlist_off);
        self.put_u32(LOCSYM_OFF + 4, 1); // nlist_count
        self.put_u32(LOCSYM_OFF + 8, strings_off);
        self.put_u32(LOCSYM_OFF + 12, 0x20); // strings_size
        self.put_u32(LOCSYM_OFF + 16, entries_off);
        self.put_u32(LOCSYM_OFF + 20, 1); // entries_count

        let nlist = Nlist64 {
            n_strx: 1,
            n_type: 0x0e, // N_SECT
            n_sect: 1,
            n_desc: 0,
            n_value: FOO_BASE + 0x1010,
        };
        self.put(LOCSYM_OFF + u64::from(nlist_off), nlist.as_bytes());
        self.put(LOCSYM_OFF + u64::from(strings_off), b"\0_local_helper\0");

        // 64-bit entry: dylib vm offset, nlist start, count.
        self.put_u64(LOCSYM_OFF + u64::from(entries_off), 0);
        self.put_u32(LOCSYM_OFF + u64::from(entries_off) + 8, 0);
        self.put_u32(LOCSYM_OFF + u64::from(entries_off) + 12, 1);
    }

    fn finish(self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, &self.data).unwrap();
        path
    }
}

/// A single-symbol export trie: terminal size, flags 0, uleb address.
fn export_trie(name: &str, addr: u64) -> Vec<u8> {
    let mut addr_uleb = Vec::new();
    let mut value = addr;
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        addr_uleb.push(byte);
        if value == 0 {
            break;
        }
    }

    let mut trie = Vec::new();
    trie.push(0); // no terminal at root
    trie.push(1); // one child
    trie.extend_from_slice(name.as_bytes());
    trie.push(0);
    let child_off = (trie.len() + 1) as u8;
    trie.push(child_off);
    // terminal node
    trie.push(1 + addr_uleb.len() as u8);
    trie.push(0); // flags
    trie.extend_from_slice(&addr_uleb);
    trie.push(0); // no children
    trie
}

struct SegSpec {
    name: &'static str,
    vmaddr: u64,
    vmsize: u64,
    fileoff: u64,
    filesize: u64,
    sections: Vec<Section64>,
}

fn section(
    segname: &str,
    sectname: &str,
    addr: u64,
    size: u64,
    flags: u32,
    reserved1: u32,
    reserved2: u32,
) -> Section64 {
    Section64 {
        sectname: make_name16(sectname),
        segname: make_name16(segname),
        addr,
        size,
        offset: CacheFile::file_off(addr) as u32,
        align: 3,
        reloff: 0,
        nreloc: 0,
        flags,
        reserved1,
        reserved2,
        reserved3: 0,
    }
}

fn dylib_lc(cmd: u32, path: &str) -> Vec<u8> {
    let path_len = path.len() + 1;
    let cmdsize = layout::align((24 + path_len) as u64, 8) as u32;
    let mut lc = DylibCommand {
        cmd,
        cmdsize,
        name_offset: 24,
        timestamp: 2,
        current_version: 0x10000,
        compatibility_version: 0x10000,
    }
    .as_bytes()
    .to_vec();
    lc.extend_from_slice(path.as_bytes());
    lc.push(0);
    lc.resize(cmdsize as usize, 0);
    lc
}

/// Assembles a 64-bit Mach-O header with the given segments and commands
/// into the cache at the image's base address.
fn write_image(cache: &mut CacheFile, base: u64, cpusubtype: u32, segs: &[SegSpec], lcs: &[Vec<u8>]) {
    let mut cmds = Vec::new();
    for seg in segs {
        let cmdsize = 72 + seg.sections.len() * 80;
        let cmd = SegmentCommand64 {
            cmd: layout::LC_SEGMENT_64,
            cmdsize: cmdsize as u32,
            segname: make_name16(seg.name),
            vmaddr: seg.vmaddr,
            vmsize: seg.vmsize,
            fileoff: seg.fileoff,
            filesize: seg.filesize,
            maxprot: 3,
            initprot: 3,
            nsects: seg.sections.len() as u32,
            flags: 0,
        };
        cmds.extend_from_slice(cmd.as_bytes());
        for sect in &seg.sections {
            cmds.extend_from_slice(sect.as_bytes());
        }
    }
    for lc in lcs {
        cmds.extend_from_slice(lc);
    }

    let header = layout::MachHeader64 {
        magic: layout::MH_MAGIC_64,
        cputype: 0x0100_000c, // CPU_TYPE_ARM64
        cpusubtype,
        filetype: 6, // MH_DYLIB
        ncmds: (segs.len() + lcs.len()) as u32,
        sizeofcmds: cmds.len() as u32,
        flags: 0,
        reserved: 0,
    };

    let mut image = header.as_bytes().to_vec();
    image.extend_from_slice(&cmds);
    cache.put_vm(base, &image);
}

/// A dependency dylib: one text segment, a linkedit with a detached export
/// trie, and its ID command.
fn write_dep(cache: &mut CacheFile, base: u64, path: &str, trie_addr: u64, trie: &[u8]) {
    cache.put_vm(trie_addr, trie);
    let segs = [
        SegSpec {
            name: "__TEXT",
            vmaddr: base,
            vmsize: 0x8000,
            fileoff: CacheFile::file_off(base),
            filesize: 0x8000,
            sections: vec![section(
                "__TEXT",
                "__text",
                base + 0x1000,
                0x100,
                layout::S_ATTR_SOME_INSTRUCTIONS,
                0,
                0,
            )],
        },
        SegSpec {
            name: "__LINKEDIT",
            vmaddr: trie_addr,
            vmsize: 0x1000,
            fileoff: CacheFile::file_off(trie_addr),
            filesize: 0x1000,
            sections: vec![],
        },
    ];
    let lcs = [
        dylib_lc(layout::LC_ID_DYLIB, path),
        LinkeditDataCommand {
            cmd: layout::LC_DYLD_EXPORTS_TRIE,
            cmdsize: 16,
            dataoff: CacheFile::file_off(trie_addr) as u32,
            datasize: trie.len() as u32,
        }
        .as_bytes()
        .to_vec(),
    ];
    write_image(cache, base, 0, &segs, &lcs);
}

/// libobjc with its optimization tables: version-16 opt_ro, a header table
/// indexing the target image, and the relative-selector pool.
fn write_libobjc(cache: &mut CacheFile, target_base: u64) {
    let opt_ro = OBJC_BASE + 0x1000;
    let headeropt = opt_ro + 0x100;
    let sel_base = OBJC_BASE + 0x2000;

    cache.put_vm_u32(opt_ro, 16); // version
    cache.put_vm_u32(opt_ro + 12, 0x100); // headeropt_ro_offset
    cache.put_vm_u32(opt_ro + 32, 0x1000); // relativeMethodSelectorBaseAddressOffset

    cache.put_vm_u32(headeropt, 2); // count
    cache.put_vm_u32(headeropt + 4, 16); // entsize
    let entry0 = headeropt + 8;
    cache.put_vm_u64(entry0, (OBJC_BASE as i64 - entry0 as i64) as u64);
    let entry1 = headeropt + 24;
    cache.put_vm_u64(entry1, (target_base as i64 - entry1 as i64) as u64);

    cache.put_vm(sel_base, b"\xf0\x9f\xa4\xaf\0init\0");

    let segs = [SegSpec {
        name: "__TEXT",
        vmaddr: OBJC_BASE,
        vmsize: 0x8000,
        fileoff: CacheFile::file_off(OBJC_BASE),
        filesize: 0x8000,
        sections: vec![section("__TEXT", "__objc_opt_ro", opt_ro, 0x100, 0, 0, 0)],
    }];
    let lcs = [dylib_lc(layout::LC_ID_DYLIB, "/usr/lib/libobjc.A.dylib")];
    write_image(cache, OBJC_BASE, 0, &segs, &lcs);
}

fn foo_linkedit(cache: &mut CacheFile, with_indirect: bool) -> Vec<Vec<u8>> {
    // nlist for the exported _foo.
    let nlist = Nlist64 {
        n_strx: 1,
        n_type: 0x0f, // N_SECT | N_EXT
        n_sect: 1,
        n_desc: 0,
        n_value: FOO_BASE + 0x1000,
    };
    cache.put(LE_FOFF, nlist.as_bytes());
    cache.put(LE_FOFF + 0x100, b"\0_foo\0");
    let trie = export_trie("_foo", 0x1000);
    cache.put(LE_FOFF + 0x200, &trie);
    if with_indirect {
        cache.put_u32(LE_FOFF + 0x300, 0); // stub entry, redacted
        cache.put_u32(LE_FOFF + 0x304, 0); // got entry, redacted
    }

    vec![
        SymtabCommand {
            cmd: layout::LC_SYMTAB,
            cmdsize: 24,
            symoff: LE_FOFF as u32,
            nsyms: 1,
            stroff: LE_FOFF as u32 + 0x100,
            strsize: 6,
        }
        .as_bytes()
        .to_vec(),
        DysymtabCommand {
            cmd: layout::LC_DYSYMTAB,
            cmdsize: 80,
            ilocalsym: 0,
            nlocalsym: 0,
            iextdefsym: 0,
            nextdefsym: 1,
            iundefsym: 1,
            nundefsym: 0,
            indirectsymoff: if with_indirect { LE_FOFF as u32 + 0x300 } else { 0 },
            nindirectsyms: if with_indirect { 2 } else { 0 },
            ..DysymtabCommand::default()
        }
        .as_bytes()
        .to_vec(),
        LinkeditDataCommand {
            cmd: layout::LC_DYLD_EXPORTS_TRIE,
            cmdsize: 16,
            dataoff: LE_FOFF as u32 + 0x200,
            datasize: trie.len() as u32,
        }
        .as_bytes()
        .to_vec(),
    ]
}

/// Scenario S1's cache: one image, one slid pointer.
fn minimal_cache(dir: &Path, magic: &str) -> PathBuf {
    let mut cache = CacheFile::new(magic);
    cache.set_images(&[(FOO_BASE, "/usr/lib/libfoo.dylib")]);
    cache.write_local_symbols();

    // The one rebase cell: a plain v3 pointer targeting __text+0.
    cache.put_vm_u64(DATA_REGION, FOO_BASE + 0x1000);

    let mut lcs = vec![dylib_lc(layout::LC_ID_DYLIB, "/usr/lib/libfoo.dylib")];
    lcs.extend(foo_linkedit(&mut cache, false));

    let segs = [
        SegSpec {
            name: "__TEXT",
            vmaddr: FOO_BASE,
            vmsize: 0x8000,
            fileoff: TEXT_FOFF,
            filesize: 0x8000,
            sections: vec![section(
                "__TEXT",
                "__text",
                FOO_BASE + 0x1000,
                0x100,
                layout::S_ATTR_SOME_INSTRUCTIONS,
                0,
                0,
            )],
        },
        SegSpec {
            name: "__DATA",
            vmaddr: DATA_REGION,
            vmsize: 0x10000,
            fileoff: DATA_FOFF,
            filesize: 0x10000,
            sections: vec![section("__DATA", "__data", DATA_REGION, 0x100, 0, 0, 0)],
        },
        SegSpec {
            name: "__LINKEDIT",
            vmaddr: LE_REGION,
            vmsize: 0x4000,
            fileoff: LE_FOFF,
            filesize: 0x4000,
            sections: vec![],
        },
    ];
    write_image(&mut cache, FOO_BASE, layout::CPU_SUBTYPE_ARM64E, &segs, &lcs);
    cache.finish(dir, "dyld_shared_cache_arm64e")
}

/// The full cache: stubs, a `__got`, ObjC metadata, three dependencies and
/// libobjc.
fn full_cache(dir: &Path) -> PathBuf {
    let mut cache = CacheFile::new("dyld_v1  arm64e");
    cache.set_images(&[
        (FOO_BASE, "/usr/lib/libfoo.dylib"),
        (OBJC_BASE, "/usr/lib/libobjc.A.dylib"),
        (BAR_BASE, "/usr/lib/libbar.dylib"),
        (BAZ_BASE, "/usr/lib/libbaz.dylib"),
        (MALLOC_BASE, "/usr/lib/system/libsystem_malloc.dylib"),
    ]);
    cache.write_local_symbols();

    write_libobjc(&mut cache, FOO_BASE);
    write_dep(&mut cache, BAR_BASE, "/usr/lib/libbar.dylib", LE_REGION + 0x4000, &[0, 0]);
    write_dep(&mut cache, BAZ_BASE, "/usr/lib/libbaz.dylib", LE_REGION + 0x5000, &[0, 0]);
    write_dep(
        &mut cache,
        MALLOC_BASE,
        "/usr/lib/system/libsystem_malloc.dylib",
        LE_REGION + 0x6000,
        &export_trie("_malloc", 0x1000),
    );

    // __text: a bl straight into libsystem_malloc's _malloc.
    let bl_imm = ((MALLOC_BASE + 0x1000 - (FOO_BASE + 0x1000)) >> 2) as u32;
    cache.put_vm_u32(FOO_BASE + 0x1000, 0x9400_0000 | bl_imm);
    // strings used by the objc metadata
    cache.put_vm(FOO_BASE + 0x3000, b"Foo\0");
    cache.put_vm(FOO_BASE + 0x3004, b"v16@0:8\0");

    // __stubs: one optimized stub branching to _malloc.
    let stub_addr = FOO_BASE + 0x2000;
    let target = MALLOC_BASE + 0x1000;
    let pages = ((target & !0xfff) - (stub_addr & !0xfff)) >> 12;
    let adrp = 0x9000_0010u32 | (((pages & 3) as u32) << 29) | ((((pages >> 2) & 0x7_ffff) as u32) << 5);
    cache.put_vm_u32(stub_addr, adrp);
    cache.put_vm_u32(stub_addr + 4, 0x9100_0210 | (((target & 0xfff) as u32) << 10));
    cache.put_vm_u32(stub_addr + 8, 0xd61f_0200);

    // __DATA contents.
    cache.put_vm_u64(DATA_REGION, FOO_BASE + 0x1000); // S1-style rebase cell
    cache.put_vm_u64(DATA_REGION + 8, 0); // unnamed __got slot
    cache.put_vm_u32(DATA_REGION + 0x104, layout::OBJC_IMAGE_OPTIMIZED_BY_DYLD); // imageinfo flags
    cache.put_vm_u64(DATA_REGION + 0x110, DATA_REGION + 0x200); // classlist entry

    // class_t
    cache.put_vm_u64(DATA_REGION + 0x200 + 32, DATA_REGION + 0x300); // data
    // class_ro_t
    cache.put_vm_u32(DATA_REGION + 0x300, layout::CLASS_RO_FLAG_ROOT);
    cache.put_vm_u64(DATA_REGION + 0x300 + 24, FOO_BASE + 0x3000); // name
    cache.put_vm_u64(DATA_REGION + 0x300 + 32, DATA_REGION + 0x400); // baseMethods
    // small method list
    cache.put_vm_u32(
        DATA_REGION + 0x400,
        layout::METHOD_LIST_IS_SMALL | layout::METHOD_LIST_SELECTORS_ARE_DIRECT | 12,
    );
    cache.put_vm_u32(DATA_REGION + 0x404, 1); // count
    cache.put_vm_u32(DATA_REGION + 0x408, 5); // name: sel base + 5 -> "init"
    let types_delta = (FOO_BASE + 0x3004) as i64 - (DATA_REGION + 0x40c) as i64;
    cache.put_vm_u32(DATA_REGION + 0x40c, types_delta as i32 as u32);
    cache.put_vm_u32(DATA_REGION + 0x410, 0); // imp

    let mut lcs = vec![
        dylib_lc(layout::LC_ID_DYLIB, "/usr/lib/libfoo.dylib"),
        dylib_lc(layout::LC_LOAD_DYLIB, "/usr/lib/libbar.dylib"),
        dylib_lc(layout::LC_LOAD_DYLIB, "/usr/lib/libbaz.dylib"),
        dylib_lc(layout::LC_LOAD_DYLIB, "/usr/lib/system/libsystem_malloc.dylib"),
    ];
    lcs.extend(foo_linkedit(&mut cache, true));

    let segs = [
        SegSpec {
            name: "__TEXT",
            vmaddr: FOO_BASE,
            vmsize: 0x8000,
            fileoff: TEXT_FOFF,
            filesize: 0x8000,
            sections: vec![
                section(
                    "__TEXT",
                    "__text",
                    FOO_BASE + 0x1000,
                    0x100,
                    layout::S_ATTR_SOME_INSTRUCTIONS,
                    0,
                    0,
                ),
                section(
                    "__TEXT",
                    "__stubs",
                    stub_addr,
                    12,
                    layout::S_SYMBOL_STUBS,
                    0,
                    12,
                ),
            ],
        },
        SegSpec {
            name: "__DATA",
            vmaddr: DATA_REGION,
            vmsize: 0x10000,
            fileoff: DATA_FOFF,
            filesize: 0x10000,
            sections: vec![
                section("__DATA", "__data", DATA_REGION, 8, 0, 0, 0),
                section(
                    "__DATA",
                    "__got",
                    DATA_REGION + 8,
                    8,
                    layout::S_NON_LAZY_SYMBOL_POINTERS,
                    1,
                    0,
                ),
                section("__DATA", "__objc_imageinfo", DATA_REGION + 0x100, 8, 0, 0, 0),
                section("__DATA", "__objc_classlist", DATA_REGION + 0x110, 8, 0, 0, 0),
            ],
        },
        SegSpec {
            name: "__LINKEDIT",
            vmaddr: LE_REGION,
            vmsize: 0x4000,
            fileoff: LE_FOFF,
            filesize: 0x4000,
            sections: vec![],
        },
    ];
    write_image(&mut cache, FOO_BASE, layout::CPU_SUBTYPE_ARM64E, &segs, &lcs);
    cache.finish(dir, "dyld_shared_cache_arm64e")
}

fn extract(cache: &DyldCache, skip: SkipModules) -> dyld_cache_extractor::extract::Extraction {
    let mut accel = Accelerator::new();
    let options = ExtractionOptions {
        skip,
        imbed_version: false,
    };
    extract_image(cache, &mut accel, 0, &options).expect("extraction succeeds")
}

fn output_bytes(extraction: &dyld_cache_extractor::extract::Extraction, dir: &Path) -> Vec<u8> {
    let out = dir.join("out.dylib");
    extraction.write_to_path(&out).unwrap();
    std::fs::read(out).unwrap()
}

/// Walks every chained fixup in the output, returning `(vmaddr, raw)`.
fn walk_chained_fixups(
    extraction: &dyld_cache_extractor::extract::Extraction,
    bytes: &[u8],
) -> Vec<(u64, u64)> {
    let image = &extraction.image;
    let lc = image
        .find_lc(&[layout::LC_DYLD_CHAINED_FIXUPS])
        .expect("chained fixups command");
    let dataoff = image.lc_u32(lc.offset, 8) as usize;
    let read_u32 =
        |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
    let read_u16 =
        |off: usize| u16::from_le_bytes(bytes[off..off + 2].try_into().unwrap());

    let starts = dataoff + read_u32(dataoff + 4) as usize;
    let seg_count = read_u32(starts) as usize;
    assert_eq!(seg_count, image.segments.len());

    let mut fixups = Vec::new();
    for seg_i in 0..seg_count {
        let info_off = read_u32(starts + 4 + seg_i * 4) as usize;
        if info_off == 0 {
            continue;
        }
        let seg_info = starts + info_off;
        let page_size = u64::from(read_u16(seg_info + 4));
        let page_count = read_u16(seg_info + 20) as usize;
        let seg = &image.segments[seg_i];

        for page_i in 0..page_count {
            let start = read_u16(seg_info + 22 + page_i * 2);
            if start == 0xffff {
                continue;
            }
            let mut addr = seg.vmaddr + page_i as u64 * page_size + u64::from(start);
            loop {
                let file_off = (seg.fileoff + (addr - seg.vmaddr)) as usize;
                let raw = u64::from_le_bytes(bytes[file_off..file_off + 8].try_into().unwrap());
                fixups.push((addr, raw));
                let next = (raw >> 51) & 0x7ff;
                if next == 0 {
                    break;
                }
                addr += next * 8;
            }
        }
    }
    fixups
}

#[test]
fn s1_single_rebase_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = minimal_cache(dir.path(), "dyld_v1   arm64");
    let cache = DyldCache::open(&path).unwrap();
    assert_eq!(cache.arch().unwrap(), CacheArch::Arm64);

    let extraction = extract(&cache, SkipModules::empty());
    let bytes = output_bytes(&extraction, dir.path());

    // The data segment holds the slid pointer value.
    let data_seg = extraction.image.segment_index("__DATA").unwrap();
    let data_off = extraction.image.segments[data_seg].fileoff as usize;
    let value = u64::from_le_bytes(bytes[data_off..data_off + 8].try_into().unwrap());
    assert_eq!(value, FOO_BASE + 0x1000);

    // Chained fixups exist with exactly one rebase fixup.
    let fixups = walk_chained_fixups(&extraction, &bytes);
    assert_eq!(fixups.len(), 1);
    let (addr, raw) = fixups[0];
    assert_eq!(addr, DATA_REGION);
    assert_eq!(raw >> 62, 0, "plain rebase carries no bind/auth bits");
}

#[test]
fn s2_skipping_stubs_and_objc_still_extracts() {
    let dir = tempfile::tempdir().unwrap();
    let path = minimal_cache(dir.path(), "dyld_v1   arm64");
    let cache = DyldCache::open(&path).unwrap();

    let skip = SkipModules::STUBS | SkipModules::OBJC;
    assert_eq!(skip.bits(), 12);
    let extraction = extract(&cache, skip);
    let bytes = output_bytes(&extraction, dir.path());

    // Header survives and metadata generation still ran.
    assert_eq!(
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        layout::MH_MAGIC_64
    );
    assert!(extraction
        .image
        .find_lc(&[layout::LC_DYLD_CHAINED_FIXUPS])
        .is_some());
}

#[test]
fn s3_image_listing_honors_case_insensitive_filter() {
    let dir = tempfile::tempdir().unwrap();
    let path = full_cache(dir.path());
    let cache = DyldCache::open(&path).unwrap();

    let all = list_images(&cache, None);
    assert_eq!(all.len(), 5);
    assert_eq!(all[0].1, "/usr/lib/libfoo.dylib");

    let filtered = list_images(&cache, Some("MALLOC"));
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].1, "/usr/lib/system/libsystem_malloc.dylib");
}

#[test]
fn s4_unsupported_architectures_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let mut cache = CacheFile::new("dyld_v1    i386");
    cache.set_images(&[]);
    let path = cache.finish(dir.path(), "dyld_shared_cache_i386");

    let cache = DyldCache::open(&path).unwrap();
    let err = cache.arch().unwrap_err();
    assert_eq!(err.to_string(), "Unsupported Architecture type.");

    let mut bad = CacheFile::new("dyld_v9   arm64");
    bad.set_images(&[]);
    let path = bad.finish(dir.path(), "dyld_shared_cache_unknown");
    let cache = DyldCache::open(&path).unwrap();
    assert_eq!(
        cache.arch().unwrap_err().to_string(),
        "Unrecognized dyld shared cache magic."
    );
}

#[test]
fn s5_small_methods_get_local_selector_references() {
    let dir = tempfile::tempdir().unwrap();
    let path = full_cache(dir.path());
    let cache = DyldCache::open(&path).unwrap();

    let extraction = extract(&cache, SkipModules::empty());
    let bytes = output_bytes(&extraction, dir.path());
    let image = &extraction.image;

    // An extra objc segment was allocated before __LINKEDIT.
    let extra = image.segment_index(layout::SEG_OBJC_EXTRA).expect("extra objc segment");
    let linkedit = image.segment_index("__LINKEDIT").unwrap();
    assert!(extra < linkedit);
    let extra_seg = &image.segments[extra];

    // The method's name offset now resolves through a selref in the extra
    // region.
    let data_seg = image.segment_index("__DATA").unwrap();
    let data_off = image.segments[data_seg].fileoff;
    let name_off = (data_off + 0x408) as usize;
    let name_rel = i32::from_le_bytes(bytes[name_off..name_off + 4].try_into().unwrap());
    let selref_addr = (DATA_REGION + 0x408) as i64 + i64::from(name_rel);
    let selref_addr = selref_addr as u64;
    assert!(
        selref_addr >= extra_seg.vmaddr && selref_addr < extra_seg.vmaddr + extra_seg.vmsize,
        "selref at {selref_addr:#x} lies in the extra region"
    );

    // The selref itself is a tracked pointer (it appears in the chain) and
    // its decoded target is the relocated "init" string.
    let fixups = walk_chained_fixups(&extraction, &bytes);
    let (_, raw) = fixups
        .iter()
        .find(|(addr, _)| *addr == selref_addr)
        .expect("selref has a pointer record");
    let target = (raw & 0x7ff_ffff_ffff) | (((raw >> 43) & 0xff) << 56);
    let target_off = (extra_seg.fileoff + (target - extra_seg.vmaddr)) as usize;
    assert_eq!(&bytes[target_off..target_off + 5], b"init\0");

    // The optimized-by-dyld flag is cleared.
    let flags_off = (data_off + 0x104) as usize;
    let flags = u32::from_le_bytes(bytes[flags_off..flags_off + 4].try_into().unwrap());
    assert_eq!(flags & layout::OBJC_IMAGE_OPTIMIZED_BY_DYLD, 0);
}

#[test]
fn s6_redacted_indirect_entries_are_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = full_cache(dir.path());
    let cache = DyldCache::open(&path).unwrap();

    let extraction = extract(&cache, SkipModules::empty());
    let bytes = output_bytes(&extraction, dir.path());
    let image = &extraction.image;

    let symtab = image.find_lc(&[layout::LC_SYMTAB]).unwrap().clone();
    let dysymtab = image.find_lc(&[layout::LC_DYSYMTAB]).unwrap().clone();
    let symoff = image.lc_u32(symtab.offset, 8) as usize;
    let stroff = image.lc_u32(symtab.offset, 16) as usize;
    let indirectsymoff = image.lc_u32(dysymtab.offset, 56) as usize;
    let nindirect = image.lc_u32(dysymtab.offset, 60) as usize;
    assert_eq!(nindirect, 2);

    // The stub's entry references a freshly created undefined symbol named
    // _malloc with library ordinal 3.
    let entry = u32::from_le_bytes(
        bytes[indirectsymoff..indirectsymoff + 4].try_into().unwrap(),
    ) as usize;
    let nlist_off = symoff + entry * 16;
    let strx =
        u32::from_le_bytes(bytes[nlist_off..nlist_off + 4].try_into().unwrap()) as usize;
    let n_desc = u16::from_le_bytes(bytes[nlist_off + 6..nlist_off + 8].try_into().unwrap());
    let name_end = stroff + strx
        + bytes[stroff + strx..]
            .iter()
            .position(|&b| b == 0)
            .unwrap();
    assert_eq!(&bytes[stroff + strx..name_end], b"_malloc");
    assert_eq!(n_desc >> 8, 3);

    // The stub was rewritten to the normal shape loading through the got.
    let text_seg = image.segment_index("__TEXT").unwrap();
    let stub_off = (image.segments[text_seg].fileoff + 0x2000) as usize;
    let adrp = u32::from_le_bytes(bytes[stub_off..stub_off + 4].try_into().unwrap());
    let ldr = u32::from_le_bytes(bytes[stub_off + 4..stub_off + 8].try_into().unwrap());
    let br = u32::from_le_bytes(bytes[stub_off + 8..stub_off + 12].try_into().unwrap());
    assert_eq!(adrp & 0x9f00_001f, 0x9000_0010);
    assert_eq!(ldr & 0xbfc0_03ff, 0xb940_0210);
    assert_eq!(br, 0xd61f_0200);

    // The claimed got slot became a bind fixup on _malloc.
    let fixups = walk_chained_fixups(&extraction, &bytes);
    let (_, raw) = fixups
        .iter()
        .find(|(addr, _)| *addr == DATA_REGION + 8)
        .expect("got slot has a pointer record");
    assert_eq!((raw >> 62) & 1, 1, "got slot is a bind");

    // The direct branch in __text now goes through the local stub.
    let bl_off = (image.segments[text_seg].fileoff + 0x1000) as usize;
    let bl = u32::from_le_bytes(bytes[bl_off..bl_off + 4].try_into().unwrap());
    assert_eq!(bl, 0x9400_0000 | 0x400);
}

#[test]
fn x86_64_extraction_emits_legacy_rebase_opcodes() {
    let dir = tempfile::tempdir().unwrap();
    let path = minimal_cache(dir.path(), "dyld_v1  x86_64");
    let cache = DyldCache::open(&path).unwrap();
    assert_eq!(cache.arch().unwrap(), CacheArch::X86_64);

    let extraction = extract(&cache, SkipModules::empty());
    let bytes = output_bytes(&extraction, dir.path());
    let image = &extraction.image;

    // The slid pointer is materialized in memory as a plain value.
    let data_seg = image.segment_index("__DATA").unwrap();
    let data_off = image.segments[data_seg].fileoff as usize;
    let value = u64::from_le_bytes(bytes[data_off..data_off + 8].try_into().unwrap());
    assert_eq!(value, FOO_BASE + 0x1000);

    // No chained fixups on this arch; a dyld-info command was inserted with
    // a rebase stream that decodes back to the tracked site.
    assert!(image.find_lc(&[layout::LC_DYLD_CHAINED_FIXUPS]).is_none());
    let di = image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        .expect("dyld info command")
        .clone();
    let rebase_off = image.lc_u32(di.offset, 8) as usize;
    let rebase_size = image.lc_u32(di.offset, 12) as usize;
    assert!(rebase_size > 0);

    let segments: Vec<(u64, u64)> = image
        .segments
        .iter()
        .map(|s| (s.vmaddr, s.vmsize))
        .collect();
    let decoded = dyld_cache_extractor::encoder::opcodes::decode_rebase(
        &bytes[rebase_off..rebase_off + rebase_size],
        &segments,
        8,
    );
    assert_eq!(decoded, vec![DATA_REGION]);
}

#[test]
fn write_plans_are_deterministic_and_non_overlapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = minimal_cache(dir.path(), "dyld_v1   arm64");
    let cache = DyldCache::open(&path).unwrap();

    let first = extract(&cache, SkipModules::empty());
    let second = extract(&cache, SkipModules::empty());
    assert_eq!(first.plan, second.plan);

    let mut last_end = 0u64;
    for chunk in &first.plan {
        assert!(chunk.write_offset >= last_end, "chunks must not overlap");
        last_end = chunk.write_offset + chunk.size;
    }
}

#[test]
fn local_symbols_are_recovered_from_the_side_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = minimal_cache(dir.path(), "dyld_v1   arm64");
    let cache = DyldCache::open(&path).unwrap();

    let extraction = extract(&cache, SkipModules::empty());
    let bytes = output_bytes(&extraction, dir.path());
    let image = &extraction.image;

    let symtab = image.find_lc(&[layout::LC_SYMTAB]).unwrap().clone();
    let stroff = image.lc_u32(symtab.offset, 16) as usize;
    let strsize = image.lc_u32(symtab.offset, 20) as usize;
    let pool = &bytes[stroff..stroff + strsize];
    let has = |needle: &[u8]| pool.windows(needle.len()).any(|w| w == needle);
    assert!(has(b"_local_helper\0"));
    assert!(has(b"_foo\0"));

    let dysymtab = image.find_lc(&[layout::LC_DYSYMTAB]).unwrap().clone();
    assert_eq!(image.lc_u32(dysymtab.offset, 12), 1); // one recovered local
}

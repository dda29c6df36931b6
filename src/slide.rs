//! Slide-info decoding and the pointer tracker.
//!
//! The tracker is the single source of truth for what pointer lives where:
//! slide-info processing seeds it, and the stub, ObjC and encoder passes
//! add, rebind or evict records as they reshape the image.

use std::collections::BTreeMap;

use zerocopy::FromBytes;

use crate::cache::{DyldCache, SubCache};
use crate::errors::TrackerError;
use crate::image::ImageView;
use crate::layout::{
    self, CacheMappingAndSlideInfo, CacheMappingInfo, SlideInfoV1, SlideInfoV2, SlideInfoV3,
    SlideInfoV4, SlidePointer3, OFFSET_OF_MAPPING_WITH_SLIDE,
};
use crate::symbols::SharedSymbols;

/// Pointer-authentication attributes captured from an arm64e v3 cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AuthData {
    pub diversity: u16,
    pub has_addr_div: bool,
    pub key: u8,
}

/// One writable mapping with its slide-info stream.
pub struct SlideMapping<'a> {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub version: u32,
    pub slide: &'a [u8],
    pub sub: &'a SubCache,
}

impl SlideMapping<'_> {
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.address + self.size
    }
}

/// Gathers every writable mapping's slide-info stream across the main cache
/// and sub-caches.
pub fn gather_slide_mappings(cache: &DyldCache) -> Vec<SlideMapping<'_>> {
    let mut mappings = Vec::new();

    if cache.main.header.slide_info_offset_unused != 0 {
        // Legacy case: no sub-caches and a single slide info stream that
        // corresponds to the second mapping.
        let header = &cache.main.header;
        let slide_off = header.slide_info_offset_unused;
        let slide_size = header.slide_info_size_unused as usize;
        let map_off = header.mapping_offset as usize + size_of::<CacheMappingInfo>();
        let Some(map_bytes) = cache
            .main
            .data()
            .get(map_off..map_off + size_of::<CacheMappingInfo>())
        else {
            return mappings;
        };
        let Ok(mapping) = CacheMappingInfo::read_from_bytes(map_bytes) else {
            return mappings;
        };
        if let Some(slide) = cache.main.bytes_at(slide_off, slide_size) {
            mappings.push(SlideMapping {
                address: mapping.address,
                size: mapping.size,
                file_offset: mapping.file_offset,
                version: u32::from_le_bytes(slide[..4].try_into().unwrap()),
                slide,
                sub: &cache.main,
            });
        }
        return mappings;
    }

    if !cache.header_contains(OFFSET_OF_MAPPING_WITH_SLIDE) {
        log::error!("unable to get mapping and slide info");
        return mappings;
    }

    for sub in cache.caches() {
        let header = &sub.header;
        let mut offset = header.mapping_with_slide_offset as usize;
        for _ in 0..header.mapping_with_slide_count {
            let end = offset + size_of::<CacheMappingAndSlideInfo>();
            let Some(bytes) = sub.data().get(offset..end) else {
                break;
            };
            let Ok(info) = CacheMappingAndSlideInfo::read_from_bytes(bytes) else {
                break;
            };
            offset = end;

            if info.slide_info_file_offset == 0 {
                continue;
            }
            let Some(slide) = sub.bytes_at(
                info.slide_info_file_offset,
                info.slide_info_file_size as usize,
            ) else {
                continue;
            };
            mappings.push(SlideMapping {
                address: info.address,
                size: info.size,
                file_offset: info.file_offset,
                version: u32::from_le_bytes(slide[..4].try_into().unwrap()),
                slide,
                sub,
            });
        }
    }

    mappings
}

/// The authoritative map of live pointers within one image.
pub struct PointerTracker<'a> {
    cache: &'a DyldCache,
    ptr_size: u64,
    page_size: u32,
    mappings: Vec<SlideMapping<'a>>,
    pointers: BTreeMap<u64, u64>,
    auths: BTreeMap<u64, AuthData>,
    binds: BTreeMap<u64, SharedSymbols>,
}

impl<'a> PointerTracker<'a> {
    pub fn new(cache: &'a DyldCache, ptr_size: u64) -> Self {
        let mappings = gather_slide_mappings(cache);
        if mappings.is_empty() {
            log::warn!("no slide mappings found");
        }
        let page_size = mappings
            .iter()
            .find_map(|m| match m.version {
                2 => SlideInfoV2::read_from_prefix(m.slide).ok().map(|(i, _)| i.page_size),
                3 => SlideInfoV3::read_from_prefix(m.slide).ok().map(|(i, _)| i.page_size),
                4 => SlideInfoV4::read_from_prefix(m.slide).ok().map(|(i, _)| i.page_size),
                1 => Some(0x1000),
                _ => None,
            })
            .unwrap_or(0x4000);

        PointerTracker {
            cache,
            ptr_size,
            page_size,
            mappings,
            pointers: BTreeMap::new(),
            auths: BTreeMap::new(),
            binds: BTreeMap::new(),
        }
    }

    pub fn pointer_size(&self) -> u64 {
        self.ptr_size
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn pointers(&self) -> &BTreeMap<u64, u64> {
        &self.pointers
    }

    pub fn auths(&self) -> &BTreeMap<u64, AuthData> {
        &self.auths
    }

    pub fn binds(&self) -> &BTreeMap<u64, SharedSymbols> {
        &self.binds
    }

    /// The fully slid value of the pointer stored at `addr`, or 0 when the
    /// address is not covered by any slide mapping.
    pub fn slide(&self, addr: u64) -> u64 {
        for mapping in &self.mappings {
            if !mapping.contains_addr(addr) {
                continue;
            }
            let Some(raw) = self.cache.read_ptr_at(addr, self.ptr_size) else {
                return 0;
            };
            match mapping.version {
                1 => return raw,
                2 => return raw & 0xff_ffff_ffff,
                3 => {
                    let Some(raw64) = self.cache.read_u64_at(addr) else {
                        return 0;
                    };
                    let Ok((info, _)) = SlideInfoV3::read_from_prefix(mapping.slide) else {
                        return 0;
                    };
                    return match SlidePointer3::decode(raw64) {
                        SlidePointer3::Plain { target, .. } => target,
                        SlidePointer3::Auth {
                            offset_from_base, ..
                        } => offset_from_base + info.auth_value_add,
                    };
                }
                4 => {
                    let Ok((info, _)) = SlideInfoV4::read_from_prefix(mapping.slide) else {
                        return 0;
                    };
                    return (raw & !info.delta_mask) + info.value_add;
                }
                v => log::error!("unknown slide info version {v}"),
            }
        }
        0
    }

    /// Records a pointer discovered during slide processing. An existing
    /// record at the site is kept. When `auth_source` lies in a v3 mapping
    /// and its cell is authenticated, the auth attributes are captured.
    pub fn track(&mut self, addr: u64, target: u64, auth_source: Option<u64>) {
        if self.pointers.contains_key(&addr) {
            return;
        }
        self.pointers.insert(addr, target);

        let Some(source) = auth_source else {
            return;
        };
        let in_v3 = self
            .mappings
            .iter()
            .any(|m| m.version == 3 && m.contains_addr(source));
        if !in_v3 {
            return;
        }
        if let Some(raw) = self.cache.read_u64_at(source) {
            if let SlidePointer3::Auth {
                diversity,
                has_addr_div,
                key,
                ..
            } = SlidePointer3::decode(raw)
            {
                self.auths.insert(
                    addr,
                    AuthData {
                        diversity,
                        has_addr_div,
                        key,
                    },
                );
            }
        }
    }

    /// Adds or retargets a pointer record.
    pub fn add(&mut self, addr: u64, target: u64) {
        self.pointers.insert(addr, target);
    }

    /// Adds a pointer record, rejecting a second record at the same site.
    pub fn insert(&mut self, addr: u64, target: u64) -> Result<(), TrackerError> {
        if self.pointers.contains_key(&addr) {
            return Err(TrackerError::DuplicatePointer(addr));
        }
        self.pointers.insert(addr, target);
        Ok(())
    }

    pub fn add_bind(&mut self, addr: u64, info: SharedSymbols) {
        self.binds.insert(addr, info);
    }

    pub fn add_auth(&mut self, addr: u64, auth: AuthData) {
        self.auths.insert(addr, auth);
    }

    pub fn remove(&mut self, addr: u64) {
        self.pointers.remove(&addr);
        self.auths.remove(&addr);
        self.binds.remove(&addr);
    }

    /// Evicts every record whose site lies in `[start, end)`.
    pub fn remove_range(&mut self, start: u64, end: u64) {
        self.pointers.retain(|&a, _| a < start || a >= end);
        self.auths.retain(|&a, _| a < start || a >= end);
        self.binds.retain(|&a, _| a < start || a >= end);
    }

    pub fn copy_auth(&mut self, dst: u64, src: u64) {
        if let Some(&auth) = self.auths.get(&src) {
            self.auths.insert(dst, auth);
        }
    }

    /// Walks every slide mapping, unpacks each pointer whose site lies
    /// within the image's segments, writes the slid value into the image and
    /// records it. Unknown slide-info versions skip their mapping.
    pub fn process_slide_info(&mut self, image: &mut ImageView) {
        let is_64 = image.is_64();
        for mi in 0..self.mappings.len() {
            let version = self.mappings[mi].version;
            match version {
                1 if is_64 => log::error!("unable to handle 64bit V1 slide info"),
                1 => self.process_v1(image, mi),
                2 => self.process_v2(image, mi),
                3 if !is_64 => log::error!("unable to handle 32bit V3 slide info"),
                3 => self.process_v3(image, mi),
                4 if is_64 => log::error!("unable to handle 64bit V4 slide info"),
                4 => self.process_v4(image, mi),
                v => log::error!("unknown slide info version {v}, skipping mapping"),
            }
        }
    }

    /// Page indices of the mapping covered by a segment.
    fn page_range(map_addr: u64, map_size: u64, page_size: u64, seg: (u64, u64)) -> (u64, u64) {
        let (seg_addr, seg_size) = seg;
        let start = (seg_addr - map_addr) / page_size;
        let end = layout::align(seg_addr + seg_size - map_addr, page_size) / page_size;
        (start, end.min(layout::align(map_size, page_size) / page_size))
    }

    fn segments_in_mapping(&self, image: &ImageView, mi: usize) -> Vec<(u64, u64)> {
        let mapping = &self.mappings[mi];
        image
            .segments
            .iter()
            .filter(|s| mapping.contains_addr(s.vmaddr))
            .map(|s| (s.vmaddr, s.vmsize))
            .collect()
    }

    fn process_v1(&mut self, image: &mut ImageView, mi: usize) {
        let mapping = &self.mappings[mi];
        let Ok((info, _)) = SlideInfoV1::read_from_prefix(mapping.slide) else {
            return;
        };
        let map_addr = mapping.address;
        let toc_off = info.toc_offset as usize;
        let entries_off = info.entries_offset as usize;
        let entries_size = info.entries_size as usize;
        let slide = mapping.slide;

        let toc_entry = |i: usize| -> u16 {
            let off = toc_off + i * 2;
            slide
                .get(off..off + 2)
                .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0)
        };
        let entry_bytes: Vec<(u64, Vec<u8>)> = {
            let mut pages = Vec::new();
            for seg in self.segments_in_mapping(image, mi) {
                let (start, end) = Self::page_range(map_addr, self.mappings[mi].size, 4096, seg);
                for page_i in start..end {
                    let entry_i = toc_entry(page_i as usize) as usize;
                    let off = entries_off + entry_i * entries_size;
                    if let Some(bitmap) = slide.get(off..off + entries_size) {
                        pages.push((map_addr + page_i * 4096, bitmap.to_vec()));
                    }
                }
            }
            pages
        };

        for (page_addr, bitmap) in entry_bytes {
            for (byte_i, &byte) in bitmap.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                for bit_i in 0..8 {
                    if byte & (1 << bit_i) == 0 {
                        continue;
                    }
                    let site = page_addr + (byte_i as u64 * 8 + bit_i as u64) * 4;
                    if !image.contains_addr(site) {
                        continue;
                    }
                    // v1 stores the value in place already.
                    if let Ok(value) = image.read_u32(site) {
                        self.track(site, u64::from(value), None);
                    }
                }
            }
        }
    }

    fn process_v2(&mut self, image: &mut ImageView, mi: usize) {
        let mapping = &self.mappings[mi];
        let Ok((info, _)) = SlideInfoV2::read_from_prefix(mapping.slide) else {
            return;
        };
        let map_addr = mapping.address;
        let map_size = mapping.size;
        let page_size = u64::from(info.page_size);
        let slide = mapping.slide;

        let delta_mask = info.delta_mask;
        let delta_shift = delta_mask.trailing_zeros() - 2;
        let value_mask = !delta_mask;
        let value_add = info.value_add;

        let read_u16 = |off: usize| -> u16 {
            slide
                .get(off..off + 2)
                .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0)
        };

        let mut starts = Vec::new();
        for seg in self.segments_in_mapping(image, mi) {
            let (start, end) = Self::page_range(map_addr, map_size, page_size, seg);
            for page_i in start..end {
                let page = read_u16(info.page_starts_offset as usize + page_i as usize * 2);
                let page_addr = map_addr + page_i * page_size;

                if page == layout::DYLD_CACHE_SLIDE_PAGE_ATTR_NO_REBASE {
                    continue;
                } else if page & layout::DYLD_CACHE_SLIDE_PAGE_ATTR_EXTRA != 0 {
                    let mut chain_i = (page & 0x3fff) as usize;
                    loop {
                        let extra = read_u16(info.page_extras_offset as usize + chain_i * 2);
                        starts.push((page_addr, u64::from(extra & 0x3fff) * 4));
                        if extra & layout::DYLD_CACHE_SLIDE_PAGE_ATTR_END != 0 {
                            break;
                        }
                        chain_i += 1;
                    }
                } else {
                    // Plain page starts are 32-bit jumps.
                    starts.push((page_addr, u64::from(page) * 4));
                }
            }
        }

        for (page_addr, start_off) in starts {
            let mut offset = start_off;
            loop {
                let site = page_addr + offset;
                let Some(raw) = self.cache.read_ptr_at(site, self.ptr_size) else {
                    break;
                };
                let delta = (raw & delta_mask) >> delta_shift;
                let mut value = raw & value_mask;
                if value != 0 {
                    value += value_add;
                }
                if image.contains_addr(site) {
                    let _ = image.write_ptr(site, value);
                    self.track(site, value, None);
                }
                if delta == 0 {
                    break;
                }
                offset += delta;
            }
        }
    }

    fn process_v3(&mut self, image: &mut ImageView, mi: usize) {
        let mapping = &self.mappings[mi];
        let Ok((info, _)) = SlideInfoV3::read_from_prefix(mapping.slide) else {
            return;
        };
        let map_addr = mapping.address;
        let map_size = mapping.size;
        let page_size = u64::from(info.page_size);
        let slide = mapping.slide;
        let auth_value_add = info.auth_value_add;

        let mut starts = Vec::new();
        for seg in self.segments_in_mapping(image, mi) {
            let (start, end) = Self::page_range(map_addr, map_size, page_size, seg);
            for page_i in start..end {
                let off = size_of::<SlideInfoV3>() + page_i as usize * 2;
                let page = slide
                    .get(off..off + 2)
                    .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                    .unwrap_or(layout::DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE);
                if page == layout::DYLD_CACHE_SLIDE_V3_PAGE_ATTR_NO_REBASE {
                    continue;
                }
                starts.push((map_addr + page_i * page_size, u64::from(page)));
            }
        }

        for (page_addr, first) in starts {
            let mut delta = first;
            let mut site = page_addr;
            loop {
                site += delta * 8;
                let Some(raw) = self.cache.read_u64_at(site) else {
                    break;
                };
                let cell = SlidePointer3::decode(raw);
                delta = u64::from(cell.next());
                let value = match cell {
                    SlidePointer3::Plain { target, .. } => target,
                    SlidePointer3::Auth {
                        offset_from_base, ..
                    } => offset_from_base + auth_value_add,
                };
                if image.contains_addr(site) {
                    let _ = image.write_u64(site, value);
                    self.track(site, value, Some(site));
                }
                if delta == 0 {
                    break;
                }
            }
        }
    }

    fn process_v4(&mut self, image: &mut ImageView, mi: usize) {
        let mapping = &self.mappings[mi];
        let Ok((info, _)) = SlideInfoV4::read_from_prefix(mapping.slide) else {
            return;
        };
        let map_addr = mapping.address;
        let map_size = mapping.size;
        let page_size = u64::from(info.page_size);
        let slide = mapping.slide;

        let delta_mask = info.delta_mask;
        let delta_shift = delta_mask.trailing_zeros() - 2;
        let value_mask = !(delta_mask as u32);
        let value_add = info.value_add as u32;

        let read_u16 = |off: usize| -> u16 {
            slide
                .get(off..off + 2)
                .map(|b| u16::from_le_bytes(b.try_into().unwrap()))
                .unwrap_or(0)
        };

        let mut starts = Vec::new();
        for seg in self.segments_in_mapping(image, mi) {
            let (start, end) = Self::page_range(map_addr, map_size, page_size, seg);
            for page_i in start..end {
                let page = read_u16(info.page_starts_offset as usize + page_i as usize * 2);
                let page_addr = map_addr + page_i * page_size;
                if page == layout::DYLD_CACHE_SLIDE4_PAGE_NO_REBASE {
                    continue;
                } else if page & layout::DYLD_CACHE_SLIDE4_PAGE_USE_EXTRA != 0 {
                    let mut extra_i = (page & layout::DYLD_CACHE_SLIDE4_PAGE_INDEX) as usize;
                    loop {
                        let extra = read_u16(info.page_extras_offset as usize + extra_i * 2);
                        starts.push((
                            page_addr,
                            u64::from(extra & layout::DYLD_CACHE_SLIDE4_PAGE_INDEX) * 4,
                        ));
                        if extra & layout::DYLD_CACHE_SLIDE4_PAGE_EXTRA_END != 0 {
                            break;
                        }
                        extra_i += 1;
                    }
                } else {
                    starts.push((page_addr, u64::from(page) * 4));
                }
            }
        }

        for (page_addr, start_off) in starts {
            let mut offset = start_off;
            let mut delta = 1u64;
            while delta != 0 {
                let site = page_addr + offset;
                let Some(raw) = self.cache.read_u32_at(site) else {
                    break;
                };
                delta = (u64::from(raw) & delta_mask) >> delta_shift;
                let mut value = raw & value_mask;
                let mut is_pointer = false;
                if value & 0xffff_8000 == 0 {
                    // small positive non-pointer, use as-is
                } else if value & 0x3fff_8000 == 0x3fff_8000 {
                    // small negative non-pointer
                    value |= 0xc000_0000;
                } else {
                    value = value.wrapping_add(value_add);
                    is_pointer = true;
                }
                if image.contains_addr(site) {
                    let _ = image.write_u32(site, value);
                    if is_pointer {
                        self.track(site, u64::from(value), None);
                    }
                }
                offset += delta;
            }
        }
    }
}

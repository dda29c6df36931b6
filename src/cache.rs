//! Memory-mapped view of a dyld shared cache and its sub-caches.

use std::ffi::CStr;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use zerocopy::FromBytes;

use crate::errors::CacheError;
use crate::layout::{
    CacheHeader, CacheImageInfo, CacheMappingInfo, OFFSET_OF_IMAGES_OFFSET,
};

/// Architecture of a cache, taken from the 16-byte `dyld_v1<arch>` magic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheArch {
    X86_64,
    Arm,
    Arm64,
    Arm64_32,
}

impl CacheArch {
    pub fn from_magic(magic: &[u8; 16]) -> Result<Self, CacheError> {
        let magic = CStr::from_bytes_until_nul(magic)
            .map(|s| s.to_bytes())
            .unwrap_or(&magic[..]);
        match magic {
            b"dyld_v1  x86_64" | b"dyld_v1 x86_64h" => Ok(CacheArch::X86_64),
            b"dyld_v1   arm64" | b"dyld_v1  arm64e" => Ok(CacheArch::Arm64),
            b"dyld_v1arm64_32" => Ok(CacheArch::Arm64_32),
            b"dyld_v1    i386" | b"dyld_v1   armv5" | b"dyld_v1   armv6" => {
                Err(CacheError::UnsupportedArchitecture)
            }
            m if m.starts_with(b"dyld_v1  armv7") || m.starts_with(b"dyld_v1   armv7") => {
                Ok(CacheArch::Arm)
            }
            _ => Err(CacheError::UnrecognizedMagic),
        }
    }

    pub fn pointer_size(self) -> u64 {
        match self {
            CacheArch::X86_64 | CacheArch::Arm64 => 8,
            CacheArch::Arm | CacheArch::Arm64_32 => 4,
        }
    }

    pub fn is_64(self) -> bool {
        self.pointer_size() == 8
    }

    /// The shared cache never needs stub reversal on x86_64.
    pub fn has_stub_fixer(self) -> bool {
        !matches!(self, CacheArch::X86_64)
    }
}

/// One mapped cache file: the main cache or a sub-cache.
pub struct SubCache {
    pub path: PathBuf,
    map: Mmap,
    pub header: CacheHeader,
    pub mappings: Vec<CacheMappingInfo>,
}

impl SubCache {
    fn open(path: &Path) -> Result<Self, CacheError> {
        let file = File::open(path)?;
        // SAFETY: the cache files are treated as immutable for the lifetime
        // of the extraction, matching how dyld itself maps them.
        let map = unsafe { Mmap::map(&file)? };

        if map.len() < size_of::<CacheHeader>() {
            return Err(CacheError::FileTooSmall);
        }
        if &map[..4] != b"dyld" {
            return Err(CacheError::BadMagic);
        }

        let (header, _) =
            CacheHeader::read_from_prefix(&map[..]).map_err(|_| CacheError::FileTooSmall)?;

        let mut mappings = Vec::with_capacity(header.mapping_count as usize);
        let mut offset = header.mapping_offset as usize;
        for _ in 0..header.mapping_count {
            let end = offset + size_of::<CacheMappingInfo>();
            let info = CacheMappingInfo::read_from_bytes(
                map.get(offset..end).ok_or(CacheError::FileTooSmall)?,
            )
            .map_err(|_| CacheError::FileTooSmall)?;
            mappings.push(info);
            offset = end;
        }

        Ok(SubCache {
            path: path.to_owned(),
            map,
            header,
            mappings,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    /// Converts a vmaddr to a file offset within this cache file only.
    pub fn convert_addr(&self, addr: u64) -> Option<u64> {
        self.mappings
            .iter()
            .find(|m| addr >= m.address && addr < m.address + m.size)
            .map(|m| (addr - m.address) + m.file_offset)
    }

    pub fn bytes_at(&self, file_offset: u64, len: usize) -> Option<&[u8]> {
        let start = usize::try_from(file_offset).ok()?;
        self.map.get(start..start.checked_add(len)?)
    }
}

/// The whole shared cache: the main file plus every sibling sub-cache.
pub struct DyldCache {
    pub main: SubCache,
    pub subcaches: Vec<SubCache>,
    pub images: Vec<CacheImageInfo>,
}

impl DyldCache {
    /// Opens a main cache file, or a directory containing one. In a
    /// directory the extensionless file is taken as the main cache and every
    /// sibling that is not a `.map` artifact as a sub-cache.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        if !path.exists() {
            return Err(CacheError::PathDoesNotExist);
        }

        let mut main_path = None;
        let mut sub_paths = Vec::new();
        if path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry_path = entry?.path();
                if entry_path.is_dir() {
                    continue;
                }
                match entry_path.extension() {
                    None => main_path = Some(entry_path),
                    Some(ext) if ext != "map" => sub_paths.push(entry_path),
                    Some(_) => {}
                }
            }
            sub_paths.sort();
        } else {
            // A plain file is assumed to be a main cache without sub-caches.
            main_path = Some(path.to_owned());
        }

        let main = SubCache::open(&main_path.ok_or(CacheError::NoMainCache)?)?;
        let subcaches = sub_paths
            .iter()
            .map(|p| SubCache::open(p))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cache = DyldCache {
            main,
            subcaches,
            images: Vec::new(),
        };
        cache.images = cache.read_image_table()?;
        Ok(cache)
    }

    fn read_image_table(&self) -> Result<Vec<CacheImageInfo>, CacheError> {
        let header = &self.main.header;
        let uses_newer_images = self.header_contains(OFFSET_OF_IMAGES_OFFSET);
        let (offset, count) = if uses_newer_images {
            (header.images_offset, header.images_count)
        } else {
            (header.images_offset_old, header.images_count_old)
        };

        let mut images = Vec::with_capacity(count as usize);
        let mut pos = offset as usize;
        for _ in 0..count {
            let end = pos + size_of::<CacheImageInfo>();
            let info = CacheImageInfo::read_from_bytes(
                self.main.map.get(pos..end).ok_or(CacheError::FileTooSmall)?,
            )
            .map_err(|_| CacheError::FileTooSmall)?;
            images.push(info);
            pos = end;
        }
        Ok(images)
    }

    pub fn arch(&self) -> Result<CacheArch, CacheError> {
        CacheArch::from_magic(&self.main.header.magic)
    }

    /// Whether the header field at `member_offset` is present in this cache.
    /// The mapping table directly follows the header, so its offset is the
    /// cutoff point.
    pub fn header_contains(&self, member_offset: u32) -> bool {
        member_offset < self.main.header.mapping_offset
    }

    pub fn caches(&self) -> impl Iterator<Item = &SubCache> {
        std::iter::once(&self.main).chain(self.subcaches.iter())
    }

    /// Converts a vmaddr to its file offset. Every mapping of every
    /// sub-cache is tried; an address matched in one sub-cache is never
    /// matched in another.
    pub fn convert_addr(&self, addr: u64) -> Option<(u64, &SubCache)> {
        self.caches()
            .find_map(|c| c.convert_addr(addr).map(|off| (off, c)))
    }

    /// Reads `len` bytes at a vmaddr, the slice-returning equivalent of the
    /// pointer conversion.
    pub fn read_at(&self, addr: u64, len: usize) -> Option<&[u8]> {
        let (offset, sub) = self.convert_addr(addr)?;
        sub.bytes_at(offset, len)
    }

    pub fn read_u32_at(&self, addr: u64) -> Option<u32> {
        self.read_at(addr, 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64_at(&self, addr: u64) -> Option<u64> {
        self.read_at(addr, 8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Reads a pointer-sized little-endian value at a vmaddr.
    pub fn read_ptr_at(&self, addr: u64, ptr_size: u64) -> Option<u64> {
        if ptr_size == 8 {
            self.read_u64_at(addr)
        } else {
            self.read_u32_at(addr).map(u64::from)
        }
    }

    /// Reads the NUL-terminated string at a vmaddr.
    pub fn read_cstr_at(&self, addr: u64) -> Option<&str> {
        let (offset, sub) = self.convert_addr(addr)?;
        let tail = &sub.map[usize::try_from(offset).ok()?..];
        CStr::from_bytes_until_nul(tail).ok()?.to_str().ok()
    }

    /// The install path of an image, read from the cache's path pool.
    pub fn image_path(&self, image: &CacheImageInfo) -> &str {
        let start = image.path_file_offset as usize;
        self.main
            .map
            .get(start..)
            .and_then(|tail| CStr::from_bytes_until_nul(tail).ok())
            .and_then(|s| s.to_str().ok())
            .unwrap_or("")
    }

    /// The cache file holding the stripped local symbols, identified by the
    /// main header's `symbol_file_uuid`. Falls back to the main cache for
    /// monolithic caches.
    pub fn symbols_cache(&self) -> Option<&SubCache> {
        if self.subcaches.is_empty() {
            return Some(&self.main);
        }
        self.subcaches
            .iter()
            .find(|c| c.header.uuid == self.main.header.symbol_file_uuid)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arch_from_magic() {
        let magic = |s: &str| {
            let mut m = [0u8; 16];
            m[..s.len()].copy_from_slice(s.as_bytes());
            m
        };

        assert_eq!(
            CacheArch::from_magic(&magic("dyld_v1   arm64")).unwrap(),
            CacheArch::Arm64
        );
        assert_eq!(
            CacheArch::from_magic(&magic("dyld_v1  arm64e")).unwrap(),
            CacheArch::Arm64
        );
        assert_eq!(
            CacheArch::from_magic(&magic("dyld_v1  x86_64")).unwrap(),
            CacheArch::X86_64
        );
        // armv7 magics carry the subtype suffix directly
        assert_eq!(
            CacheArch::from_magic(&magic("dyld_v1  armv7s")).unwrap(),
            CacheArch::Arm
        );
        assert_eq!(
            CacheArch::from_magic(&magic("dyld_v1   armv7")).unwrap(),
            CacheArch::Arm
        );
        assert!(matches!(
            CacheArch::from_magic(&magic("dyld_v1    i386")),
            Err(CacheError::UnsupportedArchitecture)
        ));
        assert!(matches!(
            CacheArch::from_magic(&magic("dyld_v2   arm64")),
            Err(CacheError::UnrecognizedMagic)
        ));
    }
}

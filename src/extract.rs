//! The extraction context and pipeline: slide-info processing, linkedit
//! optimization, stub fixing, ObjC fixing, metadata generation and offset
//! optimization, in that order, best-effort past recoverable failures.

use std::path::Path;

use bitflags::bitflags;

use crate::accelerator::Accelerator;
use crate::bind_info::BindInfo;
use crate::cache::DyldCache;
use crate::encoder;
use crate::errors::ExtractError;
use crate::image::ImageView;
use crate::layout::{self, DyldInfoCommand};
use crate::linkedit::optimizer::optimize_linkedit;
use crate::linkedit::symtab::SymbolTableTracker;
use crate::linkedit::LinkeditTracker;
use crate::objc;
use crate::offsets::{optimize_offsets, write_image, WriteChunk};
use crate::slide::PointerTracker;
use crate::stubs;
use crate::symbols::Symbolizer;

bitflags! {
    /// Development switches to skip pipeline passes. Most passes depend on
    /// their predecessors, so use with caution.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SkipModules: u32 {
        const SLIDE_INFO = 1;
        const LINKEDIT = 2;
        const STUBS = 4;
        const OBJC = 8;
        const METADATA = 16;
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExtractionOptions {
    pub skip: SkipModules,
    /// Write a build-identifier word into the 64-bit header's reserved
    /// field.
    pub imbed_version: bool,
}

/// The result of one extraction: the rewritten image and the plan to write
/// it out with.
pub struct Extraction {
    pub image: ImageView,
    pub plan: Vec<WriteChunk>,
}

impl Extraction {
    pub fn write_to_path(&self, path: &Path) -> Result<(), ExtractError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::File::create(path)?;
        write_image(&self.image, &self.plan, &mut file)?;
        Ok(())
    }
}

/// A version word for the header's reserved field, from the crate version.
pub fn version_word() -> u32 {
    let mut parts = env!("CARGO_PKG_VERSION")
        .split('.')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let patch = parts.next().unwrap_or(0);
    (major << 16) | (minor << 8) | patch
}

/// Runs the whole reversal pipeline over one image of the cache.
pub fn extract_image(
    cache: &DyldCache,
    accel: &mut Accelerator,
    image_index: usize,
    options: &ExtractionOptions,
) -> Result<Extraction, ExtractError> {
    let info = &cache.images[image_index];
    let mut image = ImageView::parse(cache, info)?;
    let mut ptr_tracker = PointerTracker::new(cache, image.pointer_size());

    if !options.skip.contains(SkipModules::SLIDE_INFO) {
        ptr_tracker.process_slide_info(&mut image);
    }

    // The original bind opcode streams, read before the linkedit moves.
    let bind_info = read_bind_info(cache, &image);

    let mut le_tracker: Option<LinkeditTracker> = None;
    let mut st_tracker: Option<SymbolTableTracker> = None;
    let mut symbolizer: Option<Symbolizer> = None;

    if !options.skip.contains(SkipModules::LINKEDIT) {
        match optimize_linkedit(cache, &mut image) {
            Ok(optimized) => {
                symbolizer = Some(Symbolizer::enumerate(
                    cache,
                    &image,
                    &optimized.symbols,
                    accel,
                ));
                le_tracker = Some(optimized.tracker);
                st_tracker = Some(optimized.symbols);
            }
            Err(err) => log::error!("linkedit optimization failed: {err}"),
        }
    }

    if !options.skip.contains(SkipModules::STUBS) {
        match (&mut le_tracker, &mut st_tracker, &symbolizer) {
            (Some(_), Some(st), Some(sym)) => {
                if let Err(err) =
                    stubs::fix_stubs(cache, accel, &mut image, &mut ptr_tracker, st, sym, &bind_info)
                {
                    log::error!("stub fixing failed: {err}");
                }
            }
            _ => log::error!("the stub fixer depends on the linkedit optimizer"),
        }
    }

    if !options.skip.contains(SkipModules::OBJC) {
        match (&mut le_tracker, &mut st_tracker, &symbolizer) {
            (Some(le), Some(st), Some(sym)) => {
                if let Err(err) =
                    objc::fix_objc(cache, &mut image, &mut ptr_tracker, sym, st, le, &bind_info)
                {
                    log::error!("objc fixing failed: {err}");
                }
            }
            _ => log::error!("the objc fixer depends on the linkedit optimizer"),
        }
    }

    if !options.skip.contains(SkipModules::METADATA) {
        match (&mut le_tracker, &mut st_tracker) {
            (Some(le), Some(st)) => {
                encoder::generate_metadata(&mut image, &mut ptr_tracker, le, st, &bind_info)?;
            }
            _ => log::error!("the metadata generator depends on the linkedit optimizer"),
        }
    }

    if options.imbed_version {
        if image.is_64() {
            image.set_header_u32(28, version_word());
        } else {
            log::error!("unable to imbed version info in a non 64 bit image");
        }
    }

    let plan = optimize_offsets(&mut image)?;
    Ok(Extraction { image, plan })
}

/// Parses the image's regular, weak and lazy bind streams from their
/// original location in the cache.
fn read_bind_info(cache: &DyldCache, image: &ImageView) -> BindInfo {
    let segments: Vec<(u64, u64)> = image
        .segments
        .iter()
        .map(|s| (s.vmaddr, s.vmsize))
        .collect();

    let Some(di_lc) = image.find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO]) else {
        return BindInfo::default();
    };
    let Ok(di) = image.lc_struct::<DyldInfoCommand>(di_lc.offset) else {
        return BindInfo::default();
    };
    let Some(le_seg) = image.segments.iter().find(|s| s.name == layout::SEG_LINKEDIT) else {
        return BindInfo::default();
    };
    let Some((_, le_sub)) = cache.convert_addr(le_seg.vmaddr) else {
        return BindInfo::default();
    };

    let blob = |off: u32, size: u32| -> Vec<u8> {
        le_sub
            .bytes_at(u64::from(off), size as usize)
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    };

    BindInfo::parse(
        &blob(di.bind_off, di.bind_size),
        &blob(di.weak_bind_off, di.weak_bind_size),
        &blob(di.lazy_bind_off, di.lazy_bind_size),
        &segments,
        image.pointer_size(),
    )
}

/// Images matching an optional case-insensitive path filter, in image-table
/// order.
pub fn list_images(cache: &DyldCache, filter: Option<&str>) -> Vec<(usize, String)> {
    let filter = filter.map(str::to_lowercase);
    cache
        .images
        .iter()
        .enumerate()
        .filter_map(|(i, info)| {
            let path = cache.image_path(info);
            match &filter {
                Some(f) if !path.to_lowercase().contains(f) => None,
                _ => Some((i, path.to_owned())),
            }
        })
        .collect()
}

/// Selects the first image whose install path contains `partial_path`.
pub fn find_image(cache: &DyldCache, partial_path: &str) -> Result<usize, ExtractError> {
    list_images(cache, Some(partial_path))
        .first()
        .map(|(i, _)| *i)
        .ok_or_else(|| ExtractError::ImageNotFound(partial_path.to_owned()))
}

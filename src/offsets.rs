//! The offset optimizer: re-pages every segment's file offset, rewrites the
//! linkedit-referencing load-command offsets, and produces the
//! scatter-gather plan the output file is written from.

use std::io::{Seek, SeekFrom, Write};

use crate::errors::ExtractError;
use crate::image::ImageView;
use crate::layout::{self, SEG_LINKEDIT};

/// One write of a segment's contents into the output file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteChunk {
    pub write_offset: u64,
    pub segment: usize,
    pub size: u64,
}

/// Assigns each segment a new file offset at the current data head, shifts
/// its sections along, and rewrites every linkedit-referencing offset when
/// the linkedit segment moves. The data head is 16 KiB aligned between
/// segments.
pub fn optimize_offsets(image: &mut ImageView) -> Result<Vec<WriteChunk>, ExtractError> {
    let mut plan = Vec::with_capacity(image.segments.len());
    let mut data_head: u64 = 0;

    for seg_i in 0..image.segments.len() {
        let fileoff = image.segments[seg_i].fileoff;
        let filesize = image.segments[seg_i].filesize;
        if fileoff > u64::from(u32::MAX) || filesize > u64::from(u32::MAX) {
            return Err(ExtractError::MalformedSegment);
        }

        plan.push(WriteChunk {
            write_offset: data_head,
            segment: seg_i,
            size: filesize,
        });

        let shift_delta = data_head as i64 - fileoff as i64;
        image.set_segment_fileoff(seg_i, data_head);
        for sect_i in 0..image.segments[seg_i].sections.len() {
            let offset = image.segments[seg_i].sections[sect_i].offset;
            if offset != 0 {
                let shifted = (i64::from(offset) + shift_delta) as u32;
                image.set_section_offset(seg_i, sect_i, shifted);
            }
        }

        if image.segments[seg_i].name == SEG_LINKEDIT {
            shift_linkedit_offsets(image, shift_delta);
        }

        data_head += filesize;
        data_head = layout::align(data_head, layout::PAGE_SIZE);
    }

    Ok(plan)
}

/// Applies `delta` to every load-command field holding a linkedit file
/// offset; zero fields mean "absent" and stay zero.
fn shift_linkedit_offsets(image: &mut ImageView, delta: i64) {
    let shift = |image: &mut ImageView, lc_offset: usize, field: usize| {
        let value = image.lc_u32(lc_offset, field);
        if value != 0 {
            image.set_lc_u32(lc_offset, field, (i64::from(value) + delta) as u32);
        }
    };

    for lc in image.all_lcs(&[
        layout::LC_DYLD_EXPORTS_TRIE,
        layout::LC_FUNCTION_STARTS,
        layout::LC_DATA_IN_CODE,
        layout::LC_CODE_SIGNATURE,
        layout::LC_SEGMENT_SPLIT_INFO,
        layout::LC_DYLIB_CODE_SIGN_DRS,
        layout::LC_LINKER_OPTIMIZATION_HINT,
        layout::LC_DYLD_CHAINED_FIXUPS,
    ]) {
        shift(image, lc.offset, 8); // linkedit_data_command.dataoff
    }

    if let Some(lc) = image
        .find_lc(&[layout::LC_DYLD_INFO_ONLY, layout::LC_DYLD_INFO])
        .cloned()
    {
        for field in [8, 16, 24, 32, 40] {
            shift(image, lc.offset, field);
        }
    }

    if let Some(lc) = image.find_lc(&[layout::LC_SYMTAB]).cloned() {
        shift(image, lc.offset, 8); // symoff
        shift(image, lc.offset, 16); // stroff
    }

    if let Some(lc) = image.find_lc(&[layout::LC_DYSYMTAB]).cloned() {
        for field in [32, 40, 48, 56, 64, 72] {
            // tocoff, modtaboff, extrefsymoff, indirectsymoff, extreloff,
            // locreloff
            shift(image, lc.offset, field);
        }
    }
}

/// Executes a write plan against an output stream.
pub fn write_image(
    image: &ImageView,
    plan: &[WriteChunk],
    out: &mut (impl Write + Seek),
) -> std::io::Result<()> {
    for chunk in plan {
        out.seek(SeekFrom::Start(chunk.write_offset))?;
        let data = &image.segments[chunk.segment].data;
        let end = (chunk.size as usize).min(data.len());
        out.write_all(&data[..end])?;
        if end < chunk.size as usize {
            // Segment data shorter than its declared filesize pads with
            // zeros.
            out.write_all(&vec![0u8; chunk.size as usize - end])?;
        }
    }
    Ok(())
}

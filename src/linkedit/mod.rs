//! The linkedit tracker: owns the rebuilt `__LINKEDIT` byte range and the
//! load-command area, and keeps every referencing load-command offset in
//! sync as data is inserted, resized or removed.

pub mod optimizer;
pub mod symtab;

use crate::errors::TrackerError;
use crate::image::ImageView;
use crate::layout::{self, SEG_LINKEDIT};

/// What kind of linkedit data a tracked region holds, which also determines
/// the load-command field that carries its file offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    Rebase,
    Bind,
    WeakBind,
    LazyBind,
    ExportTrie,
    /// An `LC_DYLD_EXPORTS_TRIE` blob, not folded into dyld-info yet.
    DetachedExportTrie,
    SymbolEntries,
    StringPool,
    IndirectSymtab,
    FunctionStarts,
    DataInCode,
    ChainedFixups,
}

impl Tag {
    /// Byte offset of the data-offset field within the owning load command.
    pub fn lc_field_offset(self) -> usize {
        match self {
            Tag::Rebase => 8,             // dyld_info_command.rebase_off
            Tag::Bind => 16,              // dyld_info_command.bind_off
            Tag::WeakBind => 24,          // dyld_info_command.weak_bind_off
            Tag::LazyBind => 32,          // dyld_info_command.lazy_bind_off
            Tag::ExportTrie => 40,        // dyld_info_command.export_off
            Tag::SymbolEntries => 8,      // symtab_command.symoff
            Tag::StringPool => 16,        // symtab_command.stroff
            Tag::IndirectSymtab => 56,    // dysymtab_command.indirectsymoff
            Tag::DetachedExportTrie | Tag::FunctionStarts | Tag::DataInCode | Tag::ChainedFixups => {
                8 // linkedit_data_command.dataoff
            }
        }
    }
}

/// Where a tracked region's offset field lives: a load command identified by
/// its offset in the header buffer, plus a field offset inside it.
#[derive(Clone, Copy, Debug)]
pub struct OffsetField {
    pub lc_offset: usize,
    pub field_offset: usize,
}

impl OffsetField {
    pub fn new(lc_offset: usize, tag: Tag) -> Self {
        OffsetField {
            lc_offset,
            field_offset: tag.lc_field_offset(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackedData {
    pub tag: Tag,
    /// Offset of the data within the linkedit region.
    pub offset: u64,
    pub size: u32,
    pub field: OffsetField,
}

impl TrackedData {
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

pub struct LinkeditTracker {
    records: Vec<TrackedData>,
    capacity: u64,
    ptr_size: u64,
}

impl LinkeditTracker {
    /// Creates a tracker over an already-populated linkedit region. The
    /// records must be pointer aligned, contiguous from the region start and
    /// within `capacity`; their offset fields are rewritten to match.
    pub fn new(
        image: &mut ImageView,
        capacity: u64,
        records: Vec<TrackedData>,
    ) -> Result<Self, TrackerError> {
        let ptr_size = image.pointer_size();
        let mut expected = 0u64;
        for rec in &records {
            if rec.size == 0 {
                return Err(TrackerError::ZeroSizedData);
            }
            if u64::from(rec.size) % ptr_size != 0 {
                return Err(TrackerError::UnalignedData);
            }
            if rec.offset != expected {
                return Err(TrackerError::DiscontinuousData);
            }
            if rec.end() > capacity {
                return Err(TrackerError::DataOutsideLinkedit);
            }
            check_field(image, rec.field)?;
            expected = rec.end();
        }

        let tracker = LinkeditTracker {
            records,
            capacity,
            ptr_size,
        };

        // Grow the backing buffer to the full region and sync offsets in
        // case they're out of date.
        let seg = linkedit_index(image)?;
        image.segments[seg].data.resize(capacity as usize, 0);
        for i in 0..tracker.records.len() {
            tracker.write_offset_field(image, i)?;
        }
        Ok(tracker)
    }

    pub fn records(&self) -> &[TrackedData] {
        &self.records
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Total bytes currently tracked; the populated prefix of the region.
    pub fn used(&self) -> u64 {
        self.records.last().map(|r| r.end()).unwrap_or(0)
    }

    pub fn find(&self, tag: Tag) -> Option<usize> {
        self.records.iter().position(|r| r.tag == tag)
    }

    pub fn find_any(&self, tags: &[Tag]) -> Option<usize> {
        tags.iter().find_map(|&t| self.find(t))
    }

    fn write_offset_field(&self, image: &mut ImageView, index: usize) -> Result<(), TrackerError> {
        let rec = &self.records[index];
        let seg = linkedit_index(image)?;
        let value = image.segments[seg].fileoff + rec.offset;
        image.set_lc_u32(rec.field.lc_offset, rec.field.field_offset, value as u32);
        Ok(())
    }

    /// Inserts a region before the record at `pos` (or at the end when `pos`
    /// equals the record count). `size` must be pointer aligned and at least
    /// `payload.len()`; the gap above the payload is zeroed.
    pub fn insert_data(
        &mut self,
        image: &mut ImageView,
        pos: usize,
        tag: Tag,
        field: OffsetField,
        payload: &[u8],
        size: u32,
    ) -> Result<usize, TrackerError> {
        if size == 0 {
            return Err(TrackerError::ZeroSizedData);
        }
        if u64::from(size) % self.ptr_size != 0 || payload.len() > size as usize {
            return Err(TrackerError::UnalignedData);
        }
        check_field(image, field)?;
        if self.used() + u64::from(size) > self.capacity {
            return Err(TrackerError::LinkeditFull);
        }

        let seg = linkedit_index(image)?;
        let insert_at = if pos < self.records.len() {
            self.records[pos].offset
        } else {
            self.used()
        };
        let used = self.used();

        let data = &mut image.segments[seg].data;
        data.copy_within(insert_at as usize..used as usize, (insert_at + u64::from(size)) as usize);
        data[insert_at as usize..insert_at as usize + payload.len()].copy_from_slice(payload);
        data[insert_at as usize + payload.len()..(insert_at + u64::from(size)) as usize].fill(0);

        for rec in &mut self.records[pos..] {
            rec.offset += u64::from(size);
        }
        self.records.insert(
            pos,
            TrackedData {
                tag,
                offset: insert_at,
                size,
                field,
            },
        );

        let new_size = image.segments[seg].vmsize + u64::from(size);
        image.set_segment_vmsize(seg, new_size);
        image.set_segment_filesize(seg, image.segments[seg].filesize + u64::from(size));
        for i in pos..self.records.len() {
            self.write_offset_field(image, i)?;
        }
        Ok(pos)
    }

    /// Appends a region at the end of the tracked data.
    pub fn add_data(
        &mut self,
        image: &mut ImageView,
        tag: Tag,
        field: OffsetField,
        payload: &[u8],
        size: u32,
    ) -> Result<usize, TrackerError> {
        self.insert_data(image, self.records.len(), tag, field, payload, size)
    }

    /// Grows or shrinks the record at `index` to `new_size`, moving
    /// subsequent regions and rewriting their offset fields.
    pub fn resize_data(
        &mut self,
        image: &mut ImageView,
        index: usize,
        new_size: u32,
    ) -> Result<(), TrackerError> {
        if u64::from(new_size) % self.ptr_size != 0 {
            return Err(TrackerError::UnalignedData);
        }
        let old_size = self.records[index].size;
        let delta = i64::from(new_size) - i64::from(old_size);
        if delta == 0 {
            return Ok(());
        }
        if self.used().checked_add_signed(delta).unwrap_or(u64::MAX) > self.capacity {
            return Err(TrackerError::LinkeditFull);
        }

        let seg = linkedit_index(image)?;
        let move_start = self.records[index].end();
        let used = self.used();
        let data = &mut image.segments[seg].data;
        data.copy_within(
            move_start as usize..used as usize,
            (move_start as i64 + delta) as usize,
        );
        if delta > 0 {
            let zero_start = (self.records[index].offset + u64::from(old_size)) as usize;
            data[zero_start..zero_start + delta as usize].fill(0);
        }

        self.records[index].size = new_size;
        for rec in &mut self.records[index + 1..] {
            rec.offset = rec.offset.checked_add_signed(delta).unwrap();
        }

        let new_vmsize = image.segments[seg].vmsize.checked_add_signed(delta).unwrap();
        image.set_segment_vmsize(seg, new_vmsize);
        let new_filesize = image.segments[seg]
            .filesize
            .checked_add_signed(delta)
            .unwrap();
        image.set_segment_filesize(seg, new_filesize);
        for i in index + 1..self.records.len() {
            self.write_offset_field(image, i)?;
        }
        Ok(())
    }

    /// Removes the record at `index`, collapsing the range.
    pub fn remove_data(&mut self, image: &mut ImageView, index: usize) -> Result<(), TrackerError> {
        let seg = linkedit_index(image)?;
        let rec_size = u64::from(self.records[index].size);
        let move_start = self.records[index].end();
        let used = self.used();

        let data = &mut image.segments[seg].data;
        data.copy_within(move_start as usize..used as usize, self.records[index].offset as usize);
        data[(used - rec_size) as usize..used as usize].fill(0);

        self.records.remove(index);
        for rec in &mut self.records[index..] {
            rec.offset -= rec_size;
        }

        image.set_segment_vmsize(seg, image.segments[seg].vmsize - rec_size);
        image.set_segment_filesize(seg, image.segments[seg].filesize - rec_size);
        for i in index..self.records.len() {
            self.write_offset_field(image, i)?;
        }
        Ok(())
    }

    /// Reads a tracked region's bytes.
    pub fn data<'i>(&self, image: &'i ImageView, index: usize) -> Result<&'i [u8], TrackerError> {
        let seg = linkedit_index(image)?;
        let rec = &self.records[index];
        Ok(&image.segments[seg].data[rec.offset as usize..rec.end() as usize])
    }

    /// Overwrites a tracked region's bytes (up to its size).
    pub fn write_data(
        &self,
        image: &mut ImageView,
        index: usize,
        bytes: &[u8],
    ) -> Result<(), TrackerError> {
        let seg = linkedit_index(image)?;
        let rec = &self.records[index];
        if bytes.len() > rec.size as usize {
            return Err(TrackerError::DataOutsideLinkedit);
        }
        image.segments[seg].data[rec.offset as usize..rec.offset as usize + bytes.len()]
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Inserts a load command before the one at `pos` (or at the end) and
    /// re-indexes the image. Tracked offset fields at or after the insertion
    /// point follow their shifted commands.
    pub fn insert_lc(
        &mut self,
        image: &mut ImageView,
        pos: Option<usize>,
        lc: &[u8],
    ) -> Result<usize, TrackerError> {
        let header_size = image.header_size();
        let cmds_end = header_size + image.sizeofcmds() as usize;
        if cmds_end - header_size + lc.len() > image.max_commands_size() {
            return Err(TrackerError::CommandsFull);
        }

        let insert_at = pos.unwrap_or(cmds_end);
        if insert_at < header_size || insert_at > cmds_end {
            return Err(TrackerError::CommandOutsideRegion);
        }

        let data = &mut image.segments[0].data;
        data.copy_within(insert_at..cmds_end, insert_at + lc.len());
        data[insert_at..insert_at + lc.len()].copy_from_slice(lc);

        for rec in &mut self.records {
            if rec.field.lc_offset >= insert_at && rec.field.lc_offset < cmds_end {
                rec.field.lc_offset += lc.len();
            }
        }

        let ncmds = image.ncmds() + 1;
        let sizeofcmds = image.sizeofcmds() + lc.len() as u32;
        image.set_header_u32(16, ncmds);
        image.set_header_u32(20, sizeofcmds);
        image.reindex().map_err(|_| TrackerError::CommandOutsideRegion)?;
        Ok(insert_at)
    }

    /// Removes the load command at `lc_offset`. Rejected when a tracked
    /// offset field still points into it.
    pub fn remove_lc(&mut self, image: &mut ImageView, lc_offset: usize) -> Result<(), TrackerError> {
        let header_size = image.header_size();
        let cmds_end = header_size + image.sizeofcmds() as usize;
        if lc_offset < header_size || lc_offset >= cmds_end {
            return Err(TrackerError::CommandOutsideRegion);
        }
        let cmdsize = image.lc_u32(lc_offset, 4) as usize;

        for rec in &self.records {
            if rec.field.lc_offset >= lc_offset && rec.field.lc_offset < lc_offset + cmdsize {
                return Err(TrackerError::CommandStillReferenced);
            }
        }

        let data = &mut image.segments[0].data;
        data.copy_within(lc_offset + cmdsize..cmds_end, lc_offset);
        data[cmds_end - cmdsize..cmds_end].fill(0);

        for rec in &mut self.records {
            if rec.field.lc_offset > lc_offset && rec.field.lc_offset < cmds_end {
                rec.field.lc_offset -= cmdsize;
            }
        }

        let ncmds = image.ncmds() - 1;
        let sizeofcmds = image.sizeofcmds() - cmdsize as u32;
        image.set_header_u32(16, ncmds);
        image.set_header_u32(20, sizeofcmds);
        image.reindex().map_err(|_| TrackerError::CommandOutsideRegion)?;
        Ok(())
    }

    /// Asserts the tracker invariants; test support.
    pub fn check_invariants(&self, image: &ImageView) {
        let seg = linkedit_index(image).unwrap();
        let fileoff = image.segments[seg].fileoff;
        let mut expected = 0;
        for rec in &self.records {
            assert_eq!(rec.offset, expected, "records must be contiguous");
            assert_eq!(u64::from(rec.size) % self.ptr_size, 0);
            let field = image.lc_u32(rec.field.lc_offset, rec.field.field_offset);
            assert_eq!(u64::from(field), fileoff + rec.offset);
            expected = rec.end();
        }
        assert!(expected <= self.capacity);
    }
}

pub fn linkedit_index(image: &ImageView) -> Result<usize, TrackerError> {
    image
        .segment_index(SEG_LINKEDIT)
        .ok_or(TrackerError::DataOutsideLinkedit)
}

fn check_field(image: &ImageView, field: OffsetField) -> Result<(), TrackerError> {
    let header_size = image.header_size();
    let cmds_end = header_size + image.sizeofcmds() as usize;
    if field.lc_offset < header_size || field.lc_offset + field.field_offset + 4 > cmds_end {
        return Err(TrackerError::FieldOutsideCommands);
    }
    Ok(())
}

/// Redacted indirect-symbol sentinels: no regular symbol at this slot.
pub fn is_redacted_indirect(entry: u32) -> bool {
    entry == 0
        || entry & layout::INDIRECT_SYMBOL_LOCAL != 0
        || entry & layout::INDIRECT_SYMBOL_ABS != 0
}

//! Mach-O views over an image inside the cache.
//!
//! [`ImageView`] is the writable view the pipeline mutates: every segment of
//! the target image is copied into a process-private buffer at construction
//! so nothing ever writes through the shared cache mapping.
//! [`CacheImageRef`] is the cheap read-only view used for dependency images
//! (export tries, libobjc tables, code regions) and reads straight out of
//! the mapped cache files.

use scroll::{Pread, Pwrite};
use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::cache::{CacheArch, DyldCache, SubCache};
use crate::errors::MachoError;
use crate::layout::{
    self, CacheImageInfo, MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64, SIZEOF_MACH_HEADER,
    SIZEOF_MACH_HEADER_64,
};

fn name16(bytes: &[u8; 16]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

pub fn make_name16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let n = name.len().min(16);
    out[..n].copy_from_slice(&name.as_bytes()[..n]);
    out
}

#[derive(Clone, Debug)]
pub struct LoadCommand {
    pub cmd: u32,
    pub cmdsize: u32,
    /// Offset of the command within the header buffer (segment 0's data).
    pub offset: usize,
}

#[derive(Clone, Debug)]
pub struct Section {
    pub segname: [u8; 16],
    pub sectname: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    /// Offset of the section record within the header buffer.
    pub cmd_offset: usize,
}

impl Section {
    pub fn sect_name(&self) -> String {
        name16(&self.sectname)
    }

    pub fn section_type(&self) -> u32 {
        self.flags & layout::SECTION_TYPE
    }
}

#[derive(Debug)]
pub struct Segment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub sections: Vec<Section>,
    /// Offset of the segment command within the header buffer.
    pub cmd_offset: usize,
    /// Process-private copy of the segment contents.
    pub data: Vec<u8>,
}

/// Writable Mach-O view over owned segment buffers.
pub struct ImageView {
    pub arch: CacheArch,
    pub segments: Vec<Segment>,
    pub commands: Vec<LoadCommand>,
}

impl ImageView {
    pub fn parse(cache: &DyldCache, image: &CacheImageInfo) -> Result<Self, MachoError> {
        let arch = cache
            .arch()
            .map_err(|_| MachoError::UnmappedAddress(image.address))?;
        let base = image.address;

        let magic = cache
            .read_u32_at(base)
            .ok_or(MachoError::UnmappedAddress(base))?;
        if magic == MH_CIGAM || magic == MH_CIGAM_64 {
            return Err(MachoError::IncompatibleEndianness);
        }
        if magic != MH_MAGIC && magic != MH_MAGIC_64 {
            return Err(MachoError::BadHeader);
        }

        let header_size = if magic == MH_MAGIC_64 {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER
        };
        let header = cache
            .read_at(base, header_size)
            .ok_or(MachoError::UnmappedAddress(base))?;
        let sizeofcmds: u32 = header.pread_with(20, scroll::LE)?;

        // One flat copy of header + commands to parse against; the real
        // copies are made per segment below.
        let cmds_area = cache
            .read_at(base, header_size + sizeofcmds as usize)
            .ok_or(MachoError::UnmappedAddress(base))?;

        let commands = parse_commands(cmds_area, header_size)?;
        let mut segments = Vec::new();
        for lc in &commands {
            if lc.cmd != layout::LC_SEGMENT && lc.cmd != layout::LC_SEGMENT_64 {
                continue;
            }
            let mut seg = parse_segment(cmds_area, lc, arch.is_64())?;
            let copy_len = seg.filesize as usize;
            seg.data = cache
                .read_at(seg.vmaddr, copy_len)
                .ok_or(MachoError::UnmappedAddress(seg.vmaddr))?
                .to_vec();
            segments.push(seg);
        }

        Ok(ImageView {
            arch,
            segments,
            commands,
        })
    }

    pub fn is_64(&self) -> bool {
        self.arch.is_64()
    }

    pub fn pointer_size(&self) -> u64 {
        self.arch.pointer_size()
    }

    pub fn header_size(&self) -> usize {
        if self.is_64() {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER
        }
    }

    pub fn base_addr(&self) -> u64 {
        self.segments[0].vmaddr
    }

    fn header_buf(&self) -> &[u8] {
        &self.segments[0].data
    }

    fn header_buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.segments[0].data
    }

    pub fn header_u32(&self, offset: usize) -> u32 {
        self.header_buf().pread_with(offset, scroll::LE).unwrap_or(0)
    }

    pub fn set_header_u32(&mut self, offset: usize, value: u32) {
        let _ = self.header_buf_mut().pwrite_with(value, offset, scroll::LE);
    }

    pub fn ncmds(&self) -> u32 {
        self.header_u32(16)
    }

    pub fn sizeofcmds(&self) -> u32 {
        self.header_u32(20)
    }

    pub fn cputype(&self) -> u32 {
        self.header_u32(4)
    }

    pub fn cpusubtype(&self) -> u32 {
        self.header_u32(8)
    }

    /// Re-parses the load command index and refreshes segment metadata.
    /// Must be called after any load command insertion or removal. New
    /// segment commands get an empty data buffer which the caller is
    /// expected to fill; segments are re-ordered to command order.
    pub fn reindex(&mut self) -> Result<(), MachoError> {
        let header_size = self.header_size();
        let is64 = self.is_64();
        let buf = self.segments[0].data.clone();
        self.commands = parse_commands(&buf, header_size)?;

        let mut new_segments = Vec::new();
        for lc in &self.commands {
            if lc.cmd != layout::LC_SEGMENT && lc.cmd != layout::LC_SEGMENT_64 {
                continue;
            }
            let mut seg = parse_segment(&buf, lc, is64)?;
            if let Some(pos) = self.segments.iter().position(|s| s.name == seg.name) {
                seg.data = std::mem::take(&mut self.segments[pos].data);
                self.segments.remove(pos);
            }
            new_segments.push(seg);
        }
        self.segments = new_segments;
        Ok(())
    }

    pub fn find_lc(&self, cmds: &[u32]) -> Option<&LoadCommand> {
        for &cmd in cmds {
            if let Some(lc) = self.commands.iter().find(|lc| lc.cmd == cmd) {
                return Some(lc);
            }
        }
        None
    }

    pub fn all_lcs(&self, cmds: &[u32]) -> Vec<LoadCommand> {
        self.commands
            .iter()
            .filter(|lc| cmds.contains(&lc.cmd))
            .cloned()
            .collect()
    }

    /// Reads a whole command struct at a command offset.
    pub fn lc_struct<T: FromBytes>(&self, offset: usize) -> Result<T, MachoError> {
        let buf = self.header_buf();
        let end = offset + size_of::<T>();
        let bytes = buf
            .get(offset..end)
            .ok_or(MachoError::TruncatedCommand(offset))?;
        T::read_from_bytes(bytes).map_err(|_| MachoError::TruncatedCommand(offset))
    }

    pub fn write_lc_struct<T: IntoBytes + Immutable>(
        &mut self,
        offset: usize,
        value: &T,
    ) -> Result<(), MachoError> {
        let bytes = value.as_bytes();
        let buf = self.header_buf_mut();
        let end = offset + bytes.len();
        buf.get_mut(offset..end)
            .ok_or(MachoError::TruncatedCommand(offset))?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn lc_u32(&self, offset: usize, field: usize) -> u32 {
        self.header_buf()
            .pread_with(offset + field, scroll::LE)
            .unwrap_or(0)
    }

    pub fn set_lc_u32(&mut self, offset: usize, field: usize, value: u32) {
        let _ = self
            .header_buf_mut()
            .pwrite_with(value, offset + field, scroll::LE);
    }

    /// The NUL-terminated path embedded in a dylib command.
    pub fn dylib_name(&self, lc: &LoadCommand) -> Option<String> {
        let name_off = self.lc_u32(lc.offset, 8) as usize;
        let start = lc.offset + name_off;
        let end = lc.offset + lc.cmdsize as usize;
        let bytes = self.header_buf().get(start..end)?;
        let nul = bytes.iter().position(|&b| b == 0)?;
        String::from_utf8(bytes[..nul].to_vec()).ok()
    }

    pub fn segment_index(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }

    pub fn section_at(&self, segname: &str, sectname: &str) -> Option<(usize, usize)> {
        for (si, seg) in self.segments.iter().enumerate() {
            for (ci, sect) in seg.sections.iter().enumerate() {
                if (segname.is_empty() || seg.name == segname) && sect.sect_name() == sectname {
                    return Some((si, ci));
                }
            }
        }
        None
    }

    /// Indices of every section matching the predicate, in declared order.
    pub fn sections_where(
        &self,
        mut pred: impl FnMut(&Segment, &Section) -> bool,
    ) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (si, seg) in self.segments.iter().enumerate() {
            for (ci, sect) in seg.sections.iter().enumerate() {
                if pred(seg, sect) {
                    out.push((si, ci));
                }
            }
        }
        out
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments
            .iter()
            .any(|s| addr >= s.vmaddr && addr < s.vmaddr + s.vmsize)
    }

    pub fn convert_addr(&self, addr: u64) -> Option<(usize, usize)> {
        for (si, seg) in self.segments.iter().enumerate() {
            if addr >= seg.vmaddr && addr < seg.vmaddr + seg.vmsize {
                let off = (addr - seg.vmaddr) as usize;
                if off <= seg.data.len() {
                    return Some((si, off));
                }
            }
        }
        None
    }

    pub fn bytes(&self, addr: u64, len: usize) -> Result<&[u8], MachoError> {
        let (si, off) = self
            .convert_addr(addr)
            .ok_or(MachoError::AddressOutsideImage(addr))?;
        self.segments[si]
            .data
            .get(off..off + len)
            .ok_or(MachoError::AddressOutsideImage(addr))
    }

    pub fn bytes_mut(&mut self, addr: u64, len: usize) -> Result<&mut [u8], MachoError> {
        let (si, off) = self
            .convert_addr(addr)
            .ok_or(MachoError::AddressOutsideImage(addr))?;
        self.segments[si]
            .data
            .get_mut(off..off + len)
            .ok_or(MachoError::AddressOutsideImage(addr))
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MachoError> {
        Ok(u32::from_le_bytes(self.bytes(addr, 4)?.try_into().unwrap()))
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> Result<(), MachoError> {
        self.bytes_mut(addr, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MachoError> {
        Ok(u64::from_le_bytes(self.bytes(addr, 8)?.try_into().unwrap()))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), MachoError> {
        self.bytes_mut(addr, 8)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_ptr(&self, addr: u64) -> Result<u64, MachoError> {
        if self.is_64() {
            self.read_u64(addr)
        } else {
            self.read_u32(addr).map(u64::from)
        }
    }

    pub fn write_ptr(&mut self, addr: u64, value: u64) -> Result<(), MachoError> {
        if self.is_64() {
            self.write_u64(addr, value)
        } else {
            self.write_u32(addr, value as u32)
        }
    }

    pub fn read_struct<T: FromBytes>(&self, addr: u64) -> Result<T, MachoError> {
        let bytes = self.bytes(addr, size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| MachoError::AddressOutsideImage(addr))
    }

    pub fn write_struct<T: IntoBytes + Immutable>(
        &mut self,
        addr: u64,
        value: &T,
    ) -> Result<(), MachoError> {
        self.bytes_mut(addr, size_of::<T>())?
            .copy_from_slice(value.as_bytes());
        Ok(())
    }

    // Segment and section metadata writers. The command bytes are canonical;
    // these keep the parsed mirror in sync.

    pub fn set_segment_vmsize(&mut self, seg: usize, vmsize: u64) {
        let off = self.segments[seg].cmd_offset;
        if self.is_64() {
            let _ = self.header_buf_mut().pwrite_with(vmsize, off + 32, scroll::LE);
        } else {
            let _ = self
                .header_buf_mut()
                .pwrite_with(vmsize as u32, off + 28, scroll::LE);
        }
        self.segments[seg].vmsize = vmsize;
    }

    pub fn set_segment_filesize(&mut self, seg: usize, filesize: u64) {
        let off = self.segments[seg].cmd_offset;
        if self.is_64() {
            let _ = self
                .header_buf_mut()
                .pwrite_with(filesize, off + 48, scroll::LE);
        } else {
            let _ = self
                .header_buf_mut()
                .pwrite_with(filesize as u32, off + 36, scroll::LE);
        }
        self.segments[seg].filesize = filesize;
    }

    pub fn set_segment_fileoff(&mut self, seg: usize, fileoff: u64) {
        let off = self.segments[seg].cmd_offset;
        if self.is_64() {
            let _ = self
                .header_buf_mut()
                .pwrite_with(fileoff, off + 40, scroll::LE);
        } else {
            let _ = self
                .header_buf_mut()
                .pwrite_with(fileoff as u32, off + 32, scroll::LE);
        }
        self.segments[seg].fileoff = fileoff;
    }

    pub fn set_section_offset(&mut self, seg: usize, sect: usize, offset: u32) {
        let off = self.segments[seg].sections[sect].cmd_offset;
        let field = if self.is_64() { 48 } else { 40 };
        let _ = self
            .header_buf_mut()
            .pwrite_with(offset, off + field, scroll::LE);
        self.segments[seg].sections[sect].offset = offset;
    }

    pub fn set_section_flags(&mut self, seg: usize, sect: usize, flags: u32) {
        let off = self.segments[seg].sections[sect].cmd_offset;
        let field = if self.is_64() { 64 } else { 56 };
        let _ = self
            .header_buf_mut()
            .pwrite_with(flags, off + field, scroll::LE);
        self.segments[seg].sections[sect].flags = flags;
    }

    pub fn set_section_reserved1(&mut self, seg: usize, sect: usize, value: u32) {
        let off = self.segments[seg].sections[sect].cmd_offset;
        let field = if self.is_64() { 68 } else { 60 };
        let _ = self
            .header_buf_mut()
            .pwrite_with(value, off + field, scroll::LE);
        self.segments[seg].sections[sect].reserved1 = value;
    }

    /// Maximum space available for load commands, bounded by the first
    /// section's address in the text segment.
    pub fn max_commands_size(&self) -> usize {
        let text = &self.segments[0];
        let first_sect = text
            .sections
            .iter()
            .filter(|s| s.addr != 0)
            .map(|s| s.addr)
            .min()
            .unwrap_or(text.vmaddr + text.vmsize);
        (first_sect - text.vmaddr) as usize - self.header_size()
    }
}

fn parse_commands(buf: &[u8], header_size: usize) -> Result<Vec<LoadCommand>, MachoError> {
    let ncmds: u32 = buf.pread_with(16, scroll::LE)?;
    let sizeofcmds: u32 = buf.pread_with(20, scroll::LE)?;
    let end = header_size + sizeofcmds as usize;

    let mut commands = Vec::with_capacity(ncmds as usize);
    let mut offset = header_size;
    for _ in 0..ncmds {
        if offset + 8 > end {
            return Err(MachoError::TruncatedCommand(offset));
        }
        let cmd: u32 = buf.pread_with(offset, scroll::LE)?;
        let cmdsize: u32 = buf.pread_with(offset + 4, scroll::LE)?;
        if cmdsize < 8 || offset + cmdsize as usize > end {
            return Err(MachoError::TruncatedCommand(offset));
        }
        commands.push(LoadCommand {
            cmd,
            cmdsize,
            offset,
        });
        offset += cmdsize as usize;
    }
    Ok(commands)
}

fn parse_segment(buf: &[u8], lc: &LoadCommand, is64: bool) -> Result<Segment, MachoError> {
    let off = lc.offset;
    let mut segname = [0u8; 16];
    segname.copy_from_slice(
        buf.get(off + 8..off + 24)
            .ok_or(MachoError::TruncatedCommand(off))?,
    );

    let (vmaddr, vmsize, fileoff, filesize, maxprot, initprot, nsects, seg_size, sect_size) =
        if is64 {
            (
                buf.pread_with::<u64>(off + 24, scroll::LE)?,
                buf.pread_with::<u64>(off + 32, scroll::LE)?,
                buf.pread_with::<u64>(off + 40, scroll::LE)?,
                buf.pread_with::<u64>(off + 48, scroll::LE)?,
                buf.pread_with::<u32>(off + 56, scroll::LE)?,
                buf.pread_with::<u32>(off + 60, scroll::LE)?,
                buf.pread_with::<u32>(off + 64, scroll::LE)?,
                72usize,
                80usize,
            )
        } else {
            (
                u64::from(buf.pread_with::<u32>(off + 24, scroll::LE)?),
                u64::from(buf.pread_with::<u32>(off + 28, scroll::LE)?),
                u64::from(buf.pread_with::<u32>(off + 32, scroll::LE)?),
                u64::from(buf.pread_with::<u32>(off + 36, scroll::LE)?),
                buf.pread_with::<u32>(off + 40, scroll::LE)?,
                buf.pread_with::<u32>(off + 44, scroll::LE)?,
                buf.pread_with::<u32>(off + 48, scroll::LE)?,
                56usize,
                68usize,
            )
        };

    let mut sections = Vec::with_capacity(nsects as usize);
    for i in 0..nsects as usize {
        let soff = off + seg_size + i * sect_size;
        let mut sectname = [0u8; 16];
        sectname.copy_from_slice(
            buf.get(soff..soff + 16)
                .ok_or(MachoError::TruncatedCommand(soff))?,
        );
        let mut ssegname = [0u8; 16];
        ssegname.copy_from_slice(
            buf.get(soff + 16..soff + 32)
                .ok_or(MachoError::TruncatedCommand(soff))?,
        );

        let (addr, size, offset, flags, reserved1, reserved2) = if is64 {
            (
                buf.pread_with::<u64>(soff + 32, scroll::LE)?,
                buf.pread_with::<u64>(soff + 40, scroll::LE)?,
                buf.pread_with::<u32>(soff + 48, scroll::LE)?,
                buf.pread_with::<u32>(soff + 64, scroll::LE)?,
                buf.pread_with::<u32>(soff + 68, scroll::LE)?,
                buf.pread_with::<u32>(soff + 72, scroll::LE)?,
            )
        } else {
            (
                u64::from(buf.pread_with::<u32>(soff + 32, scroll::LE)?),
                u64::from(buf.pread_with::<u32>(soff + 36, scroll::LE)?),
                buf.pread_with::<u32>(soff + 40, scroll::LE)?,
                buf.pread_with::<u32>(soff + 56, scroll::LE)?,
                buf.pread_with::<u32>(soff + 60, scroll::LE)?,
                buf.pread_with::<u32>(soff + 64, scroll::LE)?,
            )
        };

        sections.push(Section {
            segname: ssegname,
            sectname,
            addr,
            size,
            offset,
            flags,
            reserved1,
            reserved2,
            cmd_offset: soff,
        });
    }

    Ok(Segment {
        name: name16(&segname),
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot,
        initprot,
        sections,
        cmd_offset: off,
        data: Vec::new(),
    })
}

/// Read-only view of an image that stays inside the cache mapping.
pub struct CacheImageRef<'a> {
    pub cache: &'a DyldCache,
    pub base: u64,
    pub is_64: bool,
    pub commands: Vec<(u32, u32, u64)>,
    pub segments: Vec<RefSegment>,
}

#[derive(Clone, Debug)]
pub struct RefSegment {
    pub name: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub sections: Vec<RefSection>,
}

#[derive(Clone, Debug)]
pub struct RefSection {
    pub sectname: String,
    pub addr: u64,
    pub size: u64,
    pub flags: u32,
}

impl<'a> CacheImageRef<'a> {
    pub fn parse(cache: &'a DyldCache, base: u64) -> Result<Self, MachoError> {
        let magic = cache
            .read_u32_at(base)
            .ok_or(MachoError::UnmappedAddress(base))?;
        let is_64 = magic == MH_MAGIC_64;
        let header_size = if is_64 {
            SIZEOF_MACH_HEADER_64
        } else {
            SIZEOF_MACH_HEADER
        };
        let sizeofcmds = cache
            .read_u32_at(base + 20)
            .ok_or(MachoError::UnmappedAddress(base))?;
        let buf = cache
            .read_at(base, header_size + sizeofcmds as usize)
            .ok_or(MachoError::UnmappedAddress(base))?;

        let commands = parse_commands(buf, header_size)?
            .into_iter()
            .map(|lc| (lc.cmd, lc.cmdsize, base + lc.offset as u64))
            .collect::<Vec<_>>();

        let mut segments = Vec::new();
        for lc in parse_commands(buf, header_size)? {
            if lc.cmd != layout::LC_SEGMENT && lc.cmd != layout::LC_SEGMENT_64 {
                continue;
            }
            let seg = parse_segment(buf, &lc, is_64)?;
            segments.push(RefSegment {
                name: seg.name,
                vmaddr: seg.vmaddr,
                vmsize: seg.vmsize,
                sections: seg
                    .sections
                    .iter()
                    .map(|s| RefSection {
                        sectname: s.sect_name(),
                        addr: s.addr,
                        size: s.size,
                        flags: s.flags,
                    })
                    .collect(),
            });
        }

        Ok(CacheImageRef {
            cache,
            base,
            is_64,
            commands,
            segments,
        })
    }

    pub fn find_lc(&self, cmds: &[u32]) -> Option<(u32, u64)> {
        for &cmd in cmds {
            if let Some(&(c, _, addr)) = self.commands.iter().find(|&&(c, _, _)| c == cmd) {
                return Some((c, addr));
            }
        }
        None
    }

    pub fn lc_struct<T: FromBytes>(&self, lc_addr: u64) -> Option<T> {
        let bytes = self.cache.read_at(lc_addr, size_of::<T>())?;
        T::read_from_bytes(bytes).ok()
    }

    /// Dylib commands in declared order, as (cmd, command address) pairs.
    pub fn dylib_commands(&self) -> Vec<(u32, u64)> {
        self.commands
            .iter()
            .filter(|(c, _, _)| {
                matches!(
                    *c,
                    layout::LC_ID_DYLIB
                        | layout::LC_LOAD_DYLIB
                        | layout::LC_LOAD_WEAK_DYLIB
                        | layout::LC_REEXPORT_DYLIB
                        | layout::LC_LOAD_UPWARD_DYLIB
                        | layout::LC_LAZY_LOAD_DYLIB
                )
            })
            .map(|&(c, _, addr)| (c, addr))
            .collect()
    }

    pub fn dylib_name(&self, lc_addr: u64) -> Option<&'a str> {
        let name_off = self.cache.read_u32_at(lc_addr + 8)?;
        self.cache.read_cstr_at(lc_addr + u64::from(name_off))
    }

    pub fn segment(&self, name: &str) -> Option<&RefSegment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn section(&self, segname: Option<&str>, sectname: &str) -> Option<&RefSection> {
        self.segments
            .iter()
            .filter(|s| segname.is_none_or(|n| s.name == n))
            .flat_map(|s| s.sections.iter())
            .find(|s| s.sectname == sectname)
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        self.segments
            .iter()
            .any(|s| addr >= s.vmaddr && addr < s.vmaddr + s.vmsize)
    }

    /// The cache file holding this image's linkedit; linkedit load command
    /// offsets are file offsets into it.
    pub fn linkedit_file(&self) -> Option<&'a SubCache> {
        let seg = self.segment(layout::SEG_LINKEDIT)?;
        self.cache.convert_addr(seg.vmaddr).map(|(_, sub)| sub)
    }
}

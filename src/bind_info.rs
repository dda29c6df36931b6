//! Reader for the legacy dyld-info bind opcode streams (regular, weak and
//! lazy). The stub fixer uses lazy records to re-point symbol pointers at
//! their helpers; the legacy encoder seeds its output from the regular
//! records.

use std::collections::BTreeMap;

use crate::layout::{
    BIND_IMMEDIATE_MASK, BIND_OPCODE_ADD_ADDR_ULEB, BIND_OPCODE_DONE, BIND_OPCODE_DO_BIND,
    BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED, BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
    BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, BIND_OPCODE_MASK, BIND_OPCODE_SET_ADDEND_SLEB,
    BIND_OPCODE_SET_DYLIB_ORDINAL_IMM, BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB,
    BIND_OPCODE_SET_DYLIB_SPECIAL_IMM, BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
    BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, BIND_OPCODE_SET_TYPE_IMM,
};
use crate::leb::{read_sleb128, read_uleb128};

#[derive(Clone, Debug, Default)]
pub struct BindRecord {
    pub address: u64,
    pub bind_type: u8,
    pub flags: u8,
    pub lib_ordinal: i32,
    pub symbol_name: String,
    pub addend: i64,
}

/// Parsed bind records of one image.
#[derive(Debug, Default)]
pub struct BindInfo {
    pub binds: Vec<BindRecord>,
    pub weak_binds: Vec<BindRecord>,
    /// Lazy records keyed by their offset within the lazy-bind stream.
    pub lazy_binds: BTreeMap<u32, BindRecord>,
}

impl BindInfo {
    /// Parses the three streams. `segments` provides (vmaddr, vmsize) in
    /// declared order for segment-relative addresses.
    pub fn parse(
        bind: &[u8],
        weak_bind: &[u8],
        lazy_bind: &[u8],
        segments: &[(u64, u64)],
        ptr_size: u64,
    ) -> Self {
        let mut info = BindInfo::default();
        read_bind_stream(bind, segments, ptr_size, true, |_, rec| {
            info.binds.push(rec);
        });
        read_bind_stream(weak_bind, segments, ptr_size, true, |_, rec| {
            info.weak_binds.push(rec);
        });
        read_bind_stream(lazy_bind, segments, ptr_size, false, |off, rec| {
            info.lazy_binds.insert(off, rec);
        });
        info
    }

    pub fn has_lazy_binds(&self) -> bool {
        !self.lazy_binds.is_empty()
    }

    pub fn lazy_bind(&self, offset: u32) -> Option<&BindRecord> {
        self.lazy_binds.get(&offset)
    }
}

/// Walks one opcode stream, calling `emit` with each completed record and
/// the stream offset where the record's opcodes started. A malformed stream
/// stops the walk with what was parsed so far; some caches carry bind
/// offsets that point at trie-shaped data.
fn read_bind_stream(
    data: &[u8],
    segments: &[(u64, u64)],
    ptr_size: u64,
    stop_at_done: bool,
    mut emit: impl FnMut(u32, BindRecord),
) {
    let mut record = BindRecord::default();
    let mut record_start = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut pos = 0usize;

    let address = |seg_index: usize, seg_offset: u64| -> Option<u64> {
        segments.get(seg_index).map(|&(vmaddr, _)| vmaddr + seg_offset)
    };

    macro_rules! bail {
        () => {{
            log::debug!("malformed bind opcode stream at offset {pos}");
            return;
        }};
    }

    while pos < data.len() {
        let byte = data[pos];
        let opcode = byte & BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        pos += 1;

        match opcode {
            BIND_OPCODE_DONE => {
                if stop_at_done {
                    return;
                }
                // Lazy streams separate records with DONE.
                record = BindRecord::default();
                record_start = pos;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => record.lib_ordinal = i32::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => match read_uleb128(data, &mut pos) {
                Some(v) => record.lib_ordinal = v as i32,
                None => bail!(),
            },
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                record.lib_ordinal = if imm == 0 {
                    0
                } else {
                    // the special ordinals are negative numbers
                    i32::from((BIND_OPCODE_MASK | imm) as i8)
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                record.flags = imm;
                let Some(nul) = data[pos..].iter().position(|&b| b == 0) else {
                    bail!();
                };
                record.symbol_name = String::from_utf8_lossy(&data[pos..pos + nul]).into_owned();
                pos += nul + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => record.bind_type = imm,
            BIND_OPCODE_SET_ADDEND_SLEB => match read_sleb128(data, &mut pos) {
                Some(v) => record.addend = v,
                None => bail!(),
            },
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                match read_uleb128(data, &mut pos) {
                    Some(v) => seg_offset = v,
                    None => bail!(),
                }
            }
            BIND_OPCODE_ADD_ADDR_ULEB => match read_uleb128(data, &mut pos) {
                Some(v) => seg_offset = seg_offset.wrapping_add(v),
                None => bail!(),
            },
            BIND_OPCODE_DO_BIND => {
                let Some(addr) = address(seg_index, seg_offset) else {
                    bail!();
                };
                record.address = addr;
                emit(record_start as u32, record.clone());
                seg_offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                let Some(addr) = address(seg_index, seg_offset) else {
                    bail!();
                };
                record.address = addr;
                emit(record_start as u32, record.clone());
                match read_uleb128(data, &mut pos) {
                    Some(v) => seg_offset = seg_offset.wrapping_add(v + ptr_size),
                    None => bail!(),
                }
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                let Some(addr) = address(seg_index, seg_offset) else {
                    bail!();
                };
                record.address = addr;
                emit(record_start as u32, record.clone());
                seg_offset += u64::from(imm) * ptr_size + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let (Some(count), Some(skip)) =
                    (read_uleb128(data, &mut pos), read_uleb128(data, &mut pos))
                else {
                    bail!();
                };
                for _ in 0..count {
                    let Some(addr) = address(seg_index, seg_offset) else {
                        bail!();
                    };
                    record.address = addr;
                    emit(record_start as u32, record.clone());
                    seg_offset += skip + ptr_size;
                }
            }
            _ => bail!(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::leb::append_uleb128;

    #[test]
    fn parses_simple_bind_stream() {
        let mut stream = Vec::new();
        stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2);
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend(b"_malloc\0");
        stream.push(BIND_OPCODE_SET_TYPE_IMM | 1);
        stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        append_uleb128(&mut stream, 0x10);
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DONE);

        let segments = [(0x1000, 0x1000), (0x2000, 0x1000)];
        let info = BindInfo::parse(&stream, &[], &[], &segments, 8);
        assert_eq!(info.binds.len(), 2);
        assert_eq!(info.binds[0].address, 0x2010);
        assert_eq!(info.binds[0].symbol_name, "_malloc");
        assert_eq!(info.binds[0].lib_ordinal, 2);
        assert_eq!(info.binds[1].address, 0x2018);
    }

    #[test]
    fn lazy_records_are_keyed_by_stream_offset() {
        let mut stream = Vec::new();
        let first_start = stream.len() as u32;
        stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        append_uleb128(&mut stream, 0);
        stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 1);
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend(b"_free\0");
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DONE);
        let second_start = stream.len() as u32;
        stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        append_uleb128(&mut stream, 8);
        stream.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 3);
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend(b"_puts\0");
        stream.push(BIND_OPCODE_DO_BIND);
        stream.push(BIND_OPCODE_DONE);

        let segments = [(0x1000, 0x1000), (0x2000, 0x1000)];
        let info = BindInfo::parse(&[], &[], &stream, &segments, 8);
        assert_eq!(info.lazy_binds.len(), 2);
        assert_eq!(info.lazy_bind(first_start).unwrap().symbol_name, "_free");
        assert_eq!(info.lazy_bind(second_start).unwrap().symbol_name, "_puts");
        assert_eq!(info.lazy_bind(second_start).unwrap().address, 0x2008);
    }

    #[test]
    fn special_ordinals_are_negative() {
        let mut stream = Vec::new();
        stream.push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | 0x0e); // flat lookup, -2
        stream.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        stream.extend(b"_x\0");
        stream.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB);
        append_uleb128(&mut stream, 0);
        stream.push(BIND_OPCODE_DO_BIND);

        let info = BindInfo::parse(&stream, &[], &[], &[(0x1000, 0x1000)], 8);
        assert_eq!(info.binds[0].lib_ordinal, -2);
    }
}

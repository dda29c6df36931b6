//! Legacy rebase and bind opcode stream encoders, with decoders used by the
//! idempotence tests.
//!
//! Both encoders first produce a naive one-op-per-record stream and then run
//! the canonical optimization phases over it: runs of contiguous pointers
//! collapse into `..._TIMES`, constant-stride runs into
//! `..._TIMES_SKIPPING_ULEB`, and small operands into immediate forms.

use crate::errors::EncodeError;
use crate::layout::{
    BIND_IMMEDIATE_MASK, BIND_OPCODE_ADD_ADDR_ULEB, BIND_OPCODE_DONE, BIND_OPCODE_DO_BIND,
    BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED, BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
    BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, BIND_OPCODE_SET_ADDEND_SLEB,
    BIND_OPCODE_SET_DYLIB_ORDINAL_IMM, BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB,
    BIND_OPCODE_SET_DYLIB_SPECIAL_IMM, BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
    BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM, BIND_OPCODE_SET_TYPE_IMM,
    REBASE_IMMEDIATE_MASK, REBASE_OPCODE_ADD_ADDR_IMM_SCALED, REBASE_OPCODE_ADD_ADDR_ULEB,
    REBASE_OPCODE_DONE, REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB, REBASE_OPCODE_DO_REBASE_IMM_TIMES,
    REBASE_OPCODE_DO_REBASE_ULEB_TIMES, REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB,
    REBASE_OPCODE_MASK, REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB, REBASE_OPCODE_SET_TYPE_IMM,
    REBASE_TYPE_POINTER,
};
use crate::leb::{append_sleb128, append_uleb128, read_sleb128, read_uleb128};

fn find_segment(segments: &[(u64, u64)], addr: u64) -> Result<(usize, u64), EncodeError> {
    segments
        .iter()
        .position(|&(vmaddr, vmsize)| addr >= vmaddr && addr < vmaddr + vmsize)
        .map(|i| (i, segments[i].0))
        .ok_or(EncodeError::AddressOutsideSegments(addr))
}

#[derive(Clone, Copy)]
struct TmpOp {
    opcode: u8,
    operand1: u64,
    operand2: u64,
    name: usize, // index into the record list for symbol names
}

/// Encodes the rebase stream for `addresses` (sorted by caller), pointer
/// aligned and terminated by `REBASE_OPCODE_DONE`.
pub fn encode_rebase(
    addresses: &[u64],
    segments: &[(u64, u64)],
    ptr_size: u64,
) -> Result<Vec<u8>, EncodeError> {
    let mut mid: Vec<TmpOp> = Vec::with_capacity(addresses.len() + 4);
    let op = |opcode, operand1, operand2| TmpOp {
        opcode,
        operand1,
        operand2,
        name: 0,
    };

    let mut cur_seg: Option<usize> = None;
    let mut seg_start = 0u64;
    let mut seg_end = 0u64;
    let mut rebase_type = 0u8;
    let mut address = u64::MAX;

    for &addr in addresses {
        if rebase_type != REBASE_TYPE_POINTER {
            mid.push(op(
                REBASE_OPCODE_SET_TYPE_IMM,
                u64::from(REBASE_TYPE_POINTER),
                0,
            ));
            rebase_type = REBASE_TYPE_POINTER;
        }
        if address != addr {
            if addr < seg_start || addr >= seg_end || cur_seg.is_none() {
                let (seg_index, vmaddr) = find_segment(segments, addr)?;
                seg_start = vmaddr;
                seg_end = vmaddr + segments[seg_index].1;
                cur_seg = Some(seg_index);
                mid.push(op(
                    REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
                    seg_index as u64,
                    addr - seg_start,
                ));
            } else {
                mid.push(op(REBASE_OPCODE_ADD_ADDR_ULEB, addr - address, 0));
            }
        }
        mid.push(op(REBASE_OPCODE_DO_REBASE_ULEB_TIMES, 1, 0));
        address = addr + ptr_size;
        if address >= seg_end {
            address = 0;
        }
    }
    mid.push(op(REBASE_OPCODE_DONE, 0, 0));

    // Phase 1: compress packed runs of pointers.
    let mut out: Vec<TmpOp> = Vec::with_capacity(mid.len());
    let mut i = 0;
    while mid[i].opcode != REBASE_OPCODE_DONE {
        if mid[i].opcode == REBASE_OPCODE_DO_REBASE_ULEB_TIMES && mid[i].operand1 == 1 {
            let mut run = mid[i];
            i += 1;
            while mid[i].opcode == REBASE_OPCODE_DO_REBASE_ULEB_TIMES {
                run.operand1 += mid[i].operand1;
                i += 1;
            }
            out.push(run);
        } else {
            out.push(mid[i]);
            i += 1;
        }
    }
    out.push(op(REBASE_OPCODE_DONE, 0, 0));
    let mid = out;

    // Phase 2: combine rebase/add pairs.
    let mut out: Vec<TmpOp> = Vec::with_capacity(mid.len());
    let mut i = 0;
    while mid[i].opcode != REBASE_OPCODE_DONE {
        if mid[i].opcode == REBASE_OPCODE_DO_REBASE_ULEB_TIMES
            && mid[i].operand1 == 1
            && mid[i + 1].opcode == REBASE_OPCODE_ADD_ADDR_ULEB
        {
            out.push(op(
                REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB,
                mid[i + 1].operand1,
                0,
            ));
            i += 2;
        } else {
            out.push(mid[i]);
            i += 1;
        }
    }
    out.push(op(REBASE_OPCODE_DONE, 0, 0));
    let mid = out;

    // Phase 3: compress constant-gap runs into a single skipping op.
    let mut out: Vec<TmpOp> = Vec::with_capacity(mid.len());
    let mut i = 0;
    while mid[i].opcode != REBASE_OPCODE_DONE {
        let delta = mid[i].operand1;
        let run_of_three = mid[i].opcode == REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB
            && mid
                .get(i + 1)
                .is_some_and(|o| o.opcode == REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB && o.operand1 == delta)
            && mid
                .get(i + 2)
                .is_some_and(|o| o.opcode == REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB && o.operand1 == delta);
        if run_of_three {
            let mut run = op(REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB, 1, delta);
            while mid[i].opcode == REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB
                && mid[i].operand1 == delta
            {
                run.operand1 += 1;
                i += 1;
            }
            run.operand1 -= 1;
            out.push(run);
        } else {
            out.push(mid[i]);
            i += 1;
        }
    }
    out.push(op(REBASE_OPCODE_DONE, 0, 0));
    let mut mid = out;

    // Phase 4: use immediate encodings where the operands fit.
    for p in &mut mid {
        if p.opcode == REBASE_OPCODE_ADD_ADDR_ULEB
            && p.operand1 < 15 * ptr_size
            && p.operand1 % ptr_size == 0
        {
            p.opcode = REBASE_OPCODE_ADD_ADDR_IMM_SCALED;
            p.operand1 /= ptr_size;
        } else if p.opcode == REBASE_OPCODE_DO_REBASE_ULEB_TIMES && p.operand1 < 15 {
            p.opcode = REBASE_OPCODE_DO_REBASE_IMM_TIMES;
        }
    }

    let mut encoded = Vec::with_capacity(addresses.len() * 2);
    for p in &mid {
        match p.opcode {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {
                encoded.push(REBASE_OPCODE_SET_TYPE_IMM | p.operand1 as u8);
            }
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                encoded.push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | p.operand1 as u8);
                append_uleb128(&mut encoded, p.operand2);
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                encoded.push(REBASE_OPCODE_ADD_ADDR_ULEB);
                append_uleb128(&mut encoded, p.operand1);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                encoded.push(REBASE_OPCODE_ADD_ADDR_IMM_SCALED | p.operand1 as u8);
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                encoded.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | p.operand1 as u8);
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                encoded.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
                append_uleb128(&mut encoded, p.operand1);
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                encoded.push(REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB);
                append_uleb128(&mut encoded, p.operand1);
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                encoded.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB);
                append_uleb128(&mut encoded, p.operand1);
                append_uleb128(&mut encoded, p.operand2);
            }
            _ => {}
        }
    }
    encoded.push(REBASE_OPCODE_DONE);

    let pad = crate::layout::align(encoded.len() as u64, ptr_size) as usize - encoded.len();
    encoded.extend(std::iter::repeat_n(0u8, pad));
    Ok(encoded)
}

#[derive(Clone, Debug)]
pub struct BindingEntry {
    pub bind_type: u8,
    pub flags: u8,
    pub lib_ordinal: i32,
    pub symbol_name: String,
    pub address: u64,
    pub addend: i64,
}

/// Encodes the bind stream, sorted by library ordinal, symbol name, type,
/// flags and address.
pub fn encode_binding(
    info: &mut Vec<BindingEntry>,
    segments: &[(u64, u64)],
    ptr_size: u64,
) -> Result<Vec<u8>, EncodeError> {
    info.sort_by(|a, b| {
        a.lib_ordinal
            .cmp(&b.lib_ordinal)
            .then_with(|| a.symbol_name.cmp(&b.symbol_name))
            .then_with(|| a.bind_type.cmp(&b.bind_type))
            .then_with(|| b.flags.cmp(&a.flags))
            .then_with(|| a.address.cmp(&b.address))
    });

    let mut mid: Vec<TmpOp> = Vec::with_capacity(info.len() + 4);
    let op = |opcode, operand1: u64, operand2: u64, name: usize| TmpOp {
        opcode,
        operand1,
        operand2,
        name,
    };

    let mut ordinal = i64::MIN;
    let mut symbol: Option<usize> = None;
    let mut bind_type = 0u8;
    let mut address = u64::MAX;
    let mut addend = 0i64;
    let mut seg_start = 0u64;
    let mut seg_end = 0u64;
    let mut have_seg = false;

    for (rec_i, rec) in info.iter().enumerate() {
        if ordinal != i64::from(rec.lib_ordinal) {
            if rec.lib_ordinal <= 0 {
                // Special lookups are encoded as negative numbers.
                mid.push(op(
                    BIND_OPCODE_SET_DYLIB_SPECIAL_IMM,
                    rec.lib_ordinal as u64,
                    0,
                    0,
                ));
            } else {
                mid.push(op(
                    BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB,
                    rec.lib_ordinal as u64,
                    0,
                    0,
                ));
            }
            ordinal = i64::from(rec.lib_ordinal);
        }
        if symbol.is_none_or(|s| info[s].symbol_name != rec.symbol_name) {
            mid.push(op(
                BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM,
                u64::from(rec.flags),
                0,
                rec_i,
            ));
            symbol = Some(rec_i);
        }
        if bind_type != rec.bind_type {
            mid.push(op(BIND_OPCODE_SET_TYPE_IMM, u64::from(rec.bind_type), 0, 0));
            bind_type = rec.bind_type;
        }
        if address != rec.address {
            if rec.address < seg_start || rec.address >= seg_end || !have_seg {
                let (seg_index, vmaddr) = find_segment(segments, rec.address)?;
                seg_start = vmaddr;
                seg_end = vmaddr + segments[seg_index].1;
                have_seg = true;
                mid.push(op(
                    BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB,
                    seg_index as u64,
                    rec.address - seg_start,
                    0,
                ));
            } else {
                mid.push(op(BIND_OPCODE_ADD_ADDR_ULEB, rec.address - address, 0, 0));
            }
            address = rec.address;
        }
        if addend != rec.addend {
            mid.push(op(BIND_OPCODE_SET_ADDEND_SLEB, rec.addend as u64, 0, 0));
            addend = rec.addend;
        }
        mid.push(op(BIND_OPCODE_DO_BIND, 0, 0, 0));
        address += ptr_size;
    }
    mid.push(op(BIND_OPCODE_DONE, 0, 0, 0));

    // Phase 1: combine bind/add pairs.
    let mut out: Vec<TmpOp> = Vec::with_capacity(mid.len());
    let mut i = 0;
    while mid[i].opcode != BIND_OPCODE_DONE {
        if mid[i].opcode == BIND_OPCODE_DO_BIND
            && mid[i + 1].opcode == BIND_OPCODE_ADD_ADDR_ULEB
        {
            out.push(op(
                BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB,
                mid[i + 1].operand1,
                0,
                0,
            ));
            i += 2;
        } else {
            out.push(mid[i]);
            i += 1;
        }
    }
    out.push(op(BIND_OPCODE_DONE, 0, 0, 0));
    let mid = out;

    // Phase 2: compress constant-stride runs.
    let mut out: Vec<TmpOp> = Vec::with_capacity(mid.len());
    let mut i = 0;
    while mid[i].opcode != BIND_OPCODE_DONE {
        let delta = mid[i].operand1;
        if mid[i].opcode == BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB
            && mid[i + 1].opcode == BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB
            && mid[i + 1].operand1 == delta
        {
            let mut run = op(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB, 0, delta, 0);
            while mid[i].opcode == BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB && mid[i].operand1 == delta {
                run.operand1 += 1;
                i += 1;
            }
            out.push(run);
        } else {
            out.push(mid[i]);
            i += 1;
        }
    }
    out.push(op(BIND_OPCODE_DONE, 0, 0, 0));
    let mut mid = out;

    // Phase 3: immediate encodings.
    for p in &mut mid {
        if p.opcode == BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB
            && p.operand1 < 15 * ptr_size
            && p.operand1 % ptr_size == 0
        {
            p.opcode = BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED;
            p.operand1 /= ptr_size;
        } else if p.opcode == BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB && p.operand1 <= 15 {
            p.opcode = BIND_OPCODE_SET_DYLIB_ORDINAL_IMM;
        }
    }

    let mut encoded = Vec::with_capacity(info.len() * 2);
    for p in &mid {
        match p.opcode {
            BIND_OPCODE_DONE => break,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                encoded.push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | p.operand1 as u8);
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                encoded.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                append_uleb128(&mut encoded, p.operand1);
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                encoded
                    .push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (p.operand1 as u8 & BIND_IMMEDIATE_MASK));
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                encoded.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | p.operand1 as u8);
                encoded.extend_from_slice(info[p.name].symbol_name.as_bytes());
                encoded.push(0);
            }
            BIND_OPCODE_SET_TYPE_IMM => {
                encoded.push(BIND_OPCODE_SET_TYPE_IMM | p.operand1 as u8);
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                encoded.push(BIND_OPCODE_SET_ADDEND_SLEB);
                append_sleb128(&mut encoded, p.operand1 as i64);
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                encoded.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | p.operand1 as u8);
                append_uleb128(&mut encoded, p.operand2);
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                encoded.push(BIND_OPCODE_ADD_ADDR_ULEB);
                append_uleb128(&mut encoded, p.operand1);
            }
            BIND_OPCODE_DO_BIND => encoded.push(BIND_OPCODE_DO_BIND),
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                encoded.push(BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB);
                append_uleb128(&mut encoded, p.operand1);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                encoded.push(BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED | p.operand1 as u8);
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                encoded.push(BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB);
                append_uleb128(&mut encoded, p.operand1);
                append_uleb128(&mut encoded, p.operand2);
            }
            _ => {}
        }
    }
    encoded.push(BIND_OPCODE_DONE);

    let pad = crate::layout::align(encoded.len() as u64, ptr_size) as usize - encoded.len();
    encoded.extend(std::iter::repeat_n(0u8, pad));
    Ok(encoded)
}

/// Decodes a rebase stream back into its site addresses; the inverse of
/// `encode_rebase` for the test suite.
pub fn decode_rebase(stream: &[u8], segments: &[(u64, u64)], ptr_size: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;

    let addr = |seg: usize, off: u64| segments.get(seg).map(|&(vmaddr, _)| vmaddr + off);

    while pos < stream.len() {
        let byte = stream[pos];
        let opcode = byte & REBASE_OPCODE_MASK;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        pos += 1;
        match opcode {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {}
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb128(stream, &mut pos).unwrap_or(0);
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                seg_offset = seg_offset.wrapping_add(read_uleb128(stream, &mut pos).unwrap_or(0));
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                seg_offset += u64::from(imm) * ptr_size;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    if let Some(a) = addr(seg_index, seg_offset) {
                        out.push(a);
                    }
                    seg_offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb128(stream, &mut pos).unwrap_or(0);
                for _ in 0..count {
                    if let Some(a) = addr(seg_index, seg_offset) {
                        out.push(a);
                    }
                    seg_offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                if let Some(a) = addr(seg_index, seg_offset) {
                    out.push(a);
                }
                seg_offset += read_uleb128(stream, &mut pos).unwrap_or(0) + ptr_size;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(stream, &mut pos).unwrap_or(0);
                let skip = read_uleb128(stream, &mut pos).unwrap_or(0);
                for _ in 0..count {
                    if let Some(a) = addr(seg_index, seg_offset) {
                        out.push(a);
                    }
                    seg_offset += skip + ptr_size;
                }
            }
            _ => break,
        }
    }
    out
}

/// Decodes a bind stream into `(address, symbol, ordinal)` triples; the
/// inverse of `encode_binding` for the test suite.
pub fn decode_binding(
    stream: &[u8],
    segments: &[(u64, u64)],
    ptr_size: u64,
) -> Vec<(u64, String, i32)> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut ordinal = 0i32;
    let mut symbol = String::new();

    let addr = |seg: usize, off: u64| segments.get(seg).map(|&(vmaddr, _)| vmaddr + off);

    while pos < stream.len() {
        let byte = stream[pos];
        let opcode = byte & crate::layout::BIND_OPCODE_MASK;
        let imm = byte & BIND_IMMEDIATE_MASK;
        pos += 1;
        match opcode {
            BIND_OPCODE_DONE => break,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = i32::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                ordinal = read_uleb128(stream, &mut pos).unwrap_or(0) as i32;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if imm == 0 {
                    0
                } else {
                    i32::from((crate::layout::BIND_OPCODE_MASK | imm) as i8)
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let nul = stream[pos..].iter().position(|&b| b == 0).unwrap_or(0);
                symbol = String::from_utf8_lossy(&stream[pos..pos + nul]).into_owned();
                pos += nul + 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                let _ = read_sleb128(stream, &mut pos);
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb128(stream, &mut pos).unwrap_or(0);
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                seg_offset = seg_offset.wrapping_add(read_uleb128(stream, &mut pos).unwrap_or(0));
            }
            BIND_OPCODE_DO_BIND => {
                if let Some(a) = addr(seg_index, seg_offset) {
                    out.push((a, symbol.clone(), ordinal));
                }
                seg_offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                if let Some(a) = addr(seg_index, seg_offset) {
                    out.push((a, symbol.clone(), ordinal));
                }
                seg_offset += read_uleb128(stream, &mut pos).unwrap_or(0) + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                if let Some(a) = addr(seg_index, seg_offset) {
                    out.push((a, symbol.clone(), ordinal));
                }
                seg_offset += u64::from(imm) * ptr_size + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(stream, &mut pos).unwrap_or(0);
                let skip = read_uleb128(stream, &mut pos).unwrap_or(0);
                for _ in 0..count {
                    if let Some(a) = addr(seg_index, seg_offset) {
                        out.push((a, symbol.clone(), ordinal));
                    }
                    seg_offset += skip + ptr_size;
                }
            }
            _ => break,
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const SEGMENTS: &[(u64, u64)] = &[(0x1000, 0x1000), (0x2000, 0x2000)];

    #[test]
    fn rebase_round_trip_contiguous_run() {
        let addrs: Vec<u64> = (0..10).map(|i| 0x2000 + i * 8).collect();
        let stream = encode_rebase(&addrs, SEGMENTS, 8).unwrap();
        assert_eq!(decode_rebase(&stream, SEGMENTS, 8), addrs);
        // A contiguous run must collapse to a handful of opcodes.
        assert!(stream.len() <= 8, "stream was {} bytes", stream.len());
    }

    #[test]
    fn rebase_round_trip_constant_stride() {
        let addrs: Vec<u64> = (0..8).map(|i| 0x2000 + i * 0x20).collect();
        let stream = encode_rebase(&addrs, SEGMENTS, 8).unwrap();
        assert_eq!(decode_rebase(&stream, SEGMENTS, 8), addrs);
    }

    #[test]
    fn rebase_rejects_address_outside_segments() {
        assert!(matches!(
            encode_rebase(&[0x9000_0000], SEGMENTS, 8),
            Err(EncodeError::AddressOutsideSegments(_))
        ));
    }

    #[test]
    fn binding_round_trip() {
        let mut info = vec![
            BindingEntry {
                bind_type: 1,
                flags: 0,
                lib_ordinal: 2,
                symbol_name: "_malloc".into(),
                address: 0x2000,
                addend: 0,
            },
            BindingEntry {
                bind_type: 1,
                flags: 0,
                lib_ordinal: 1,
                symbol_name: "_free".into(),
                address: 0x2008,
                addend: 0,
            },
            BindingEntry {
                bind_type: 1,
                flags: 0,
                lib_ordinal: 2,
                symbol_name: "_malloc".into(),
                address: 0x2010,
                addend: 0,
            },
        ];
        let stream = encode_binding(&mut info, SEGMENTS, 8).unwrap();
        let mut decoded = decode_binding(&stream, SEGMENTS, 8);
        decoded.sort();

        let mut expected = vec![
            (0x2000u64, "_malloc".to_owned(), 2),
            (0x2008, "_free".to_owned(), 1),
            (0x2010, "_malloc".to_owned(), 2),
        ];
        expected.sort();
        assert_eq!(decoded, expected);
    }
}

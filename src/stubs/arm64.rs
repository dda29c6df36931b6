//! arm64/arm64e stub recognition and repair.
//!
//! Stub shapes are matched by masked-instruction-word equality against the
//! original cache bytes; a full disassembler is never needed for the fixed
//! sequences the cache builder emits.

use crate::accelerator::Accelerator;
use crate::cache::DyldCache;
use crate::slide::PointerTracker;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum StubFormat {
    /// Non optimized stub with a symbol pointer and a stub helper.
    StubNormal,
    /// Optimized stub that branches straight into another image.
    StubOptimized,
    /// Non optimized auth stub with a symbol pointer.
    AuthStubNormal,
    /// Optimized auth stub with a branch to a function.
    AuthStubOptimized,
    /// Non optimized auth stub with a symbol pointer and a resolver.
    AuthStubResolver,
    /// A special stub helper that branches to an in-image function.
    Resolver,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolverData {
    pub target_func: u64,
    pub target_ptr: u64,
    pub size: u64,
}

pub fn sign_extend(value: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

/// Reader and writer for the arm64 stub shapes. Instruction words are read
/// from the cache mapping, which still holds the pre-fix bytes.
pub struct Arm64Utils<'a> {
    cache: &'a DyldCache,
    is_64: bool,
}

impl<'a> Arm64Utils<'a> {
    pub fn new(cache: &'a DyldCache, is_64: bool) -> Self {
        Arm64Utils { cache, is_64 }
    }

    fn instrs<const N: usize>(&self, addr: u64) -> Option<[u32; N]> {
        let bytes = self.cache.read_at(addr, N * 4)?;
        let mut out = [0u32; N];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(out)
    }

    fn adrp_result(addr: u64, adrp: u32) -> u64 {
        let immlo = u64::from(adrp & 0x6000_0000) >> 29;
        let immhi = u64::from(adrp & 0x00ff_ffe0) >> 3;
        let imm = sign_extend((immhi | immlo) << 12, 33);
        ((addr & !0xfff) as i64 + imm) as u64
    }

    fn ldr_offset(ldr: u32) -> u64 {
        let scale = ldr >> 30;
        u64::from((ldr & 0x003f_fc00) >> (10 - scale))
    }

    /// The dyld_stub_binder preamble at the start of `__stub_helper`:
    /// adrp x17 / add x17 / stp x16,x17 / adrp x16 / ldr x16 / br x16.
    pub fn is_stub_binder(&self, addr: u64) -> bool {
        let Some([adrp, add, stp, adrp2, ldr, br]) = self.instrs::<6>(addr) else {
            return false;
        };
        adrp & 0x9f00_0000 == 0x9000_0000
            && add & 0xffc0_0000 == 0x9100_0000
            && stp & 0x7fc0_0000 == 0x2980_0000
            && adrp2 & 0x9f00_0000 == 0x9000_0000
            && ldr & 0xbfc0_0000 == 0xb940_0000
            && br == 0xd61f_0200
    }

    /// A regular lazy-binding helper: `ldr w16, [pc+8]; b binder; .word off`.
    /// Returns the embedded lazy-bind-info offset.
    pub fn stub_helper_data(&self, addr: u64) -> Option<u32> {
        let [ldr, b, data] = self.instrs::<3>(addr)?;
        if ldr & 0xbf00_0000 != 0x1800_0000 || b & 0xfc00_0000 != 0x1400_0000 {
            return None;
        }
        Some(data)
    }

    /// A resolver helper executes a function and stores the result into an
    /// image-local pointer. Formats vary across caches; the shape is
    /// verified loosely: stp/mov prologue, a bl in the middle with
    /// adrp/add/str directly after, ldp before the final braaz.
    pub fn resolver_data(&self, addr: u64) -> Option<ResolverData> {
        const SEARCH_LIMIT: usize = 50;
        let words = self.instrs::<SEARCH_LIMIT>(addr)?;

        let stp = words[0];
        let mov = words[1];
        if stp & 0x7fc0_0000 != 0x2980_0000 || mov & 0x7f3f_fc00 != 0x1100_0000 {
            return None;
        }

        let braaz_i = (2..SEARCH_LIMIT).find(|&i| words[i] & 0xfe9f_f000 == 0xd61f_0000)?;
        let bl_i = (2..braaz_i).find(|&i| words[i] & 0xfc00_0000 == 0x9400_0000)?;

        let ldp = words[braaz_i - 1];
        let adrp = *words.get(bl_i + 1)?;
        let add = *words.get(bl_i + 2)?;
        let str_i = *words.get(bl_i + 3)?;
        if ldp & 0x7fc0_0000 != 0x28c0_0000
            || adrp & 0x9f00_001f != 0x9000_0010
            || add & 0xffc0_0000 != 0x9100_0000
            || str_i & 0xbfc0_0000 != 0xb900_0000
        {
            return None;
        }

        let bl_imm = sign_extend(u64::from(words[bl_i] & 0x03ff_ffff) << 2, 28);
        let target_func = (addr as i64 + (bl_i as i64 * 4) + bl_imm) as u64;

        let adrp_result = Self::adrp_result(addr, adrp);
        let add_result = adrp_result + u64::from((add & 0x003f_fc00) >> 10);
        let scale = str_i >> 30;
        let str_imm = u64::from((str_i & 0x003f_fc00) >> (10 - scale));
        let target_ptr = add_result + str_imm;

        Some(ResolverData {
            target_func,
            target_ptr,
            size: (braaz_i as u64 * 4) + 4,
        })
    }

    /// `adrp x16; ldr x16, [x16, off]; br x16`: the pointer address loaded
    /// through, without following the pointer.
    pub fn stub_ldr_addr(&self, addr: u64) -> Option<u64> {
        let [adrp, ldr, br] = self.instrs::<3>(addr)?;
        if adrp & 0x9f00_001f != 0x9000_0010
            || ldr & 0xbfc0_03ff != 0xb940_0210
            || br != 0xd61f_0200
        {
            return None;
        }
        Some(Self::adrp_result(addr, adrp) + Self::ldr_offset(ldr))
    }

    /// `adrp x17; add x17; ldr x16, [x17]; braa x16, x17`: the pointer
    /// address of a normal auth stub.
    pub fn auth_stub_ldr_addr(&self, addr: u64) -> Option<u64> {
        let [adrp, add, ldr, braa] = self.instrs::<4>(addr)?;
        if adrp & 0x9f00_0000 != 0x9000_0000
            || add & 0xffc0_0000 != 0x9100_0000
            || ldr & 0xbfc0_0000 != 0xb940_0000
            || braa & 0xfeff_f800 != 0xd61f_0800
        {
            return None;
        }
        let add_result = Self::adrp_result(addr, adrp) + u64::from((add & 0x003f_fc00) >> 10);
        Some(add_result + Self::ldr_offset(ldr))
    }

    fn stub_normal_target(&self, tracker: &PointerTracker<'_>, addr: u64) -> Option<u64> {
        let ldr_target = self.stub_ldr_addr(addr)?;
        Some(tracker.slide(ldr_target))
    }

    fn stub_optimized_target(&self, addr: u64) -> Option<u64> {
        // adrp x16; add x16, x16, off; br x16
        let [adrp, add, br] = self.instrs::<3>(addr)?;
        if adrp & 0x9f00_001f != 0x9000_0010
            || add & 0xffc0_03ff != 0x9100_0210
            || br != 0xd61f_0200
        {
            return None;
        }
        Some(Self::adrp_result(addr, adrp) + u64::from((add & 0x003f_fc00) >> 10))
    }

    fn auth_stub_normal_target(&self, tracker: &PointerTracker<'_>, addr: u64) -> Option<u64> {
        let ldr_target = self.auth_stub_ldr_addr(addr)?;
        Some(tracker.slide(ldr_target))
    }

    fn auth_stub_optimized_target(&self, addr: u64) -> Option<u64> {
        // adrp x16; add x16; br x16; trap
        let [adrp, add, br, trap] = self.instrs::<4>(addr)?;
        if adrp & 0x9f00_0000 != 0x9000_0000
            || add & 0xffc0_0000 != 0x9100_0000
            || br != 0xd61f_0200
            || trap != 0xd420_0020
        {
            return None;
        }
        Some(Self::adrp_result(addr, adrp) + u64::from((add & 0x003f_fc00) >> 10))
    }

    fn auth_stub_resolver_target(&self, tracker: &PointerTracker<'_>, addr: u64) -> Option<u64> {
        // adrp x16; ldr x16; braaz x16
        let [adrp, ldr, braaz] = self.instrs::<3>(addr)?;
        if adrp & 0x9f00_0000 != 0x9000_0000
            || ldr & 0xbfc0_0000 != 0xb940_0000
            || braaz & 0xfeff_f800 != 0xd61f_0800
        {
            return None;
        }
        let ldr_target = Self::adrp_result(addr, adrp) + Self::ldr_offset(ldr);
        Some(tracker.slide(ldr_target))
    }

    /// Identifies the stub shape at `addr` and its immediate target.
    pub fn resolve_stub(
        &self,
        tracker: &PointerTracker<'_>,
        addr: u64,
    ) -> Option<(u64, StubFormat)> {
        if let Some(t) = self.stub_normal_target(tracker, addr) {
            return Some((t, StubFormat::StubNormal));
        }
        if let Some(t) = self.stub_optimized_target(addr) {
            return Some((t, StubFormat::StubOptimized));
        }
        if let Some(t) = self.auth_stub_normal_target(tracker, addr) {
            return Some((t, StubFormat::AuthStubNormal));
        }
        if let Some(t) = self.auth_stub_optimized_target(addr) {
            return Some((t, StubFormat::AuthStubOptimized));
        }
        if let Some(t) = self.auth_stub_resolver_target(tracker, addr) {
            return Some((t, StubFormat::AuthStubResolver));
        }
        if let Some(r) = self.resolver_data(addr) {
            return Some((r.target_func, StubFormat::Resolver));
        }
        None
    }

    /// Follows a chain of stubs to its final target, memoized across
    /// extractions.
    pub fn resolve_stub_chain(
        &self,
        tracker: &PointerTracker<'_>,
        accel: &mut Accelerator,
        addr: u64,
    ) -> u64 {
        if let Some(&target) = accel.resolved_chains.get(&addr) {
            return target;
        }

        let mut target = addr;
        while let Some((next, _)) = self.resolve_stub(tracker, target) {
            if next == target {
                break;
            }
            target = next;
        }

        accel.resolved_chains.insert(addr, target);
        target
    }

    /// Every node of a stub chain, for walking back up when the final
    /// target cannot be symbolized.
    pub fn resolve_stub_chain_extended(
        &self,
        tracker: &PointerTracker<'_>,
        addr: u64,
    ) -> Vec<(u64, StubFormat)> {
        let mut chain = Vec::new();
        let mut target = addr;
        while let Some(node) = self.resolve_stub(tracker, target) {
            if node.0 == target {
                break;
            }
            chain.push(node);
            target = node.0;
        }
        chain
    }

    /// Emits the normal stub shape loading through `ldr_addr`.
    pub fn write_normal_stub(&self, loc: &mut [u8], stub_addr: u64, ldr_addr: u64) {
        write_normal_stub(self.is_64, loc, stub_addr, ldr_addr)
    }

    /// Emits the normal auth stub shape loading through `ldr_addr`.
    pub fn write_normal_auth_stub(&self, loc: &mut [u8], stub_addr: u64, ldr_addr: u64) {
        write_normal_auth_stub(loc, stub_addr, ldr_addr)
    }
}

pub fn write_normal_stub(is_64: bool, loc: &mut [u8], stub_addr: u64, ldr_addr: u64) {
    let adrp_delta = (ldr_addr & !0xfff) as i64 - (stub_addr & !0xfff) as i64;
    let immhi = ((adrp_delta >> 9) as u32) & 0x00ff_ffe0;
    let immlo = ((adrp_delta << 17) as u32) & 0x6000_0000;
    let adrp = 0x9000_0010 | immlo | immhi;

    let ldr_pageoff = ldr_addr & 0xfff;
    let ldr = if is_64 {
        // LDR X16, [X16, lp@pageoff]
        0xf940_0210 | (((ldr_pageoff as u32) << 7) & 0x003f_fc00)
    } else {
        // LDR W16, [X16, lp@pageoff]
        0xb940_0210 | (((ldr_pageoff as u32) << 8) & 0x003f_fc00)
    };

    loc[0..4].copy_from_slice(&adrp.to_le_bytes());
    loc[4..8].copy_from_slice(&ldr.to_le_bytes());
    loc[8..12].copy_from_slice(&0xd61f_0200u32.to_le_bytes());
}

pub fn write_normal_auth_stub(loc: &mut [u8], stub_addr: u64, ldr_addr: u64) {
    let adrp_delta = (ldr_addr & !0xfff) as i64 - (stub_addr & !0xfff) as i64;
    let immhi = ((adrp_delta >> 9) as u32) & 0x00ff_ffe0;
    let immlo = ((adrp_delta << 17) as u32) & 0x6000_0000;
    let adrp = 0x9000_0011 | immlo | immhi;

    let add_imm = ((ldr_addr & 0xfff) as u32) << 10 & 0x003f_fc00;
    let add = 0x9100_0231 | add_imm;

    loc[0..4].copy_from_slice(&adrp.to_le_bytes());
    loc[4..8].copy_from_slice(&add.to_le_bytes());
    loc[8..12].copy_from_slice(&0xf940_0230u32.to_le_bytes()); // LDR X16, [X17]
    loc[12..16].copy_from_slice(&0xd71f_0a11u32.to_le_bytes()); // BRAA X16, X17
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_extend_widths() {
        assert_eq!(sign_extend(0x3ff_fffc << 2, 28), -16);
        assert_eq!(sign_extend(0x10, 28), 0x10);
        assert_eq!(sign_extend(0x1_ffff_f000, 33), -0x1000);
    }

    #[test]
    fn normal_stub_round_trips_through_recognizer() {
        // Write a normal stub, then decode its pointer address with the
        // same masks the scanner uses.
        let stub_addr = 0x1_0000_4000u64;
        let ldr_addr = 0x1_0001_0008u64;
        let mut buf = [0u8; 12];
        write_normal_stub(true, &mut buf, stub_addr, ldr_addr);

        let adrp = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let ldr = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let br = u32::from_le_bytes(buf[8..12].try_into().unwrap());

        assert_eq!(adrp & 0x9f00_001f, 0x9000_0010);
        assert_eq!(ldr & 0xbfc0_03ff, 0xb940_0210);
        assert_eq!(br, 0xd61f_0200);

        let decoded = Arm64Utils::adrp_result(stub_addr, adrp) + Arm64Utils::ldr_offset(ldr);
        assert_eq!(decoded, ldr_addr);
    }
}

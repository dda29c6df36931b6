//! armv7 stub recognition and repair: the PIC `__picsymbolstub4` indirect
//! form, the optimized `__picsymbolstub5` direct form and the resolver
//! helper.

use crate::accelerator::Accelerator;
use crate::cache::DyldCache;
use crate::slide::PointerTracker;

use super::arm64::sign_extend;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StubFormat {
    /// `__picsymbolstub4`, loads through an in-image pointer.
    NormalV4,
    /// `__picsymbolstub5`, pc-relative jump straight into another image.
    OptimizedV5,
    /// `__stub_helper` resolver.
    Resolver,
}

#[derive(Clone, Copy, Debug)]
pub struct ResolverData {
    pub target_func: u64,
    pub target_ptr: u64,
    pub size: u64,
}

pub struct ArmUtils<'a> {
    cache: &'a DyldCache,
}

impl<'a> ArmUtils<'a> {
    pub fn new(cache: &'a DyldCache) -> Self {
        ArmUtils { cache }
    }

    fn instrs<const N: usize>(&self, addr: u64) -> Option<[u32; N]> {
        let bytes = self.cache.read_at(addr & !3, N * 4)?;
        let mut out = [0u32; N];
        for (i, chunk) in bytes.chunks_exact(4).enumerate() {
            out[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        Some(out)
    }

    /// The dyld_stub_binder preamble: two str/ldr/add groups ending in an
    /// `ldr pc, [r12]`, followed by two data words.
    pub fn stub_binder_info(&self, addr: u64) -> Option<u64> {
        let [str1, ldr1, add1, str2, ldr2, add2, ldr3] = self.instrs::<7>(addr)?;
        if str1 != 0xe52d_c004
            || ldr1 != 0xe59f_c010
            || add1 != 0xe08f_c00c
            || str2 != 0xe52d_c004
            || ldr2 != 0xe59f_c008
            || add2 != 0xe08f_c00c
            || ldr3 != 0xe59c_f000
        {
            return None;
        }
        // Size of the binder including its embedded data words.
        Some(0x24)
    }

    /// A regular lazy-binding helper: `ldr r12, [pc]; b binder; .word off`.
    pub fn stub_helper_data(&self, addr: u64) -> Option<u32> {
        let [ldr, b, data] = self.instrs::<3>(addr)?;
        if ldr != 0xe59f_c000 || b & 0x0f00_0000 != 0x0a00_0000 {
            return None;
        }
        Some(data)
    }

    /// An arm resolver stores its result into an image-local pointer:
    /// `stmdb sp!; blx func; ... str r0, [ip]; ... ldmia sp!; bx ip`.
    pub fn resolver_data(&self, addr: u64) -> Option<ResolverData> {
        const SEARCH_LIMIT: usize = 32;
        let words = self.instrs::<SEARCH_LIMIT>(addr)?;

        // stmdb sp!, {r0 r1 r2 r3 lr}
        if words[0] != 0xe92d_400f {
            return None;
        }
        // blx imm24
        let blx = words[1];
        if blx & 0xfe00_0000 != 0xfa00_0000 {
            return None;
        }
        let h = u64::from((blx >> 24) & 1) << 1;
        let bl_imm = sign_extend(u64::from(blx & 0x00ff_ffff) << 2, 26);
        let target_func = ((addr & !3) as i64 + 8 + bl_imm) as u64 + h;

        // Find the str r0, [ip] and the final bx.
        let str_i = (2..SEARCH_LIMIT).find(|&i| words[i] == 0xe58c_0000)?;
        let bx_i = (str_i..SEARCH_LIMIT).find(|&i| words[i] == 0xe12f_ff1c)?;

        // The pointer address comes from `ldr ip, [pc, #off]; add ip, pc`
        // directly before the store.
        let ldr = words[str_i - 2];
        if ldr & 0xffff_f000 != 0xe59f_c000 {
            return None;
        }
        let ldr_off = u64::from(ldr & 0xfff);
        let data_addr = (addr & !3) + (str_i as u64 - 2) * 4 + 8 + ldr_off;
        let data = u64::from(self.cache.read_u32_at(data_addr)?);
        let add_pc = (addr & !3) + (str_i as u64 - 1) * 4 + 8;
        let target_ptr = add_pc.wrapping_add(data);

        Some(ResolverData {
            target_func,
            target_ptr,
            size: (bx_i as u64 + 1) * 4,
        })
    }

    /// The pointer address a normal v4 stub loads through.
    pub fn normal_v4_ldr_addr(&self, addr: u64) -> Option<u64> {
        let plain = addr & !3;
        let [ldr, add, ldr2, data] = self.instrs::<4>(plain)?;
        if ldr != 0xe59f_c004 || add != 0xe08f_c00c || ldr2 != 0xe59c_f000 {
            return None;
        }
        Some(plain + 12 + u64::from(data))
    }

    fn normal_v4_target(&self, tracker: &PointerTracker<'_>, addr: u64) -> Option<u64> {
        self.normal_v4_ldr_addr(addr).map(|p| tracker.slide(p))
    }

    fn optimized_v5_target(&self, addr: u64) -> Option<u64> {
        let plain = addr & !3;
        let [ldr, add, data, trap] = self.instrs::<4>(plain)?;
        if ldr != 0xe59f_c000 || add != 0xe08f_f00c || trap != 0xe7ff_defe {
            return None;
        }
        Some(plain + 12 + u64::from(data))
    }

    pub fn resolve_stub(
        &self,
        tracker: &PointerTracker<'_>,
        addr: u64,
    ) -> Option<(u64, StubFormat)> {
        if let Some(t) = self.normal_v4_target(tracker, addr) {
            return Some((t, StubFormat::NormalV4));
        }
        if let Some(t) = self.optimized_v5_target(addr) {
            return Some((t, StubFormat::OptimizedV5));
        }
        if let Some(r) = self.resolver_data(addr) {
            return Some((r.target_func, StubFormat::Resolver));
        }
        None
    }

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
}

/// Emits the normal v4 shape: `ldr ip, [pc, #4]; add ip, pc, ip;
/// ldr pc, [ip]; .word ldr_addr - stub - 12`.
pub fn write_normal_v4_stub(loc: &mut [u8], stub_addr: u64, ldr_addr: u64) {
    loc[0..4].copy_from_slice(&0xe59f_c004u32.to_le_bytes());
    loc[4..8].copy_from_slice(&0xe08f_c00cu32.to_le_bytes());
    loc[8..12].copy_from_slice(&0xe59c_f000u32.to_le_bytes());
    let data = (ldr_addr as i64 - stub_addr as i64 - 12) as i32;
    loc[12..16].copy_from_slice(&data.to_le_bytes());
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normal_v4_stub_encodes_relative_pointer() {
        let mut buf = [0u8; 16];
        write_normal_v4_stub(&mut buf, 0x7000, 0x9000);
        let data = i32::from_le_bytes(buf[12..16].try_into().unwrap());
        assert_eq!(data, 0x9000 - 0x7000 - 12);
        assert_eq!(
            u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            0xe59f_c004
        );
    }
}

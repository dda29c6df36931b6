//! The atom arena for Objective-C structures.
//!
//! Every distinct source address becomes one atom holding its raw payload
//! plus typed fixups into that payload. The class graph has cycles (class to
//! metaclass to root class), so atoms are interned before their children are
//! walked; back-edges resolve to the already-allocated atom and are written
//! during propagation.

use std::collections::HashMap;

use crate::symbols::SharedSymbols;

pub type AtomId = usize;

/// Placement group of an atom. Groups are packed into the extra region in
/// this declared order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomKind {
    Class,
    ClassData,
    SmallMethodList,
    LargeMethodList,
    ProtocolList,
    PropertyList,
    IvarList,
    ExtendedMethodTypes,
    Protocol,
    Category,
    /// A synthesized selector-reference slot for a small method.
    SelRef,
    String,
    IvarLayout,
    IvarOffset,
    /// A function implementation; never moved, never written.
    Imp,
}

impl AtomKind {
    /// Variable-length payloads are byte-packed in the extra region.
    pub fn byte_packed(self) -> bool {
        matches!(self, AtomKind::String | AtomKind::IvarLayout | AtomKind::IvarOffset)
    }

    /// Selector references always move to the extra region so each small
    /// method owns a pointer it can reach with a 32-bit offset.
    pub fn force_extra(self) -> bool {
        self == AtomKind::SelRef
    }
}

/// How a payload field relates to another atom.
#[derive(Clone, Debug)]
pub enum FixKind {
    /// Pointer-sized field holding the referent's final address.
    Ptr(Option<AtomId>),
    /// Pointer-sized field that is either a bind (written as 0) or a
    /// reference.
    BindPtr {
        target: Option<AtomId>,
        bind: Option<SharedSymbols>,
    },
    /// 32-bit offset relative to the field's own final address.
    Rel32(Option<AtomId>),
    /// Pointer-sized field with flag bits in its low bits that must ride
    /// along with the relocated address (the class `data` word).
    PtrBits { target: Option<AtomId>, bits: u64 },
}

#[derive(Clone, Debug)]
pub struct Fixup {
    /// Byte offset of the field within the payload.
    pub offset: u64,
    pub kind: FixKind,
}

#[derive(Debug)]
pub struct Atom {
    pub kind: AtomKind,
    pub source_addr: u64,
    pub payload: Vec<u8>,
    pub fixups: Vec<Fixup>,
    pub final_addr: Option<u64>,
    /// Whether the final placement is at the original in-image address.
    pub placed_in_image: bool,
}

impl Atom {
    pub fn final_addr(&self) -> u64 {
        self.final_addr.expect("atom address assigned during placement")
    }
}

#[derive(Default)]
pub struct AtomArena {
    nodes: Vec<Atom>,
    by_addr: HashMap<(AtomKind, u64), AtomId>,
}

impl AtomArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, kind: AtomKind, addr: u64) -> Option<AtomId> {
        self.by_addr.get(&(kind, addr)).copied()
    }

    /// Interns a fresh atom. The caller must have checked `lookup` first;
    /// interning happens before children are walked so cycles terminate.
    pub fn insert(&mut self, kind: AtomKind, source_addr: u64, payload: Vec<u8>) -> AtomId {
        let id = self.nodes.len();
        self.nodes.push(Atom {
            kind,
            source_addr,
            payload,
            fixups: Vec::new(),
            final_addr: None,
            placed_in_image: false,
        });
        self.by_addr.insert((kind, source_addr), id);
        id
    }

    pub fn get(&self, id: AtomId) -> &Atom {
        &self.nodes[id]
    }

    pub fn get_mut(&mut self, id: AtomId) -> &mut Atom {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (AtomId, &Atom)> {
        self.nodes.iter().enumerate()
    }

    /// Ids of one placement group, in source-address order so placement is
    /// deterministic.
    pub fn ids_of_kind(&self, kind: AtomKind) -> Vec<AtomId> {
        let mut ids: Vec<AtomId> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, a)| a.kind == kind)
            .map(|(i, _)| i)
            .collect();
        ids.sort_by_key(|&i| self.nodes[i].source_addr);
        ids
    }
}

/// A pointer slot in one of the `__objc_*` sections, re-registered after
/// placement.
#[derive(Debug)]
pub struct SectionPointer {
    pub addr: u64,
    pub target: Option<AtomId>,
    pub bind: Option<SharedSymbols>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interning_breaks_cycles() {
        let mut arena = AtomArena::new();
        let a = arena.insert(AtomKind::Class, 0x1000, vec![0; 40]);
        // A back-edge to the same source address resolves to the same atom.
        assert_eq!(arena.lookup(AtomKind::Class, 0x1000), Some(a));
        // The same address under a different kind is a different atom.
        assert_eq!(arena.lookup(AtomKind::ClassData, 0x1000), None);
    }

    #[test]
    fn kind_order_is_deterministic() {
        let mut arena = AtomArena::new();
        arena.insert(AtomKind::String, 0x3000, b"b\0".to_vec());
        arena.insert(AtomKind::String, 0x1000, b"a\0".to_vec());
        arena.insert(AtomKind::Class, 0x2000, vec![0; 40]);
        let strings = arena.ids_of_kind(AtomKind::String);
        assert_eq!(
            strings
                .iter()
                .map(|&i| arena.get(i).source_addr)
                .collect::<Vec<_>>(),
            vec![0x1000, 0x3000]
        );
    }
}

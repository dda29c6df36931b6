//! The symbol-table tracker: a string pool with stable handles plus the
//! four symbol buckets the rebuilt dynamic symbol table is written from.

use std::collections::HashMap;

use crate::layout::{Nlist32, Nlist64};

/// Width-independent nlist entry; written as `nlist`/`nlist_64` per arch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Nlist {
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

impl Nlist {
    pub fn encode_64(&self, n_strx: u32) -> Nlist64 {
        Nlist64 {
            n_strx,
            n_type: self.n_type,
            n_sect: self.n_sect,
            n_desc: self.n_desc,
            n_value: self.n_value,
        }
    }

    pub fn encode_32(&self, n_strx: u32) -> Nlist32 {
        Nlist32 {
            n_strx,
            n_type: self.n_type,
            n_sect: self.n_sect,
            n_desc: self.n_desc,
            n_value: self.n_value as u32,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SymbolBucket {
    Other,
    Local,
    External,
    Undefined,
}

/// Stable handle to an interned string.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StringRef(usize);

/// A symbol's identity: its bucket plus the index within that bucket.
pub type SymbolIndex = (SymbolBucket, u32);

#[derive(Default)]
pub struct SymbolTableTracker {
    strings: Vec<String>,
    interned: HashMap<String, StringRef>,
    other: Vec<(StringRef, Nlist)>,
    local: Vec<(StringRef, Nlist)>,
    external: Vec<(StringRef, Nlist)>,
    undefined: Vec<(StringRef, Nlist)>,
    /// Entries reference symbols by bucket and intra-bucket index.
    pub indirect_syms: Vec<SymbolIndex>,
    redacted: Option<SymbolIndex>,
}

impl SymbolTableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_string(&mut self, s: &str) -> StringRef {
        if let Some(&r) = self.interned.get(s) {
            return r;
        }
        let r = StringRef(self.strings.len());
        self.strings.push(s.to_owned());
        self.interned.insert(s.to_owned(), r);
        r
    }

    pub fn contains_string(&self, s: &str) -> bool {
        self.interned.contains_key(s)
    }

    pub fn string(&self, r: StringRef) -> &str {
        &self.strings[r.0]
    }

    fn bucket(&self, bucket: SymbolBucket) -> &Vec<(StringRef, Nlist)> {
        match bucket {
            SymbolBucket::Other => &self.other,
            SymbolBucket::Local => &self.local,
            SymbolBucket::External => &self.external,
            SymbolBucket::Undefined => &self.undefined,
        }
    }

    pub fn add_sym(&mut self, bucket: SymbolBucket, s: StringRef, sym: Nlist) -> SymbolIndex {
        let list = match bucket {
            SymbolBucket::Other => &mut self.other,
            SymbolBucket::Local => &mut self.local,
            SymbolBucket::External => &mut self.external,
            SymbolBucket::Undefined => &mut self.undefined,
        };
        let index = list.len() as u32;
        list.push((s, sym));
        (bucket, index)
    }

    pub fn symbol(&self, index: SymbolIndex) -> Option<(&str, &Nlist)> {
        self.bucket(index.0)
            .get(index.1 as usize)
            .map(|(s, n)| (self.string(*s), n))
    }

    pub fn bucket_len(&self, bucket: SymbolBucket) -> u32 {
        self.bucket(bucket).len() as u32
    }

    /// Start index of a bucket in the flattened symbol table:
    /// other, local, external, undefined.
    pub fn bucket_start(&self, bucket: SymbolBucket) -> u32 {
        match bucket {
            SymbolBucket::Other => 0,
            SymbolBucket::Local => self.other.len() as u32,
            SymbolBucket::External => (self.other.len() + self.local.len()) as u32,
            SymbolBucket::Undefined => {
                (self.other.len() + self.local.len() + self.external.len()) as u32
            }
        }
    }

    pub fn symbol_count(&self) -> u32 {
        (self.other.len() + self.local.len() + self.external.len() + self.undefined.len()) as u32
    }

    /// Every symbol with its name, in no particular order.
    pub fn all_symbols(&self) -> impl Iterator<Item = (&str, &Nlist)> {
        self.other
            .iter()
            .chain(self.local.iter())
            .chain(self.external.iter())
            .chain(self.undefined.iter())
            .map(|(s, n)| (self.string(*s), n))
    }

    /// The `<redacted>` stand-in for indirect entries whose source symbol
    /// was stripped, created on first use.
    pub fn get_or_make_redacted(&mut self) -> SymbolIndex {
        if let Some(index) = self.redacted {
            return index;
        }
        let s = self.add_string("<redacted>");
        let sym = Nlist {
            n_type: 1,
            ..Nlist::default()
        };
        let index = self.add_sym(SymbolBucket::Other, s, sym);
        self.redacted = Some(index);
        index
    }

    pub fn redacted_index(&self) -> Option<SymbolIndex> {
        self.redacted
    }

    /// Flattens the tracker for write-out. Strings are sorted into a single
    /// null-separated pool with a leading `\0`; every symbol's `n_strx` is
    /// computed against that pool at write time.
    pub fn build(&self) -> BuiltSymbolTable {
        let mut sorted: Vec<&str> = self.strings.iter().map(String::as_str).collect();
        sorted.sort_unstable();

        let mut offsets = HashMap::with_capacity(sorted.len());
        let mut pool = vec![0u8];
        for s in sorted {
            offsets.insert(s, pool.len() as u32);
            pool.extend_from_slice(s.as_bytes());
            pool.push(0);
        }

        let strx = |r: StringRef| offsets[self.strings[r.0].as_str()];
        let mut symbols = Vec::with_capacity(self.symbol_count() as usize);
        for bucket in [&self.other, &self.local, &self.external, &self.undefined] {
            for &(s, nlist) in bucket {
                symbols.push((strx(s), nlist));
            }
        }

        let indirect = self
            .indirect_syms
            .iter()
            .map(|&(bucket, i)| self.bucket_start(bucket) + i)
            .collect();

        BuiltSymbolTable {
            string_pool: pool,
            symbols,
            indirect,
        }
    }
}

/// Write-ready form of the tracker.
pub struct BuiltSymbolTable {
    pub string_pool: Vec<u8>,
    /// `(n_strx, nlist)` in bucket order.
    pub symbols: Vec<(u32, Nlist)>,
    pub indirect: Vec<u32>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_law_strx_and_bucket_ranges() {
        let mut st = SymbolTableTracker::new();
        let a = st.add_string("_alpha");
        let b = st.add_string("_beta");
        let r = st.get_or_make_redacted();
        assert_eq!(r, (SymbolBucket::Other, 0));

        let local = st.add_sym(
            SymbolBucket::Local,
            a,
            Nlist {
                n_type: 0x0e,
                n_value: 0x1000,
                ..Nlist::default()
            },
        );
        let undef = st.add_sym(SymbolBucket::Undefined, b, Nlist::default());
        st.indirect_syms.push(undef);
        st.indirect_syms.push(r);

        let built = st.build();

        // Every emitted n_strx resolves to the symbol's string content.
        for (index, name) in [(local, "_alpha"), (undef, "_beta")] {
            let flat = (st.bucket_start(index.0) + index.1) as usize;
            let (strx, _) = built.symbols[flat];
            let bytes = &built.string_pool[strx as usize..];
            let nul = bytes.iter().position(|&b| b == 0).unwrap();
            assert_eq!(&bytes[..nul], name.as_bytes());
        }

        // Pool leads with a NUL byte.
        assert_eq!(built.string_pool[0], 0);

        // Bucket layout: other=0, local after other, etc.
        assert_eq!(st.bucket_start(SymbolBucket::Other), 0);
        assert_eq!(st.bucket_start(SymbolBucket::Local), 1);
        assert_eq!(st.bucket_start(SymbolBucket::External), 2);
        assert_eq!(st.bucket_start(SymbolBucket::Undefined), 2);

        // Indirect entries are bucket start + intra-bucket index.
        assert_eq!(built.indirect, vec![2, 0]);
    }

    #[test]
    fn strings_are_deduplicated() {
        let mut st = SymbolTableTracker::new();
        let a = st.add_string("_dup");
        let b = st.add_string("_dup");
        assert_eq!(a, b);
    }
}

//! Hierarchical instruction decode tables.
//!
//! Dispatch starts in a primary table indexed by the 7-bit RISC-V opcode.
//! An entry either names a semantic routine directly or redirects into a
//! sub-table keyed on a narrower field (funct3, funct7, or rs2). Tables
//! live in a flat arena and refer to each other by index, so the whole
//! structure can be validated once at construction time. Extensions
//! populate the tables by registering their handlers through
//! [`DecoderBuilder`]; anything left unclaimed decodes as reserved.

use crate::cpu::{Cpu, Trap};

/// Index into the op arena. Index 0 is always the reserved handler.
pub type OpId = usize;
/// Index into the table arena.
pub type TableId = usize;

pub const RESERVED: OpId = 0;

pub type ExecFn = fn(&mut Cpu, &Decoded) -> Result<(), Trap>;
pub type DumpFn = fn(&mut String, &Cpu, &Decoded, u32, bool);

/// A leaf of the decode tree: one mnemonic, its semantic routine, and its
/// disassembly formatter.
pub struct Op {
    pub name: &'static str,
    pub exec: ExecFn,
    pub dump: DumpFn,
}

/// Instruction field a sub-table is keyed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Funct3,
    Funct7,
    Rs2,
}

impl Key {
    const fn len(self) -> usize {
        match self {
            Self::Funct3 => 8,
            Self::Funct7 => 128,
            Self::Rs2 => 32,
        }
    }

    const fn extract(self, word: u32) -> usize {
        match self {
            Self::Funct3 => ((word >> 12) & 0x7) as usize,
            Self::Funct7 => ((word >> 25) & 0x7f) as usize,
            Self::Rs2 => ((word >> 20) & 0x1f) as usize,
        }
    }
}

#[derive(Clone, Copy)]
pub enum Entry {
    Reserved,
    Leaf(OpId),
    Table(TableId),
}

struct Table {
    key: Key,
    entries: Vec<Entry>,
}

/// Builder used by the extension registration functions. `build()` checks
/// every cross reference so a bad registration fails at construction, not
/// in the middle of a run.
pub struct DecoderBuilder {
    ops: Vec<Op>,
    tables: Vec<Table>,
    primary: Vec<Entry>,
}

impl DecoderBuilder {
    pub fn new() -> Self {
        let reserved = Op {
            name: "reserved",
            exec: |cpu, d| Err(cpu.reserved(d)),
            dump: |_s, _cpu, _d, _addr, _eval| {},
        };
        Self {
            ops: vec![reserved],
            tables: Vec::new(),
            primary: vec![Entry::Reserved; 128],
        }
    }

    pub fn op(&mut self, name: &'static str, exec: ExecFn, dump: DumpFn) -> OpId {
        self.ops.push(Op { name, exec, dump });
        self.ops.len() - 1
    }

    pub fn table(&mut self, key: Key) -> TableId {
        self.tables.push(Table {
            key,
            entries: vec![Entry::Reserved; key.len()],
        });
        self.tables.len() - 1
    }

    pub fn primary(&mut self, opcode: usize, entry: Entry) {
        assert!(opcode < 128 && opcode & 3 == 3, "not a 32-bit opcode: {opcode:#x}");
        self.primary[opcode] = entry;
    }

    pub fn set(&mut self, table: TableId, index: usize, entry: Entry) {
        self.tables[table].entries[index] = entry;
    }

    /// Shorthand for a funct3 sub-table entry holding a single leaf.
    pub fn leaf(&mut self, table: TableId, index: usize, op: OpId) {
        self.set(table, index, Entry::Leaf(op));
    }

    /// # Panics
    /// Panics when an entry refers outside the arenas. Registration is
    /// wholly under crate control, so this only fires on a programming
    /// error in an extension's table set-up.
    #[must_use]
    pub fn build(self) -> Decoder {
        for t in &self.tables {
            assert_eq!(t.entries.len(), t.key.len());
        }
        let entries = self
            .primary
            .iter()
            .chain(self.tables.iter().flat_map(|t| t.entries.iter()));
        for e in entries {
            match *e {
                Entry::Reserved => {}
                Entry::Leaf(op) => assert!(op < self.ops.len(), "dangling op id {op}"),
                Entry::Table(t) => assert!(t < self.tables.len(), "dangling table id {t}"),
            }
        }
        Decoder {
            ops: self.ops,
            tables: self.tables,
            primary: self.primary,
            cache: DecodeCache::new(),
        }
    }
}

impl Default for DecoderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The built decode structure plus a small decode cache.
pub struct Decoder {
    ops: Vec<Op>,
    tables: Vec<Table>,
    primary: Vec<Entry>,
    cache: DecodeCache,
}

impl Decoder {
    /// Walks the tables for `word`. Any miss resolves to [`RESERVED`].
    #[must_use]
    pub fn lookup(&self, word: u32) -> OpId {
        let mut entry = self.primary[(word & 0x7f) as usize];
        loop {
            match entry {
                Entry::Reserved => return RESERVED,
                Entry::Leaf(op) => return op,
                Entry::Table(t) => {
                    let table = &self.tables[t];
                    entry = table.entries[table.key.extract(word)];
                }
            }
        }
    }

    /// Cached variant of [`lookup`](Self::lookup), used on the fetch path.
    pub fn decode(&mut self, word: u32) -> OpId {
        if let Some(op) = self.cache.get(word) {
            return op;
        }
        let op = self.lookup(word);
        self.cache.insert(word, op);
        op
    }

    #[must_use]
    pub fn get(&self, op: OpId) -> &Op {
        &self.ops[op]
    }
}

const DECODE_CACHE_SLOTS: usize = 0x1000;

/// Direct-mapped word-to-op cache. Table walking is cheap but not free,
/// and the hot loops of a guest program reuse a handful of words, so even
/// this trivial policy hits the vast majority of fetches.
struct DecodeCache {
    slots: Vec<(u32, OpId)>,
    hit_count: u64,
    miss_count: u64,
}

/// Slot value meaning "never filled". 0 is a valid instruction word for
/// the cache key, so an op id out of any possible arena is used instead.
const EMPTY_SLOT: (u32, OpId) = (0, usize::MAX);

impl DecodeCache {
    fn new() -> Self {
        Self {
            slots: vec![EMPTY_SLOT; DECODE_CACHE_SLOTS],
            hit_count: 0,
            miss_count: 0,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn index(word: u32) -> usize {
        // Fold the upper funct fields over the opcode bits
        ((word >> 2) ^ (word >> 15) ^ (word >> 25)) as usize % DECODE_CACHE_SLOTS
    }

    #[allow(clippy::cast_precision_loss)]
    fn get(&mut self, word: u32) -> Option<OpId> {
        let (w, op) = self.slots[Self::index(word)];
        let result = if op != usize::MAX && w == word {
            self.hit_count += 1;
            Some(op)
        } else {
            self.miss_count += 1;
            None
        };
        log::trace!(
            "decode cache hit:{}, miss:{}, ratio:{}",
            self.hit_count,
            self.miss_count,
            (self.hit_count as f64) / (self.hit_count + self.miss_count) as f64
        );
        result
    }

    fn insert(&mut self, word: u32, op: OpId) {
        self.slots[Self::index(word)] = (word, op);
    }
}

/// The raw instruction word with every field the semantic routines use,
/// extracted once. Immediates are sign extended per their format.
#[derive(Clone, Copy, Debug)]
pub struct Decoded {
    pub word: u32,
    pub opcode: u32,
    pub rd: usize,
    pub rs1: usize,
    pub rs2: usize,
    pub rs3: usize,
    pub funct3: u32,
    pub funct7: u32,
    pub funct5: u32,
    pub imm_i: i32,
    pub imm_s: i32,
    pub imm_b: i32,
    pub imm_u: i32,
    pub imm_j: i32,
    pub shamt: u32,
    pub rm: u32,
}

impl Decoded {
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn new(word: u32) -> Self {
        Self {
            word,
            opcode: word & 0x7f,
            rd: ((word >> 7) & 0x1f) as usize,
            rs1: ((word >> 15) & 0x1f) as usize,
            rs2: ((word >> 20) & 0x1f) as usize,
            rs3: ((word >> 27) & 0x1f) as usize,
            funct3: (word >> 12) & 0x7,
            funct7: (word >> 25) & 0x7f,
            funct5: (word >> 27) & 0x1f,
            imm_i: (word as i32) >> 20,
            imm_s: ((word & 0xfe00_0000) as i32 >> 20) | ((word >> 7) & 0x1f) as i32,
            imm_b: ((word & 0x8000_0000) as i32 >> 19)
                | (((word << 4) & 0x0000_0800) as i32)
                | (((word >> 20) & 0x0000_07e0) as i32)
                | (((word >> 7) & 0x0000_001e) as i32),
            imm_u: (word & 0xffff_f000) as i32,
            imm_j: ((word & 0x8000_0000) as i32 >> 11)
                | ((word & 0x000f_f000) as i32)
                | (((word & 0x0010_0000) >> 9) as i32)
                | (((word & 0x7fe0_0000) >> 20) as i32),
            shamt: (word >> 20) & 0x1f,
            rm: (word >> 12) & 0x7,
        }
    }
}

#[cfg(test)]
mod test_decode {
    use super::*;

    #[test]
    fn immediates() {
        // addi x1, x0, -1
        let d = Decoded::new(0xfff0_0093);
        assert_eq!(d.rd, 1);
        assert_eq!(d.rs1, 0);
        assert_eq!(d.imm_i, -1);

        // sw x1, -4(x2)
        let d = Decoded::new(0xfe11_2e23);
        assert_eq!(d.rs1, 2);
        assert_eq!(d.rs2, 1);
        assert_eq!(d.imm_s, -4);

        // jal x1, 8
        let d = Decoded::new(0x0080_00ef);
        assert_eq!(d.rd, 1);
        assert_eq!(d.imm_j, 8);

        // beq x1, x2, 8
        let d = Decoded::new(0x0020_8463);
        assert_eq!(d.imm_b, 8);

        // lui x1, 0x12345
        let d = Decoded::new(0x1234_50b7);
        assert_eq!(d.imm_u, 0x1234_5000);

        // srai x2, x1, 31
        let d = Decoded::new(0x41f0_d113);
        assert_eq!(d.shamt, 31);
        assert_eq!(d.funct7, 0x20);
    }

    #[test]
    fn negative_branch_offset() {
        // blt x2, x3, -8
        let d = Decoded::new(0xfe31_4ce3);
        assert_eq!(d.imm_b, -8);
        // jal x0, -16
        let d = Decoded::new(0xff1f_f06f);
        assert_eq!(d.imm_j, -16);
    }

    #[test]
    fn unclaimed_words_are_reserved() {
        let decoder = DecoderBuilder::new().build();
        assert_eq!(decoder.lookup(0x0000_0013), RESERVED);
        assert_eq!(decoder.lookup(0xffff_ffff), RESERVED);
    }

    #[test]
    fn cache_returns_inserted_op() {
        let mut decoder = DecoderBuilder::new().build();
        assert_eq!(decoder.decode(0x13), RESERVED);
        // Second decode of the same word is served from the cache
        assert_eq!(decoder.decode(0x13), RESERVED);
    }
}

//! Interns symbol names and folds every input's view of a name into one canonical record.
//!
//! Each input file gets its own `Symbol` per name carrying that input's fragment reference, but
//! all of them alias the same `SymbolRecord`. The output symbol table grows only when a name is
//! seen for the first time (or unconditionally, for locals).

use crate::error;
use crate::error::Result;
use crate::fragment::FragmentRef;
use crate::hash::PassThroughHashMap;
use crate::resolve::Binding;
use crate::resolve::Desc;
use crate::resolve::RecordFlags;
use crate::resolve::Resolver;
use crate::resolve::SymbolRecord;
use crate::resolve::SymbolType;
use crate::resolve::Visibility;
use crate::symbol::SymbolName;
use anyhow::ensure;
use std::collections::hash_map::Entry;

/// An index into the record arena. One record per distinct non-local name, one per local symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecordId(u32);

impl RecordId {
    fn from_usize(raw: usize) -> Self {
        RecordId(u32::try_from(raw).expect("record IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// An index into the symbol arena (input- and output-scoped views).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    fn from_usize(raw: usize) -> Self {
        SymbolId(u32::try_from(raw).expect("symbol IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One file's (or the output's) view of a resolved name: the shared record plus this view's own
/// fragment reference.
#[derive(Clone, Copy, Debug)]
pub struct Symbol {
    record: RecordId,
    frag_ref: Option<FragmentRef>,
}

impl Symbol {
    pub fn record(&self) -> RecordId {
        self.record
    }

    pub fn frag_ref(&self) -> Option<FragmentRef> {
        self.frag_ref
    }
}

pub struct SymbolDb<'data> {
    resolver: Resolver,
    records: Vec<SymbolRecord<'data>>,
    name_to_record: PassThroughHashMap<SymbolName<'data>, RecordId>,
    symbols: Vec<Symbol>,

    /// The symbols that will form the output symbol table, in the order they were promoted.
    output_symbols: Vec<SymbolId>,
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new() -> Self {
        Self {
            resolver: Resolver,
            records: Vec::new(),
            name_to_record: PassThroughHashMap::default(),
            symbols: Vec::new(),
            output_symbols: Vec::new(),
        }
    }

    /// Adds a non-local symbol and resolves it against the canonical record for its name
    /// immediately. Returns the input-scoped symbol. The first sighting of a name also appends an
    /// output-scoped symbol; that is the only path by which the output symbol table grows for
    /// globals.
    pub fn add_global_symbol(
        &mut self,
        name: &'data [u8],
        is_dynamic: bool,
        sym_type: SymbolType,
        desc: Desc,
        binding: Binding,
        size: u64,
        frag_ref: Option<FragmentRef>,
        visibility: Visibility,
    ) -> Result<SymbolId> {
        ensure!(
            binding != Binding::Local,
            "local symbol {} must be added with add_local_symbol",
            SymbolName::new(name),
        );

        let mut incoming = SymbolRecord::new(SymbolName::new(name));
        incoming
            .set_binding(binding)
            .set_desc(desc)
            .set_type(sym_type)
            .set_visibility(visibility)
            .set_size(size)
            .set_dynamic(is_dynamic)
            .set_frag_ref(frag_ref);

        let (record_id, existent) = match self.name_to_record.entry(SymbolName::prehashed(name)) {
            Entry::Occupied(entry) => {
                let record_id = *entry.get();
                let resolution = self
                    .resolver
                    .resolve(&mut self.records[record_id.as_usize()], &incoming)?;
                if let Some(message) = resolution.warning {
                    error::warning(&message);
                }
                (record_id, true)
            }
            Entry::Vacant(entry) => {
                let record_id = RecordId::from_usize(self.records.len());
                self.records.push(incoming);
                entry.insert(record_id);
                (record_id, false)
            }
        };

        let input_sym = self.push_symbol(record_id, frag_ref);
        if !existent {
            let output_sym = self.push_symbol(record_id, frag_ref);
            self.output_symbols.push(output_sym);
        }
        Ok(input_sym)
    }

    /// Adds a local symbol. Locals never merge across inputs: every call creates a fresh private
    /// record and unconditionally pairs it with an output symbol.
    pub fn add_local_symbol(
        &mut self,
        name: &'data [u8],
        sym_type: SymbolType,
        desc: Desc,
        size: u64,
        frag_ref: Option<FragmentRef>,
        visibility: Visibility,
    ) -> SymbolId {
        let mut record = SymbolRecord::new(SymbolName::new(name));
        record
            .set_binding(Binding::Local)
            .set_desc(desc)
            .set_type(sym_type)
            .set_visibility(visibility)
            .set_size(size)
            .set_frag_ref(frag_ref);

        let record_id = RecordId::from_usize(self.records.len());
        self.records.push(record);

        let input_sym = self.push_symbol(record_id, frag_ref);
        let output_sym = self.push_symbol(record_id, frag_ref);
        self.output_symbols.push(output_sym);
        input_sym
    }

    /// Creates a record for an output section symbol. These are synthesized by the context, not
    /// read from any input.
    pub(crate) fn add_section_symbol(&mut self, name: &'data [u8]) -> SymbolId {
        let id = self.add_local_symbol(
            name,
            SymbolType::Section,
            Desc::Define,
            0,
            None,
            Visibility::Default,
        );
        let record_id = self.symbols[id.as_usize()].record;
        let flags = self.records[record_id.as_usize()].flags() | RecordFlags::SECTION_SYMBOL;
        self.records[record_id.as_usize()].set_flags(flags);
        id
    }

    fn push_symbol(&mut self, record: RecordId, frag_ref: Option<FragmentRef>) -> SymbolId {
        let id = SymbolId::from_usize(self.symbols.len());
        self.symbols.push(Symbol { record, frag_ref });
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.as_usize()]
    }

    pub fn record(&self, id: RecordId) -> &SymbolRecord<'data> {
        &self.records[id.as_usize()]
    }

    pub fn record_mut(&mut self, id: RecordId) -> &mut SymbolRecord<'data> {
        &mut self.records[id.as_usize()]
    }

    /// The canonical record a symbol view aliases.
    pub fn record_of(&self, id: SymbolId) -> &SymbolRecord<'data> {
        self.record(self.symbol(id).record)
    }

    pub fn canonical_record_id(&self, name: &[u8]) -> Option<RecordId> {
        self.name_to_record
            .get(&SymbolName::prehashed(name))
            .copied()
    }

    pub fn output_symbols(&self) -> &[SymbolId] {
        &self.output_symbols
    }

    pub(crate) fn records(&self) -> &[SymbolRecord<'data>] {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut [SymbolRecord<'data>] {
        &mut self.records
    }
}

//! The orchestrator that owns every arena for the duration of a link session.
//!
//! All state that could otherwise live in process-wide factories lives here instead, with the
//! session's lifetime giving a clear init and teardown boundary. Sections, fragment streams,
//! fragments and symbols cross-reference each other only through index handles into these arenas.

use crate::error::Result;
use crate::fragment::Fragment;
use crate::fragment::FragmentId;
use crate::fragment::FragmentRef;
use crate::fragment::FragmentStream;
use crate::fragment::StreamId;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::reloc::Relocation;
use crate::resolve::Binding;
use crate::resolve::Desc;
use crate::resolve::SymbolType;
use crate::resolve::Visibility;
use crate::section::Section;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::section::SectionName;
use crate::section_map::SectionMap;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use braze_utils::elf::SectionFlags;
use braze_utils::elf::SectionType;
use itertools::Itertools;

/// Session-wide knobs supplied by the driver.
#[derive(Clone, Copy, Debug)]
pub struct LinkConfig {
    /// Where the first output section is placed.
    pub base_address: u64,

    /// Whether the output must be position independent. Chooses between stub templates among
    /// other things.
    pub pic: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            base_address: 0x10000,
            pic: false,
        }
    }
}

/// Read-only view of one output section for external queries (`ADDR`, `SIZEOF`, `ALIGNOF` style
/// lookups from a linker-script evaluator).
#[derive(Clone, Copy, Debug)]
pub struct SectionInfo {
    pub address: Option<u64>,
    pub size: u64,
    pub alignment: u64,
}

/// Notes which input section owns the stream suffix starting at `first_fragment`. Appended on
/// every stream request so relocation base addresses can be recovered after layout.
#[derive(Clone, Copy, Debug)]
struct InputRange {
    input_section: SectionId,
    first_fragment: usize,
}

pub struct LinkContext<'data> {
    config: LinkConfig,
    sections: Vec<Section<'data>>,
    streams: Vec<FragmentStream>,
    fragments: Vec<Fragment>,

    /// Which stream each fragment was placed in. Parallel to `fragments`.
    fragment_home: Vec<Option<StreamId>>,

    /// Input-range records per stream. Parallel to `streams`.
    ranges: Vec<Vec<InputRange>>,

    section_map: SectionMap,

    /// Output sections in creation order, which is also layout order.
    output_sections: Vec<SectionId>,
    output_by_name: PassThroughHashMap<SectionName<'data>, SectionId>,

    symbols: SymbolDb<'data>,

    /// Relocations read from the inputs, in scan order.
    relocations: Vec<Relocation>,

    /// Output section symbols, synthesized one per output section on request.
    section_symbols: Vec<(SectionId, SymbolId)>,
}

impl<'data> LinkContext<'data> {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            sections: Vec::new(),
            streams: Vec::new(),
            fragments: Vec::new(),
            fragment_home: Vec::new(),
            ranges: Vec::new(),
            section_map: SectionMap::default(),
            output_sections: Vec::new(),
            output_by_name: PassThroughHashMap::default(),
            symbols: SymbolDb::new(),
            relocations: Vec::new(),
            section_symbols: Vec::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn section_map_mut(&mut self) -> &mut SectionMap {
        &mut self.section_map
    }

    // -----  sections  ----- //

    /// Creates an input section header and makes sure the output section it maps to exists.
    /// Returns the input header; readers hang fragments off it via
    /// [`LinkContext::get_or_create_fragment_stream`].
    pub fn create_sect_hdr(
        &mut self,
        name: &'data [u8],
        kind: SectionKind,
        sh_type: SectionType,
        flags: SectionFlags,
    ) -> SectionId {
        self.get_or_create_output_sect_hdr(name, kind, sh_type, flags);

        let id = SectionId::from_usize(self.sections.len());
        self.sections
            .push(Section::new(SectionName(name), kind, sh_type, flags));
        id
    }

    /// Returns the output section an input section name maps to, creating and registering it on
    /// first sight.
    pub fn get_or_create_output_sect_hdr(
        &mut self,
        name: &'data [u8],
        kind: SectionKind,
        sh_type: SectionType,
        flags: SectionFlags,
    ) -> SectionId {
        let output_name = self.section_map.output_name(name);
        let key = PreHashed::new(SectionName(output_name), hash_bytes(output_name));
        if let Some(id) = self.output_by_name.get(&key) {
            return *id;
        }
        let id = SectionId::from_usize(self.sections.len());
        self.sections
            .push(Section::new(SectionName(output_name), kind, sh_type, flags));
        self.output_sections.push(id);
        self.output_by_name.insert(key, id);
        id
    }

    pub fn section(&self, id: SectionId) -> &Section<'data> {
        &self.sections[id.as_usize()]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section<'data> {
        &mut self.sections[id.as_usize()]
    }

    pub fn output_sections(&self) -> &[SectionId] {
        &self.output_sections
    }

    /// `{address, size, alignment}` of a named output section, for the script evaluator.
    pub fn section_by_name(&self, name: &[u8]) -> Option<SectionInfo> {
        let key = PreHashed::new(SectionName(name), hash_bytes(name));
        let section = self.section(*self.output_by_name.get(&key)?);
        Some(SectionInfo {
            address: section.address(),
            size: section.size(),
            alignment: section.alignment(),
        })
    }

    // -----  fragment streams  ----- //

    /// Returns the stream that fragments of `input_section` append to.
    ///
    /// Three-tier lookup: the input may already own a stream; otherwise the mapped output section
    /// may already own one (other inputs got there first), in which case the input adopts it;
    /// otherwise a fresh stream is allocated and bound to both. Every call also records an
    /// input-range marker so that the input section's final address can be recovered.
    pub fn get_or_create_fragment_stream(&mut self, input_section: SectionId) -> StreamId {
        if let Some(stream) = self.section(input_section).stream() {
            self.push_range(stream, input_section);
            return stream;
        }

        let (name, kind, sh_type, flags) = {
            let section = self.section(input_section);
            (
                section.name().0,
                section.kind(),
                section.sh_type(),
                section.flags(),
            )
        };
        let output = self.get_or_create_output_sect_hdr(name, kind, sh_type, flags);

        let stream = match self.section(output).stream() {
            Some(stream) => stream,
            None => {
                let stream = StreamId::from_usize(self.streams.len());
                self.streams.push(FragmentStream::new(output));
                self.ranges.push(Vec::new());
                self.section_mut(output).set_stream(stream);
                stream
            }
        };
        // When the requested section is itself the output (synthetic sections like the stub
        // section), it already got the stream above.
        if self.section(input_section).stream().is_none() {
            self.section_mut(input_section).set_stream(stream);
        }
        self.push_range(stream, input_section);
        stream
    }

    fn push_range(&mut self, stream: StreamId, input_section: SectionId) {
        let first_fragment = self.streams[stream.as_usize()].len();
        self.ranges[stream.as_usize()].push(InputRange {
            input_section,
            first_fragment,
        });
    }

    pub fn stream(&self, id: StreamId) -> &FragmentStream {
        &self.streams[id.as_usize()]
    }

    /// Appends a fragment to a stream. Fragments never move between streams afterwards.
    pub fn add_fragment(&mut self, stream: StreamId, fragment: Fragment) -> FragmentId {
        let id = self.alloc_fragment(stream, fragment);
        self.streams[stream.as_usize()].append(id);
        id
    }

    /// Inserts a fragment directly after `anchor` in its stream. Only the stub pass does this.
    pub fn insert_fragment_after(
        &mut self,
        stream: StreamId,
        anchor: FragmentId,
        fragment: Fragment,
    ) -> FragmentId {
        let id = self.alloc_fragment(stream, fragment);
        self.streams[stream.as_usize()].insert_after(anchor, id);
        id
    }

    fn alloc_fragment(&mut self, stream: StreamId, fragment: Fragment) -> FragmentId {
        let id = FragmentId::from_usize(self.fragments.len());
        self.fragments.push(fragment);
        self.fragment_home.push(Some(stream));
        id
    }

    pub fn fragment(&self, id: FragmentId) -> &Fragment {
        &self.fragments[id.as_usize()]
    }

    pub fn fragment_mut(&mut self, id: FragmentId) -> &mut Fragment {
        &mut self.fragments[id.as_usize()]
    }

    /// The fragment's final address. `None` before layout.
    pub fn fragment_address(&self, id: FragmentId) -> Option<u64> {
        let stream_id = self.fragment_home[id.as_usize()]?;
        let stream = self.stream(stream_id);
        let section_address = self.section(stream.output_section()).address()?;
        Some(section_address + stream.offset_of(id)?)
    }

    // -----  symbols  ----- //

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
        self.symbols.add_global_symbol(
            name, is_dynamic, sym_type, desc, binding, size, frag_ref, visibility,
        )
    }

    pub fn add_local_symbol(
        &mut self,
        name: &'data [u8],
        sym_type: SymbolType,
        desc: Desc,
        size: u64,
        frag_ref: Option<FragmentRef>,
        visibility: Visibility,
    ) -> SymbolId {
        self.symbols
            .add_local_symbol(name, sym_type, desc, size, frag_ref, visibility)
    }

    /// Synthesizes (once) a section symbol for an output section.
    pub fn add_section_symbol(&mut self, output_section: SectionId) -> SymbolId {
        if let Some((_, sym)) = self
            .section_symbols
            .iter()
            .find(|(section, _)| *section == output_section)
        {
            return *sym;
        }
        let name = self.section(output_section).name().0;
        let sym = self.symbols.add_section_symbol(name);
        self.section_symbols.push((output_section, sym));
        sym
    }

    pub fn symbols(&self) -> &SymbolDb<'data> {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut SymbolDb<'data> {
        &mut self.symbols
    }

    /// The address a symbol resolves to, with the Thumb tag bit applied for stub entries.
    pub fn symbol_value(&self, id: SymbolId) -> u64 {
        self.symbols.record_of(id).value()
    }

    // -----  relocations  ----- //

    /// Records a relocation read from an input. Returns its index in scan order.
    pub fn add_relocation(
        &mut self,
        section: SectionId,
        offset: u64,
        symbol: SymbolId,
        r_type: u32,
        addend: i64,
    ) -> usize {
        self.relocations.push(Relocation {
            section: Some(section),
            offset,
            symbol: Some(symbol),
            r_type,
            addend,
        });
        self.relocations.len() - 1
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn relocation_mut(&mut self, index: usize) -> &mut Relocation {
        &mut self.relocations[index]
    }

    // -----  layout  ----- //

    /// Assigns addresses to every output section, offsets to every fragment, and final values to
    /// every symbol that points at a fragment. Runs again from scratch after passes that add
    /// fragments (stub insertion); only after the last run are sizes and offsets frozen.
    #[tracing::instrument(skip_all, name = "Layout")]
    pub fn layout(&mut self) -> Result {
        // Stub insertion re-runs layout, so start every run from a clean slate.
        for section in &mut self.sections {
            section.clear_address();
        }

        let mut address = self.config.base_address;
        let output_sections = self.output_sections.clone();
        for &id in &output_sections {
            let alignment = self.section(id).alignment().max(1);
            address = address.next_multiple_of(alignment);

            let size = match self.section(id).stream() {
                Some(stream) => self.layout_stream(stream),
                // Relocation sections and other streamless sections keep their declared size.
                None => self.section(id).size(),
            };

            let section = self.section_mut(id);
            section.set_address(address);
            section.set_size(size);
            tracing::debug!(section = ?section.name(), address, size, "placed");
            address += size;
        }

        self.assign_input_section_addresses();
        self.finalize_symbol_values();
        Ok(())
    }

    fn layout_stream(&mut self, stream_id: StreamId) -> u64 {
        let stream = &self.streams[stream_id.as_usize()];
        let mut offsets = Vec::with_capacity(stream.len());
        let mut cursor = 0u64;
        for &frag in stream.fragments() {
            let fragment = &self.fragments[frag.as_usize()];
            cursor = cursor.next_multiple_of(fragment.alignment().max(1));
            offsets.push(cursor);
            cursor += fragment.size();
        }
        self.streams[stream_id.as_usize()].set_offsets(offsets);
        cursor
    }

    /// Turns the per-stream input-range records into addresses and sizes on the input section
    /// headers, so relocation sites can be turned into absolute addresses.
    fn assign_input_section_addresses(&mut self) {
        let mut assigned: Vec<(SectionId, u64, u64)> = Vec::new();
        for (stream_index, ranges) in self.ranges.iter().enumerate() {
            let stream = &self.streams[stream_index];
            let Some(section_address) = self.section(stream.output_section()).address() else {
                continue;
            };
            let total = self.section(stream.output_section()).size();

            let bounds = ranges
                .iter()
                .map(|r| (r.input_section, r.first_fragment))
                .chain(std::iter::once((stream.output_section(), stream.len())));
            for ((input, first), (_, next_first)) in bounds.tuple_windows() {
                let start = match stream.fragments().get(first) {
                    Some(&frag) => stream.offset_of(frag).unwrap_or(total),
                    None => total,
                };
                let end = match stream.fragments().get(next_first) {
                    Some(&frag) => stream.offset_of(frag).unwrap_or(total),
                    None => total,
                };
                assigned.push((input, section_address + start, end.saturating_sub(start)));
            }
        }

        // A section that requested its stream more than once keeps the address of its first
        // range; later ranges only extend coverage.
        for (input, addr, size) in assigned {
            let section = self.section_mut(input);
            if section.address().is_none() {
                section.set_address(addr);
                section.set_size(size);
            }
        }
    }

    fn finalize_symbol_values(&mut self) {
        let mut updates: Vec<(usize, u64)> = Vec::new();
        for (index, record) in self.symbols.records().iter().enumerate() {
            if !record.is_defined() {
                continue;
            }
            let Some(frag_ref) = record.frag_ref() else {
                continue;
            };
            let Some(base) = self.fragment_address(frag_ref.fragment) else {
                continue;
            };
            let tag = match self.fragment(frag_ref.fragment) {
                Fragment::Stub { thumb_entry, .. } => u64::from(*thumb_entry),
                _ => 0,
            };
            updates.push((index, base + frag_ref.offset + tag));
        }
        for (index, value) in updates {
            self.symbols.records_mut()[index].set_value(value);
        }

        // Section symbols take the address of their section.
        for &(section, sym) in &self.section_symbols {
            if let Some(address) = self.sections[section.as_usize()].address() {
                let record = self.symbols.symbol(sym).record();
                self.symbols.records_mut()[record.as_usize()].set_value(address);
            }
        }
    }
}

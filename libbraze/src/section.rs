use crate::fragment::StreamId;
use braze_utils::elf::SectionFlags;
use braze_utils::elf::SectionType;
use std::fmt::Debug;

/// An index into the link context's section arena. Input and output section headers share the
/// arena; the context's output section table records which are outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectionId(u32);

impl SectionId {
    pub(crate) fn from_usize(raw: usize) -> Self {
        SectionId(u32::try_from(raw).expect("section IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SectionName<'data>(pub &'data [u8]);

impl SectionName<'_> {
    pub fn bytes(&self) -> &[u8] {
        self.0
    }
}

impl Debug for SectionName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", String::from_utf8_lossy(self.0)))
    }
}

/// The semantic class of a section, which decides how its payload is represented and laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Null,
    /// Byte-producing content backed by a fragment stream.
    Regular,
    /// Occupies address space but produces no file bytes.
    Bss,
    Note,
    /// Holds relocation entries rather than fragments. Sized by entry count.
    Relocation,
    /// Exception unwind table. Backed by a fragment stream with CIE/FDE bookkeeping on the side.
    EhFrame,
    Debug,
    MetaData,
}

/// One section header, input or output.
#[derive(Debug)]
pub struct Section<'data> {
    name: SectionName<'data>,
    kind: SectionKind,
    sh_type: SectionType,
    flags: SectionFlags,
    alignment: u64,
    size: u64,
    address: Option<u64>,
    stream: Option<StreamId>,
}

impl<'data> Section<'data> {
    pub(crate) fn new(
        name: SectionName<'data>,
        kind: SectionKind,
        sh_type: SectionType,
        flags: SectionFlags,
    ) -> Self {
        Self {
            name,
            kind,
            sh_type,
            flags,
            alignment: 1,
            size: 0,
            address: None,
            stream: None,
        }
    }

    pub fn name(&self) -> SectionName<'data> {
        self.name
    }

    pub fn kind(&self) -> SectionKind {
        self.kind
    }

    pub fn sh_type(&self) -> SectionType {
        self.sh_type
    }

    pub fn flags(&self) -> SectionFlags {
        self.flags
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn set_alignment(&mut self, alignment: u64) {
        debug_assert!(alignment.is_power_of_two());
        self.alignment = alignment;
    }

    /// The section's size. For stream-backed sections this is only meaningful after `layout()`;
    /// for relocation sections it tracks reservations as they happen.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    /// Assigned virtual address. `None` until `layout()` has run.
    pub fn address(&self) -> Option<u64> {
        self.address
    }

    pub(crate) fn set_address(&mut self, address: u64) {
        self.address = Some(address);
    }

    pub(crate) fn clear_address(&mut self) {
        self.address = None;
    }

    pub fn stream(&self) -> Option<StreamId> {
        self.stream
    }

    pub(crate) fn set_stream(&mut self, stream: StreamId) {
        debug_assert!(self.stream.is_none());
        self.stream = Some(stream);
    }
}

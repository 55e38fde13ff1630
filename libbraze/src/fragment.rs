//! The byte-producing pieces that make up an output section.
//!
//! Everything that ends up contributing bytes to the output is a `Fragment` in an arena owned by
//! the link context. Fragments are referenced by index everywhere, including back-references from
//! symbol records, so there are no ownership cycles.

use crate::eh_frame::CieId;
use crate::section::SectionId;
use smallvec::SmallVec;
use std::borrow::Cow;

/// An index into the link context's fragment arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FragmentId(u32);

impl FragmentId {
    pub(crate) fn from_usize(raw: usize) -> Self {
        FragmentId(u32::try_from(raw).expect("fragment IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// A byte position within a fragment. This is how symbols point back at the content that defines
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentRef {
    pub fragment: FragmentId,
    pub offset: u64,
}

impl FragmentRef {
    pub fn new(fragment: FragmentId, offset: u64) -> Self {
        Self { fragment, offset }
    }
}

/// A patch a stub needs applied against its own bytes once the final target address is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StubFixup {
    pub offset: u64,
    pub addend: i64,
    pub r_type: u32,
}

/// The closed set of fragment kinds. Dispatch happens on the variant, not through a trait object.
#[derive(Clone, Debug)]
pub enum Fragment {
    /// A run of bytes taken verbatim from an input section.
    Region { bytes: Vec<u8> },

    /// `size` bytes of `value`, e.g. bss or alignment padding.
    Fill { size: u64, value: u8 },

    /// A synthesized trampoline. Owns an independent copy of its template bytes and fix-ups.
    Stub {
        bytes: Vec<u8>,
        fixups: SmallVec<[StubFixup; 2]>,
        alignment: u64,
        /// Whether the stub is entered in Thumb state. Sets bit 0 of the stub symbol's value.
        thumb_entry: bool,
    },

    /// A Common Information Entry of an unwind table, with the encoding its FDE pointers use.
    Cie { bytes: Vec<u8>, fde_encoding: u8 },

    /// A Frame Description Entry. Holds a non-owning reference to its CIE and the offset at which
    /// its data starts.
    Fde {
        bytes: Vec<u8>,
        cie: CieId,
        data_start: u32,
    },
}

impl Fragment {
    pub fn size(&self) -> u64 {
        match self {
            Fragment::Region { bytes }
            | Fragment::Stub { bytes, .. }
            | Fragment::Cie { bytes, .. }
            | Fragment::Fde { bytes, .. } => bytes.len() as u64,
            Fragment::Fill { size, .. } => *size,
        }
    }

    pub fn alignment(&self) -> u64 {
        match self {
            Fragment::Stub { alignment, .. } => *alignment,
            _ => 1,
        }
    }

    /// Produces the fragment's output bytes.
    pub fn emit(&self) -> Cow<'_, [u8]> {
        match self {
            Fragment::Region { bytes }
            | Fragment::Stub { bytes, .. }
            | Fragment::Cie { bytes, .. }
            | Fragment::Fde { bytes, .. } => Cow::Borrowed(bytes),
            Fragment::Fill { size, value } => Cow::Owned(vec![*value; *size as usize]),
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, Fragment::Stub { .. })
    }
}

/// An index into the link context's stream arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub(crate) fn from_usize(raw: usize) -> Self {
        StreamId(u32::try_from(raw).expect("stream IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// The ordered fragments that one output section will emit. Append-only while inputs are being
/// merged; the stub pass may additionally insert after an existing fragment.
#[derive(Debug)]
pub struct FragmentStream {
    output_section: SectionId,
    fragments: Vec<FragmentId>,

    /// Byte offset of each fragment within the stream. Parallel to `fragments`; filled in by
    /// `layout()` and meaningless before it runs.
    offsets: Vec<u64>,
}

impl FragmentStream {
    pub(crate) fn new(output_section: SectionId) -> Self {
        Self {
            output_section,
            fragments: Vec::new(),
            offsets: Vec::new(),
        }
    }

    pub fn output_section(&self) -> SectionId {
        self.output_section
    }

    pub fn fragments(&self) -> &[FragmentId] {
        &self.fragments
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub(crate) fn append(&mut self, fragment: FragmentId) {
        self.fragments.push(fragment);
    }

    /// Inserts `fragment` directly after `anchor`. Used by the stub pass, which must place a stub
    /// near the branch it serves rather than at the end of the stream.
    pub(crate) fn insert_after(&mut self, anchor: FragmentId, fragment: FragmentId) {
        let position = self
            .fragments
            .iter()
            .position(|f| *f == anchor)
            .expect("insert_after anchor is not in this stream");
        self.fragments.insert(position + 1, fragment);
    }

    pub(crate) fn set_offsets(&mut self, offsets: Vec<u64>) {
        debug_assert_eq!(offsets.len(), self.fragments.len());
        self.offsets = offsets;
    }

    /// Offset of `fragment` within the stream. Only valid after layout.
    pub fn offset_of(&self, fragment: FragmentId) -> Option<u64> {
        let position = self.fragments.iter().position(|f| *f == fragment)?;
        self.offsets.get(position).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_emits_its_size() {
        let frag = Fragment::Fill { size: 5, value: 0 };
        assert_eq!(frag.size(), 5);
        assert_eq!(frag.emit().len(), 5);
    }

    #[test]
    fn insert_after_keeps_order() {
        let mut stream = FragmentStream::new(SectionId::from_usize(0));
        let a = FragmentId::from_usize(0);
        let b = FragmentId::from_usize(1);
        let c = FragmentId::from_usize(2);
        stream.append(a);
        stream.append(b);
        stream.insert_after(a, c);
        assert_eq!(stream.fragments(), &[a, c, b]);
    }
}

//! Merging of `.eh_frame` unwind tables.
//!
//! The merger keeps an ordered CIE list and an ordered FDE list per output unwind section, on top
//! of the same fragment stream every other section kind uses. No DWARF decoding happens here; the
//! binary-format reader hands us opaque entry bytes and the association between them.

use crate::context::LinkContext;
use crate::error::Result;
use crate::fragment::Fragment;
use crate::fragment::FragmentId;
use crate::fragment::StreamId;
use crate::section::SectionId;
use anyhow::ensure;

/// An index into one unwind table's CIE list. Only [`EhFrame::add_cie`] mints these, so holding
/// one proves the CIE is already merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CieId(u32);

impl CieId {
    fn from_usize(raw: usize) -> Self {
        CieId(u32::try_from(raw).expect("CIE IDs overflowed 32 bits"))
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FdeId(u32);

impl FdeId {
    fn from_usize(raw: usize) -> Self {
        FdeId(u32::try_from(raw).expect("FDE IDs overflowed 32 bits"))
    }
}

/// The unwind table being built for one output section.
pub struct EhFrame {
    section: SectionId,
    stream: StreamId,
    cies: Vec<FragmentId>,
    fdes: Vec<FragmentId>,
}

impl EhFrame {
    /// Binds a merger to an input unwind section, funneling its entries into the mapped output
    /// section's stream like any regular content.
    pub fn new(ctx: &mut LinkContext<'_>, section: SectionId) -> Self {
        let stream = ctx.get_or_create_fragment_stream(section);
        Self {
            section,
            stream,
            cies: Vec::new(),
            fdes: Vec::new(),
        }
    }

    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn add_cie(&mut self, ctx: &mut LinkContext<'_>, bytes: Vec<u8>, fde_encoding: u8) -> CieId {
        let frag = ctx.add_fragment(
            self.stream,
            Fragment::Cie {
                bytes,
                fde_encoding,
            },
        );
        let id = CieId::from_usize(self.cies.len());
        self.cies.push(frag);
        id
    }

    /// Appends an FDE. Its CIE must already be merged into this table; an FDE arriving ahead of
    /// its CIE is a bug in the driving reader, not bad user input.
    pub fn add_fde(
        &mut self,
        ctx: &mut LinkContext<'_>,
        cie: CieId,
        bytes: Vec<u8>,
        data_start: u32,
    ) -> Result<FdeId> {
        ensure!(
            cie.as_usize() < self.cies.len(),
            "FDE references CIE {} but only {} CIEs are merged",
            cie.as_usize(),
            self.cies.len()
        );
        let frag = ctx.add_fragment(
            self.stream,
            Fragment::Fde {
                bytes,
                cie,
                data_start,
            },
        );
        let id = FdeId::from_usize(self.fdes.len());
        self.fdes.push(frag);
        Ok(id)
    }

    /// Appends opaque bytes. Used once CIE/FDE distinctions no longer matter and everything is
    /// just content to emit.
    pub fn add_fragment(&mut self, ctx: &mut LinkContext<'_>, bytes: Vec<u8>) -> FragmentId {
        ctx.add_fragment(self.stream, Fragment::Region { bytes })
    }

    pub fn num_cies(&self) -> usize {
        self.cies.len()
    }

    pub fn num_fdes(&self) -> usize {
        self.fdes.len()
    }

    pub fn cie_fragment(&self, id: CieId) -> FragmentId {
        self.cies[id.as_usize()]
    }
}

//! Relocation entries and the reserve-then-consume pool used for dynamic relocation sections.

use crate::context::LinkContext;
use crate::error::Result;
use crate::section::SectionId;
use crate::section::SectionKind;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use anyhow::ensure;

/// One relocation: a place (section + offset), a referenced symbol, a target-specific type tag and
/// an addend. Entries sitting in a pool with `symbol == None` are reserved but not yet bound.
#[derive(Clone, Copy, Debug, Default)]
pub struct Relocation {
    pub section: Option<SectionId>,
    pub offset: u64,
    pub symbol: Option<SymbolId>,
    pub r_type: u32,
    pub addend: i64,
}

/// A dynamic relocation output section. Slots are reserved while scanning inputs, before the final
/// symbols are known, then claimed in a later pass in the exact order they were reserved.
pub struct OutputRelocPool {
    section: SectionId,
    entry_size: u64,
    entries: Vec<Relocation>,
    cursor: usize,
    /// Whether `consume_entry` has been called yet. The cursor is advanced on entry to each call
    /// after the first, not on exit, so that a reserve-then-consume-immediately cycle (e.g. a COPY
    /// relocation) doesn't leave the cursor past the end for the next cycle.
    visited: bool,
}

impl OutputRelocPool {
    pub fn new(ctx: &LinkContext, section: SectionId, entry_size: u64) -> OutputRelocPool {
        debug_assert_eq!(ctx.section(section).kind(), SectionKind::Relocation);
        OutputRelocPool {
            section,
            entry_size,
            entries: Vec::new(),
            cursor: 0,
            visited: false,
        }
    }

    pub fn section(&self) -> SectionId {
        self.section
    }

    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }

    /// Appends `count` blank entries and grows the section's declared size to match. Always
    /// additive; call as many times as reservations are discovered.
    pub fn reserve_entries(&mut self, ctx: &mut LinkContext, count: usize) {
        for _ in 0..count {
            self.entries.push(Relocation::default());
            let section = ctx.section_mut(self.section);
            section.set_size(section.size() + self.entry_size);
        }
    }

    /// Returns the next unclaimed entry, in first-reserved-first order.
    pub fn consume_entry(&mut self) -> Result<&mut Relocation> {
        if self.visited {
            self.cursor += 1;
        } else {
            ensure!(
                !self.entries.is_empty(),
                "relocation pool consumed before any entries were reserved"
            );
            self.visited = true;
        }
        let index = self.cursor;
        match self.entries.get_mut(index) {
            Some(entry) => Ok(entry),
            None => bail!("no reserved relocation entry left for the incoming symbol"),
        }
    }

    /// Recomputes the section size from the entry count, reconciling any drift from direct size
    /// mutation during reservation.
    pub fn finalize_section_size(&self, ctx: &mut LinkContext) {
        ctx.section_mut(self.section)
            .set_size(self.entries.len() as u64 * self.entry_size);
    }

    pub fn entries(&self) -> &[Relocation] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LinkConfig;
    use braze_utils::elf::SectionFlags;
    use braze_utils::elf::sht;

    fn pool(ctx: &mut LinkContext<'static>) -> OutputRelocPool {
        let section = ctx.get_or_create_output_sect_hdr(
            b".rela.dyn",
            SectionKind::Relocation,
            sht::RELA,
            SectionFlags::empty(),
        );
        OutputRelocPool::new(ctx, section, 24)
    }

    #[test]
    fn reserve_then_consume_exactly() {
        let mut ctx = LinkContext::new(LinkConfig::default());
        let mut pool = pool(&mut ctx);
        pool.reserve_entries(&mut ctx, 3);
        for _ in 0..3 {
            pool.consume_entry().unwrap();
        }
        assert!(pool.consume_entry().is_err());
    }

    #[test]
    fn consume_without_reserve_fails() {
        let mut ctx = LinkContext::new(LinkConfig::default());
        let mut pool = pool(&mut ctx);
        assert!(pool.consume_entry().is_err());
    }

    #[test]
    fn reserve_consume_cycles_stay_fifo() {
        let mut ctx = LinkContext::new(LinkConfig::default());
        let mut pool = pool(&mut ctx);

        // A COPY-style reserve-and-claim-immediately...
        pool.reserve_entries(&mut ctx, 1);
        pool.consume_entry().unwrap().r_type = 1;

        // ...must not disturb a later, independent cycle.
        pool.reserve_entries(&mut ctx, 2);
        pool.consume_entry().unwrap().r_type = 2;
        pool.consume_entry().unwrap().r_type = 3;

        let types: Vec<u32> = pool.entries().iter().map(|e| e.r_type).collect();
        assert_eq!(types, [1, 2, 3]);
        assert!(pool.consume_entry().is_err());
    }

    #[test]
    fn sizes_track_reservations() {
        let mut ctx = LinkContext::new(LinkConfig::default());
        let mut pool = pool(&mut ctx);
        pool.reserve_entries(&mut ctx, 4);
        assert_eq!(ctx.section(pool.section()).size(), 96);

        // Drift the size directly, then reconcile.
        ctx.section_mut(pool.section()).set_size(1000);
        pool.finalize_section_size(&mut ctx);
        assert_eq!(ctx.section(pool.section()).size(), 96);
    }
}

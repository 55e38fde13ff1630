//! Branch-range stubs for ARM / Thumb interworking.
//!
//! After an initial layout, direct branches can turn out to be unreachable: either the
//! displacement overflows the instruction's immediate field, or the branch would need to switch
//! instruction set and the encoding cannot (`b`/`b.w` have no exchanging form). The stub pass
//! scans all recorded relocations, and for each unreachable branch synthesizes a small trampoline
//! in a designated output section, then redirects the relocation at the trampoline's entry symbol.
//!
//! Scanning is monotonic: stub entry symbols resolve to stub fragments, and no stub kind claims a
//! branch whose target is already a stub, so a re-scan after re-layout only adds stubs for
//! branches that are still out of range.

use crate::context::LinkContext;
use crate::error::Result;
use crate::fragment::Fragment;
use crate::fragment::FragmentRef;
use crate::fragment::StubFixup;
use crate::reloc::Relocation;
use crate::resolve::Desc;
use crate::resolve::SymbolType;
use crate::resolve::Visibility;
use crate::section::SectionId;
use crate::symbol_db::RecordId;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use braze_utils::arm;
use foldhash::HashMap;
use smallvec::SmallVec;

/// One kind of trampoline. A prototype decides which branches it serves and carries the template
/// a served branch gets a copy of.
pub trait Stub {
    fn name(&self) -> &'static str;

    /// Whether this stub kind must serve the given branch. `target_value` carries the Thumb bit
    /// if the target is Thumb code.
    fn is_my_duty(
        &self,
        reloc: &Relocation,
        source_address: u64,
        target_value: u64,
        target_is_stub: bool,
    ) -> bool;

    /// The instruction bytes of the trampoline.
    fn template(&self) -> &[u8];

    /// Patches to apply against the template once the branch target's final address is known.
    fn fixups(&self) -> &[StubFixup];

    fn alignment(&self) -> u64 {
        4
    }

    /// Whether the trampoline is entered in Thumb state. Thumb entry points get bit 0 of their
    /// symbol value set so interworking branches encode correctly.
    fn thumb_entry(&self) -> bool {
        false
    }

    /// The name given to each materialized trampoline's entry symbol.
    fn symbol_name(&self) -> &'static [u8];

    /// A fresh, independently owned copy of this prototype.
    fn clone_boxed(&self) -> Box<dyn Stub>;
}

/// Serves `R_ARM_THM_CALL` branches whose target is out of Thumb range, and `R_ARM_THM_JUMP24`
/// branches to ARM code (Thumb `b.w` cannot exchange instruction sets). The trampoline is entered
/// in Thumb state, switches to ARM with `bx pc`, and jumps to the real target through a literal.
pub struct ThumbToArmStub {
    bytes: Vec<u8>,
    fixups: SmallVec<[StubFixup; 2]>,
    thumb2: bool,
}

/// `bx pc; nop; ldr pc, [pc, #-4]; .word target`
const THM_TO_ARM_TEMPLATE: &[u32] = &[
    0x46c0_4778, // bx pc, nop (Thumb halfwords 0x4778 then 0x46c0, little-endian)
    0xe51f_f004, // ldr pc, [pc, #-4]
    0x0000_0000, // dcd target
];

/// `bx pc; nop; ldr ip, [pc, #0]; add pc, ip, pc; .word target - (site + 8)`
const THM_TO_ARM_PIC_TEMPLATE: &[u32] = &[
    0x46c0_4778,
    0xe59f_c000, // ldr ip, [pc, #0]
    0xe08c_f00f, // add pc, ip, pc
    0x0000_0000,
];

impl ThumbToArmStub {
    pub fn new(pic: bool, thumb2: bool) -> Self {
        let (template, fixup) = if pic {
            (
                THM_TO_ARM_PIC_TEMPLATE,
                StubFixup {
                    offset: 12,
                    addend: -4,
                    r_type: object::elf::R_ARM_REL32,
                },
            )
        } else {
            (
                THM_TO_ARM_TEMPLATE,
                StubFixup {
                    offset: 8,
                    addend: 0,
                    r_type: object::elf::R_ARM_ABS32,
                },
            )
        };
        Self {
            bytes: bytemuck::cast_slice::<u32, u8>(template).to_vec(),
            fixups: smallvec::smallvec![fixup],
            thumb2,
        }
    }
}

impl Stub for ThumbToArmStub {
    fn name(&self) -> &'static str {
        "T2A"
    }

    fn is_my_duty(
        &self,
        reloc: &Relocation,
        source_address: u64,
        target_value: u64,
        target_is_stub: bool,
    ) -> bool {
        if target_is_stub {
            return false;
        }
        if arm::is_thumb_address(target_value) {
            // Thumb-to-Thumb needs no interworking.
            return false;
        }
        match reloc.r_type {
            arm::R_ARM_THM_CALL => {
                // `bl` can be rewritten to `blx` by the relocation engine, so a reachable ARM
                // target needs no stub. Only distance matters here.
                let destination = arm::clear_thumb_bit(target_value)
                    .wrapping_add_signed(reloc.addend)
                    .wrapping_add(arm::THM_PC_BIAS);
                let displacement = destination.wrapping_sub(source_address) as i64;
                let (min, max) = (
                    if self.thumb2 {
                        arm::THM2_MAX_BWD_BRANCH_OFFSET
                    } else {
                        arm::THM_MAX_BWD_BRANCH_OFFSET
                    },
                    if self.thumb2 {
                        arm::THM2_MAX_FWD_BRANCH_OFFSET
                    } else {
                        arm::THM_MAX_FWD_BRANCH_OFFSET
                    },
                );
                displacement < min || displacement > max
            }
            // `b.w` has no exchanging form, so any ARM destination needs the veneer.
            object::elf::R_ARM_THM_JUMP24 => true,
            _ => false,
        }
    }

    fn template(&self) -> &[u8] {
        &self.bytes
    }

    fn fixups(&self) -> &[StubFixup] {
        &self.fixups
    }

    fn thumb_entry(&self) -> bool {
        true
    }

    fn symbol_name(&self) -> &'static [u8] {
        b"__ThumbToArmVeneer"
    }

    fn clone_boxed(&self) -> Box<dyn Stub> {
        Box::new(Self {
            bytes: self.bytes.clone(),
            fixups: self.fixups.clone(),
            thumb2: self.thumb2,
        })
    }
}

/// Serves `R_ARM_CALL` branches to Thumb code that are out of ARM range, and `R_ARM_JUMP24`
/// branches to Thumb code at any distance (`b` cannot exchange instruction sets). Entered in ARM
/// state; the literal keeps the Thumb bit so the final `bx` switches sets.
pub struct ArmToThumbStub {
    bytes: Vec<u8>,
    fixups: SmallVec<[StubFixup; 2]>,
}

/// `ldr ip, [pc, #0]; bx ip; .word target`
const ARM_TO_THM_TEMPLATE: &[u32] = &[
    0xe59f_c000, // ldr ip, [pc, #0]
    0xe12f_ff1c, // bx ip
    0x0000_0000,
];

/// `ldr ip, [pc, #4]; add ip, ip, pc; bx ip; .word target - (site + 8)`
const ARM_TO_THM_PIC_TEMPLATE: &[u32] = &[
    0xe59f_c004,
    0xe08f_c00c, // add ip, pc, ip
    0xe12f_ff1c,
    0x0000_0000,
];

impl ArmToThumbStub {
    pub fn new(pic: bool) -> Self {
        let (template, fixup) = if pic {
            (
                ARM_TO_THM_PIC_TEMPLATE,
                StubFixup {
                    offset: 12,
                    addend: 0,
                    r_type: object::elf::R_ARM_REL32,
                },
            )
        } else {
            (
                ARM_TO_THM_TEMPLATE,
                StubFixup {
                    offset: 8,
                    addend: 0,
                    r_type: object::elf::R_ARM_ABS32,
                },
            )
        };
        Self {
            bytes: bytemuck::cast_slice::<u32, u8>(template).to_vec(),
            fixups: smallvec::smallvec![fixup],
        }
    }
}

impl Stub for ArmToThumbStub {
    fn name(&self) -> &'static str {
        "A2T"
    }

    fn is_my_duty(
        &self,
        reloc: &Relocation,
        source_address: u64,
        target_value: u64,
        target_is_stub: bool,
    ) -> bool {
        if target_is_stub || !arm::is_thumb_address(target_value) {
            return false;
        }
        match reloc.r_type {
            object::elf::R_ARM_CALL => {
                // `bl` becomes `blx` for a reachable Thumb target.
                let destination = arm::clear_thumb_bit(target_value)
                    .wrapping_add_signed(reloc.addend)
                    .wrapping_add(arm::ARM_PC_BIAS);
                let displacement = destination.wrapping_sub(source_address) as i64;
                displacement < arm::ARM_MAX_BWD_BRANCH_OFFSET
                    || displacement > arm::ARM_MAX_FWD_BRANCH_OFFSET
            }
            object::elf::R_ARM_JUMP24 => true,
            _ => false,
        }
    }

    fn template(&self) -> &[u8] {
        &self.bytes
    }

    fn fixups(&self) -> &[StubFixup] {
        &self.fixups
    }

    fn symbol_name(&self) -> &'static [u8] {
        b"__ArmToThumbVeneer"
    }

    fn clone_boxed(&self) -> Box<dyn Stub> {
        Box::new(Self {
            bytes: self.bytes.clone(),
            fixups: self.fixups.clone(),
        })
    }
}

/// Owns the stub prototypes and the bookkeeping that lets two branches to the same target share
/// one trampoline.
pub struct StubEngine {
    prototypes: Vec<Box<dyn Stub>>,
    stub_section: SectionId,

    /// (prototype index, branch target record) of every trampoline already materialized.
    reuse: HashMap<(usize, RecordId), SymbolId>,
}

impl StubEngine {
    /// `stub_section` is the section trampolines are appended to. It must be executable
    /// and laid out near the code it serves, or the stubs themselves go out of range.
    pub fn new(stub_section: SectionId) -> Self {
        Self {
            prototypes: Vec::new(),
            stub_section,
            reuse: HashMap::default(),
        }
    }

    /// Registers the two interworking prototypes for a standard ARM link.
    pub fn with_arm_prototypes(stub_section: SectionId, pic: bool, thumb2: bool) -> Self {
        let mut engine = Self::new(stub_section);
        engine.add_prototype(Box::new(ThumbToArmStub::new(pic, thumb2)));
        engine.add_prototype(Box::new(ArmToThumbStub::new(pic)));
        engine
    }

    pub fn add_prototype(&mut self, prototype: Box<dyn Stub>) {
        self.prototypes.push(prototype);
    }

    /// Walks every recorded relocation and materializes trampolines for unreachable branches,
    /// redirecting each served relocation at its trampoline's entry symbol. Requires layout to
    /// have run so branch sites and targets have addresses. Returns the number of trampolines
    /// created; a re-layout is only needed when it is non-zero.
    pub fn scan(&mut self, ctx: &mut LinkContext<'_>) -> Result<usize> {
        let mut created = 0;
        for index in 0..ctx.relocations().len() {
            let reloc = ctx.relocations()[index];
            let (Some(section), Some(symbol)) = (reloc.section, reloc.symbol) else {
                continue;
            };
            let Some(section_address) = ctx.section(section).address() else {
                bail!("stub scan ran before layout assigned section addresses");
            };
            let source_address = section_address + reloc.offset;

            let record_id = ctx.symbols().symbol(symbol).record();
            let record = ctx.symbols().record(record_id);
            let target_value = record.value();
            let target_is_stub = record
                .frag_ref()
                .is_some_and(|frag_ref| ctx.fragment(frag_ref.fragment).is_stub());

            let Some(kind) = self
                .prototypes
                .iter()
                .position(|p| p.is_my_duty(&reloc, source_address, target_value, target_is_stub))
            else {
                continue;
            };

            let entry = match self.reuse.get(&(kind, record_id)) {
                Some(entry) => *entry,
                None => {
                    let entry = self.materialize(ctx, kind, record_id, target_value);
                    created += 1;
                    entry
                }
            };
            ctx.relocation_mut(index).symbol = Some(entry);
        }
        if created > 0 {
            tracing::debug!(created, "inserted branch stubs");
        }
        Ok(created)
    }

    fn materialize(
        &mut self,
        ctx: &mut LinkContext<'_>,
        kind: usize,
        target: RecordId,
        target_value: u64,
    ) -> SymbolId {
        let stub = self.prototypes[kind].clone_boxed();
        tracing::trace!(
            kind = stub.name(),
            target = %ctx.symbols().record(target).name(),
            target_value,
            "materializing stub"
        );

        let stream = ctx.get_or_create_fragment_stream(self.stub_section);
        let fragment = ctx.add_fragment(
            stream,
            Fragment::Stub {
                bytes: stub.template().to_vec(),
                fixups: stub.fixups().iter().copied().collect(),
                alignment: stub.alignment(),
                thumb_entry: stub.thumb_entry(),
            },
        );

        let size = stub.template().len() as u64;
        let entry = ctx.add_local_symbol(
            stub.symbol_name(),
            SymbolType::Func,
            Desc::Define,
            size,
            Some(FragmentRef::new(fragment, 0)),
            Visibility::Default,
        );
        self.reuse.insert((kind, target), entry);
        entry
    }

    /// Checks that after stub insertion and re-layout every direct branch reaches its (possibly
    /// redirected) target. A failure here means the stub section itself landed out of range.
    pub fn verify_branch_ranges(&self, ctx: &LinkContext<'_>, thumb2: bool) -> Result {
        for reloc in ctx.relocations() {
            let is_branch = matches!(
                reloc.r_type,
                object::elf::R_ARM_CALL
                    | object::elf::R_ARM_JUMP24
                    | object::elf::R_ARM_PC24
                    | arm::R_ARM_THM_CALL
                    | object::elf::R_ARM_THM_JUMP24
            );
            if !is_branch {
                continue;
            }
            let (Some(section), Some(symbol)) = (reloc.section, reloc.symbol) else {
                continue;
            };
            let Some(section_address) = ctx.section(section).address() else {
                bail!("branch verification ran before layout");
            };
            let source_address = section_address + reloc.offset;
            let target_value = ctx.symbol_value(symbol);

            let bias = match reloc.r_type {
                arm::R_ARM_THM_CALL | object::elf::R_ARM_THM_JUMP24 => arm::THM_PC_BIAS,
                _ => arm::ARM_PC_BIAS,
            };
            let destination = arm::clear_thumb_bit(target_value)
                .wrapping_add_signed(reloc.addend)
                .wrapping_add(bias);
            let displacement = destination.wrapping_sub(source_address) as i64;
            let (min, max) = arm::branch_range(reloc.r_type, thumb2)?;
            if displacement < min || displacement > max {
                bail!(
                    "{} branch at 0x{source_address:x} cannot reach its target at \
                     0x{target_value:x} even via a stub",
                    arm::arm_rel_type_to_string(reloc.r_type)
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LinkConfig;
    use crate::resolve::Binding;
    use crate::section::SectionKind;
    use braze_utils::elf::{SectionFlags, shf, sht};

    fn code_flags() -> SectionFlags {
        SectionFlags::empty().with(shf::ALLOC).with(shf::EXECINSTR)
    }

    struct Fixture<'data> {
        ctx: LinkContext<'data>,
        text: SectionId,
        stubs: SectionId,
    }

    /// A `.text` with `span` bytes of code and a `.text.stubs` output placed after it.
    fn fixture(span: u64) -> Fixture<'static> {
        let mut ctx = LinkContext::new(LinkConfig::default());
        let text = ctx.create_sect_hdr(
            b".text",
            SectionKind::Regular,
            sht::PROGBITS,
            code_flags(),
        );
        let stream = ctx.get_or_create_fragment_stream(text);
        ctx.add_fragment(
            stream,
            Fragment::Fill {
                size: span,
                value: 0,
            },
        );
        let stubs = ctx.create_sect_hdr(
            b".text.stubs",
            SectionKind::Regular,
            sht::PROGBITS,
            code_flags(),
        );
        Fixture { ctx, text, stubs }
    }

    fn define_func(ctx: &mut LinkContext<'static>, name: &'static [u8], value: u64) -> SymbolId {
        let sym = ctx
            .add_global_symbol(
                name,
                false,
                SymbolType::Func,
                Desc::Define,
                Binding::Global,
                4,
                None,
                Visibility::Default,
            )
            .unwrap();
        let record = ctx.symbols().symbol(sym).record();
        ctx.symbols_mut().record_mut(record).set_value(value);
        sym
    }

    #[test]
    fn thumb_call_in_range_needs_no_stub() {
        let stub = ThumbToArmStub::new(false, false);
        let reloc = Relocation {
            section: None,
            offset: 0,
            symbol: None,
            r_type: arm::R_ARM_THM_CALL,
            addend: -4,
        };
        // Target 1 KiB away, well inside the 4 MiB window.
        assert!(!stub.is_my_duty(&reloc, 0x1_0000, 0x1_0400, false));
        // Target 8 MiB away.
        assert!(stub.is_my_duty(&reloc, 0x1_0000, 0x81_0000, false));
    }

    #[test]
    fn thumb_jump24_to_arm_always_needs_a_stub() {
        let stub = ThumbToArmStub::new(false, false);
        let reloc = Relocation {
            section: None,
            offset: 0,
            symbol: None,
            r_type: object::elf::R_ARM_THM_JUMP24,
            addend: -4,
        };
        assert!(stub.is_my_duty(&reloc, 0x1_0000, 0x1_0100, false));
        // A Thumb target is fine for b.w, no set exchange needed.
        assert!(!stub.is_my_duty(&reloc, 0x1_0000, 0x1_0101, false));
    }

    #[test]
    fn arm_call_to_near_thumb_uses_blx() {
        let stub = ArmToThumbStub::new(false);
        let reloc = Relocation {
            section: None,
            offset: 0,
            symbol: None,
            r_type: object::elf::R_ARM_CALL,
            addend: -8,
        };
        assert!(!stub.is_my_duty(&reloc, 0x1_0000, 0x1_0401, false));
        assert!(stub.is_my_duty(&reloc, 0x1_0000, 0x4001_0001, false));
    }

    #[test]
    fn pic_and_non_pic_templates_differ() {
        let plain = ThumbToArmStub::new(false, false);
        let pic = ThumbToArmStub::new(true, false);
        assert_eq!(plain.template().len(), 12);
        assert_eq!(pic.template().len(), 16);
        assert_eq!(plain.fixups()[0].r_type, object::elf::R_ARM_ABS32);
        assert_eq!(pic.fixups()[0].r_type, object::elf::R_ARM_REL32);
    }

    #[test]
    fn interworking_veneer_enters_with_bx_pc() {
        // The first Thumb halfword must be `bx pc` (0x4778) followed by `nop` (0x46c0), in both
        // template flavors, or the veneer never leaves Thumb state.
        for pic in [false, true] {
            let stub = ThumbToArmStub::new(pic, false);
            assert_eq!(&stub.template()[..4], &[0x78, 0x47, 0xc0, 0x46]);
        }
    }

    #[test]
    fn clone_owns_its_bytes() {
        let proto = ArmToThumbStub::new(false);
        let copy = proto.clone_boxed();
        assert_eq!(proto.template(), copy.template());
        assert_ne!(proto.template().as_ptr(), copy.template().as_ptr());
    }

    #[test]
    fn scan_inserts_redirects_and_converges() {
        // A Thumb call to an ARM target 9 MiB out. The stub section sits right after the small
        // `.text`, so the trampoline itself is reachable.
        let Fixture {
            mut ctx,
            text,
            stubs,
        } = fixture(0x1000);
        let target = define_func(&mut ctx, b"far_arm_func", 0x0090_0000);
        let index = ctx.add_relocation(text, 0, target, arm::R_ARM_THM_CALL, -4);
        ctx.layout().unwrap();

        let mut engine = StubEngine::with_arm_prototypes(stubs, false, false);
        assert_eq!(engine.scan(&mut ctx).unwrap(), 1);

        let entry = ctx.relocations()[index].symbol.unwrap();
        assert_ne!(entry, target);
        let entry_record = ctx.symbols().record_of(entry);
        let frag_ref = entry_record.frag_ref().unwrap();
        assert!(ctx.fragment(frag_ref.fragment).is_stub());

        // The stub entry is Thumb code, so after layout its value carries the Thumb bit.
        ctx.layout().unwrap();
        assert!(arm::is_thumb_address(ctx.symbol_value(entry)));

        // Re-scan after re-layout must not stub the already-redirected branch again.
        assert_eq!(engine.scan(&mut ctx).unwrap(), 0);
        assert!(engine.verify_branch_ranges(&ctx, false).is_ok());
    }

    #[test]
    fn branches_to_one_target_share_a_stub() {
        let Fixture {
            mut ctx,
            text,
            stubs,
        } = fixture(0x1000);
        let target = define_func(&mut ctx, b"far_arm_func", 0x0090_0000);
        let first = ctx.add_relocation(text, 0, target, arm::R_ARM_THM_CALL, -4);
        let second = ctx.add_relocation(text, 0x100, target, arm::R_ARM_THM_CALL, -4);
        ctx.layout().unwrap();

        let mut engine = StubEngine::with_arm_prototypes(stubs, false, false);
        assert_eq!(engine.scan(&mut ctx).unwrap(), 1);
        assert_eq!(
            ctx.relocations()[first].symbol,
            ctx.relocations()[second].symbol
        );
    }

    #[test]
    fn unreachable_after_stubbing_is_fatal() {
        // An ARM-to-ARM call 64 MiB out. Neither interworking prototype claims it, and no stub
        // can help, so verification must fail.
        let Fixture {
            mut ctx,
            text,
            stubs,
        } = fixture(0x0400_0000);
        let target = define_func(&mut ctx, b"very_far_arm_func", 0x0410_0000);
        ctx.add_relocation(text, 0, target, object::elf::R_ARM_CALL, -8);
        ctx.layout().unwrap();

        let mut engine = StubEngine::with_arm_prototypes(stubs, false, false);
        assert_eq!(engine.scan(&mut ctx).unwrap(), 0);
        let err = engine.verify_branch_ranges(&ctx, false).unwrap_err();
        assert!(err.to_string().contains("R_ARM_CALL"));
    }
}

//! Canonical per-name symbol state and the rules for merging a newly seen symbol into it.
//!
//! Every non-local name across all inputs has exactly one live `SymbolRecord`. As each input is
//! processed, its view of the name is folded into that record by `Resolver::resolve`, which decides
//! the winner, mutates the record in place and reports whether the record's identity changed.

use crate::error::MultipleDefinitions;
use crate::error::Result;
use crate::fragment::FragmentRef;
use crate::symbol::SymbolName;
use bitflags::bitflags;

/// Scope and strength of a name. `Local` never participates in cross-input resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    Global,
    Weak,
    Local,
}

/// What kind of thing the symbol table entry stands for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Desc {
    Undefined,
    Define,
    Common,
    Indirect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Default,
    Internal,
    Hidden,
    Protected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SymbolType {
    #[default]
    NoType,
    Object,
    Func,
    Section,
    File,
    Tls,
}

bitflags! {
    /// Extra per-record state that isn't captured by binding/desc.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u8 {
        /// The record's current winner came from a shared (dynamic) object rather than regular
        /// object code. Definitions from regular inputs beat dynamic ones.
        const FROM_DYNAMIC = 1 << 0;

        /// The record was synthesized for an output section symbol rather than read from an input.
        const SECTION_SYMBOL = 1 << 1;
    }
}

/// The canonical resolution state for one symbol name.
#[derive(Clone, Debug)]
pub struct SymbolRecord<'data> {
    name: SymbolName<'data>,
    binding: Binding,
    desc: Desc,
    visibility: Visibility,
    sym_type: SymbolType,
    flags: RecordFlags,
    size: u64,
    value: u64,
    frag_ref: Option<FragmentRef>,
}

impl<'data> SymbolRecord<'data> {
    pub fn new(name: SymbolName<'data>) -> Self {
        Self {
            name,
            binding: Binding::Global,
            desc: Desc::Undefined,
            visibility: Visibility::Default,
            sym_type: SymbolType::NoType,
            flags: RecordFlags::empty(),
            size: 0,
            value: 0,
            frag_ref: None,
        }
    }

    pub fn name(&self) -> SymbolName<'data> {
        self.name
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn desc(&self) -> Desc {
        self.desc
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn sym_type(&self) -> SymbolType {
        self.sym_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn frag_ref(&self) -> Option<FragmentRef> {
        self.frag_ref
    }

    pub fn is_dynamic(&self) -> bool {
        self.flags.contains(RecordFlags::FROM_DYNAMIC)
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self.desc, Desc::Undefined)
    }

    pub fn is_weak(&self) -> bool {
        self.binding == Binding::Weak
    }

    pub(crate) fn flags(&self) -> RecordFlags {
        self.flags
    }

    pub fn set_binding(&mut self, binding: Binding) -> &mut Self {
        self.binding = binding;
        self
    }

    pub fn set_desc(&mut self, desc: Desc) -> &mut Self {
        self.desc = desc;
        self
    }

    pub fn set_visibility(&mut self, visibility: Visibility) -> &mut Self {
        self.visibility = visibility;
        self
    }

    pub fn set_type(&mut self, sym_type: SymbolType) -> &mut Self {
        self.sym_type = sym_type;
        self
    }

    pub fn set_size(&mut self, size: u64) -> &mut Self {
        self.size = size;
        self
    }

    pub fn set_value(&mut self, value: u64) -> &mut Self {
        self.value = value;
        self
    }

    pub fn set_dynamic(&mut self, is_dynamic: bool) -> &mut Self {
        self.flags.set(RecordFlags::FROM_DYNAMIC, is_dynamic);
        self
    }

    pub(crate) fn set_flags(&mut self, flags: RecordFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn set_frag_ref(&mut self, frag_ref: Option<FragmentRef>) -> &mut Self {
        self.frag_ref = frag_ref;
        self
    }

    /// Replaces this record's resolution state with `other`'s. The interned name stays; everything
    /// the winner contributes moves over.
    fn adopt(&mut self, other: &SymbolRecord<'data>) {
        self.binding = other.binding;
        self.desc = other.desc;
        self.visibility = other.visibility;
        self.sym_type = other.sym_type;
        self.flags = other.flags;
        self.size = other.size;
        self.value = other.value;
        self.frag_ref = other.frag_ref;
    }
}

/// The outcome of one call to [`Resolver::resolve`]. An abort (multiple strong definitions) is an
/// `Err` instead, so that it propagates with `?` like every other fatal condition.
#[derive(Debug, Default)]
pub struct Resolution {
    /// True when the record's identity changed, i.e. the new symbol became the winner. Note that
    /// the Common-vs-Common size merge can update the record's fields while leaving this false;
    /// output-symbol bookkeeping depends on the distinction, so don't "fix" it.
    pub overridden: bool,

    /// A non-fatal diagnostic to surface to the user, if any.
    pub warning: Option<String>,
}

impl Resolution {
    fn success(overridden: bool) -> Resolution {
        Resolution {
            overridden,
            warning: None,
        }
    }
}

/// Decides, for two views of the same name, which definition wins. Pure apart from mutating `old`
/// into the canonical post-merge state.
#[derive(Default)]
pub struct Resolver;

impl Resolver {
    /// Merges `new` into `old`. `old` becomes the canonical record; the caller discards `new`.
    pub fn resolve<'data>(
        &self,
        old: &mut SymbolRecord<'data>,
        new: &SymbolRecord<'data>,
    ) -> Result<Resolution> {
        debug_assert!(old.name().bytes() == new.name().bytes());
        debug_assert!(old.binding != Binding::Local && new.binding != Binding::Local);

        // A reference adds nothing to a name we already track, whatever its state. This covers
        // define-then-undefined and undefined-then-undefined.
        if !new.is_defined() {
            return Ok(Resolution::success(false));
        }

        // First definition for a name we so far only had references to.
        if !old.is_defined() {
            old.adopt(new);
            return Ok(Resolution::success(true));
        }

        // Both sides define the symbol from here on.

        if old.is_dynamic() {
            if new.is_dynamic() {
                // Among shared objects, the first definition seen wins.
                return Ok(Resolution::success(false));
            }
            // A definition in regular object code beats one from a shared object.
            old.adopt(new);
            return Ok(Resolution::success(true));
        }
        if new.is_dynamic() {
            return Ok(Resolution::success(false));
        }

        match (old.desc, new.desc) {
            (Desc::Define, Desc::Define) => match (old.binding, new.binding) {
                (Binding::Weak, Binding::Global) => {
                    old.adopt(new);
                    Ok(Resolution::success(true))
                }
                (_, Binding::Weak) => Ok(Resolution::success(false)),
                _ => Err(MultipleDefinitions {
                    name: old.name().to_string(),
                }
                .into()),
            },
            (Desc::Common, Desc::Common) => {
                if old.is_weak() && !new.is_weak() {
                    // A weak tentative definition loses its claim on the record outright.
                    let size = old.size.max(new.size);
                    old.adopt(new);
                    old.size = size;
                    Ok(Resolution::success(true))
                } else if !old.is_weak() && new.is_weak() {
                    Ok(Resolution::success(false))
                } else {
                    // The bigger tentative definition dictates the size; the record identity is
                    // unchanged, so this does not count as an override.
                    if new.size > old.size {
                        old.size = new.size;
                    }
                    Ok(Resolution::success(false))
                }
            }
            (Desc::Common, Desc::Define) => {
                let warning = format!("definition of '{}' is overriding common.", old.name());
                old.adopt(new);
                Ok(Resolution {
                    overridden: true,
                    warning: Some(warning),
                })
            }
            (Desc::Define, Desc::Common) => {
                // The real definition already won; the tentative one only contributes if the
                // existing winner is weak.
                if old.is_weak() && !new.is_weak() {
                    old.adopt(new);
                    Ok(Resolution::success(true))
                } else {
                    Ok(Resolution::success(false))
                }
            }
            // Indirect symbols resolve through the record they alias, which happens when the
            // output symbol table is built. At merge time the first one seen holds the record.
            (Desc::Indirect, _) | (_, Desc::Indirect) => Ok(Resolution::success(false)),
            (Desc::Undefined, _) | (_, Desc::Undefined) => unreachable!("handled above"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &'static [u8]) -> SymbolRecord<'static> {
        SymbolRecord::new(SymbolName::new(name))
    }

    #[test]
    fn multiple_strong_definitions_abort() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define);

        let err = Resolver.resolve(&mut old, &new).unwrap_err();
        assert_eq!(err.to_string(), "multiple definitions of `abc'.");
    }

    #[test]
    fn define_survives_later_reference() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define).set_size(1).set_value(1);
        let new = record(b"abc");

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert!(res.warning.is_none());
        assert_eq!(old.size(), 1);
        assert_eq!(old.value(), 1);
        assert_eq!(old.desc(), Desc::Define);
    }

    #[test]
    fn reference_after_reference_keeps_old() {
        let mut old = record(b"abc");
        old.set_size(1).set_value(1);
        let new = record(b"abc");

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 1);
        assert_eq!(old.value(), 1);
    }

    #[test]
    fn global_define_overrides_weak() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define)
            .set_binding(Binding::Weak)
            .set_size(1)
            .set_value(1);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define).set_size(0).set_value(0);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(res.overridden);
        assert_eq!(old.size(), 0);
        assert_eq!(old.value(), 0);
        assert_eq!(old.binding(), Binding::Global);
    }

    #[test]
    fn weak_define_loses_to_existing_global() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define).set_size(1).set_value(1);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define)
            .set_binding(Binding::Weak)
            .set_size(0)
            .set_value(0);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 1);
        assert_eq!(old.value(), 1);
    }

    #[test]
    fn bigger_common_marks_record_without_override() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Common).set_size(0).set_value(111);
        let mut new = record(b"abc");
        new.set_desc(Desc::Common).set_size(999).set_value(999);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 999);
        assert_eq!(old.value(), 111);
    }

    #[test]
    fn smaller_common_leaves_record_alone() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Common).set_size(8).set_value(111);
        let mut new = record(b"abc");
        new.set_desc(Desc::Common).set_size(4).set_value(999);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 8);
        assert_eq!(old.value(), 111);
    }

    #[test]
    fn common_overrides_weak_common() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Common)
            .set_binding(Binding::Weak)
            .set_size(0)
            .set_value(111);
        let mut new = record(b"abc");
        new.set_desc(Desc::Common).set_size(999).set_value(999);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(res.overridden);
        assert_eq!(old.size(), 999);
        assert_eq!(old.value(), 999);
        assert_eq!(old.binding(), Binding::Global);
    }

    #[test]
    fn define_overrides_common_with_warning() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Common).set_size(0).set_value(111);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define).set_size(999).set_value(999);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(res.overridden);
        assert_eq!(old.size(), 999);
        assert_eq!(old.value(), 999);
        assert_eq!(
            res.warning.as_deref(),
            Some("definition of 'abc' is overriding common.")
        );
    }

    #[test]
    fn first_dynamic_definition_wins() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define)
            .set_dynamic(true)
            .set_size(1)
            .set_value(1);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define)
            .set_dynamic(true)
            .set_size(0)
            .set_value(0);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 1);
        assert_eq!(old.value(), 1);
    }

    #[test]
    fn regular_definition_beats_dynamic() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define)
            .set_dynamic(true)
            .set_size(1)
            .set_value(1);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define).set_size(2).set_value(2);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(res.overridden);
        assert_eq!(old.size(), 2);
        assert!(!old.is_dynamic());
    }

    #[test]
    fn dynamic_definition_does_not_displace_regular() {
        let mut old = record(b"abc");
        old.set_desc(Desc::Define).set_size(1).set_value(1);
        let mut new = record(b"abc");
        new.set_desc(Desc::Define)
            .set_dynamic(true)
            .set_size(2)
            .set_value(2);

        let res = Resolver.resolve(&mut old, &new).unwrap();
        assert!(!res.overridden);
        assert_eq!(old.size(), 1);
    }

    /// Folding the same arrivals for one name must end in the same canonical state regardless of
    /// how the non-conflicting ones are interleaved.
    #[test]
    fn fold_order_converges() {
        let mut weak = record(b"abc");
        weak.set_desc(Desc::Define)
            .set_binding(Binding::Weak)
            .set_size(1)
            .set_value(1);
        let mut global = record(b"abc");
        global.set_desc(Desc::Define).set_size(7).set_value(7);
        let undef = record(b"abc");

        for arrivals in [
            [&weak, &global, &undef],
            [&undef, &weak, &global],
            [&weak, &undef, &global],
        ] {
            let mut canonical = record(b"abc");
            for arrival in arrivals {
                Resolver.resolve(&mut canonical, arrival).unwrap();
            }
            assert_eq!(canonical.desc(), Desc::Define);
            assert_eq!(canonical.binding(), Binding::Global);
            assert_eq!(canonical.size(), 7);
            assert_eq!(canonical.value(), 7);
        }
    }
}

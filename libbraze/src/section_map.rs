//! The policy that decides which output section an input section's bytes land in.
//!
//! Matching is by name prefix, longest rule first, so `.text.unlikely.foo` funnels into `.text`
//! and a name with no rule maps to itself.

/// A name-remapping rule: any input section whose name starts with `prefix` goes to `output`.
struct MappingRule {
    prefix: &'static [u8],
    output: &'static [u8],
}

pub struct SectionMap {
    rules: Vec<MappingRule>,
}

/// The standard GNU-style mappings. Order doesn't matter; lookup picks the longest match.
const STANDARD_RULES: &[(&[u8], &[u8])] = &[
    (b".text", b".text"),
    (b".rodata", b".rodata"),
    (b".data.rel.ro.local", b".data.rel.ro.local"),
    (b".data.rel.ro", b".data.rel.ro"),
    (b".data", b".data"),
    (b".bss", b".bss"),
    (b".tdata", b".tdata"),
    (b".tbss", b".tbss"),
    (b".init_array", b".init_array"),
    (b".fini_array", b".fini_array"),
    (b".gcc_except_table", b".gcc_except_table"),
    (b".sdata", b".sdata"),
    (b".sbss", b".sbss"),
];

impl Default for SectionMap {
    fn default() -> Self {
        let rules = STANDARD_RULES
            .iter()
            .map(|(prefix, output)| MappingRule { prefix, output })
            .collect();
        Self { rules }
    }
}

impl SectionMap {
    /// Adds a custom rule, e.g. from a linker script. Custom rules compete with the standard ones
    /// on prefix length like any other.
    pub fn add_rule(&mut self, prefix: &'static [u8], output: &'static [u8]) {
        self.rules.push(MappingRule { prefix, output });
    }

    /// Returns the output section name for an input section name. Rule outputs are `'static`, so
    /// the result always lives at least as long as the input name.
    pub fn output_name<'data>(&self, input_name: &'data [u8]) -> &'data [u8] {
        let best = self
            .rules
            .iter()
            .filter(|rule| input_name.starts_with(rule.prefix))
            .max_by_key(|rule| rule.prefix.len());
        match best {
            Some(rule) => rule.output,
            None => input_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_sections_funnel_to_text() {
        let map = SectionMap::default();
        assert_eq!(map.output_name(b".text.foo"), b".text");
        assert_eq!(map.output_name(b".text"), b".text");
    }

    #[test]
    fn longest_prefix_wins() {
        let map = SectionMap::default();
        assert_eq!(
            map.output_name(b".data.rel.ro.local.x"),
            b".data.rel.ro.local"
        );
        assert_eq!(map.output_name(b".data.rel.ro.x"), b".data.rel.ro");
        assert_eq!(map.output_name(b".data.x"), b".data");
    }

    #[test]
    fn unmatched_names_map_to_themselves() {
        let map = SectionMap::default();
        assert_eq!(map.output_name(b".mysection"), b".mysection");
    }

    #[test]
    fn custom_rules_participate() {
        let mut map = SectionMap::default();
        map.add_rule(b".text.hot", b".text.hot");
        assert_eq!(map.output_name(b".text.hot.foo"), b".text.hot");
        assert_eq!(map.output_name(b".text.cold"), b".text");
    }
}

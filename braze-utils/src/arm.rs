//! ARM / Thumb interworking knowledge shared by the stub engine and external tooling.

use crate::elf::const_name_by_value;
use std::borrow::Cow;

/// Maximum forward displacement of an ARM-mode `b`/`bl` (signed 26-bit, word aligned), measured
/// from the relocation site. Includes the 8-byte ARM PC bias.
pub const ARM_MAX_FWD_BRANCH_OFFSET: i64 = (((1 << 23) - 1) << 2) + 8;
pub const ARM_MAX_BWD_BRANCH_OFFSET: i64 = (-((1 << 23) << 2)) + 8;

/// Maximum displacement of a Thumb `bl`/`blx` on cores without the wide (Thumb-2) encoding.
/// Includes the 4-byte Thumb PC bias.
pub const THM_MAX_FWD_BRANCH_OFFSET: i64 = (1 << 22) - 2 + 4;
pub const THM_MAX_BWD_BRANCH_OFFSET: i64 = -(1 << 22) + 4;

/// Thumb-2 wide branch range.
pub const THM2_MAX_FWD_BRANCH_OFFSET: i64 = ((1 << 24) - 2) + 4;
pub const THM2_MAX_BWD_BRANCH_OFFSET: i64 = -(1 << 24) + 4;

/// PC reads 2 instructions ahead in each mode.
pub const THM_PC_BIAS: u64 = 4;
pub const ARM_PC_BIAS: u64 = 8;

/// Relocation 10 under its modern name. The `object` crate only carries the legacy
/// `R_ARM_THM_PC22` spelling.
pub const R_ARM_THM_CALL: u32 = object::elf::R_ARM_THM_PC22;

/// Bit 0 of a code address distinguishes the instruction set of the target.
#[must_use]
pub const fn is_thumb_address(value: u64) -> bool {
    value & 1 != 0
}

#[must_use]
pub const fn clear_thumb_bit(value: u64) -> u64 {
    value & !1
}

/// Returns the (backward, forward) displacement limits for a direct branch relocation.
pub fn branch_range(r_type: u32, thumb2: bool) -> anyhow::Result<(i64, i64)> {
    match r_type {
        object::elf::R_ARM_CALL | object::elf::R_ARM_JUMP24 | object::elf::R_ARM_PC24 => {
            Ok((ARM_MAX_BWD_BRANCH_OFFSET, ARM_MAX_FWD_BRANCH_OFFSET))
        }
        R_ARM_THM_CALL | object::elf::R_ARM_THM_JUMP24 => {
            if thumb2 {
                Ok((THM2_MAX_BWD_BRANCH_OFFSET, THM2_MAX_FWD_BRANCH_OFFSET))
            } else {
                Ok((THM_MAX_BWD_BRANCH_OFFSET, THM_MAX_FWD_BRANCH_OFFSET))
            }
        }
        _ => anyhow::bail!(
            "{} is not a direct branch relocation",
            arm_rel_type_to_string(r_type)
        ),
    }
}

#[must_use]
pub fn arm_rel_type_to_string(r_type: u32) -> Cow<'static, str> {
    if r_type == R_ARM_THM_CALL {
        return Cow::Borrowed("R_ARM_THM_CALL");
    }
    if let Some(name) = const_name_by_value![
        r_type,
        R_ARM_NONE,
        R_ARM_PC24,
        R_ARM_ABS32,
        R_ARM_REL32,
        R_ARM_CALL,
        R_ARM_JUMP24,
        R_ARM_THM_JUMP24,
        R_ARM_PLT32,
        R_ARM_GOT32,
        R_ARM_COPY,
        R_ARM_GLOB_DAT,
        R_ARM_JUMP_SLOT,
        R_ARM_RELATIVE
    ] {
        Cow::Borrowed(name)
    } else {
        Cow::Owned(format!("Unknown arm relocation type 0x{r_type:x}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_ranges_are_signed_and_asymmetric() {
        assert!(ARM_MAX_FWD_BRANCH_OFFSET > 0);
        assert!(ARM_MAX_BWD_BRANCH_OFFSET < 0);
        assert!(THM2_MAX_FWD_BRANCH_OFFSET > THM_MAX_FWD_BRANCH_OFFSET);
        assert!(THM2_MAX_BWD_BRANCH_OFFSET < THM_MAX_BWD_BRANCH_OFFSET);
    }

    #[test]
    fn thumb_bit() {
        assert!(is_thumb_address(0x8001));
        assert!(!is_thumb_address(0x8000));
        assert_eq!(clear_thumb_bit(0x8001), 0x8000);
    }

    #[test]
    fn rel_type_names() {
        assert_eq!(arm_rel_type_to_string(R_ARM_THM_CALL), "R_ARM_THM_CALL");
        assert_eq!(
            arm_rel_type_to_string(object::elf::R_ARM_JUMP24),
            "R_ARM_JUMP24"
        );
        assert!(arm_rel_type_to_string(0xfffe).contains("Unknown"));
    }

    #[test]
    fn thm_call_aliases_the_legacy_constant() {
        assert_eq!(R_ARM_THM_CALL, object::elf::R_ARM_THM_PC22);
        assert_eq!(R_ARM_THM_CALL, 10);
        assert!(branch_range(R_ARM_THM_CALL, false).is_ok());
    }
}

//! Architecture identifiers and register descriptors.
//!
//! A register descriptor names a slice of a wider physical or virtual
//! register: flag set, local identifier, bit count and bit offset, plus the
//! architecture the identifier is scoped to.

use bitflags::bitflags;
use std::fmt;

/// Architecture the IL was lifted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ArchitectureId {
    Amd64 = 0,
    Arm64 = 1,
    /// Pure virtual architecture, contains no physical register access.
    Virtual = 2,
}

impl ArchitectureId {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ArchitectureId::Amd64),
            1 => Some(ArchitectureId::Arm64),
            2 => Some(ArchitectureId::Virtual),
            _ => None,
        }
    }
}

bitflags! {
    /// Flags describing register properties.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RegisterFlags: u64 {
        /// Physical register of the source architecture.
        const PHYSICAL = 1 << 0;
        /// Local temporary register of the current basic block.
        const LOCAL = 1 << 1;
        /// Holds CPU flags.
        const FLAGS = 1 << 2;
        /// Used as the stack pointer.
        const STACK_POINTER = 1 << 3;
        /// Alias to the image base.
        const IMAGE_BASE = 1 << 4;
        /// May change spontaneously between reads.
        const VOLATILE = 1 << 5;
        /// Must not be written to.
        const READONLY = 1 << 6;
        /// The special "undefined" register.
        const UNDEFINED = 1 << 7;
        /// Internal-use register allocated by the routine counter.
        const INTERNAL = 1 << 8;
        /// Combined mask of all special registers.
        const SPECIAL = Self::FLAGS.bits() | Self::STACK_POINTER.bits()
                      | Self::IMAGE_BASE.bits() | Self::UNDEFINED.bits();
    }
}

/// Describes a register slice used as an operand or a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterDesc {
    pub flags: RegisterFlags,
    /// Identifier, unique within (flags-class, architecture).
    pub local_id: u64,
    /// Number of bits accessed.
    pub bit_count: u32,
    /// Offset of the access into the full register.
    pub bit_offset: i32,
    pub architecture: ArchitectureId,
}

impl RegisterDesc {
    /// A pure virtual register of the given width.
    pub fn virt(local_id: u64, bit_count: u32) -> Self {
        RegisterDesc {
            flags: RegisterFlags::empty(),
            local_id,
            bit_count,
            bit_offset: 0,
            architecture: ArchitectureId::Virtual,
        }
    }

    /// An internal register allocated from the routine counter.
    pub fn internal(local_id: u64, bit_count: u32) -> Self {
        RegisterDesc {
            flags: RegisterFlags::INTERNAL,
            local_id,
            bit_count,
            bit_offset: 0,
            architecture: ArchitectureId::Virtual,
        }
    }

    /// A block-local temporary.
    pub fn local(local_id: u64, bit_count: u32) -> Self {
        RegisterDesc {
            flags: RegisterFlags::LOCAL,
            local_id,
            bit_count,
            bit_offset: 0,
            architecture: ArchitectureId::Virtual,
        }
    }

    /// A physical register of the given architecture.
    pub fn physical(architecture: ArchitectureId, local_id: u64, bit_count: u32) -> Self {
        RegisterDesc {
            flags: RegisterFlags::PHYSICAL,
            local_id,
            bit_count,
            bit_offset: 0,
            architecture,
        }
    }

    /// Re-slices the descriptor.
    pub fn select(&self, bit_count: u32, bit_offset: i32) -> Self {
        RegisterDesc {
            bit_count,
            bit_offset,
            ..*self
        }
    }

    pub fn is_physical(&self) -> bool {
        self.flags.contains(RegisterFlags::PHYSICAL)
    }
    pub fn is_virtual(&self) -> bool {
        !self.is_physical()
    }
    pub fn is_stack_pointer(&self) -> bool {
        self.flags.contains(RegisterFlags::STACK_POINTER)
    }
    pub fn is_image_base(&self) -> bool {
        self.flags.contains(RegisterFlags::IMAGE_BASE)
    }
    pub fn is_flags(&self) -> bool {
        self.flags.contains(RegisterFlags::FLAGS)
    }
    pub fn is_volatile(&self) -> bool {
        self.flags.contains(RegisterFlags::VOLATILE)
    }
    pub fn is_read_only(&self) -> bool {
        self.flags.contains(RegisterFlags::READONLY)
    }
    pub fn is_undefined(&self) -> bool {
        self.flags.contains(RegisterFlags::UNDEFINED)
    }
    pub fn is_local(&self) -> bool {
        self.flags.contains(RegisterFlags::LOCAL)
    }
    pub fn is_internal(&self) -> bool {
        self.flags.contains(RegisterFlags::INTERNAL)
    }

    /// Whether the two descriptors name the same underlying register,
    /// ignoring the slice.
    pub fn same_storage(&self, other: &RegisterDesc) -> bool {
        self.flags == other.flags
            && self.local_id == other.local_id
            && self.architecture == other.architecture
    }

    /// Whether the two slices overlap in the same underlying register.
    pub fn overlaps(&self, other: &RegisterDesc) -> bool {
        if !self.same_storage(other) {
            return false;
        }
        let a0 = self.bit_offset;
        let a1 = self.bit_offset + self.bit_count as i32;
        let b0 = other.bit_offset;
        let b1 = other.bit_offset + other.bit_count as i32;
        a0 < b1 && b0 < a1
    }

    /// Mask of the slice within the full register.
    pub fn mask(&self) -> u64 {
        crate::core::masks::fill_at(self.bit_count, self.bit_offset)
    }
}

/// Stack pointer register.
pub const REG_SP: RegisterDesc = RegisterDesc {
    flags: RegisterFlags::PHYSICAL
        .union(RegisterFlags::STACK_POINTER),
    local_id: 0,
    bit_count: 64,
    bit_offset: 0,
    architecture: ArchitectureId::Virtual,
};

/// Image base pseudo-register.
pub const REG_IMGBASE: RegisterDesc = RegisterDesc {
    flags: RegisterFlags::IMAGE_BASE
        .union(RegisterFlags::READONLY),
    local_id: 0,
    bit_count: 64,
    bit_offset: 0,
    architecture: ArchitectureId::Virtual,
};

/// Flags register.
pub const REG_FLAGS: RegisterDesc = RegisterDesc {
    flags: RegisterFlags::PHYSICAL.union(RegisterFlags::FLAGS),
    local_id: 0,
    bit_count: 64,
    bit_offset: 0,
    architecture: ArchitectureId::Virtual,
};

/// The special undefined register; reads produce fresh unconstrained values.
pub const REG_UNDEFINED: RegisterDesc = RegisterDesc {
    flags: RegisterFlags::UNDEFINED
        .union(RegisterFlags::VOLATILE),
    local_id: 0,
    bit_count: 64,
    bit_offset: 0,
    architecture: ArchitectureId::Virtual,
};

/// AMD64 general purpose registers for hosts lifting from x86-64.
pub mod amd64 {
    use super::{ArchitectureId, RegisterDesc, RegisterFlags};

    const fn gpr(local_id: u64) -> RegisterDesc {
        RegisterDesc {
            flags: RegisterFlags::PHYSICAL,
            local_id,
            bit_count: 64,
            bit_offset: 0,
            architecture: ArchitectureId::Amd64,
        }
    }

    pub const RAX: RegisterDesc = gpr(0);
    pub const RBX: RegisterDesc = gpr(1);
    pub const RCX: RegisterDesc = gpr(2);
    pub const RDX: RegisterDesc = gpr(3);
    pub const RSI: RegisterDesc = gpr(4);
    pub const RDI: RegisterDesc = gpr(5);
    pub const RBP: RegisterDesc = gpr(6);
    pub const R8: RegisterDesc = gpr(8);
    pub const R9: RegisterDesc = gpr(9);
    pub const R10: RegisterDesc = gpr(10);
    pub const R11: RegisterDesc = gpr(11);
    pub const R12: RegisterDesc = gpr(12);
    pub const R13: RegisterDesc = gpr(13);
    pub const R14: RegisterDesc = gpr(14);
    pub const R15: RegisterDesc = gpr(15);

    pub(super) const NAMES: [&str; 16] = [
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp",
        "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
    ];
}

impl fmt::Display for RegisterDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut prefix = String::new();
        if self.is_volatile() {
            prefix.push('?');
        }
        if self.is_read_only() {
            prefix.push_str("&&");
        }

        let mut suffix = String::new();
        if self.bit_offset != 0 {
            suffix = format!("@{}", self.bit_offset);
        }
        if self.bit_count != 64 {
            suffix.push_str(&format!(":{}", self.bit_count));
        }

        if self.is_internal() {
            return write!(f, "{prefix}sr{}{suffix}", self.local_id);
        }
        if self.is_undefined() {
            return write!(f, "{prefix}UD{suffix}");
        }
        if self.is_flags() {
            return write!(f, "{prefix}$flags{suffix}");
        }
        if self.is_stack_pointer() {
            return write!(f, "{prefix}$sp{suffix}");
        }
        if self.is_image_base() {
            return write!(f, "{prefix}base{suffix}");
        }
        if self.is_local() {
            return write!(f, "{prefix}t{}{suffix}", self.local_id);
        }
        if self.is_physical() && self.architecture == ArchitectureId::Amd64 {
            if let Some(name) = amd64::NAMES.get(self.local_id as usize) {
                return write!(f, "{prefix}{name}{suffix}");
            }
        }
        if self.is_physical() {
            return write!(f, "{prefix}pr{}{suffix}", self.local_id);
        }
        write!(f, "{prefix}vr{}{suffix}", self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap() {
        let full = RegisterDesc::virt(1, 64);
        let low = full.select(8, 0);
        let high = full.select(8, 8);
        assert!(full.overlaps(&low));
        assert!(full.overlaps(&high));
        assert!(!low.overlaps(&high));
        assert!(!full.overlaps(&RegisterDesc::virt(2, 64)));
    }

    #[test]
    fn test_mask() {
        let r = RegisterDesc::virt(1, 8).select(8, 8);
        assert_eq!(r.mask(), 0xFF00);
    }

    #[test]
    fn test_display() {
        assert_eq!(RegisterDesc::virt(3, 64).to_string(), "vr3");
        assert_eq!(RegisterDesc::virt(3, 32).to_string(), "vr3:32");
        assert_eq!(REG_SP.to_string(), "$sp");
        assert_eq!(amd64::RAX.to_string(), "rax");
        assert_eq!(amd64::RAX.select(8, 8).to_string(), "rax@8:8");
    }
}

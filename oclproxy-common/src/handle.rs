// Portable handle wrapper (spec.md §3, §4.1; original_source/include/ocland/client/ocland_icd.h).
use std::mem::size_of;

/// Architecture tag of a handle wrapper's payload.
///
/// Computed from the *sender's* pointer width; `Unset` is used when the
/// payload does not represent a native pointer at all (e.g. a generic
/// opaque identifier round-tripped without ever being dereferenced).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Arch {
    Le32 = 0,
    Le64 = 1,
    Unset = 2,
}

impl Arch {
    pub fn from_wire(b: u8) -> Option<Arch> {
        match b {
            0 => Some(Arch::Le32),
            1 => Some(Arch::Le64),
            2 => Some(Arch::Unset),
            _ => None,
        }
    }

    /// The architecture tag a handle originated on *this* process would carry.
    pub fn native() -> Arch {
        match size_of::<usize>() {
            4 => Arch::Le32,
            8 => Arch::Le64,
            _ => Arch::Unset,
        }
    }
}

/// Object-class tag of a handle wrapper (spec.md §3's nine classes plus Unset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectClass {
    Platform = 0,
    Device = 1,
    Context = 2,
    CommandQueue = 3,
    Memory = 4,
    Sampler = 5,
    Program = 6,
    Kernel = 7,
    Event = 8,
    Unset = 9,
}

impl ObjectClass {
    pub fn from_wire(b: u8) -> Option<ObjectClass> {
        use ObjectClass::*;
        match b {
            0 => Some(Platform),
            1 => Some(Device),
            2 => Some(Context),
            3 => Some(CommandQueue),
            4 => Some(Memory),
            5 => Some(Sampler),
            6 => Some(Program),
            7 => Some(Kernel),
            8 => Some(Event),
            9 => Some(Unset),
            _ => None,
        }
    }
}

/// On-wire representation of any object reference: an 8-byte opaque payload,
/// a 1-byte architecture tag, and a 1-byte object-class tag (10 bytes total;
/// the in-memory struct may be larger due to alignment, but exactly 10 bytes
/// are ever written to or read from the wire, per spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleWrapper {
    payload: [u8; 8],
    arch: Arch,
    class: ObjectClass,
}

pub const WIRE_SIZE: usize = 10;

impl HandleWrapper {
    /// Build a wrapper from a pointer that lives in *this* process, computing
    /// the architecture tag from this process's own pointer width.
    pub fn from_local_ptr(ptr: usize, class: ObjectClass) -> Self {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&(ptr as u64).to_le_bytes());
        HandleWrapper {
            payload,
            arch: Arch::native(),
            class,
        }
    }

    /// Build a wrapper carrying an opaque (non-pointer) identifier, e.g. a
    /// generic round-tripped value. Architecture tag is explicitly `Unset`.
    pub fn from_opaque(value: u64, class: ObjectClass) -> Self {
        HandleWrapper {
            payload: value.to_le_bytes(),
            arch: Arch::Unset,
            class,
        }
    }

    pub fn class(&self) -> ObjectClass {
        self.class
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Recover the payload as a 64-bit opaque value (always safe).
    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.payload)
    }

    /// Recover the payload as a local pointer-width value. Callers that are
    /// round-tripping a handle back into their own address space should
    /// additionally check `arch() == Arch::native()`.
    pub fn as_local_ptr(&self) -> usize {
        self.as_u64() as usize
    }

    pub(crate) fn to_wire_bytes(self) -> [u8; WIRE_SIZE] {
        let mut out = [0u8; WIRE_SIZE];
        out[..8].copy_from_slice(&self.payload);
        out[8] = self.arch as u8;
        out[9] = self.class as u8;
        out
    }

    pub(crate) fn from_wire_bytes(bytes: [u8; WIRE_SIZE]) -> Option<HandleWrapper> {
        let mut payload = [0u8; 8];
        payload.copy_from_slice(&bytes[..8]);
        let arch = Arch::from_wire(bytes[8])?;
        let class = ObjectClass::from_wire(bytes[9])?;
        Some(HandleWrapper {
            payload,
            arch,
            class,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_bytes_and_class() {
        let w = HandleWrapper::from_local_ptr(0xdead_beef, ObjectClass::Context);
        let bytes = w.to_wire_bytes();
        let back = HandleWrapper::from_wire_bytes(bytes).unwrap();
        assert_eq!(back.class(), ObjectClass::Context);
        assert_eq!(back.as_u64(), 0xdead_beef);
        assert_eq!(back.arch(), Arch::native());
    }

    #[test]
    fn rejects_unknown_class_byte() {
        let mut bytes = [0u8; WIRE_SIZE];
        bytes[9] = 250;
        assert!(HandleWrapper::from_wire_bytes(bytes).is_none());
    }

    #[test]
    fn opaque_wrapper_has_unset_arch() {
        let w = HandleWrapper::from_opaque(42, ObjectClass::Event);
        assert_eq!(w.arch(), Arch::Unset);
        assert_eq!(w.as_u64(), 42);
    }

    /// A handle minted on a 32-bit client must carry its `Le32` tag across
    /// the wire unchanged even when decoded on a 64-bit host (spec.md §9:
    /// "handles are architecture-tagged, not architecture-converted") —
    /// `from_wire_bytes` never upgrades a foreign tag to `Arch::native()`.
    #[test]
    fn foreign_arch_tag_survives_the_wire_round_trip() {
        let w = HandleWrapper { payload: 0xdead_beefu64.to_le_bytes(), arch: Arch::Le32, class: ObjectClass::Device };
        assert_ne!(w.arch, Arch::native(), "test assumes the host is not itself Le32");

        let bytes = w.to_wire_bytes();
        let back = HandleWrapper::from_wire_bytes(bytes).unwrap();
        assert_eq!(back.arch(), Arch::Le32);
        assert_eq!(back.class(), ObjectClass::Device);
        assert_eq!(back.as_u64(), 0xdead_beef);
    }
}

#![forbid(unsafe_code)]
#![no_std]

//! Shared primitive types for the skiff demand-paging layer.
//!
//! The accelerator and the software emulator name the same guest translation
//! with a single packed 64-bit key ([`PageKey`]): kernel bit, address-space
//! id, guest page number, and access permission. Guest virtual addresses on
//! this architecture are sign-extended from bit 47, so the kernel bit stands
//! in for the whole upper half:
//!
//! ```text
//! GVA  | kernel (0xFFFF/0x0000) | page number | page offset |
//! bits | 63                  48 | 47       12 | 11        0 |
//!
//! key  | K  | ASID    | page number | (unused)  | perm |
//! bits | 63 | 62   48 | 47       12 | 11      2 | 1  0 |
//! ```

/// Page granularity shared by the emulator and the accelerator.
pub const PAGE_SIZE: usize = 4096;

/// Mask selecting the page-offset bits of an address.
pub const PAGE_MASK: u64 = 0xfff;

/// Hardware thread slot index on the accelerator.
pub type ThreadId = u32;

/// Address-space identifier (15 significant bits).
pub type Asid = u16;

/// Round an address down to its 4 KiB page base.
#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

/// Memory access permission, encoded in the low two bits of a [`PageKey`].
///
/// The discriminants match the execution engine's access-type encoding, so
/// they travel unchanged through the device message protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Access {
    Load = 0,
    Store = 1,
    Fetch = 2,
}

impl Access {
    /// All permissions a translation can be resident under, in the order the
    /// flush paths probe them.
    pub const ALL: [Access; 3] = [Access::Load, Access::Store, Access::Fetch];

    #[inline]
    pub const fn bits(self) -> u64 {
        self as u64
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Option<Access> {
        match bits {
            0 => Some(Access::Load),
            1 => Some(Access::Store),
            2 => Some(Access::Fetch),
            _ => None,
        }
    }
}

const KERNEL_BIT: u64 = 1 << 63;
const ASID_SHIFT: u32 = 48;
const ASID_FIELD: u64 = 0x7fff << ASID_SHIFT;
const PAGE_FIELD: u64 = 0xf_ffff_ffff << 12;
const PERM_FIELD: u64 = 0b11;

/// Packed guest-mapping key: one guest translation as the accelerator sees it.
///
/// Two keys are equal iff they name the same (address space, guest page,
/// permission) triple; the page-offset bits never participate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey(u64);

impl PageKey {
    /// Pack a guest virtual address, ASID, and permission into a key.
    ///
    /// The kernel bit is taken from bit 63 of `gva`; the offset bits of
    /// `gva` are dropped.
    #[inline]
    pub const fn pack(gva: u64, asid: Asid, perm: Access) -> PageKey {
        PageKey(
            (gva & KERNEL_BIT)
                | (((asid as u64) << ASID_SHIFT) & ASID_FIELD)
                | (gva & PAGE_FIELD)
                | perm.bits(),
        )
    }

    /// Rebuild a key from its raw packed form (e.g. off the wire).
    ///
    /// Returns `None` if the permission field holds the unused encoding.
    #[inline]
    pub const fn from_raw(raw: u64) -> Option<PageKey> {
        match Access::from_bits(raw & PERM_FIELD) {
            Some(_) => Some(PageKey(raw)),
            None => None,
        }
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        self.0 & KERNEL_BIT != 0
    }

    #[inline]
    pub const fn asid(self) -> Asid {
        ((self.0 & ASID_FIELD) >> ASID_SHIFT) as Asid
    }

    /// Guest virtual page base, with the kernel half sign-extended back in.
    #[inline]
    pub const fn guest_page(self) -> u64 {
        let kernel_bits = if self.is_kernel() { 0xffff << 48 } else { 0 };
        kernel_bits | (self.0 & PAGE_FIELD)
    }

    #[inline]
    pub const fn perm(self) -> Access {
        // The constructor and `from_raw` only admit valid encodings.
        match Access::from_bits(self.0 & PERM_FIELD) {
            Some(perm) => perm,
            None => unreachable!(),
        }
    }

    /// The same key under a different permission.
    #[inline]
    pub const fn with_perm(self, perm: Access) -> PageKey {
        PageKey((self.0 & !PERM_FIELD) | perm.bits())
    }
}

impl core::fmt::Debug for PageKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageKey")
            .field("asid", &format_args!("{:#x}", self.asid()))
            .field("gva", &format_args!("{:#x}", self.guest_page()))
            .field("perm", &self.perm())
            .field("kernel", &self.is_kernel())
            .finish()
    }
}

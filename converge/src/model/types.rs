//! Strong types for resource property domains.
//!
//! These types carry the Hyper-V limits used while normalizing raw
//! specifications. Constructors return `None` outside the valid range.

use core::fmt;

/// A closed set of string choices with a canonical spelling.
pub trait Choice: Sized + Copy {
    const CHOICES: &'static [&'static str];
    fn parse(value: &str) -> Option<Self>;
    fn as_str(&self) -> &'static str;
}

/// Declares a closed set of string choices accepted case-insensitively and
/// stored in their canonical spelling.
macro_rules! choice_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Every accepted spelling, canonical form.
            pub const CHOICES: &'static [&'static str] = &[$($text),+];

            /// Parse ignoring ASCII case.
            pub fn parse(value: &str) -> Option<Self> {
                $(
                    if value.eq_ignore_ascii_case($text) {
                        return Some($name::$variant);
                    }
                )+
                None
            }

            /// Canonical spelling.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl $crate::model::types::Choice for $name {
            const CHOICES: &'static [&'static str] = $name::CHOICES;

            fn parse(value: &str) -> Option<Self> {
                $name::parse(value)
            }

            fn as_str(&self) -> &'static str {
                $name::as_str(self)
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use choice_enum;

/// Memory size in megabytes.
///
/// Validates that memory is within Hyper-V limits:
/// - Minimum: 32 MB
/// - Maximum: 12 TB (12,582,912 MB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryMB(u64);

impl MemoryMB {
    /// Minimum memory in MB (32 MB).
    pub const MIN: u64 = 32;
    /// Maximum memory in MB (12 TB).
    pub const MAX: u64 = 12 * 1024 * 1024;

    /// Returns `None` if outside valid range (32 MB - 12 TB).
    pub fn new(mb: u64) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&mb).then_some(Self(mb))
    }

    pub fn as_mb(&self) -> u64 {
        self.0
    }
}

impl Default for MemoryMB {
    fn default() -> Self {
        Self(1024)
    }
}

impl fmt::Display for MemoryMB {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 && self.0 % 1024 == 0 {
            write!(f, "{} GB", self.0 / 1024)
        } else {
            write!(f, "{} MB", self.0)
        }
    }
}

/// Virtual processor count (1-240).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorCount(u32);

impl ProcessorCount {
    pub const MIN: u32 = 1;
    pub const MAX: u32 = 240;

    /// Returns `None` if outside valid range (1-240).
    pub fn new(count: u32) -> Option<Self> {
        (Self::MIN..=Self::MAX).contains(&count).then_some(Self(count))
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl Default for ProcessorCount {
    fn default() -> Self {
        Self(1)
    }
}

impl fmt::Display for ProcessorCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} vCPU{}", self.0, if self.0 == 1 { "" } else { "s" })
    }
}

choice_enum! {
    /// Storage controller a hard drive attaches to.
    pub enum ControllerType {
        Ide => "IDE",
        Scsi => "SCSI",
    }
}

/// Controller slot of an attached drive: SCSI location (0-63) or IDE
/// location (0-1). IDE machines only have controllers 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiskLocation {
    controller_type: ControllerType,
    controller: u32,
    location: u32,
}

impl DiskLocation {
    /// Maximum SCSI location.
    pub const MAX_SCSI: u32 = 63;
    /// Maximum IDE location.
    pub const MAX_IDE: u32 = 1;
    /// Maximum IDE controller number.
    pub const MAX_IDE_CONTROLLER: u32 = 1;

    pub fn new(controller_type: ControllerType, controller: u32, location: u32) -> Option<Self> {
        let valid = match controller_type {
            ControllerType::Scsi => location <= Self::MAX_SCSI,
            ControllerType::Ide => {
                location <= Self::MAX_IDE && controller <= Self::MAX_IDE_CONTROLLER
            }
        };
        valid.then_some(Self {
            controller_type,
            controller,
            location,
        })
    }

    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    pub fn controller(&self) -> u32 {
        self.controller
    }

    pub fn location(&self) -> u32 {
        self.location
    }
}

impl fmt::Display for DiskLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}",
            self.controller_type, self.controller, self.location
        )
    }
}

/// VHD block size.
///
/// Valid values: 512 KB, 1 MB, 2 MB, 16 MB, 32 MB, 64 MB, 128 MB, 256 MB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const KB_512: Self = Self(512 * 1024);
    pub const MB_1: Self = Self(1024 * 1024);
    pub const MB_2: Self = Self(2 * 1024 * 1024);
    pub const MB_16: Self = Self(16 * 1024 * 1024);
    /// 32 MB block size (VHDX default).
    pub const MB_32: Self = Self(32 * 1024 * 1024);
    pub const MB_64: Self = Self(64 * 1024 * 1024);
    pub const MB_128: Self = Self(128 * 1024 * 1024);
    pub const MB_256: Self = Self(256 * 1024 * 1024);

    const ALL: [Self; 8] = [
        Self::KB_512,
        Self::MB_1,
        Self::MB_2,
        Self::MB_16,
        Self::MB_32,
        Self::MB_64,
        Self::MB_128,
        Self::MB_256,
    ];

    pub fn from_bytes(bytes: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|b| i64::from(b.0) == bytes)
    }

    pub fn as_bytes(&self) -> u32 {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::MB_32
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1024 * 1024 {
            write!(f, "{} MB", self.0 / (1024 * 1024))
        } else {
            write!(f, "{} KB", self.0 / 1024)
        }
    }
}

/// 802.1Q access VLAN identifier (1-4094).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    pub fn new(id: i64) -> Option<Self> {
        u16::try_from(id)
            .ok()
            .filter(|id| (Self::MIN..=Self::MAX).contains(id))
            .map(Self)
    }

    pub fn get(&self) -> u16 {
        self.0
    }
}

/// VMQ weight (0-100). Zero disables VMQ on the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmqWeight(u8);

impl VmqWeight {
    pub fn new(weight: i64) -> Option<Self> {
        u8::try_from(weight).ok().filter(|w| *w <= 100).map(Self)
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

/// Static MAC address, stored as 12 upper-case hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(String);

impl MacAddress {
    /// Accepts `00-15-5D-01-02-03`, `00:15:5d:01:02:03` or `00155D010203`.
    pub fn parse(value: &str) -> Option<Self> {
        let digits: String = value
            .chars()
            .filter(|c| !matches!(c, '-' | ':' | '.'))
            .collect();
        if digits.len() == 12 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(digits.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

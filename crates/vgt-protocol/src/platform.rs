//! Platform identity: which GPU generation is being mediated and which hypervisor hosts us.

/// Supported integrated GPU generations (`XEN_IGD_*`).
///
/// The raw value selects emulation behaviour variants; `Invalid` means the physical device was
/// not recognised and mediation must not start.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IgdGeneration {
    Invalid = 0,
    SandyBridge = 1,
    IvyBridge = 2,
    Haswell = 3,
}

/// The newest generation this contract knows how to mediate (`XEN_IGD_MAX`).
pub const IGD_GENERATION_MAX: IgdGeneration = IgdGeneration::Haswell;

impl IgdGeneration {
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::SandyBridge,
            2 => Self::IvyBridge,
            3 => Self::Haswell,
            _ => Self::Invalid,
        }
    }

    pub const fn to_raw(self) -> u32 {
        self as u32
    }

    pub fn is_supported(self) -> bool {
        self != Self::Invalid && self <= IGD_GENERATION_MAX
    }
}

/// The environment the privileged domain itself runs in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    /// No hypervisor signature (bare metal, or an unknown hypervisor).
    Native,
    Xen,
    Kvm,
}

const KVM_SIGNATURE: &[u8] = b"KVMKVMKVM";
const XEN_SIGNATURE: &[u8] = b"XenVMMXenVMM";

impl PlatformKind {
    /// Classifies the hypervisor vendor signature returned by CPUID leaf `0x4000_0000`.
    ///
    /// `ebx`, `ecx`, `edx` are the raw register values; the 12-byte signature is their
    /// little-endian concatenation.
    pub fn from_cpuid_signature(ebx: u32, ecx: u32, edx: u32) -> Self {
        let mut sig = [0u8; 12];
        sig[0..4].copy_from_slice(&ebx.to_le_bytes());
        sig[4..8].copy_from_slice(&ecx.to_le_bytes());
        sig[8..12].copy_from_slice(&edx.to_le_bytes());

        if sig.starts_with(KVM_SIGNATURE) {
            Self::Kvm
        } else if sig.starts_with(XEN_SIGNATURE) {
            Self::Xen
        } else {
            Self::Native
        }
    }
}

/// Capability query for the platform the mediator is running on.
///
/// Hypervisor detection is a collaborator concern (CPUID on x86, device tree elsewhere); the
/// mediator only consumes the answer.
pub trait PlatformProbe {
    fn guest_platform(&self) -> PlatformKind;
}

/// Probe with a fixed answer, for hosts that already know where they run (and for tests).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticPlatformProbe(pub PlatformKind);

impl PlatformProbe for StaticPlatformProbe {
    fn guest_platform(&self) -> PlatformKind {
        self.0
    }
}

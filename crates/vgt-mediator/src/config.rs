use vgt_protocol::{AvailableResources, GmadrRange};

/// Upper bounds on what this host can ever hand a single guest.
///
/// A guest minimum above these is a permanent failure, not something another negotiation round
/// can fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub max_low_gmadr: u32,
    pub max_high_gmadr: u32,
    pub max_fence_num: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            // Aperture (low) and hidden (high) graphics memory as carved up for a 2 GiB GGTT.
            max_low_gmadr: 256 << 20,
            max_high_gmadr: 1536 << 20,
            max_fence_num: 32,
        }
    }
}

impl ResourceLimits {
    pub fn admits(&self, min_low_gmadr: u32, min_high_gmadr: u32, min_fence_num: u32) -> bool {
        min_low_gmadr <= self.max_low_gmadr
            && min_high_gmadr <= self.max_high_gmadr
            && min_fence_num <= self.max_fence_num
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// How many rejected responses are answered with a fresh publication before giving up.
    pub max_retries: u32,
    pub limits: ResourceLimits,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediatorConfig {
    /// Initial allocation published to each new guest.
    pub default_resources: AvailableResources,
    /// Size of the device's mapped register BAR, including the PVINFO window.
    pub mmio_size: u64,
    pub negotiator: NegotiatorConfig,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            default_resources: AvailableResources {
                low_gmadr: GmadrRange::new(0, 64 << 20),
                high_gmadr: GmadrRange::new(0, 384 << 20),
                fence_num: 4,
            },
            mmio_size: 2 << 20,
            negotiator: NegotiatorConfig::default(),
        }
    }
}

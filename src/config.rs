/// Tunables for the HMM layer (maps to the driver's module parameters).
#[derive(Debug, Clone, Copy)]
pub struct HmmConfig {
    /// Administratively disable HMM for every address space.
    pub disable_hmm: bool,
    /// The host kernel was built with HMM and device-private memory support.
    pub host_supports_hmm: bool,
    /// ATS is serving pageable memory; it takes priority over HMM.
    pub ats_enabled: bool,
    /// How many times a fault is re-driven after `MoreProcessingRequired`.
    pub max_fault_retries: u32,
    /// Service a speculative window around each GPU fault.
    pub fault_prefetch: bool,
}

impl Default for HmmConfig {
    fn default() -> Self {
        Self {
            disable_hmm: false,
            host_supports_hmm: true,
            ats_enabled: false,
            max_fault_retries: 64,
            fault_prefetch: false,
        }
    }
}

impl HmmConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn disable_hmm(mut self) -> Self {
        self.disable_hmm = true;
        self
    }

    #[must_use]
    pub const fn without_host_support(mut self) -> Self {
        self.host_supports_hmm = false;
        self
    }

    #[must_use]
    pub const fn ats(mut self) -> Self {
        self.ats_enabled = true;
        self
    }

    #[must_use]
    pub const fn max_fault_retries(mut self, retries: u32) -> Self {
        self.max_fault_retries = retries;
        self
    }

    #[must_use]
    pub const fn fault_prefetch(mut self) -> Self {
        self.fault_prefetch = true;
        self
    }

    /// HMM is usable somewhere on this system.
    #[must_use]
    pub const fn enabled_system_wide(&self) -> bool {
        self.host_supports_hmm && !self.disable_hmm
    }
}

/// Per address space creation flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpaceFlags {
    pub disable_hmm: bool,
}

/// Whether an address space may create HMM blocks.
///
/// Evaluated on every call; none of the inputs are cached.
#[must_use]
pub const fn hmm_enabled(system_wide: bool, space_enabled: bool, ats_conflict: bool) -> bool {
    system_wide && space_enabled && !ats_conflict
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_composes_all_inputs() {
        assert!(hmm_enabled(true, true, false));
        assert!(!hmm_enabled(false, true, false));
        assert!(!hmm_enabled(true, false, false));
        assert!(!hmm_enabled(true, true, true));
    }

    #[test]
    fn builder() {
        let config = HmmConfig::new().max_fault_retries(3).fault_prefetch();
        assert_eq!(config.max_fault_retries, 3);
        assert!(config.fault_prefetch);
        assert!(config.enabled_system_wide());
        assert!(!HmmConfig::new().disable_hmm().enabled_system_wide());
        assert!(!HmmConfig::new().without_host_support().enabled_system_wide());
    }
}

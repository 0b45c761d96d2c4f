//! BIP9 deployment definitions.

/// Bits 29..31 of a signalling block version must equal `001`.
pub const VERSIONBITS_TOP_BITS: i32 = 0x2000_0000;
pub const VERSIONBITS_TOP_MASK: u32 = 0xE000_0000;
/// Number of assignable version bits.
pub const VERSIONBITS_NUM_BITS: u8 = 29;
/// `start_time` value that forces a deployment to ACTIVE from genesis.
pub const ALWAYS_ACTIVE: i64 = -1;
pub const NO_TIMEOUT: i64 = i64::MAX;

/// Adds `SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY` to the block script flags.
pub const DEPLOYMENT_CHECKLOCKTIMEVERIFY: &str = "checklocktimeverify";
/// Folds the masternode share into the stake reward and drops the
/// masternode payee requirement.
pub const DEPLOYMENT_DEPRECATE_MASTERNODES: &str = "deprecate_masternodes";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    pub fn as_str(self) -> &'static str {
        match self {
            ThresholdState::Defined => "defined",
            ThresholdState::Started => "started",
            ThresholdState::LockedIn => "locked_in",
            ThresholdState::Active => "active",
            ThresholdState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ThresholdState::Active | ThresholdState::Failed)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Bip9Deployment {
    pub name: String,
    pub bit: u8,
    /// Median time past at which signalling may start, or [`ALWAYS_ACTIVE`].
    pub start_time: i64,
    pub timeout: i64,
    pub period: u32,
    pub threshold: u32,
}

impl Bip9Deployment {
    pub fn new(
        name: impl Into<String>,
        bit: u8,
        start_time: i64,
        timeout: i64,
        period: u32,
        threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            bit,
            start_time,
            timeout,
            period,
            threshold,
        }
    }

    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }

    pub fn is_viable(&self) -> bool {
        if self.start_time == ALWAYS_ACTIVE {
            return true;
        }
        self.period > 0 && self.start_time <= self.timeout && self.period >= self.threshold
    }

    /// True when `version` carries the versionbits marker and this deployment's bit.
    pub fn signals(&self, version: i32) -> bool {
        let version = version as u32;
        (version & VERSIONBITS_TOP_MASK) == VERSIONBITS_TOP_BITS as u32
            && (version & self.mask()) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signalling_requires_top_bits() {
        let deployment = Bip9Deployment::new("csv", 0, 0, NO_TIMEOUT, 1000, 900);
        assert!(deployment.signals(VERSIONBITS_TOP_BITS | 1));
        assert!(!deployment.signals(VERSIONBITS_TOP_BITS | 2));
        assert!(!deployment.signals(0x4000_0001));
        assert!(!deployment.signals(1));
    }

    #[test]
    fn viability() {
        assert!(Bip9Deployment::new("a", 1, 0, 10, 10, 9).is_viable());
        assert!(!Bip9Deployment::new("b", 1, 11, 10, 10, 9).is_viable());
        assert!(!Bip9Deployment::new("c", 1, 0, 10, 8, 9).is_viable());
        assert!(Bip9Deployment::new("d", 1, ALWAYS_ACTIVE, 0, 0, 0).is_viable());
    }
}

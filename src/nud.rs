/// Kernel neighbour unreachability detection states (`NUD_*` in `linux/neighbour.h`).
///
/// Only a subset of states counts as "reachable": the kernel leaves `Stale` and
/// `Delay` only after an active re-verification fails, so those are treated as
/// present. Anything unrecognised maps to `Failed`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[repr(u32)]
pub enum NudState {
    None = 0x00,
    Incomplete = 0x01,
    Reachable = 0x02,
    Stale = 0x04,
    Delay = 0x08,
    Probe = 0x10,
    Failed = 0x20,
    Noarp = 0x40,
    Permanent = 0x80,
}

impl NudState {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x00 => Self::None,
            0x01 => Self::Incomplete,
            0x02 => Self::Reachable,
            0x04 => Self::Stale,
            0x08 => Self::Delay,
            0x10 => Self::Probe,
            0x20 => Self::Failed,
            0x40 => Self::Noarp,
            0x80 => Self::Permanent,
            _ => Self::Failed,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Incomplete => "incomplete",
            Self::Reachable => "reachable",
            Self::Stale => "stale",
            Self::Delay => "delay",
            Self::Probe => "probe",
            Self::Failed => "failed",
            Self::Noarp => "noarp",
            Self::Permanent => "permanent",
        }
    }

    #[inline]
    pub fn is_reachable(self) -> bool {
        matches!(
            self,
            Self::Reachable | Self::Stale | Self::Delay | Self::Permanent
        )
    }
}

impl std::fmt::Display for NudState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Maps a raw NUD code to a reachability verdict.
pub fn classify(code: u32) -> bool {
    NudState::from_code(code).is_reachable()
}

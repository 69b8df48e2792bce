//! Operating modes and the components each one runs.

use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// Pieces of the system a mode brings up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Components: u8 {
        /// Scheduler loop on its own thread (otherwise run inline to completion).
        const SCHEDULER_THREAD = 0b0000_0001;
        /// Renderer loop reading state for display.
        const RENDERER = 0b0000_0010;
        /// Console thread applying control commands.
        const CONSOLE = 0b0000_0100;
        /// Frame-sync handshake between scheduler and renderer is allowed.
        const FRAME_SYNC = 0b0000_1000;
    }
}

/// How the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Scheduler, renderer and console all active; frame-sync available.
    #[default]
    Visual,
    /// Scheduler and console, no renderer.
    Safe,
    /// Batch: run to completion on the caller's thread, no console.
    Optimal,
    /// Scheduler, renderer and console, free-running with no frame-sync.
    Unsafe,
}

impl Mode {
    /// Components this mode brings up.
    pub const fn components(self) -> Components {
        match self {
            Self::Visual => Components::SCHEDULER_THREAD
                .union(Components::RENDERER)
                .union(Components::CONSOLE)
                .union(Components::FRAME_SYNC),
            Self::Safe => Components::SCHEDULER_THREAD.union(Components::CONSOLE),
            Self::Optimal => Components::empty(),
            Self::Unsafe => Components::SCHEDULER_THREAD
                .union(Components::RENDERER)
                .union(Components::CONSOLE),
        }
    }

    /// Whether frame-sync can be engaged in this mode.
    pub const fn allows_frame_sync(self) -> bool {
        self.components().contains(Components::FRAME_SYNC)
    }

    /// All modes.
    pub const fn all() -> [Self; 4] {
        [Self::Visual, Self::Safe, Self::Optimal, Self::Unsafe]
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Visual => "visual",
            Self::Safe => "safe",
            Self::Optimal => "optimal",
            Self::Unsafe => "unsafe",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "visual" => Ok(Self::Visual),
            "safe" => Ok(Self::Safe),
            "optimal" => Ok(Self::Optimal),
            "unsafe" | "unsynced" => Ok(Self::Unsafe),
            other => Err(format!("unknown mode: {other}")),
        }
    }
}

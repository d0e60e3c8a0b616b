//! Status indicator driven from the connection phase.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::ble::connection::ConnectionPhase;
use crate::error::Result;

/// Output line controlling the status LED.
pub trait Indicator: Send + Sync {
    /// Drive the line high.
    fn set_on(&self) -> Result<()>;

    /// Drive the line low.
    fn set_off(&self) -> Result<()>;

    /// Invert the line.
    fn toggle(&self) -> Result<()>;
}

/// How the indicator is driven for a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorPattern {
    /// Held on.
    Solid,
    /// Toggled once per tick.
    Blink,
}

/// Map a phase to its drive pattern.
pub fn pattern_for(phase: ConnectionPhase) -> IndicatorPattern {
    match phase {
        ConnectionPhase::Connected => IndicatorPattern::Solid,
        ConnectionPhase::Advertising | ConnectionPhase::Idle => IndicatorPattern::Blink,
    }
}

/// Applies the phase pattern to an [`Indicator`].
pub struct StatusIndicator {
    line: Arc<dyn Indicator>,
    last_pattern: Option<IndicatorPattern>,
}

impl StatusIndicator {
    /// Wrap an indicator line.
    pub fn new(line: Arc<dyn Indicator>) -> Self {
        Self {
            line,
            last_pattern: None,
        }
    }

    /// The pattern applied most recently.
    pub fn last_pattern(&self) -> Option<IndicatorPattern> {
        self.last_pattern
    }

    /// Drive one step of the pattern for `phase`.
    pub fn apply(&mut self, phase: ConnectionPhase) {
        let pattern = pattern_for(phase);
        if self.last_pattern != Some(pattern) {
            debug!("Indicator pattern {:?} for {}", pattern, phase);
        }

        let result = match pattern {
            IndicatorPattern::Solid => self.line.set_on(),
            IndicatorPattern::Blink => self.line.toggle(),
        };
        if let Err(e) = result {
            warn!("Failed to drive indicator: {}", e);
        }

        self.last_pattern = Some(pattern);
    }

    /// Turn the indicator off for shutdown.
    pub fn force_off(&mut self) {
        if let Err(e) = self.line.set_off() {
            warn!("Failed to turn indicator off: {}", e);
        }
        self.last_pattern = None;
    }
}

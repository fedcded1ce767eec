//! Sequence-number replay protection.
//!
//! A sliding bitmap over the most recent accepted sequence numbers. A
//! sequence is accepted once: either above the highest seen, or inside the
//! reorder window and not yet marked. Sequence `0` is never valid.
//!
//! Checking and committing are separate steps so the inbound path can
//! validate a packet completely before recording it.

/// Sliding-window replay filter
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest accepted sequence (0 = none yet)
    highest: u64,
    /// Bit `i` set = `highest - i` was accepted
    bitmap: u64,
    /// Accept up to this far below `highest`
    window: u64,
}

/// Why a sequence number was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// Sequence `0`
    Zero,
    /// Already accepted
    Duplicate,
    /// Older than the reorder window
    TooOld,
}

impl ReplayWindow {
    /// Create a filter with the given reorder window (0..=64)
    #[must_use]
    pub fn new(window: u64) -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            window: window.min(64),
        }
    }

    /// Highest accepted sequence
    #[must_use]
    pub fn highest(&self) -> u64 {
        self.highest
    }

    /// Check a sequence without recording it.
    ///
    /// # Errors
    ///
    /// Returns the [`ReplayError`] explaining the refusal.
    pub fn check(&self, seq: u64) -> Result<(), ReplayError> {
        if seq == 0 {
            return Err(ReplayError::Zero);
        }
        if seq > self.highest {
            return Ok(());
        }
        let age = self.highest - seq;
        if age == 0 {
            return Err(ReplayError::Duplicate);
        }
        if age >= self.window {
            return Err(ReplayError::TooOld);
        }
        if self.bitmap & (1 << age) != 0 {
            Err(ReplayError::Duplicate)
        } else {
            Ok(())
        }
    }

    /// Record a sequence previously passed by [`ReplayWindow::check`].
    pub fn commit(&mut self, seq: u64) {
        if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.highest = seq;
        } else {
            let age = self.highest - seq;
            if age < 64 {
                self.bitmap |= 1 << age;
            }
        }
    }

    /// Check and record in one step.
    ///
    /// # Errors
    ///
    /// Returns the [`ReplayError`] explaining the refusal.
    pub fn accept(&mut self, seq: u64) -> Result<(), ReplayError> {
        self.check(seq)?;
        self.commit(seq);
        Ok(())
    }
}

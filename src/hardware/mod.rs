// Copyright lowRISC contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Pluggable hardware functionality.
//!
//! This module provides traits for plugging in the device-specific pieces
//! the update engine depends on: flash storage and a monotonic clock.

use core::time::Duration;

pub mod flash;

/// A monotonic time source.
pub trait Clock {
    /// Returns the uptime of the device, i.e., the absolute duration since it
    /// was last released from reset.
    ///
    /// The resolution and accuracy of this value are expected to be
    /// best-effort, but it must never go backwards.
    fn uptime(&self) -> Duration;
}
impl dyn Clock {} // Ensure object-safe.

impl<C: Clock + ?Sized> Clock for &C {
    fn uptime(&self) -> Duration {
        C::uptime(self)
    }
}

/// A [`Clock`] backed by [`std::time::Instant`], counting from its creation.
#[cfg(feature = "std")]
#[derive(Copy, Clone, Debug)]
pub struct StdClock {
    epoch: std::time::Instant,
}

#[cfg(feature = "std")]
impl StdClock {
    /// Creates a new `StdClock` whose uptime starts at zero.
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn uptime(&self) -> Duration {
        self.epoch.elapsed()
    }
}

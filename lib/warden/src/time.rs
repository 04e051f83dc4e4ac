// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The cycle-counter timebase.
//!
//! Everything time-related on the fast path is expressed in raw CPU
//! cycles: entry timestamps, capability deadlines, budget windows.
//! Reading the counter is a handful of cycles and never traps, which
//! is what a per-packet timestamp needs. [`Clocks`] carries the
//! calibrated frequency and does every conversion the state machines
//! use.

/// Picoseconds per second.
pub const PICOS_PER_SEC: u64 = 1_000_000_000_000;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Read the CPU cycle counter.
        ///
        /// No serializing fence: out-of-order error is nanoseconds,
        /// irrelevant against deadlines measured in milliseconds.
        #[inline(always)]
        pub fn read_cycles() -> u64 {
            unsafe { core::arch::x86_64::_rdtsc() }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// Read the generic timer virtual count (constant-rate,
        /// monotonic, unprivileged).
        #[inline(always)]
        pub fn read_cycles() -> u64 {
            let cnt: u64;
            unsafe {
                core::arch::asm!(
                    "mrs {cnt}, CNTVCT_EL0",
                    cnt = out(reg) cnt,
                    options(nostack, nomem, preserves_flags)
                );
            }
            cnt
        }
    } else if #[cfg(any(feature = "std", test))] {
        #[inline(always)]
        pub fn read_cycles() -> u64 {
            // No cycle counter on this target; count nanoseconds since
            // the first read instead.
            use std::time::Instant;
            static FIRST_TS: std::sync::OnceLock<Instant> =
                std::sync::OnceLock::new();
            let first = *FIRST_TS.get_or_init(Instant::now);
            let d = Instant::now().saturating_duration_since(first);
            d.as_secs() * 1_000_000_000 + u64::from(d.subsec_nanos())
        }
    } else {
        compile_error!("no cycle counter for this target without std");
    }
}

/// The calibrated counter frequency and the conversions derived from
/// it.
#[derive(Clone, Copy, Debug)]
pub struct Clocks {
    hz: u64,
}

impl Clocks {
    pub const fn from_hz(hz: u64) -> Self {
        assert!(hz >= 1_000, "cycle counter slower than 1 kHz");
        Self { hz }
    }

    /// Two-point calibration of the counter against the OS monotonic
    /// clock.
    #[cfg(any(feature = "std", test))]
    pub fn calibrate() -> Self {
        let c0 = read_cycles();
        let t0 = std::time::Instant::now();
        std::thread::sleep(core::time::Duration::from_millis(50));
        let c1 = read_cycles();
        let nanos = t0.elapsed().as_nanos() as u64;
        let cycles = c1.wrapping_sub(c0);
        Self::from_hz(cycles.saturating_mul(1_000_000_000) / nanos.max(1))
    }

    #[inline(always)]
    pub fn now(&self) -> u64 {
        read_cycles()
    }

    pub const fn cycles_per_sec(&self) -> u64 {
        self.hz
    }

    pub const fn cycles_per_ms(&self) -> u64 {
        self.hz / 1_000
    }

    /// Picoseconds spanned by one cycle. Never zero given the
    /// frequency floor asserted in the constructor.
    pub const fn picos_per_cycle(&self) -> u64 {
        PICOS_PER_SEC / self.hz
    }

    pub const fn from_secs(&self, secs: u64) -> u64 {
        secs * self.hz
    }

    pub const fn from_millis(&self, ms: u64) -> u64 {
        ms * self.cycles_per_ms()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conversions() {
        let clocks = Clocks::from_hz(2_500_000_000);
        assert_eq!(clocks.cycles_per_sec(), 2_500_000_000);
        assert_eq!(clocks.cycles_per_ms(), 2_500_000);
        assert_eq!(clocks.picos_per_cycle(), 400);
        assert_eq!(clocks.from_secs(3), 7_500_000_000);
        assert_eq!(clocks.from_millis(500), 1_250_000_000);
    }

    #[test]
    fn counter_advances() {
        let a = read_cycles();
        let mut spin = 0u64;
        for i in 0..10_000u64 {
            spin = spin.wrapping_add(i);
        }
        core::hint::black_box(spin);
        let b = read_cycles();
        assert!(b >= a);
    }

    #[test]
    fn calibrate_plausible() {
        let clocks = Clocks::calibrate();
        // Anything from an embedded timer to a fast core.
        assert!(clocks.cycles_per_sec() > 1_000);
        assert!(clocks.cycles_per_sec() < 10_000_000_000);
    }
}

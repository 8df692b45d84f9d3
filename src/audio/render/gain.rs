//! Shared gain state between the control context and the real-time thread.
//!
//! Volume and mute are packed into one `AtomicU64` so the render callback
//! observes both with a single load: the low 32 bits hold the volume's `f32`
//! bits, bit 32 holds the mute flag. Writers use a compare-exchange loop so
//! a volume change never clobbers a concurrent mute change.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

const MUTE_BIT: u64 = 1 << 32;
const VOLUME_MASK: u64 = 0xFFFF_FFFF;

/// Clamp a requested volume to [0, 1]. NaN maps to 0.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// `muted ? 0 : volume`
pub fn effective_gain(volume: f32, muted: bool) -> f32 {
    if muted {
        0.0
    } else {
        clamp_volume(volume)
    }
}

/// Point-in-time copy of the gain state, emitted to collaborators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainSnapshot {
    pub volume: f32,
    pub muted: bool,
}

impl GainSnapshot {
    pub fn effective(&self) -> f32 {
        effective_gain(self.volume, self.muted)
    }
}

#[derive(Debug)]
pub struct GainState {
    packed: AtomicU64,
}

impl GainState {
    pub fn new(volume: f32, muted: bool) -> Self {
        Self {
            packed: AtomicU64::new(pack(clamp_volume(volume), muted)),
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let volume = clamp_volume(volume);
        self.update(|_, muted| (volume, muted));
    }

    pub fn set_muted(&self, muted: bool) {
        self.update(|volume, _| (volume, muted));
    }

    /// Flip the mute flag, returning the new value
    pub fn toggle_muted(&self) -> bool {
        unpack(self.update(|volume, muted| (volume, !muted))).1
    }

    /// Adjust volume by `delta`, clamped. Returns the new volume.
    pub fn step_volume(&self, delta: f32) -> f32 {
        unpack(self.update(|volume, muted| (clamp_volume(volume + delta), muted))).0
    }

    pub fn volume(&self) -> f32 {
        self.snapshot().volume
    }

    pub fn is_muted(&self) -> bool {
        self.snapshot().muted
    }

    pub fn snapshot(&self) -> GainSnapshot {
        let (volume, muted) = unpack(self.packed.load(Ordering::Acquire));
        GainSnapshot { volume, muted }
    }

    /// Effective multiplier. Real-time safe: one atomic load, no branches on shared state.
    #[inline]
    pub fn effective(&self) -> f32 {
        let (volume, muted) = unpack(self.packed.load(Ordering::Relaxed));
        if muted {
            0.0
        } else {
            volume
        }
    }

    fn update(&self, f: impl Fn(f32, bool) -> (f32, bool)) -> u64 {
        let mut current = self.packed.load(Ordering::Acquire);
        loop {
            let (volume, muted) = unpack(current);
            let (volume, muted) = f(volume, muted);
            let next = pack(volume, muted);
            match self
                .packed
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for GainState {
    fn default() -> Self {
        Self::new(1.0, false)
    }
}

fn pack(volume: f32, muted: bool) -> u64 {
    let bits = volume.to_bits() as u64;
    if muted {
        bits | MUTE_BIT
    } else {
        bits
    }
}

fn unpack(word: u64) -> (f32, bool) {
    (f32::from_bits((word & VOLUME_MASK) as u32), word & MUTE_BIT != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_mute_preserves_volume() {
        let gain = GainState::new(0.4, false);
        gain.set_muted(true);
        assert_eq!(gain.effective(), 0.0);
        assert_eq!(gain.volume(), 0.4);

        gain.set_muted(false);
        assert_eq!(gain.effective(), 0.4);
    }

    #[test]
    fn test_toggle_and_step() {
        let gain = GainState::default();
        assert!(gain.toggle_muted());
        assert!(!gain.toggle_muted());

        assert_eq!(gain.step_volume(0.25), 1.0);
        assert_eq!(gain.step_volume(-0.25), 0.75);
        assert_eq!(gain.step_volume(-5.0), 0.0);
    }

    #[test]
    fn test_nan_volume_is_silence() {
        let gain = GainState::new(f32::NAN, false);
        assert_eq!(gain.effective(), 0.0);
    }

    #[test]
    fn test_concurrent_writers_do_not_lose_fields() {
        let gain = Arc::new(GainState::new(0.5, false));
        let muter = {
            let gain = gain.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    gain.set_muted(true);
                }
            })
        };
        for _ in 0..1000 {
            gain.set_volume(0.25);
        }
        muter.join().unwrap();

        let snapshot = gain.snapshot();
        assert!(snapshot.muted);
        assert_eq!(snapshot.volume, 0.25);
    }

    proptest! {
        #[test]
        fn prop_clamped_volume_in_unit_range(v in proptest::num::f32::ANY) {
            let clamped = clamp_volume(v);
            prop_assert!((0.0..=1.0).contains(&clamped));
        }

        #[test]
        fn prop_effective_gain_matches_definition(v in proptest::num::f32::ANY, muted in any::<bool>()) {
            let gain = GainState::new(v, muted);
            let expected = if muted { 0.0 } else { clamp_volume(v) };
            prop_assert_eq!(gain.effective(), expected);
            prop_assert!((0.0..=1.0).contains(&gain.effective()));
        }
    }
}

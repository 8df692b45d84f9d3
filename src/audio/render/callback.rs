//! Sample processing performed on the real-time audio thread.
//!
//! Nothing in here allocates, locks or logs.

use super::gain::GainState;

/// Multiply every sample by `gain` in place. Unity gain leaves the buffer untouched.
#[inline]
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if gain == 1.0 {
        return;
    }
    if gain == 0.0 {
        samples.fill(0.0);
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

/// Apply the current effective gain to every channel buffer of one hardware
/// period. The gain word is read once so all channels see the same value.
#[inline]
pub fn process_period<'a, I>(buffers: I, gain: &GainState)
where
    I: IntoIterator<Item = &'a mut [f32]>,
{
    let effective = gain.effective();
    if effective == 1.0 {
        return;
    }
    for buffer in buffers {
        apply_gain(buffer, effective);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unity_gain_is_passthrough() {
        let mut samples = [0.1, -0.5, 0.9];
        apply_gain(&mut samples, 1.0);
        assert_eq!(samples, [0.1, -0.5, 0.9]);
    }

    #[test]
    fn test_half_gain_scales_every_sample() {
        let mut samples = [0.5, -1.0, 0.25];
        apply_gain(&mut samples, 0.5);
        assert_eq!(samples, [0.25, -0.5, 0.125]);
    }

    #[test]
    fn test_mute_silences_all_channels() {
        let gain = GainState::new(0.8, true);
        let mut left = vec![0.3f32; 64];
        let mut right = vec![-0.3f32; 64];

        process_period([left.as_mut_slice(), right.as_mut_slice()], &gain);

        assert!(left.iter().all(|s| *s == 0.0));
        assert!(right.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_period_uses_current_volume() {
        let gain = GainState::new(0.25, false);
        let mut left = vec![1.0f32; 8];
        let mut right = vec![0.5f32; 8];

        process_period([left.as_mut_slice(), right.as_mut_slice()], &gain);

        assert!(left.iter().all(|s| (*s - 0.25).abs() < f32::EPSILON));
        assert!(right.iter().all(|s| (*s - 0.125).abs() < f32::EPSILON));
    }
}

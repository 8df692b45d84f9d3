//! Channel maps for the composite device.
//!
//! In the composite's output channel ordering the capture device's channels
//! come first, followed by the physical output device's channels. The
//! real-time stereo pair is routed to the first two channels of the physical
//! device; everything else is silence. Capture reads the composite's first
//! two input channels, which belong to the capture device.

use std::fmt;

/// Number of logical channels carried through the render session
pub const LOGICAL_CHANNELS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSlot {
    /// Physical channel carries this logical channel
    Logical(u32),
    Silence,
}

/// Physical composite channel index → logical channel or silence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap {
    slots: Vec<ChannelSlot>,
}

impl ChannelMap {
    /// Render-side map over `capture_channels + output_channels` physical channels.
    ///
    /// A mono output device gets only logical channel 0.
    pub fn for_output(capture_channels: u32, output_channels: u32) -> Self {
        let total = capture_channels + output_channels;
        let routed = output_channels.min(LOGICAL_CHANNELS);
        let slots = (0..total)
            .map(|physical| {
                if physical >= capture_channels && physical < capture_channels + routed {
                    ChannelSlot::Logical(physical - capture_channels)
                } else {
                    ChannelSlot::Silence
                }
            })
            .collect();
        Self { slots }
    }

    /// Capture-side map over the composite's `input_channels`: the first two
    /// feed logical channels 0 and 1, the rest are ignored.
    pub fn for_input(input_channels: u32) -> Self {
        let slots = (0..input_channels)
            .map(|physical| {
                if physical < LOGICAL_CHANNELS {
                    ChannelSlot::Logical(physical)
                } else {
                    ChannelSlot::Silence
                }
            })
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slots(&self) -> &[ChannelSlot] {
        &self.slots
    }

    /// Indexed by physical channel; `-1` marks silence. This is the layout the
    /// HAL output unit expects on its output scope.
    pub fn to_raw(&self) -> Vec<i32> {
        self.slots
            .iter()
            .map(|slot| match slot {
                ChannelSlot::Logical(channel) => *channel as i32,
                ChannelSlot::Silence => -1,
            })
            .collect()
    }

    /// Indexed by logical channel; each entry is the physical source channel.
    /// This is the layout the HAL output unit expects on its input bus.
    pub fn to_raw_sources(&self) -> Vec<i32> {
        let mut sources = vec![-1; LOGICAL_CHANNELS as usize];
        for (physical, slot) in self.slots.iter().enumerate() {
            if let ChannelSlot::Logical(channel) = slot {
                if let Some(entry) = sources.get_mut(*channel as usize) {
                    *entry = physical as i32;
                }
            }
        }
        sources
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_raw())
    }
}

use serde::{Deserialize, Serialize};

/// OS-assigned device handle. Only valid for the current OS audio session;
/// hot-plug and sleep may reassign it, so persist the UID instead.
pub type DeviceId = u32;

/// Audio device snapshot.
///
/// Re-fetched on every enumeration and never cached beyond a single
/// operation, because the handle may be invalidated by hot-plug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: DeviceId,
    /// Stable identifier, survives reconnects and reboots
    pub uid: String,
    pub name: String,
    pub input_channels: u32,
    pub output_channels: u32,
    /// Device exposes a native hardware volume scalar
    pub has_volume_control: bool,
}

/// Property scope of a device query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Input,
    Output,
}

/// OS-wide default routing targets the engine redirects and restores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DefaultRole {
    /// Where applications play by default
    Output,
    /// Where alert and UI sounds play
    SystemOutput,
}

impl DefaultRole {
    pub const ALL: [DefaultRole; 2] = [DefaultRole::Output, DefaultRole::SystemOutput];

    pub fn label(self) -> &'static str {
        match self {
            DefaultRole::Output => "Default",
            DefaultRole::SystemOutput => "System",
        }
    }
}

/// Which side of the hardware unit a stream format applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamSide {
    /// Data read from the device (input bus 1, output scope)
    Capture,
    /// Data written to the device (output bus 0, input scope)
    Render,
}

/// Linear PCM stream format negotiated for the render session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub channels: u32,
    pub bits_per_channel: u32,
    pub is_float: bool,
    pub non_interleaved: bool,
}

impl StreamFormat {
    /// 32-bit float, stereo, non-interleaved
    pub fn float_stereo(sample_rate: f64) -> Self {
        Self {
            sample_rate,
            channels: 2,
            bits_per_channel: 32,
            is_float: true,
            non_interleaved: true,
        }
    }

    /// Bytes per frame of a single buffer
    pub fn bytes_per_frame(&self) -> u32 {
        let sample_bytes = self.bits_per_channel / 8;
        if self.non_interleaved {
            sample_bytes
        } else {
            sample_bytes * self.channels
        }
    }
}

/// Eligible output device as presented to the UI collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputChoice {
    pub uid: String,
    pub name: String,
}

impl From<&AudioDevice> for OutputChoice {
    fn from(device: &AudioDevice) -> Self {
        Self {
            uid: device.uid.clone(),
            name: device.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_stereo_format() {
        let format = StreamFormat::float_stereo(48_000.0);
        assert_eq!(format.channels, 2);
        assert_eq!(format.bits_per_channel, 32);
        assert!(format.is_float && format.non_interleaved);
        assert_eq!(format.bytes_per_frame(), 4);
    }
}

//! Desktop route probe and audio session
//!
//! cpal reports devices by name only, so port categories are inferred
//! from the names PipeWire, PulseAudio and ALSA give them
//! (e.g. "bluez_output.XX.a2dp-sink", "alsa_output.usb-...").

use super::{AudioPort, AudioSession, PortKind, RouteDecision, RouteProbe, RouteSnapshot};
use crate::error::CaptureError;

/// Server aliases that name no physical port
const VIRTUAL_DEVICES: &[&str] = &["default", "pipewire", "pulse", "sysdefault", "jack"];

/// Takes route snapshots from the default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalRouteProbe;

impl CpalRouteProbe {
    pub fn new() -> Self {
        Self
    }
}

impl RouteProbe for CpalRouteProbe {
    fn snapshot(&self) -> Result<RouteSnapshot, CaptureError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();

        let outputs = host
            .output_devices()
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .filter_map(|device| device.name().ok())
            .filter(|name| !is_virtual(name))
            .map(|name| AudioPort::new(classify_output(&name), name))
            .collect();

        let available_inputs = host
            .input_devices()
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .filter_map(|device| device.name().ok())
            .filter(|name| !is_virtual(name))
            .map(|name| AudioPort::new(classify_input(&name), name))
            .collect();

        Ok(RouteSnapshot {
            outputs,
            available_inputs,
        })
    }
}

fn is_virtual(name: &str) -> bool {
    let name = name.to_lowercase();
    VIRTUAL_DEVICES.contains(&name.as_str()) || name.ends_with(".monitor")
}

fn is_bluetooth(name: &str) -> bool {
    name.contains("bluez") || name.contains("bluetooth")
}

/// Bluetooth profile from a device name; HFP unless A2DP or LE audio is named
fn bluetooth_kind(name: &str) -> PortKind {
    if name.contains("a2dp") {
        PortKind::BluetoothA2dp
    } else if name.contains("bap") || name.contains("lc3") || name.contains("le_audio") {
        PortKind::BluetoothLe
    } else {
        PortKind::BluetoothHfp
    }
}

/// Infer the category of an output device from its name
pub fn classify_output(name: &str) -> PortKind {
    let name = name.to_lowercase();
    if is_bluetooth(&name) {
        let kind = bluetooth_kind(&name);
        // Plain bluez sinks are A2DP unless a headset profile is named
        if kind == PortKind::BluetoothHfp
            && !(name.contains("hfp") || name.contains("hsp") || name.contains("headset"))
        {
            return PortKind::BluetoothA2dp;
        }
        kind
    } else if name.contains("headphone") || name.contains("headset") {
        PortKind::Headphones
    } else if name.contains("hdmi") || name.contains("displayport") {
        PortKind::Hdmi
    } else if name.contains("usb") {
        PortKind::Usb
    } else if name.contains("speaker") || name.contains("analog") || name.contains("pci") {
        PortKind::BuiltInSpeaker
    } else {
        PortKind::Other
    }
}

/// Infer the category of an input device from its name
pub fn classify_input(name: &str) -> PortKind {
    let name = name.to_lowercase();
    if is_bluetooth(&name) {
        bluetooth_kind(&name)
    } else if name.contains("headset") {
        PortKind::HeadsetMic
    } else if name.contains("usb") {
        PortKind::Usb
    } else if name.contains("mic") || name.contains("analog") || name.contains("pci") {
        PortKind::BuiltInMic
    } else {
        PortKind::Other
    }
}

/// Audio session for desktop audio servers.
///
/// The server owns ducking and output selection, so this session records the
/// applied decision and hands the preferred input to the capture pipeline.
#[derive(Debug, Default)]
pub struct DesktopAudioSession {
    active: bool,
    applied: Option<RouteDecision>,
}

impl DesktopAudioSession {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioSession for DesktopAudioSession {
    fn activate_play_and_record(&mut self) -> Result<(), CaptureError> {
        if !self.active {
            tracing::debug!("Audio session active (play and record, duck others, bluetooth)");
            self.active = true;
        }
        Ok(())
    }

    fn apply_route(&mut self, decision: &RouteDecision) -> Result<(), CaptureError> {
        if self.applied.as_ref() == Some(decision) {
            tracing::trace!("Route unchanged: {}", decision);
            return Ok(());
        }
        tracing::info!("Audio route: {}", decision);
        self.applied = Some(decision.clone());
        Ok(())
    }

    fn deactivate(&mut self) {
        if self.active {
            tracing::debug!("Audio session released");
            self.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_bluetooth_outputs() {
        assert_eq!(
            classify_output("bluez_output.AA_BB_CC_DD_EE_FF.a2dp-sink"),
            PortKind::BluetoothA2dp
        );
        assert_eq!(
            classify_output("bluez_output.AA_BB_CC_DD_EE_FF.1"),
            PortKind::BluetoothA2dp
        );
        assert_eq!(
            classify_output("bluez_output.AA_BB_CC_DD_EE_FF.headset-head-unit"),
            PortKind::BluetoothHfp
        );
        assert_eq!(
            classify_output("bluez_output.AA_BB_CC_DD_EE_FF.bap-sink"),
            PortKind::BluetoothLe
        );
    }

    #[test]
    fn test_classify_wired_outputs() {
        assert_eq!(
            classify_output("alsa_output.pci-0000_00_1f.3.analog-stereo"),
            PortKind::BuiltInSpeaker
        );
        assert_eq!(
            classify_output("alsa_output.pci-0000_00_1f.3.analog-headphones"),
            PortKind::Headphones
        );
        assert_eq!(
            classify_output("alsa_output.usb-Focusrite_Scarlett-00.analog-stereo"),
            PortKind::Usb
        );
        assert_eq!(
            classify_output("alsa_output.pci-0000_01_00.1.hdmi-stereo"),
            PortKind::Hdmi
        );
        assert_eq!(classify_output("null_sink"), PortKind::Other);
    }

    #[test]
    fn test_classify_inputs() {
        assert_eq!(
            classify_input("bluez_input.AA_BB_CC_DD_EE_FF.0"),
            PortKind::BluetoothHfp
        );
        assert_eq!(
            classify_input("alsa_input.pci-0000_00_1f.3.analog-stereo"),
            PortKind::BuiltInMic
        );
        assert_eq!(classify_input("alsa_input.usb-Blue_Yeti-00.mono"), PortKind::Usb);
        assert_eq!(classify_input("Headset Microphone"), PortKind::HeadsetMic);
    }

    #[test]
    fn test_virtual_devices_skipped() {
        assert!(is_virtual("default"));
        assert!(is_virtual("PipeWire"));
        assert!(is_virtual("alsa_output.pci-0000_00_1f.3.analog-stereo.monitor"));
        assert!(!is_virtual("bluez_output.AA_BB_CC_DD_EE_FF.1"));
    }

    #[test]
    fn test_session_records_decision() {
        let mut session = DesktopAudioSession::new();
        assert!(!session.active);
        session.activate_play_and_record().unwrap();
        assert!(session.active);

        session.apply_route(&RouteDecision::UseLoudspeaker).unwrap();
        assert_eq!(session.applied, Some(RouteDecision::UseLoudspeaker));

        session.deactivate();
        assert!(!session.active);
    }
}

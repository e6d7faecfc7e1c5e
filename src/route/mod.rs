//! Audio route policy
//!
//! Decides where speech is played and which microphone is preferred,
//! from a snapshot of the ports currently in use. The decision is a pure
//! function of the snapshot; snapshots are taken fresh for every route
//! change and never cached.
//!
//! Platform seams:
//! - [`AudioSession`] configures play-and-record and applies a decision
//! - [`RouteProbe`] reports the current snapshot

pub mod desktop;
pub mod monitor;

use crate::error::CaptureError;
use serde::Serialize;

pub use desktop::{CpalRouteProbe, DesktopAudioSession};
pub use monitor::RouteMonitor;

/// Category of an audio port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    BuiltInSpeaker,
    BuiltInReceiver,
    BuiltInMic,
    Headphones,
    /// Wired headset microphone
    HeadsetMic,
    BluetoothA2dp,
    BluetoothHfp,
    BluetoothLe,
    Usb,
    Hdmi,
    Other,
}

impl PortKind {
    /// Outputs that mean the user is not listening to the loudspeaker
    pub fn is_external_output(self) -> bool {
        matches!(
            self,
            PortKind::Headphones
                | PortKind::BluetoothA2dp
                | PortKind::BluetoothHfp
                | PortKind::BluetoothLe
        )
    }

    /// Inputs preferred while an external output is in use
    pub fn is_bluetooth_input(self) -> bool {
        matches!(self, PortKind::BluetoothHfp | PortKind::BluetoothLe)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortKind::BuiltInSpeaker => "built-in speaker",
            PortKind::BuiltInReceiver => "built-in receiver",
            PortKind::BuiltInMic => "built-in mic",
            PortKind::Headphones => "headphones",
            PortKind::HeadsetMic => "headset mic",
            PortKind::BluetoothA2dp => "bluetooth a2dp",
            PortKind::BluetoothHfp => "bluetooth hfp",
            PortKind::BluetoothLe => "bluetooth le",
            PortKind::Usb => "usb",
            PortKind::Hdmi => "hdmi",
            PortKind::Other => "other",
        }
    }
}

/// One input or output port
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct AudioPort {
    pub kind: PortKind,
    pub name: String,
}

impl AudioPort {
    pub fn new(kind: PortKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Ports in use at one moment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteSnapshot {
    pub outputs: Vec<AudioPort>,
    pub available_inputs: Vec<AudioPort>,
}

impl RouteSnapshot {
    pub fn has_external_output(&self) -> bool {
        self.outputs.iter().any(|port| port.kind.is_external_output())
    }
}

/// Where audio should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Leave output on the external device; use its microphone if it has one
    UseExternal { preferred_input: Option<AudioPort> },
    /// Force output to the loudspeaker and clear any preferred input
    UseLoudspeaker,
}

impl RouteDecision {
    pub fn preferred_input(&self) -> Option<&AudioPort> {
        match self {
            RouteDecision::UseExternal { preferred_input } => preferred_input.as_ref(),
            RouteDecision::UseLoudspeaker => None,
        }
    }
}

impl std::fmt::Display for RouteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteDecision::UseExternal {
                preferred_input: Some(port),
            } => write!(f, "external output, input '{}'", port.name),
            RouteDecision::UseExternal {
                preferred_input: None,
            } => write!(f, "external output"),
            RouteDecision::UseLoudspeaker => write!(f, "loudspeaker"),
        }
    }
}

/// Pick a route for the given snapshot
pub fn choose(snapshot: &RouteSnapshot) -> RouteDecision {
    if snapshot.has_external_output() {
        let preferred_input = snapshot
            .available_inputs
            .iter()
            .find(|port| port.kind.is_bluetooth_input())
            .cloned();
        RouteDecision::UseExternal { preferred_input }
    } else {
        RouteDecision::UseLoudspeaker
    }
}

/// Why the route changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChangeReason {
    NewDeviceAvailable,
    OldDeviceUnavailable,
    CategoryChange,
    /// Our own output override
    Override,
    ConfigurationChange,
    Unknown,
}

impl RouteChangeReason {
    /// A device was plugged or unplugged, as opposed to a reconfiguration
    /// we may have caused ourselves
    pub fn is_device_transition(self) -> bool {
        matches!(
            self,
            RouteChangeReason::NewDeviceAvailable | RouteChangeReason::OldDeviceUnavailable
        )
    }
}

/// Route-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub reason: RouteChangeReason,
    pub snapshot: RouteSnapshot,
}

/// Infer why the route moved from `prev` to `next`, or None if it did not
pub fn classify_change(prev: &RouteSnapshot, next: &RouteSnapshot) -> Option<RouteChangeReason> {
    if prev == next {
        return None;
    }

    let appeared =
        |old: &[AudioPort], new: &[AudioPort]| new.iter().any(|port| !old.contains(port));

    if appeared(&prev.outputs, &next.outputs)
        || appeared(&prev.available_inputs, &next.available_inputs)
    {
        Some(RouteChangeReason::NewDeviceAvailable)
    } else if appeared(&next.outputs, &prev.outputs)
        || appeared(&next.available_inputs, &prev.available_inputs)
    {
        Some(RouteChangeReason::OldDeviceUnavailable)
    } else {
        // Same ports, different order
        Some(RouteChangeReason::ConfigurationChange)
    }
}

/// Platform audio session
pub trait AudioSession: Send {
    /// Configure for simultaneous playback and recording, ducking other
    /// audio and allowing Bluetooth devices
    fn activate_play_and_record(&mut self) -> Result<(), CaptureError>;

    /// Apply a route decision
    fn apply_route(&mut self, decision: &RouteDecision) -> Result<(), CaptureError>;

    /// Release the session
    fn deactivate(&mut self) {}
}

/// Source of route snapshots
pub trait RouteProbe: Send + Sync {
    fn snapshot(&self) -> Result<RouteSnapshot, CaptureError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaker() -> AudioPort {
        AudioPort::new(PortKind::BuiltInSpeaker, "Speakers")
    }

    fn mic() -> AudioPort {
        AudioPort::new(PortKind::BuiltInMic, "Internal Mic")
    }

    fn bt_out() -> AudioPort {
        AudioPort::new(PortKind::BluetoothA2dp, "bluez_output.a2dp")
    }

    fn bt_mic() -> AudioPort {
        AudioPort::new(PortKind::BluetoothHfp, "bluez_input.hfp")
    }

    #[test]
    fn test_bluetooth_output_uses_external() {
        let snapshot = RouteSnapshot {
            outputs: vec![bt_out()],
            available_inputs: vec![mic(), bt_mic()],
        };
        assert_eq!(
            choose(&snapshot),
            RouteDecision::UseExternal {
                preferred_input: Some(bt_mic())
            }
        );
    }

    #[test]
    fn test_headphones_without_bluetooth_mic() {
        let snapshot = RouteSnapshot {
            outputs: vec![AudioPort::new(PortKind::Headphones, "Headphones")],
            available_inputs: vec![mic(), AudioPort::new(PortKind::HeadsetMic, "Headset")],
        };
        let decision = choose(&snapshot);
        assert_eq!(
            decision,
            RouteDecision::UseExternal {
                preferred_input: None
            }
        );
        assert!(decision.preferred_input().is_none());
    }

    #[test]
    fn test_no_external_output_uses_loudspeaker() {
        let snapshot = RouteSnapshot {
            outputs: vec![speaker(), AudioPort::new(PortKind::Hdmi, "HDMI")],
            // A Bluetooth mic alone does not move output off the speaker
            available_inputs: vec![mic(), bt_mic()],
        };
        assert_eq!(choose(&snapshot), RouteDecision::UseLoudspeaker);
        assert_eq!(choose(&RouteSnapshot::default()), RouteDecision::UseLoudspeaker);
    }

    #[test]
    fn test_usb_is_not_external() {
        let snapshot = RouteSnapshot {
            outputs: vec![AudioPort::new(PortKind::Usb, "USB DAC")],
            available_inputs: vec![],
        };
        assert_eq!(choose(&snapshot), RouteDecision::UseLoudspeaker);
    }

    #[test]
    fn test_choose_is_pure() {
        let snapshot = RouteSnapshot {
            outputs: vec![bt_out()],
            available_inputs: vec![bt_mic()],
        };
        let first = choose(&snapshot);
        for _ in 0..10 {
            assert_eq!(choose(&snapshot), first);
        }
    }

    #[test]
    fn test_first_bluetooth_input_wins() {
        let le = AudioPort::new(PortKind::BluetoothLe, "le mic");
        let snapshot = RouteSnapshot {
            outputs: vec![AudioPort::new(PortKind::BluetoothLe, "le out")],
            available_inputs: vec![mic(), le.clone(), bt_mic()],
        };
        assert_eq!(choose(&snapshot).preferred_input(), Some(&le));
    }

    #[test]
    fn test_device_transition_reasons() {
        assert!(RouteChangeReason::NewDeviceAvailable.is_device_transition());
        assert!(RouteChangeReason::OldDeviceUnavailable.is_device_transition());
        assert!(!RouteChangeReason::Override.is_device_transition());
        assert!(!RouteChangeReason::CategoryChange.is_device_transition());
        assert!(!RouteChangeReason::ConfigurationChange.is_device_transition());
        assert!(!RouteChangeReason::Unknown.is_device_transition());
    }

    #[test]
    fn test_classify_change() {
        let before = RouteSnapshot {
            outputs: vec![speaker()],
            available_inputs: vec![mic()],
        };
        let after = RouteSnapshot {
            outputs: vec![speaker(), bt_out()],
            available_inputs: vec![mic(), bt_mic()],
        };
        assert_eq!(classify_change(&before, &before), None);
        assert_eq!(
            classify_change(&before, &after),
            Some(RouteChangeReason::NewDeviceAvailable)
        );
        assert_eq!(
            classify_change(&after, &before),
            Some(RouteChangeReason::OldDeviceUnavailable)
        );

        let reordered = RouteSnapshot {
            outputs: vec![bt_out(), speaker()],
            available_inputs: vec![bt_mic(), mic()],
        };
        assert_eq!(
            classify_change(&after, &reordered),
            Some(RouteChangeReason::ConfigurationChange)
        );
    }

    #[test]
    fn test_decision_display() {
        assert_eq!(RouteDecision::UseLoudspeaker.to_string(), "loudspeaker");
        let decision = RouteDecision::UseExternal {
            preferred_input: Some(bt_mic()),
        };
        assert_eq!(decision.to_string(), "external output, input 'bluez_input.hfp'");
    }
}

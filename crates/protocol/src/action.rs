//! Closed catalog of relay actions.
//!
//! Every action a client may send is a variant here. Strings that do not
//! name a variant are rejected at the relay boundary with [`UnknownAction`],
//! never forwarded to an agent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

macro_rules! device_actions {
	($($(#[$meta:meta])* $variant:ident => $wire:literal),+ $(,)?) => {
		/// Actions executed by the device agent inside a session workload.
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum DeviceAction {
			$($(#[$meta])* $variant),+
		}

		impl DeviceAction {
			/// Every device action, in catalog order.
			pub const ALL: &'static [DeviceAction] = &[$(DeviceAction::$variant),+];

			/// Wire name understood by the agent.
			pub fn as_str(self) -> &'static str {
				match self {
					$(DeviceAction::$variant => $wire),+
				}
			}

			/// Looks up a device action by its wire name.
			pub fn parse(name: &str) -> Option<Self> {
				match name {
					$($wire => Some(DeviceAction::$variant),)+
					_ => None,
				}
			}
		}
	};
}

device_actions! {
	/// `{x, y}`
	Tap => "tap",
	/// `{x1, y1, x2, y2, duration?}`
	Swipe => "swipe",
	/// `{keycode}`
	KeyEvent => "keyevent",
	LongPress => "longPress",
	InputText => "inputText",
	Screenshot => "screenshot",
	InstallApk => "installApk",
	InstallApkFromUrl => "installApkFromUrl",
	PushFile => "pushFile",
	PullFile => "pullFile",
	ListDir => "listDir",
	DeleteFile => "deleteFile",
	FileInfo => "fileInfo",
	StartRecording => "startRecording",
	StopRecording => "stopRecording",
	/// Raw reply output is parsed with [`crate::parse_package_list`].
	ListInstalledApps => "listInstalledApps",
	UninstallApp => "uninstallApp",
	SwitchLauncher => "switchLauncher",
	StartApp => "startApp",
	ClearAppData => "clearAppData",
	Reboot => "reboot",
	BatteryLevel => "batteryLevel",
	GetProp => "getProp",
	NetworkStatus => "networkStatus",
	UiDump => "uiDump",
	TakeBugReport => "takeBugReport",
	PutSetting => "putSetting",
	GrantPermission => "grantPermission",
}

impl fmt::Display for DeviceAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Any action a relay client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
	/// Render, sanitize, and apply a new session's resources.
	CreateSession,
	/// Delete every resource labelled with the session.
	DeleteSession,
	/// Forwarded to the session's device agent.
	Device(DeviceAction),
}

impl Action {
	pub fn as_str(self) -> &'static str {
		match self {
			Action::CreateSession => "createSession",
			Action::DeleteSession => "deleteSession",
			Action::Device(action) => action.as_str(),
		}
	}

	/// Returns true for actions handled locally by the relay.
	pub fn is_lifecycle(self) -> bool {
		matches!(self, Action::CreateSession | Action::DeleteSession)
	}
}

impl fmt::Display for Action {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Error returned when an action name is not in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAction(pub String);

impl fmt::Display for UnknownAction {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "unknown action '{}'", self.0)
	}
}

impl std::error::Error for UnknownAction {}

impl FromStr for Action {
	type Err = UnknownAction;

	fn from_str(name: &str) -> Result<Self, Self::Err> {
		match name {
			"createSession" => Ok(Action::CreateSession),
			"deleteSession" => Ok(Action::DeleteSession),
			other => DeviceAction::parse(other).map(Action::Device).ok_or_else(|| UnknownAction(other.to_string())),
		}
	}
}

impl Serialize for Action {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Action {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let name = String::deserialize(deserializer)?;
		name.parse().map_err(serde::de::Error::custom)
	}
}

//! Parser for the agent's `listInstalledApps` output.
//!
//! The agent returns the raw `pm list packages -f` text:
//!
//! ```text
//! package:/data/app/~~Qx3w==/com.example-9Zk==/base.apk=com.example
//! package:/system/app/Settings/Settings.apk=com.android.settings
//! ```
//!
//! Paths may themselves contain `=`, so the package name is everything after
//! the last `=`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static PACKAGE_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^package:(.+)=([^=]+)$").expect("package line pattern is valid"));

/// One installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledPackage {
	pub package_path: String,
	pub package_name: String,
}

/// Lazily parses package lines, skipping anything that does not match.
pub fn parse_package_list(output: &str) -> impl Iterator<Item = InstalledPackage> + '_ {
	output.lines().filter_map(|line| {
		let caps = PACKAGE_LINE.captures(line.trim())?;
		Some(InstalledPackage {
			package_path: caps[1].to_string(),
			package_name: caps[2].trim().to_string(),
		})
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_paths_containing_equals() {
		let output = "package:/data/app/~~Qx3w==/com.example-9Zk==/base.apk=com.example\r\n\
		              package:/system/app/Settings/Settings.apk=com.android.settings\n";
		let packages: Vec<_> = parse_package_list(output).collect();
		assert_eq!(
			packages,
			vec![
				InstalledPackage {
					package_path: "/data/app/~~Qx3w==/com.example-9Zk==/base.apk".into(),
					package_name: "com.example".into(),
				},
				InstalledPackage {
					package_path: "/system/app/Settings/Settings.apk".into(),
					package_name: "com.android.settings".into(),
				},
			]
		);
	}

	#[test]
	fn skips_noise_and_is_lazy() {
		let output = "WARNING: linker\n\npackage:/a.apk=com.a\nnot a package\npackage:/b.apk=com.b\n";
		let mut iter = parse_package_list(output);
		assert_eq!(iter.next().map(|p| p.package_name), Some("com.a".to_string()));
		assert_eq!(iter.next().map(|p| p.package_name), Some("com.b".to_string()));
		assert!(iter.next().is_none());
	}

	#[test]
	fn serializes_camel_case() {
		let pkg = InstalledPackage {
			package_path: "/a.apk".into(),
			package_name: "com.a".into(),
		};
		assert_eq!(
			serde_json::to_value(pkg).unwrap(),
			serde_json::json!({"packagePath": "/a.apk", "packageName": "com.a"})
		);
	}
}

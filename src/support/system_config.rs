//-
// Copyright (c) 2023, 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Wingmap.
///
/// This is stored in a file named `wingmap.toml`, typically under
/// `/usr/local/etc/wingmap` or `/etc/wingmap`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    /// Connection information for the document database.
    pub database: DatabaseConfig,

    /// The listener to bind.
    pub listener: ListenerConfig,

    /// Global size limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Login rate limiting.
    #[serde(default)]
    pub login_throttle: LoginThrottleConfig,

    /// Extra values to report in the ID command. `name`, `version`, and
    /// `vendor` are the useful ones.
    #[serde(default)]
    pub identification: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// The connection URI, e.g. `mongodb://localhost:27017`.
    pub uri: String,
    /// The database name holding the `users`, `mailboxes`, `messages`,
    /// `journal`, and `attachments.files` collections.
    #[serde(default = "DatabaseConfig::default_name")]
    pub name: String,
}

impl DatabaseConfig {
    fn default_name() -> String {
        "wingmap".to_owned()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ListenerConfig {
    /// The address to bind.
    #[serde(default = "ListenerConfig::default_host")]
    pub host: String,
    /// The port to bind. Conventionally 143 for a plaintext+STARTTLS
    /// listener and 993 for implicit TLS.
    pub port: u16,
    /// If true, the connection is wrapped in TLS immediately on accept.
    #[serde(default)]
    pub secure: bool,
    /// If true, STARTTLS is neither advertised nor accepted. Has no effect
    /// when `secure` is set.
    #[serde(default)]
    pub ignore_starttls: bool,
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

impl ListenerConfig {
    fn default_host() -> String {
        "0.0.0.0".to_owned()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// The largest APPEND literal accepted, in bytes.
    #[serde(default = "LimitsConfig::default_max_message")]
    pub max_message: u32,
    /// The quota applied to users which have none of their own, in bytes.
    /// 0 means unlimited.
    #[serde(default)]
    pub max_storage: u64,
}

impl LimitsConfig {
    fn default_max_message() -> u32 {
        64 * 1024 * 1024
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message: Self::default_max_message(),
            max_storage: 0,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LoginThrottleConfig {
    /// The width of the sliding window, in seconds.
    #[serde(default = "LoginThrottleConfig::default_window_secs")]
    pub window_secs: u64,
    /// The number of attempts permitted per `(username, remote address)`
    /// within the window.
    #[serde(default = "LoginThrottleConfig::default_max_attempts")]
    pub max_attempts: u32,
}

impl LoginThrottleConfig {
    fn default_window_secs() -> u64 {
        60
    }

    fn default_max_attempts() -> u32 {
        100
    }
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            window_secs: Self::default_window_secs(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: SystemConfig = toml::from_str(
            r#"
[database]
uri = "mongodb://localhost:27017"

[listener]
port = 143
private_key = "/etc/wingmap/key.pem"
certificate_chain = "/etc/wingmap/cert.pem"
"#,
        )
        .unwrap();

        assert_eq!("wingmap", config.database.name);
        assert_eq!("0.0.0.0", config.listener.host);
        assert!(!config.listener.secure);
        assert_eq!(64 * 1024 * 1024, config.limits.max_message);
        assert_eq!(60, config.login_throttle.window_secs);
        assert_eq!(100, config.login_throttle.max_attempts);
    }
}

use anyhow::Context;
use config::{Config, Environment, File};
use meshcall_session::SessionConfig;
use meshcall_signaling::config::RelayConfig;
use meshcall_webrtc::WebrtcConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub relay: RelayConfig,
    pub session: SessionConfig,
    pub webrtc: WebrtcConfig,
}

impl CliConfig {
    /// Layers defaults, `config.toml` (or the given file) and `MESHCALL_*` environment variables.
    pub fn parse(config_file: Option<&Path>) -> anyhow::Result<Self> {
        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name("config.toml").required(false),
        };

        Config::builder()
            .add_source(Config::try_from(&CliConfig::default())?)
            .add_source(file)
            .add_source(
                Environment::with_prefix("meshcall")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("webrtc.ice_servers")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build config")?
            .try_deserialize::<Self>()
            .context("Failed to deserialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = CliConfig::parse(None).unwrap();

        assert_eq!(config.session, SessionConfig::default());
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.webrtc, WebrtcConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!(
            "meshcall-cli-config-{}.toml",
            std::process::id()
        ));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[relay]
url = "wss://relay.example.com/socket"

[session]
announce_repeats = 5

[webrtc]
ice_servers = ["turn:turn.example.com:3478"]
turn_username = "user"
"#
        )
        .unwrap();

        let config = CliConfig::parse(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.relay.url, "wss://relay.example.com/socket");
        assert_eq!(config.relay.subscribe_timeout_millis, 5000);
        assert_eq!(config.session.announce_repeats, 5);
        assert_eq!(
            config.session.announce_interval_millis,
            SessionConfig::default().announce_interval_millis
        );
        assert_eq!(config.webrtc.ice_servers, vec!["turn:turn.example.com:3478"]);
        assert_eq!(config.webrtc.turn_username.as_deref(), Some("user"));
    }
}

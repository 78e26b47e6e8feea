use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use nri_stub::StubConfig;
use nri_stub::DEFAULT_SOCKET_PATH;
use utils::version;

/// NRI plugin pinning containers to the CPU cores requested in pod annotations.
#[derive(Parser, Clone, Debug)]
#[command(about, long_about = None, version = &**version::VERSION)]
pub(crate) struct Cli {
    #[arg(
        long,
        env = "NRI_PLUGIN_NAME",
        default_value = "core-binding",
        help = "Plugin name reported to the runtime"
    )]
    pub plugin_name: String,

    #[arg(
        long,
        env = "NRI_PLUGIN_IDX",
        default_value = "10",
        help = "Two digit plugin index (00-99), lower indices are invoked first"
    )]
    pub plugin_idx: String,

    #[arg(
        long,
        env = "NRI_SOCKET_PATH",
        default_value = DEFAULT_SOCKET_PATH,
        value_hint = clap::ValueHint::FilePath,
        help = "NRI socket of the container runtime"
    )]
    pub socket_path: PathBuf,

    #[arg(
        long,
        env = "NRI_PLUGIN_SOCKET",
        help = "File descriptor of a socket already connected to the runtime, set when the runtime launches the plugin"
    )]
    pub socket_fd: Option<RawFd>,

    #[arg(
        long,
        default_value = "5",
        help = "Seconds to wait for the runtime to accept the registration"
    )]
    pub registration_timeout_secs: u64,

    #[arg(
        long,
        default_value = "2",
        help = "Deadline in seconds attached to requests sent to the runtime"
    )]
    pub request_timeout_secs: u64,

    #[arg(
        long,
        env = "NRI_CORE_BINDING_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

impl From<&Cli> for StubConfig {
    fn from(cli: &Cli) -> Self {
        StubConfig::new(cli.plugin_name.clone())
            .with_plugin_idx(cli.plugin_idx.clone())
            .with_socket_path(cli.socket_path.clone())
            .with_socket_fd(cli.socket_fd)
            .with_registration_timeout(Duration::from_secs(cli.registration_timeout_secs))
            .with_request_timeout(Duration::from_secs(cli.request_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn explicit_arguments_reach_stub_config() {
        let cli = Cli::try_parse_from([
            "nri-core-binding",
            "--plugin-name",
            "pinning",
            "--plugin-idx",
            "05",
            "--socket-path",
            "/run/custom/nri.sock",
            "--socket-fd",
            "3",
            "--registration-timeout-secs",
            "9",
            "--request-timeout-secs",
            "1",
        ])
        .expect("should parse arguments");

        let config = StubConfig::from(&cli);
        assert_eq!(config.plugin_name, "pinning");
        assert_eq!(config.plugin_idx, "05");
        assert_eq!(config.socket_path, PathBuf::from("/run/custom/nri.sock"));
        assert_eq!(config.socket_fd, Some(3));
        assert_eq!(config.registration_timeout, Duration::from_secs(9));
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_index_is_caught_by_stub_validation() {
        let cli = Cli::try_parse_from(["nri-core-binding", "--plugin-idx", "7"])
            .expect("should parse arguments");
        assert!(StubConfig::from(&cli).validate().is_err());
    }
}

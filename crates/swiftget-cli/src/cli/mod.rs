//! CLI for the SwiftGet download manager.

mod commands;
mod progress_display;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use swiftget_core::config;

/// Exit codes promised to scripts.
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;
pub const EXIT_NETWORK: u8 = 3;
pub const EXIT_CHECKSUM: u8 = 4;
pub const EXIT_IO: u8 = 5;

/// Top-level CLI. A bare invocation with URLs is the `download` subcommand.
#[derive(Debug, Parser)]
#[command(name = "swiftget")]
#[command(version)]
#[command(about = "High-throughput segmented HTTP/HTTPS download manager", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<CliCommand>,

    #[command(flatten)]
    pub download: DownloadArgs,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Download one or more URLs (the default subcommand).
    Download(DownloadArgs),

    /// Show or edit the persistent configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Args, Default)]
pub struct DownloadArgs {
    /// HTTP/HTTPS URLs to download.
    pub urls: Vec<String>,

    /// Directory where files are saved (default: current directory).
    #[arg(short = 'd', long, value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Output filename (single-URL downloads only).
    #[arg(short = 'o', long, value_name = "NAME")]
    pub output: Option<String>,

    /// Continue a partially downloaded file.
    #[arg(short = 'c', long = "continue")]
    pub continue_partial: bool,

    /// Number of parallel connections per download.
    #[arg(long, value_name = "N")]
    pub connections: Option<usize>,

    /// Download speed cap in bytes/sec; accepts K and M suffixes.
    #[arg(long, value_name = "BYTES_PER_SEC")]
    pub max_speed: Option<String>,

    /// Override the User-Agent header.
    #[arg(long, value_name = "STR")]
    pub user_agent: Option<String>,

    /// Extra request header as 'Name: value'. Repeatable.
    #[arg(long = "header", value_name = "K: V")]
    pub headers: Vec<String>,

    /// Proxy URL for all requests.
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Expected checksum as ALG:HEX (md5, sha1, or sha256).
    #[arg(long, value_name = "ALG:HEX")]
    pub checksum: Option<String>,

    /// Suppress non-error output.
    #[arg(short, long)]
    pub quiet: bool,

    /// Verbose logging to stderr.
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Show a progress bar (default on).
    #[arg(long, overrides_with = "no_progress")]
    pub progress: bool,

    /// Disable the progress bar.
    #[arg(long = "no-progress")]
    pub no_progress: bool,

    /// Skip TLS certificate verification.
    #[arg(long = "no-check-certificate")]
    pub no_check_certificate: bool,

    /// Extract downloaded archives (not supported in this build).
    #[arg(long)]
    pub extract: bool,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct ConfigAction {
    /// Print every configured key.
    #[arg(long)]
    pub show: bool,

    /// Set a key, as KEY=VALUE.
    #[arg(long, value_name = "KEY=VALUE")]
    pub set: Option<String>,

    /// Print one key's value.
    #[arg(long, value_name = "KEY")]
    pub get: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(flatten)]
    pub action: ConfigAction,
}

impl Cli {
    /// Parse, dispatch, and map the result onto the promised exit codes.
    pub async fn run_from_args() -> ExitCode {
        let cli = Cli::parse();

        let (verbose, quiet) = match &cli.command {
            Some(CliCommand::Download(args)) => (args.verbose, args.quiet),
            None => (cli.download.verbose, cli.download.quiet),
            Some(CliCommand::Config(_)) => (false, false),
        };
        init_logging(verbose, quiet);

        let cfg = match config::load_or_init() {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("config unavailable, using defaults: {e:#}");
                config::Config::default()
            }
        };

        match cli.command {
            Some(CliCommand::Config(args)) => match commands::run_config(&args, cfg) {
                Ok(code) => ExitCode::from(code),
                Err(e) => {
                    eprintln!("swiftget: {e:#}");
                    ExitCode::from(EXIT_FAILURE)
                }
            },
            Some(CliCommand::Download(args)) => commands::run_download(args, &cfg).await,
            None => {
                if cli.download.urls.is_empty() {
                    eprintln!("swiftget: no URLs given; see --help");
                    return ExitCode::from(EXIT_USAGE);
                }
                commands::run_download(cli.download, &cfg).await
            }
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    if verbose {
        swiftget_core::logging::init_stderr_logging(true, false);
        return;
    }
    // Keep the terminal clear for the progress bar; stderr only when the
    // state file cannot be opened.
    if swiftget_core::logging::init_file_logging().is_err() {
        swiftget_core::logging::init_stderr_logging(false, quiet);
    }
}

/// Map a terminal download error onto the exit-code contract.
pub fn exit_code_for(error: &swiftget_core::retry::DownloadError) -> u8 {
    use swiftget_core::retry::{DownloadError, ErrorCategory};
    match error {
        DownloadError::ChecksumMismatch { .. } => EXIT_CHECKSUM,
        DownloadError::DiskSpace | DownloadError::FilePermission { .. } => EXIT_IO,
        _ => match error.profile().category {
            ErrorCategory::TransientNetwork
            | ErrorCategory::ServerError
            | ErrorCategory::RateLimited => EXIT_NETWORK,
            ErrorCategory::ContentIntegrity => EXIT_CHECKSUM,
            ErrorCategory::SystemResource => EXIT_IO,
            _ => EXIT_FAILURE,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftget_core::retry::DownloadError;

    #[test]
    fn bare_urls_parse_as_download() {
        let cli = Cli::parse_from(["swiftget", "https://example.com/a", "https://example.com/b"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.download.urls.len(), 2);
    }

    #[test]
    fn download_subcommand_with_options() {
        let cli = Cli::parse_from([
            "swiftget",
            "download",
            "-d",
            "/tmp",
            "--connections",
            "8",
            "--max-speed",
            "500K",
            "--header",
            "X-Token: abc",
            "--checksum",
            "sha256:0000000000000000000000000000000000000000000000000000000000000000",
            "https://example.com/file.iso",
        ]);
        let Some(CliCommand::Download(args)) = cli.command else {
            panic!("expected download subcommand");
        };
        assert_eq!(args.connections, Some(8));
        assert_eq!(args.max_speed.as_deref(), Some("500K"));
        assert_eq!(args.headers.len(), 1);
        assert_eq!(args.directory.as_deref(), Some(std::path::Path::new("/tmp")));
    }

    #[test]
    fn continue_flag_short_and_long() {
        let cli = Cli::parse_from(["swiftget", "-c", "https://example.com/f"]);
        assert!(cli.download.continue_partial);
        let cli = Cli::parse_from(["swiftget", "--continue", "https://example.com/f"]);
        assert!(cli.download.continue_partial);
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["swiftget", "-q", "-v", "https://example.com/f"]).is_err());
    }

    #[test]
    fn config_requires_exactly_one_action() {
        assert!(Cli::try_parse_from(["swiftget", "config"]).is_err());
        assert!(Cli::try_parse_from(["swiftget", "config", "--show", "--get", "k"]).is_err());
        let cli = Cli::parse_from(["swiftget", "config", "--set", "default-connections=8"]);
        let Some(CliCommand::Config(args)) = cli.command else { panic!() };
        assert_eq!(args.action.set.as_deref(), Some("default-connections=8"));
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(exit_code_for(&DownloadError::NetworkTimeout), EXIT_NETWORK);
        assert_eq!(exit_code_for(&DownloadError::ServerError { status: 502 }), EXIT_NETWORK);
        assert_eq!(
            exit_code_for(&DownloadError::ChecksumMismatch {
                expected: "a".into(),
                actual: "b".into()
            }),
            EXIT_CHECKSUM
        );
        assert_eq!(exit_code_for(&DownloadError::DiskSpace), EXIT_IO);
        assert_eq!(
            exit_code_for(&DownloadError::FilePermission { path: "/x".into() }),
            EXIT_IO
        );
        assert_eq!(exit_code_for(&DownloadError::Unknown("x".into())), EXIT_FAILURE);
        assert_eq!(exit_code_for(&DownloadError::ClientError { status: 404 }), EXIT_FAILURE);
    }
}

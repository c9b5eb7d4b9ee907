//! `swiftget download`: drive the coordinator over one or more URLs.

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;

use swiftget_core::bandwidth::BandwidthManager;
use swiftget_core::checksum::ExpectedChecksum;
use swiftget_core::client::{HttpClient, HttpClientConfig, DEFAULT_USER_AGENT};
use swiftget_core::config::{parse_byte_rate, Config};
use swiftget_core::coordinator::{
    redact_credentials, CoordinatorConfig, DownloadCoordinator, DownloadTask,
};
use swiftget_core::progress::ProgressReporter;

use crate::cli::progress_display::ConsoleProgress;
use crate::cli::{exit_code_for, DownloadArgs, EXIT_OK, EXIT_USAGE};

/// Settings after overlaying CLI flags onto the persistent config.
struct EffectiveSettings {
    directory: std::path::PathBuf,
    connections: usize,
    max_speed: Option<u64>,
    user_agent: String,
    check_certificate: bool,
    checksum: Option<ExpectedChecksum>,
    headers: HashMap<String, String>,
}

fn resolve_settings(args: &DownloadArgs, cfg: &Config) -> Result<EffectiveSettings, String> {
    let directory = args
        .directory
        .clone()
        .or_else(|| cfg.default_directory())
        .or_else(|| std::env::current_dir().ok())
        .ok_or_else(|| "cannot resolve a download directory".to_string())?;

    let connections = args
        .connections
        .or_else(|| cfg.default_connections())
        .unwrap_or(4)
        .clamp(1, 64);

    let max_speed = match &args.max_speed {
        Some(raw) => Some(parse_byte_rate(raw).map_err(|e| format!("--max-speed: {e:#}"))?),
        None => cfg.default_max_speed(),
    };

    let checksum = match &args.checksum {
        Some(raw) => Some(raw.parse().map_err(|e| format!("--checksum: {e:#}"))?),
        None => None,
    };

    let mut headers = HashMap::new();
    for raw in &args.headers {
        let Some((name, value)) = raw.split_once(':') else {
            return Err(format!("--header expects 'Name: value', got {raw:?}"));
        };
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    Ok(EffectiveSettings {
        directory,
        connections,
        max_speed,
        user_agent: args
            .user_agent
            .clone()
            .or_else(|| cfg.default_user_agent().map(String::from))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        check_certificate: if args.no_check_certificate {
            false
        } else {
            cfg.check_certificate().unwrap_or(true)
        },
        checksum,
        headers,
    })
}

pub async fn run_download(args: DownloadArgs, cfg: &Config) -> ExitCode {
    if args.urls.is_empty() {
        eprintln!("swiftget: no URLs given; see --help");
        return ExitCode::from(EXIT_USAGE);
    }
    if args.output.is_some() && args.urls.len() > 1 {
        eprintln!("swiftget: --output cannot be combined with multiple URLs");
        return ExitCode::from(EXIT_USAGE);
    }
    if args.extract {
        eprintln!("swiftget: --extract is not supported in this build; downloads proceed");
    }

    let settings = match resolve_settings(&args, cfg) {
        Ok(s) => s,
        Err(message) => {
            eprintln!("swiftget: {message}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    for url in &args.urls {
        let scheme_ok = url::Url::parse(url)
            .map(|u| matches!(u.scheme(), "http" | "https"))
            .unwrap_or(false);
        if !scheme_ok {
            eprintln!("swiftget: not an http(s) URL: {}", redact_credentials(url));
            return ExitCode::from(EXIT_USAGE);
        }
    }

    let client = match HttpClient::new(HttpClientConfig {
        user_agent: settings.user_agent.clone(),
        custom_headers: settings.headers.clone(),
        proxy: args.proxy.clone(),
        check_certificate: settings.check_certificate,
        ..HttpClientConfig::default()
    }) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("swiftget: {e:#}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // One process-wide budget; 0 means unlimited.
    let bandwidth = BandwidthManager::new(settings.max_speed.unwrap_or(0));
    let show_progress = !args.quiet && !args.no_progress;

    let mut worst = EXIT_OK;
    for url in &args.urls {
        let reporter = show_progress.then(|| {
            Arc::new(ConsoleProgress::new(settings.connections > 1)) as Arc<dyn ProgressReporter>
        });
        let coordinator = DownloadCoordinator::new(
            client.clone(),
            bandwidth.clone(),
            CoordinatorConfig { reporter, ..CoordinatorConfig::default() },
        );

        // Ctrl-C flips the cancellation switch; workers stop at the next
        // chunk boundary.
        let cancel = coordinator.cancellation_token();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let mut task = DownloadTask::new(url.clone(), settings.directory.clone());
        task.output_name = args.output.clone();
        task.connections = settings.connections;
        task.max_bytes_per_sec = settings.max_speed;
        task.expected_checksum = settings.checksum.clone();
        task.resume = args.continue_partial;

        let result = coordinator.download(&task).await;
        ctrl_c.abort();

        match result {
            Ok(outcome) => {
                if !args.quiet {
                    let secs = outcome.elapsed.as_secs_f64();
                    let rate = if secs > 0.0 {
                        outcome.bytes_downloaded as f64 / secs / 1_048_576.0
                    } else {
                        0.0
                    };
                    println!(
                        "{} -> {} ({} bytes, {:.2} MiB/s{})",
                        redact_credentials(url),
                        outcome.final_path.display(),
                        outcome.total_bytes,
                        rate,
                        if outcome.used_parallel { ", parallel" } else { "" },
                    );
                }
            }
            Err(error) => {
                eprintln!(
                    "swiftget: download failed: {}: {} ({})",
                    redact_credentials(url),
                    error,
                    error.kind_name(),
                );
                let code = exit_code_for(&error);
                if code > worst {
                    worst = code;
                }
            }
        }
    }

    ExitCode::from(worst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let cfg = Config::from_json(
            r#"{"default-connections": "16", "default-max-speed": "1M", "default-user-agent": "cfg-agent"}"#,
        )
        .unwrap();
        let args = DownloadArgs {
            connections: Some(2),
            max_speed: Some("100K".into()),
            user_agent: Some("flag-agent".into()),
            ..Default::default()
        };
        let s = resolve_settings(&args, &cfg).unwrap();
        assert_eq!(s.connections, 2);
        assert_eq!(s.max_speed, Some(102_400));
        assert_eq!(s.user_agent, "flag-agent");
    }

    #[test]
    fn config_defaults_apply_without_flags() {
        let cfg = Config::from_json(
            r#"{"default-connections": "16", "default-max-speed": "1M", "check-certificate": "false"}"#,
        )
        .unwrap();
        let args = DownloadArgs::default();
        let s = resolve_settings(&args, &cfg).unwrap();
        assert_eq!(s.connections, 16);
        assert_eq!(s.max_speed, Some(1024 * 1024));
        assert!(!s.check_certificate);
    }

    #[test]
    fn bad_header_is_rejected() {
        let args = DownloadArgs { headers: vec!["no-colon".into()], ..Default::default() };
        assert!(resolve_settings(&args, &Config::default()).is_err());
    }

    #[test]
    fn bad_checksum_is_rejected() {
        let args = DownloadArgs { checksum: Some("sha256:short".into()), ..Default::default() };
        assert!(resolve_settings(&args, &Config::default()).is_err());
    }

    #[test]
    fn header_values_are_trimmed() {
        let args = DownloadArgs {
            headers: vec!["X-Token:  abc ".into()],
            ..Default::default()
        };
        let s = resolve_settings(&args, &Config::default()).unwrap();
        assert_eq!(s.headers.get("X-Token").map(String::as_str), Some("abc"));
    }
}

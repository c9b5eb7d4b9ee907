//! `swiftget config`: show, get, and set persistent configuration keys.

use anyhow::Result;

use crate::cli::{ConfigArgs, EXIT_FAILURE, EXIT_OK, EXIT_USAGE};
use swiftget_core::config::Config;

pub fn run_config(args: &ConfigArgs, mut cfg: Config) -> Result<u8> {
    if args.action.show {
        for (key, value) in cfg.entries() {
            println!("{key}={value}");
        }
        return Ok(EXIT_OK);
    }

    if let Some(key) = &args.action.get {
        return Ok(match cfg.get(key) {
            Some(value) => {
                println!("{value}");
                EXIT_OK
            }
            None => {
                eprintln!("swiftget: config key not set: {key}");
                EXIT_FAILURE
            }
        });
    }

    if let Some(assignment) = &args.action.set {
        let Some((key, value)) = assignment.split_once('=') else {
            eprintln!("swiftget: --set expects KEY=VALUE, got {assignment:?}");
            return Ok(EXIT_USAGE);
        };
        let key = key.trim();
        if key.is_empty() {
            eprintln!("swiftget: --set expects a non-empty key");
            return Ok(EXIT_USAGE);
        }
        cfg.set(key, value.trim());
        cfg.save()?;
        return Ok(EXIT_OK);
    }

    // clap's group guarantees one action was chosen.
    unreachable!("config action enforced by clap group")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::ConfigAction;

    fn args(show: bool, set: Option<&str>, get: Option<&str>) -> ConfigArgs {
        ConfigArgs {
            action: ConfigAction {
                show,
                set: set.map(String::from),
                get: get.map(String::from),
            },
        }
    }

    #[test]
    fn get_missing_key_fails() {
        let code = run_config(&args(false, None, Some("never-set")), Config::default()).unwrap();
        assert_eq!(code, EXIT_FAILURE);
    }

    #[test]
    fn set_requires_assignment_form() {
        let code = run_config(&args(false, Some("not-an-assignment"), None), Config::default())
            .unwrap();
        assert_eq!(code, EXIT_USAGE);
        let code = run_config(&args(false, Some("=value"), None), Config::default()).unwrap();
        assert_eq!(code, EXIT_USAGE);
    }
}

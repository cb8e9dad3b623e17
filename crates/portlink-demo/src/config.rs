//! Configuration loading for the demo binary.
//!
//! The demo's own flags are mixed freely with configuration flags, so the
//! arguments handed to `ortho_config` are filtered down to the program name
//! and the flags listed in [`CONFIG_CLI_FLAGS`].

use std::ffi::{OsStr, OsString};

use ortho_config::OrthoConfig;
use portlink_config::{CONFIG_CLI_FLAGS, Config};

use crate::DemoError;

/// Resolves the configuration for one run.
pub(crate) trait ConfigLoader {
    /// Loads configuration from the full command line.
    fn load(&self, args: &[OsString]) -> Result<Config, DemoError>;
}

/// Layers defaults, file, environment and flags through `ortho_config`.
pub(crate) struct OrthoConfigLoader;

impl ConfigLoader for OrthoConfigLoader {
    fn load(&self, args: &[OsString]) -> Result<Config, DemoError> {
        Config::load_from_iter(config_arguments(args)).map_err(DemoError::Config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagAction {
    Include { needs_value: bool },
    Skip,
}

fn classify(argument: &OsStr) -> FlagAction {
    let text = argument.to_string_lossy();
    let (flag, inline_value) = text
        .split_once('=')
        .map_or((text.as_ref(), false), |(name, _)| (name, true));
    if CONFIG_CLI_FLAGS.contains(&flag) {
        FlagAction::Include {
            needs_value: !inline_value,
        }
    } else {
        FlagAction::Skip
    }
}

/// Keeps the program name and every configuration flag with its value.
pub(crate) fn config_arguments(args: &[OsString]) -> Vec<OsString> {
    let mut arguments = args.iter();
    let mut filtered: Vec<OsString> = arguments.next().cloned().into_iter().collect();
    while let Some(argument) = arguments.next() {
        if let FlagAction::Include { needs_value } = classify(argument) {
            filtered.push(argument.clone());
            if needs_value && let Some(value) = arguments.next() {
                filtered.push(value.clone());
            }
        }
    }
    filtered
}

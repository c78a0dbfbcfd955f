use anyhow::{bail, Context, Result};
use figment::{providers::Format, Figment};
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;

/// This trait is used for the cli-args struct, which doubles as the env-var
/// surface: every env var can be overridden by a cli arg, and both override
/// the config file.
pub trait CliEnvExt: Serialize + DeserializeOwned {
    /// Env vars follow the pattern of `{ENV_VAR_PREFIX}_{UPPERCASE_ARG_NAME}`
    const ENV_VAR_PREFIX: &'static str;

    fn home_dir(&self) -> Option<PathBuf>;
    fn dotenv_path(&self) -> Option<PathBuf>;

    // merges the cli and env vars
    // which has optional values, by default None (or empty)
    // and parses complex types from strings
    fn merge_cli_env(&self) -> Result<Self> {
        let merged: Self = Figment::new()
            .merge(figment::providers::Env::prefixed(&format!(
                "{}_",
                Self::ENV_VAR_PREFIX
            )))
            .merge(figment::providers::Serialized::defaults(self))
            .extract()?;

        Ok(merged)
    }
}

/// The fully parsed and validated config struct of an application.
/// Built up from the [`ConfigBuilder`] which loads from multiple sources
/// (in order of preference):
///
/// 1. cli args
/// 2. environment variables
/// 3. config file
pub trait ConfigExt: Serialize + DeserializeOwned + Default {
    const FILENAME: &'static str;
    const DIRNAME: &'static str;
    const HIDDEN_DIRNAME: &'static str;

    /// Log directives in the format of tracing-subscriber env-filter strings.
    fn log_directives(&self) -> &[String];

    fn tracing_env_filter(&self) -> Result<tracing_subscriber::EnvFilter> {
        let mut filter = tracing_subscriber::EnvFilter::from_default_env();
        for directive in self.log_directives() {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(err) => bail!("{}: {}", err, directive),
            }
        }

        Ok(filter)
    }
}

#[derive(Debug)]
pub struct ConfigBuilder<A: CliEnvExt> {
    pub cli_args: A,
}

impl<A: CliEnvExt> ConfigBuilder<A> {
    pub fn new(cli_args: A) -> Self {
        Self { cli_args }
    }

    pub fn build<C: ConfigExt>(self) -> Result<C> {
        // try to load dotenv first, since it may affect env vars for filepaths
        let dotenv_path = self
            .cli_args
            .dotenv_path()
            .map(Ok)
            .unwrap_or_else(|| std::env::current_dir().map(|dir| dir.join(".env")))?;

        if dotenv_path.exists() {
            if let Err(e) = dotenvy::from_path(dotenv_path) {
                bail!("Error loading dotenv file: {}", e);
            }
        }

        let cli_env_args = self.cli_args.merge_cli_env()?;

        // then, the final config, which can have more complex types with easier
        // TOML-like syntax, and fills in defaults for required values at the end
        let config: C = Figment::new()
            .merge(figment::providers::Toml::file(Self::filepath::<C>(
                &cli_env_args,
            )?))
            .merge(figment::providers::Serialized::defaults(cli_env_args))
            .join(figment::providers::Serialized::defaults(C::default()))
            .extract()?;

        Ok(config)
    }

    /// finds the filepath through a series of fallbacks
    /// the argument is internally derived cli + env args
    pub fn filepath<C: ConfigExt>(cli_env_args: &A) -> Result<PathBuf> {
        let filepaths_to_try = Self::filepaths_to_try::<C>(cli_env_args);

        filepaths_to_try
            .iter()
            .find(|filename| filename.exists())
            .with_context(|| {
                format!(
                    "No config file found, try creating one of these: {:?}",
                    filepaths_to_try
                )
            })
            .cloned()
    }

    /// provides the list of filepaths to try for the config file
    /// the argument is internally from cli + env args
    pub fn filepaths_to_try<C: ConfigExt>(cli_env_args: &A) -> Vec<PathBuf> {
        // the paths returned will be tried in order of pushing
        let mut dirs = Vec::new();

        // explicit arg passed to the cli, e.g. --home /foo, or an env var
        // this does not append the default subdirectory; it is used as the
        // direct home directory
        if let Some(dir) = cli_env_args.home_dir() {
            dirs.push(expand_tilde(dir));
        }

        // next, check the current working directory, wherever the command is run from
        if let Ok(dir) = std::env::current_dir() {
            dirs.push(dir);
        }

        // the user's home directory directly, not in the `.config` subdirectory;
        // to not pollute it, a hidden directory is used
        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(C::HIDDEN_DIRNAME)) {
            dirs.push(dir);
        }

        // the system config directory, e.g. ~/.config/<dirname> on Linux
        if let Some(dir) = dirs::config_dir().map(|dir| dir.join(C::DIRNAME)) {
            dirs.push(dir);
        }

        // on linux this may already be covered by config_dir above, but on
        // macOS and windows it's helpful to check explicitly
        if let Some(dir) = std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .map(|dir| dir.join(C::DIRNAME))
        {
            dirs.push(dir);
        }

        if let Some(dir) = dirs::home_dir().map(|dir| dir.join(".config").join(C::DIRNAME)) {
            dirs.push(dir);
        }

        // lastly, the system-wide /etc location
        dirs.push(PathBuf::from("/etc").join(C::DIRNAME));

        // now we have a list of directories to check, we need to add the filename to each
        dirs.into_iter().map(|dir| dir.join(C::FILENAME)).collect()
    }
}

pub fn expand_tilde(path: PathBuf) -> PathBuf {
    shellexpand::tilde(&path.to_string_lossy()).to_string().into()
}

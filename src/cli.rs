//! CLI for this application
//!
use std::path::PathBuf;

#[derive(Clone, Debug, clap::Parser)]
#[clap(about = "Push pxGrid SGT/IP bindings into network-analytics host groups")]
pub struct Cli {
    // Path to the TOML configuration file
    #[clap(
        long,
        default_value = "sgtsync.toml",
        env("SGTSYNC_CONFIG"),
        help = "Path to the TOML configuration file"
    )]
    pub config: PathBuf,

    // Console credential overrides; take precedence over the config file
    #[clap(
        long,
        env("SGTSYNC_CONSOLE_USER"),
        help = "Console API user (overrides the config file)"
    )]
    pub console_user: Option<String>,

    #[clap(
        long,
        env("SGTSYNC_CONSOLE_PASSWORD"),
        hide_env_values = true,
        help = "Console API password (overrides the config file)"
    )]
    pub console_password: Option<String>,

    // pxGrid agent password override
    #[clap(
        long,
        env("SGTSYNC_PXGRID_PASSWORD"),
        hide_env_values = true,
        help = "pxGrid agent password (overrides the config file)"
    )]
    pub pxgrid_password: Option<String>,
}

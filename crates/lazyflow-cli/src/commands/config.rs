//! Effective settings display.

use crate::commands::common::LoadedSettings;
use clap::Args;
use lazyflow_config::{ensure_user_config_dir, settings_path};

#[derive(Args)]
pub struct ConfigArgs {
    /// Write the effective settings to the user settings file
    #[arg(long)]
    save: bool,
}

pub fn run(args: ConfigArgs, loaded: &LoadedSettings) -> anyhow::Result<()> {
    match &loaded.source {
        Some(path) => println!("# source: {}", path.display()),
        None => println!("# source: built-in defaults"),
    }
    print!("{}", loaded.settings.to_toml()?);

    if args.save {
        ensure_user_config_dir()?;
        let path = settings_path();
        loaded.settings.save(&path)?;
        println!("# saved to {}", path.display());
    }
    Ok(())
}

use crate::config::Settings;
use crate::error::{config_error, AppResult, EXIT_SUCCESS};
use crate::report::sign::generate_key_files;
use clap::Args;
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Private key path; the public key is written next to it as `.pub`.
    /// Defaults to `signing.private_key_path` from the config file.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

pub fn run(args: &KeygenArgs, settings: Option<&Settings>) -> AppResult<i32> {
    let private_path = args
        .output
        .clone()
        .or_else(|| settings.and_then(|s| s.signing.private_key_path.clone()))
        .ok_or_else(|| {
            config_error("no key path given: pass --output or set signing.private_key_path")
        })?;

    let (private, public) = generate_key_files(&private_path)?;
    info!("Generated Ed25519 key pair");
    println!("Private key: {}", private.display());
    println!("Public key:  {}", public.display());
    Ok(EXIT_SUCCESS)
}

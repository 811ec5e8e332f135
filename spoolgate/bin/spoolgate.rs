#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = spoolgate::config::find_config_file(None, |key| std::env::var(key).ok())?;
    let spoolgate = spoolgate::config::load(&config_path)?;

    spoolgate.run().await
}

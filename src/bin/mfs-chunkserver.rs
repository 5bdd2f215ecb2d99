use std::path::PathBuf;

use anyhow::{bail, Error};

use mfs_chunkserver::config::DEFAULT_CONFIG_PATH;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        log::error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Error> {
    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" => match args.next() {
                Some(path) => config_path = PathBuf::from(path),
                None => bail!("option -c requires a config file path"),
            },
            "-h" | "--help" => {
                println!("usage: mfs-chunkserver [-c <config file>]");
                return Ok(());
            }
            other if !other.starts_with('-') => config_path = PathBuf::from(other),
            other => bail!("unknown option '{}'", other),
        }
    }

    mfs_chunkserver::mainloop::run(&config_path)
}

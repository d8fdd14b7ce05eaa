//! Command-line entry point: downloads the single-file torrent named by a
//! metainfo path into the current directory.

use std::path::PathBuf;

use leechtorrent::{client::Engine, conf::Conf, metainfo::Metainfo};

fn main() {
    env_logger::init();

    let metainfo_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: leechtorrent <path-to-torrent-file>");
            std::process::exit(1);
        }
    };

    let mut runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start async runtime: {}", error);
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(metainfo_path));
    std::process::exit(code);
}

async fn run(metainfo_path: PathBuf) -> i32 {
    let bytes = match std::fs::read(&metainfo_path) {
        Ok(bytes) => bytes,
        Err(error) => {
            log::error!("failed to read metainfo file {:?}: {}", metainfo_path, error);
            return 1;
        }
    };

    let metainfo = match Metainfo::from_bytes(&bytes) {
        Ok(metainfo) => metainfo,
        Err(error) => {
            log::error!("invalid metainfo: {}", error);
            return 1;
        }
    };

    let download_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let conf = Conf::new(download_dir);
    let engine = Engine::new(conf, metainfo);

    match engine.run().await {
        Ok(()) => 0,
        Err(leechtorrent::error::Error::Metainfo(
            leechtorrent::metainfo::Error::UdpTrackerNotSupported(url),
        )) => {
            log::error!("tracker {} is a UDP tracker, which is not supported", url);
            1
        }
        Err(error) => {
            log::error!("fatal error: {}", error);
            1
        }
    }
}

//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default leechtorrent client id.
pub const LEECHTORRENT_CLIENT_ID: &PeerId = b"-lt0001-000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default leechtorrent client id,
    /// [`LEECHTORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *LEECHTORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine has a default instance of this applied to its one torrent.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which the torrent's file is placed upon download.
    pub download_dir: PathBuf,

    /// The fixed number of concurrent peer sessions the supervisor spawns
    /// against the shared peer queue (§4.6).
    pub session_count: usize,

    /// How often the monitor loop wakes up to check for completion, abort,
    /// and re-announce (§4.6). Spec default: 100ms.
    pub monitor_tick: Duration,

    /// If the tracker doesn't provide an announce interval, we default to
    /// re-announcing every 300 seconds (§4.6).
    pub announce_interval: Duration,

    /// A pending block request older than this is eligible for re-issue by
    /// the coordinator's request-selection policy (§4.4). Spec value:
    /// 300_000ms.
    pub max_pending_request_time: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // Exactly 10 peer sessions are spawned, per spec §4.6.
            session_count: 10,
            monitor_tick: Duration::from_millis(100),
            announce_interval: Duration::from_secs(5 * 60),
            max_pending_request_time: Duration::from_secs(5 * 60),
        }
    }
}

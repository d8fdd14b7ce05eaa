//! The client supervisor: builds the coordinator, fans out peer sessions
//! against a shared peer queue, and re-announces to the tracker on an
//! interval until the download completes or the user aborts.

use std::{net::SocketAddr, sync::Arc, time::Instant};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    conf::Conf,
    coordinator::Coordinator,
    error::Result,
    metainfo::Metainfo,
    peer::{Command, PeerQueue, PeerSession, Sender as PeerCommandSender},
    storage_info::StorageInfo,
    tracker::TrackerClient,
};

/// We never accept incoming connections since this client only leeches, so
/// the port we announce is nominal.
const DEFAULT_PORT: u16 = 6881;

/// Drives a single torrent download to completion.
pub struct Engine {
    conf: Conf,
    metainfo: Metainfo,
}

impl Engine {
    pub fn new(conf: Conf, metainfo: Metainfo) -> Self {
        Self { conf, metainfo }
    }

    /// Announces to the tracker, spawns the peer session fan-out, and runs
    /// the monitor loop until the torrent is complete or Ctrl-C is received.
    pub async fn run(&self) -> Result<()> {
        if !self.metainfo.is_http_tracker() {
            return Err(
                crate::metainfo::Error::UdpTrackerNotSupported(self.metainfo.announce.clone())
                    .into(),
            );
        }

        let info_hash = self.metainfo.info_hash()?;
        let storage = StorageInfo::new(&self.metainfo, self.conf.torrent.download_dir.clone());
        let piece_count = storage.piece_count;
        let coordinator = Arc::new(RwLock::new(Coordinator::new(
            &self.metainfo,
            storage,
            self.conf.torrent.max_pending_request_time,
        )?));

        let tracker = TrackerClient::new(
            self.metainfo.announce.clone(),
            info_hash,
            self.conf.engine.client_id,
            DEFAULT_PORT,
        )?;

        let left = coordinator.read().await.bytes_left();
        let response = tracker.announce(left).await?;
        let mut announce_interval = response.interval;
        let mut last_announce = Instant::now();

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer_queue: PeerQueue = Arc::new(Mutex::new(peer_rx));
        enqueue(&peer_tx, response.peers);

        let mut session_cmds: Vec<PeerCommandSender> = Vec::with_capacity(
            self.conf.torrent.session_count,
        );
        for _ in 0..self.conf.torrent.session_count {
            let (mut session, cmd_tx) = PeerSession::new(
                self.conf.engine.client_id,
                info_hash,
                piece_count,
                Arc::clone(&coordinator),
                Arc::clone(&peer_queue),
            );
            tokio::spawn(async move { session.start().await });
            session_cmds.push(cmd_tx);
        }

        let mut monitor = tokio::time::interval(self.conf.torrent.monitor_tick);
        loop {
            tokio::select! {
                _ = monitor.tick() => {
                    if coordinator.read().await.is_complete() {
                        log::info!("download complete");
                        break;
                    }
                    if last_announce.elapsed() >= announce_interval {
                        last_announce = Instant::now();
                        let uploaded = coordinator.read().await.bytes_uploaded();
                        let downloaded = coordinator.read().await.bytes_downloaded();
                        let left = coordinator.read().await.bytes_left();
                        match tracker.connect(uploaded, downloaded, left).await {
                            Ok(response) => {
                                drain_queue(&peer_queue).await;
                                enqueue(&peer_tx, response.peers);
                                announce_interval = response.interval;
                            }
                            Err(error) => {
                                log::warn!("re-announce failed: {}", error);
                            }
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received interrupt, aborting");
                    break;
                }
            }
        }

        for cmd_tx in &session_cmds {
            let _ = cmd_tx.send(Command::Shutdown);
        }
        coordinator.read().await.close()?;
        Ok(())
    }
}

fn enqueue(tx: &mpsc::UnboundedSender<SocketAddr>, peers: Vec<SocketAddr>) {
    for addr in peers {
        let _ = tx.send(addr);
    }
}

async fn drain_queue(queue: &PeerQueue) {
    let mut queue = queue.lock().await;
    while queue.try_recv().is_ok() {}
}

//! StreamServer - session table keyed by fd and pid

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use contracts::{Pid, TransportConfig, Uid};
use parking_lot::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, TransportError};
use crate::packet::NetPacket;
use crate::session::StreamSession;

#[derive(Default)]
struct SessionTable {
    by_fd: HashMap<RawFd, Arc<StreamSession>>,
    by_pid: HashMap<Pid, RawFd>,
}

/// Per-destination multicast result
#[derive(Debug, Default)]
pub struct MulticastReport {
    pub delivered: Vec<RawFd>,
    pub failed: Vec<(RawFd, TransportError)>,
}

impl MulticastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Socket channel server
pub struct StreamServer {
    config: TransportConfig,
    sessions: RwLock<SessionTable>,
}

impl StreamServer {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(SessionTable::default()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Create a socket pair for a client and register the server end
    ///
    /// A pid owns at most one socket channel; an existing one is closed and
    /// replaced.
    #[instrument(name = "stream_server_add_socket_pair", skip(self))]
    pub fn add_socket_pair_info(
        &self,
        uid: Uid,
        pid: Pid,
        token_type: i32,
    ) -> Result<(Arc<StreamSession>, UnixStream)> {
        let (session, client) = StreamSession::pair(pid, uid, token_type, &self.config)?;
        session.bind()?;

        let replaced = {
            let mut table = self.sessions.write();
            let replaced = table
                .by_pid
                .insert(pid, session.fd())
                .and_then(|old_fd| table.by_fd.remove(&old_fd));
            table.by_fd.insert(session.fd(), session.clone());
            replaced
        };
        if let Some(old) = replaced {
            warn!(pid, old_fd = old.fd(), "replacing existing socket channel");
            old.close();
        }

        info!(pid, uid, fd = session.fd(), "socket channel created");
        Ok((session, client))
    }

    pub fn get_session(&self, fd: RawFd) -> Option<Arc<StreamSession>> {
        self.sessions.read().by_fd.get(&fd).cloned()
    }

    pub fn get_session_by_pid(&self, pid: Pid) -> Option<Arc<StreamSession>> {
        let table = self.sessions.read();
        table
            .by_pid
            .get(&pid)
            .and_then(|fd| table.by_fd.get(fd))
            .cloned()
    }

    pub fn get_client_fd(&self, pid: Pid) -> Option<RawFd> {
        self.sessions.read().by_pid.get(&pid).copied()
    }

    pub fn get_client_pid(&self, fd: RawFd) -> Option<Pid> {
        self.sessions.read().by_fd.get(&fd).map(|s| s.pid())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().by_fd.len()
    }

    /// Send one packet to one session
    pub fn send_msg(&self, fd: RawFd, packet: &NetPacket) -> Result<()> {
        let session = self
            .get_session(fd)
            .ok_or(TransportError::SessionNotFound(fd))?;
        session.send_msg(packet)
    }

    /// Send one packet to every fd, independently per destination
    ///
    /// The frame is encoded once. A failure on one fd never prevents
    /// delivery to the others.
    pub fn multicast(&self, fds: &[RawFd], packet: &NetPacket) -> Result<MulticastReport> {
        let frame = packet.to_frame(self.config.max_packet_size)?;
        let mut report = MulticastReport::default();

        for &fd in fds {
            let result = match self.get_session(fd) {
                Some(session) => session.send_frame(&frame),
                None => Err(TransportError::SessionNotFound(fd)),
            };
            match result {
                Ok(()) => report.delivered.push(fd),
                Err(e) => {
                    debug!(fd, error = %e, "multicast destination failed");
                    report.failed.push((fd, e));
                }
            }
        }
        Ok(report)
    }

    /// Remove and close the pid's socket channel
    #[instrument(name = "stream_server_del_session", skip(self))]
    pub fn del_session(&self, pid: Pid) -> Option<Arc<StreamSession>> {
        let removed = {
            let mut table = self.sessions.write();
            table
                .by_pid
                .remove(&pid)
                .and_then(|fd| table.by_fd.remove(&fd))
        };
        if let Some(session) = &removed {
            session.close();
            info!(pid, fd = session.fd(), "socket channel destroyed");
        }
        removed
    }

    /// Close every session
    pub fn close_all(&self) {
        let sessions: Vec<_> = {
            let mut table = self.sessions.write();
            table.by_pid.clear();
            table.by_fd.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }
}

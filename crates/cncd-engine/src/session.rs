//! Client sessions
//!
//! A session is an authenticated client connection. Every session carries
//! an unbounded event channel; controllers it subscribes to multicast
//! their state onto it, and the engine uses it for global events
//! (`startup`, `task:*`, `config:change`).

use crate::auth::AuthClaims;
use cncd_communication::Push;
use std::net::IpAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// An authenticated client session
#[derive(Debug, Clone)]
pub struct Session {
    /// Session id, used as the subscriber key in controllers
    pub id: Uuid,
    /// Authenticated user
    pub user: AuthClaims,
    /// Remote address the session connected from
    pub remote: IpAddr,
    /// Event sink towards the client
    pub tx: mpsc::UnboundedSender<Push>,
}

impl Session {
    /// Create a session and its event receiver
    pub fn new(user: AuthClaims, remote: IpAddr) -> (Self, mpsc::UnboundedReceiver<Push>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4(),
                user,
                remote,
                tx,
            },
            rx,
        )
    }

    /// Push an event to this session, ignoring a gone client
    pub fn push(&self, event: Push) {
        let _ = self.tx.send(event);
    }
}

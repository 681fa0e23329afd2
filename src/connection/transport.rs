use std::future::Future;

use tokio::sync::mpsc;

use crate::error::ConnectionError;
use crate::types::{Identity, MatchContext};

/// One established duplex link carrying JSON text frames. Dropping
/// `outbound` closes the link from the client side; the peer closes it by
/// dropping its end of `inbound`.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two connected in-memory ends: `(client side, authority side)`.
    pub fn pair() -> (Link, Link) {
        let (client_tx, authority_rx) = mpsc::unbounded_channel();
        let (authority_tx, client_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: client_tx,
                inbound: client_rx,
            },
            Link {
                outbound: authority_tx,
                inbound: authority_rx,
            },
        )
    }
}

/// Opens transport links for a player. Implementations decide how the
/// authority is reached; the connection manager only sees `Link`s.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        identity: &Identity,
        context: &MatchContext,
    ) -> impl Future<Output = Result<Link, ConnectionError>> + Send;
}

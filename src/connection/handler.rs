//! Connection Handler

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::ProxyRule;
use crate::error::ProxyError;
use crate::metrics::ListenerStats;
use crate::relay::{CloseReason, RelayEngine, RelaySession, SessionOutcome};
use crate::shutdown::ShutdownSignal;
use crate::tls::TlsConnector;
use crate::transport::{self, ProxyStream};

/// Runs one stream session: dial the target, then relay until closed
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    rule: Arc<ProxyRule>,
    engine: RelayEngine,
    tls: Option<TlsConnector>,
    stats: Arc<ListenerStats>,
}

impl ConnectionHandler {
    /// Fails only when the rule's TLS client settings cannot be built.
    pub fn new(
        rule: Arc<ProxyRule>,
        shutdown_grace: Duration,
        stats: Arc<ListenerStats>,
    ) -> Result<Self, ProxyError> {
        let engine = RelayEngine::new(&rule.settings, shutdown_grace);
        let tls = if rule.settings.dial_tls {
            if rule.settings.tls_skip_verify {
                warn!("Rule {} dials TLS without verifying certificates", rule.name);
            }
            Some(TlsConnector::new(rule.settings.tls_skip_verify)?)
        } else {
            None
        };

        Ok(Self {
            rule,
            engine,
            tls,
            stats,
        })
    }

    /// Handle a single accepted connection.
    ///
    /// When the target cannot be dialed the inbound connection is reset so
    /// the client sees the failure immediately.
    #[instrument(skip(self, inbound, shutdown), fields(rule = %self.rule.name))]
    pub async fn handle(
        &self,
        inbound: ProxyStream,
        client: String,
        mut shutdown: ShutdownSignal,
    ) -> SessionOutcome {
        let session = Arc::new(RelaySession::new(
            self.rule.name.clone(),
            client,
            self.rule.target.to_string(),
        ));

        let dial = transport::dial(
            self.rule.target_protocol,
            &self.rule.target,
            &self.rule.settings,
            self.tls.as_ref(),
        );
        let dialed = tokio::select! {
            result = dial => Some(result),
            _ = shutdown.recv() => None,
        };

        let outcome = match dialed {
            Some(Ok(outbound)) => {
                debug!(
                    session_id = %session.session_id,
                    "Dialed {} for {}",
                    outbound.peer_label(),
                    session.client
                );
                self.engine
                    .relay(Arc::clone(&session), inbound, outbound, shutdown)
                    .await
            }
            Some(Err(e)) => {
                warn!(session_id = %session.session_id, "Resetting client: {}", e);
                inbound.reset();
                session.finish(CloseReason::DialFailed(e.to_string()))
            }
            None => {
                inbound.reset();
                session.finish(CloseReason::Shutdown)
            }
        };

        self.stats.record_outcome(&outcome);
        session.log_outcome(&outcome);
        outcome
    }
}

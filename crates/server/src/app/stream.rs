use super::hub::{ConnectionEntry, OUTBOUND_CAPACITY};
use super::{ServerError, SottoApp};
use crate::security::limiter::RateScope;
use crate::util::query_param;
use chrono::Utc;
use pingora::http::ResponseHeader;
use pingora::protocols::Stream;
use pingora::protocols::http::ServerSession;
use pingora::server::ShutdownWatch;
use sotto_proto::{ClientEnvelope, ServerEnvelope, next_line};
use std::sync::Arc;
use tokio::select;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

impl SottoApp {
    /// Drives one live relay stream: a long-lived request whose body
    /// carries newline-delimited client envelopes while the response body
    /// streams server envelopes back. Reader and writer share this task;
    /// the `select!` joins their lifetimes to the connection's.
    pub(super) async fn process_stream(
        self: &Arc<Self>,
        mut session: ServerSession,
        shutdown: &ShutdownWatch,
    ) -> Option<Stream> {
        if let Some(retry_after) = self.check_rate_limit(&session, RateScope::Stream).await {
            self.state.metrics.mark_http_rate_limited();
            if let Err(err) = self.respond_rate_limited(session, retry_after).await {
                error!("stream rate limit response failed: {}", err);
            }
            return None;
        }
        let user_id = match self.authenticate_stream(&session) {
            Ok(user_id) => user_id,
            Err(err) => {
                let _ = self.respond_api_error(&mut session, err).await;
                return None;
            }
        };
        let device_label = query_param(session.req_header().uri.query(), "device")
            .unwrap_or("default")
            .to_string();

        let mut response = ResponseHeader::build_no_case(200, None).ok()?;
        response
            .append_header("content-type", "application/x-ndjson")
            .ok()?;
        response.append_header("cache-control", "no-store").ok()?;
        session
            .write_response_header(Box::new(response))
            .await
            .ok()?;

        let (tx_out, mut rx_out) = mpsc::channel::<ServerEnvelope>(OUTBOUND_CAPACITY);
        let connection_id = self.state.hub.next_connection_id();
        self.state
            .hub
            .register(ConnectionEntry::new(
                tx_out,
                connection_id,
                user_id,
                device_label.clone(),
            ))
            .await;
        self.state.metrics.incr_connections();
        info!(user = %user_id, device = %device_label, "stream established");

        let mut buffer: Vec<u8> = Vec::new();
        let mut shutdown_rx = shutdown.clone();
        'stream: loop {
            select! {
                inbound = session.read_request_body() => {
                    match inbound {
                        Ok(Some(chunk)) => {
                            if chunk.is_empty() {
                                continue;
                            }
                            buffer.extend_from_slice(chunk.as_ref());
                            loop {
                                let (parsed, consumed) = match next_line(&buffer) {
                                    Ok(Some((line, consumed))) => {
                                        (ClientEnvelope::parse(line), consumed)
                                    }
                                    Ok(None) => break,
                                    Err(err) => {
                                        error!(user = %user_id, "stream framing failure: {}", err);
                                        break 'stream;
                                    }
                                };
                                buffer.drain(0..consumed);
                                self.state.hub.touch(user_id).await;
                                match parsed {
                                    Ok(envelope) => {
                                        self.handle_client_envelope(user_id, envelope).await;
                                    }
                                    Err(err) => {
                                        debug!(user = %user_id, "undecodable frame ignored: {}", err);
                                    }
                                }
                            }
                        }
                        Ok(None) => {
                            break;
                        }
                        Err(err) => {
                            error!(user = %user_id, "stream read failure: {}", err);
                            break;
                        }
                    }
                }
                outbound = rx_out.recv() => {
                    match outbound {
                        Some(envelope) => {
                            if let Err(err) = self.write_envelope(&mut session, &envelope).await {
                                error!(user = %user_id, "outbound send failed: {}", err);
                                break;
                            }
                        }
                        // The hub dropped our sender: evicted by a newer
                        // connection, a slow-consumer trip, or shutdown.
                        None => {
                            break;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() {
                        break;
                    }
                }
            }
        }

        self.state.hub.unregister(user_id, connection_id).await;
        self.state.metrics.decr_connections();
        // A replacement connection keeps the pairing; a genuine
        // disconnect dissolves it so the peer stops waiting on a ghost.
        if !self.state.hub.is_online(user_id).await {
            self.state.matchmaker.remove_pair(user_id).await;
        }
        info!(user = %user_id, "stream closed");
        session.finish().await.ok()?;
        None
    }

    async fn handle_client_envelope(&self, sender: Uuid, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::Message { to, payload } => {
                self.state.metrics.mark_ingress();
                let relay = ServerEnvelope::Message {
                    from: sender,
                    payload,
                    timestamp: Utc::now().timestamp(),
                };
                if self.state.hub.send_to(to, relay).await {
                    self.state.metrics.mark_relayed();
                } else {
                    // Recipient offline or evicted; end-to-end recovery is
                    // the clients' concern.
                    self.state.metrics.mark_dropped();
                    debug!(from = %sender, to = %to, "envelope dropped");
                }
            }
            ClientEnvelope::Ping => {
                self.state.metrics.mark_ingress();
                if !self.state.hub.send_to(sender, ServerEnvelope::Pong).await {
                    debug!(user = %sender, "pong not deliverable");
                }
            }
            ClientEnvelope::Unknown => {
                debug!(user = %sender, "unknown frame type ignored");
            }
        }
    }

    async fn write_envelope(
        &self,
        session: &mut ServerSession,
        envelope: &ServerEnvelope,
    ) -> Result<(), ServerError> {
        let encoded = envelope.encode().map_err(|_| ServerError::Codec)?;
        session
            .write_response_body(encoded.into(), false)
            .await
            .map_err(|_| ServerError::Io)?;
        self.state.metrics.mark_egress();
        Ok(())
    }
}

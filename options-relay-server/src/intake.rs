use options_relay::{
    AnalysisQueue, SessionManager, SignalRequest,
    analysis::queue::SubmitResponse,
    market_hours::{Clock, MarketSession},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, info, warn};

/// Newline delimited JSON entry point for external producers.
///
/// Each line is either a trade signal, answered with a [`SubmitResponse`], or an entry timing
/// snapshot (`{"type":"entry_timing","timing":{..}}`) relayed to every authenticated session.
#[derive(Clone)]
pub struct SignalIntake {
    queue: AnalysisQueue,
    manager: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
}

impl SignalIntake {
    pub fn new(queue: AnalysisQueue, manager: Arc<SessionManager>, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue,
            manager,
            clock,
        }
    }

    /// Accept producer connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) {
        while let Ok((stream, peer_addr)) = listener.accept().await {
            info!(%peer_addr, "signal producer connected");
            let intake = self.clone();
            tokio::spawn(async move {
                if let Err(error) = intake.handle_producer(stream).await {
                    warn!(%peer_addr, %error, "signal producer connection error");
                }
                info!(%peer_addr, "signal producer disconnected");
            });
        }
    }

    async fn handle_producer(&self, stream: TcpStream) -> std::io::Result<()> {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let mut reply = self.handle_line(&line).to_string();
            reply.push('\n');
            write.write_all(reply.as_bytes()).await?;
        }

        Ok(())
    }

    /// Process one producer line and build its reply.
    pub fn handle_line(&self, line: &str) -> Value {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            return reply(SubmitResponse::rejected("Invalid JSON"));
        };

        if value.get("type").and_then(Value::as_str) == Some("entry_timing") {
            let timing = value.get("timing").cloned().unwrap_or(Value::Null);
            let recipients = self.manager.publish_entry_timing(timing);
            debug!(recipients, "entry timing relayed");
            return json!({ "success": true, "recipients": recipients });
        }

        reply(self.submit_signal(value))
    }

    fn submit_signal(&self, value: Value) -> SubmitResponse {
        let request = match serde_json::from_value::<SignalRequest>(value) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "rejected malformed signal");
                return SubmitResponse::rejected("Invalid signal format");
            }
        };

        let now = self.clock.now();
        let signal = match request.into_signal(now) {
            Ok(signal) => signal,
            Err(error) => return SubmitResponse::rejected(error.to_string()),
        };

        info!(
            contract = %signal.key(),
            session = MarketSession::at(now).label(),
            "signal received"
        );
        SubmitResponse::from(self.queue.submit(signal))
    }
}

fn reply(response: SubmitResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|_| json!({ "success": false }))
}

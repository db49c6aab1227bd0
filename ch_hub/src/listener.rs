//! ABOUTME: Newline-delimited JSON TCP listener for worker sessions
//! ABOUTME: Turns each connection into a hub session and routes client events

use ch_core::{Error, Id, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{ClientAction, ClientEvent, RegisterWorkerData, TaskUpdateData};
use crate::session::ChannelSession;
use crate::{TaskUpdateSink, WorkerHub};

/// Outbound queue depth per session; a worker that stops reading loses its
/// session rather than stalling broadcasts.
const SESSION_QUEUE: usize = 64;

/// Accept worker connections until cancelled
pub async fn serve(
    bind: &str,
    hub: Arc<WorkerHub>,
    sink: Arc<dyn TaskUpdateSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind worker listener on {}: {}", bind, e)))?;
    info!(bind, "Worker listener started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Worker listener stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Worker connection accepted");
                        let hub = hub.clone();
                        let sink = sink.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, hub, sink, cancel).await {
                                debug!(error = %e, "Worker connection closed with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<WorkerHub>,
    sink: Arc<dyn TaskUpdateSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let client_id = Id::new().to_string();
    let (session, mut outbound) = ChannelSession::new(client_id.clone(), SESSION_QUEUE);
    hub.add(Arc::new(session)).await;

    let framed = Framed::new(stream, LinesCodec::new());
    let (mut writer, mut reader) = framed.split();

    // Writer half: drain the session queue onto the wire
    let writer_client = client_id.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    warn!(client_id = %writer_client, error = %e, "Failed to encode event");
                    continue;
                }
            };
            if writer.send(line).await.is_err() {
                break;
            }
        }
    });

    // Reader half: client events in arrival order
    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            line = reader.next() => {
                match line {
                    Some(Ok(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Err(e) = handle_client_event(&client_id, &line, &hub, &sink).await {
                            // Malformed or failing events never kill the session
                            warn!(client_id = %client_id, error = %e, "Client event rejected");
                        }
                    }
                    Some(Err(e)) => break Err(Error::WorkerUnreachable(e.to_string())),
                    None => break Ok(()),
                }
            }
        }
    };

    hub.remove(&client_id).await;
    writer_task.abort();
    result
}

async fn handle_client_event(
    client_id: &str,
    line: &str,
    hub: &Arc<WorkerHub>,
    sink: &Arc<dyn TaskUpdateSink>,
) -> Result<()> {
    let event: ClientEvent = serde_json::from_str(line)
        .map_err(|e| Error::BadRequest(format!("Invalid client event: {}", e)))?;

    match event.action {
        ClientAction::Ping => {
            if event.worker_id.is_empty() {
                return Err(Error::BadRequest("ping without worker_id".to_string()));
            }
            hub.touch_worker(&event.worker_id).await
        }
        ClientAction::RegistWorker => {
            let data: RegisterWorkerData = serde_json::from_value(event.data)
                .map_err(|e| Error::BadRequest(format!("Invalid registration: {}", e)))?;
            hub.register_worker(client_id, data).await
        }
        ClientAction::TaskUpdate => {
            if event.task_id.is_empty() {
                return Err(Error::BadRequest("task_update without task_id".to_string()));
            }
            let data: TaskUpdateData = serde_json::from_value(event.data)
                .map_err(|e| Error::BadRequest(format!("Invalid task update: {}", e)))?;
            sink.apply(&event.worker_id, &event.task_id, data).await
        }
    }
}

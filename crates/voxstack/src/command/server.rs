use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::xml::{format_response, take_request, XmlRequest};
use super::{Command, CommandHandler, CommandResponse};
use crate::stack::StackHandle;

const READ_CHUNK: usize = 4096;

pub struct CommandServer {
    listener: TcpListener,
    stack: StackHandle,
    handler: Option<Arc<dyn CommandHandler>>,
    cancel: CancellationToken,
}

impl CommandServer {
    pub async fn bind(addr: &str, stack: StackHandle) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding command server to {}", addr))?;
        info!("command server listening on {}", listener.local_addr()?);
        Ok(CommandServer {
            listener,
            stack,
            handler: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Cancelled once a `Shutdown` command has been answered; cancelling it
    /// stops the server
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accepts connections until the cancel token fires
    pub async fn serve(self) -> anyhow::Result<()> {
        let shared = Arc::new(Dispatcher {
            stack: self.stack,
            handler: self.handler,
            cancel: self.cancel.clone(),
        });
        loop {
            let (stream, peer) = select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept command connection: {}", e);
                        continue;
                    }
                },
            };
            debug!(%peer, "command connection opened");
            let dispatcher = shared.clone();
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                select! {
                    _ = cancel.cancelled() => {}
                    result = dispatcher.serve_connection(stream) => {
                        if let Err(e) = result {
                            debug!(%peer, "command connection ended: {:#}", e);
                        }
                    }
                }
                debug!(%peer, "command connection closed");
            });
        }
        info!("command server stopped");
        Ok(())
    }
}

struct Dispatcher {
    stack: StackHandle,
    handler: Option<Arc<dyn CommandHandler>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn serve_connection(&self, mut stream: TcpStream) -> anyhow::Result<()> {
        let mut pending = String::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut next_id: u32 = 1;
        loop {
            let n = stream.read(&mut chunk).await.context("reading command")?;
            if n == 0 {
                return Ok(());
            }
            pending.push_str(&String::from_utf8_lossy(&chunk[..n]));

            loop {
                let mut stop = false;
                let out = match take_request(&mut pending) {
                    Ok(Some(request)) => {
                        let id = request.request_id().unwrap_or(next_id);
                        next_id = id.wrapping_add(1);
                        let response = self.dispatch(&request);
                        stop = request.is("Shutdown") && response.code == 200;
                        format_response(
                            &request.tag,
                            id,
                            response.code,
                            &response.text,
                            &response.data,
                        )
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("bad command framing: {}", e);
                        let id = next_id;
                        next_id = next_id.wrapping_add(1);
                        format_response("Error", id, 400, "Parse error", "")
                    }
                };
                stream
                    .write_all(out.as_bytes())
                    .await
                    .context("writing command response")?;
                if stop {
                    stream.flush().await.ok();
                    self.cancel.cancel();
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&self, request: &XmlRequest) -> CommandResponse {
        let command = match Command::parse(request) {
            Ok(command) => command,
            Err(response) => {
                info!(tag = %request.tag, "rejected command: {}", response.text);
                return response;
            }
        };
        info!(tag = %request.tag, "command received");

        match command {
            Command::GetStackInfo => {
                CommandResponse::ok("Stack info retrieved.").with_data(self.stack.stack_info())
            }
            Command::GetCongestionStats => CommandResponse::ok("Congestion stats retrieved.")
                .with_data(self.stack.congestion_state()),
            Command::SetCongestionTolerance {
                fifo,
                metric,
                max_tolerance,
            } => {
                self.stack.set_congestion_tolerance(&fifo, metric, max_tolerance);
                CommandResponse::ok("Congestion Tolerance set.")
            }
            Command::Shutdown => match self.stack.shutdown() {
                Ok(()) => CommandResponse::ok("Shutdown initiated."),
                Err(e) => CommandResponse::error(500, format!("Shutdown failed: {}", e)),
            },
            Command::ClickToCall => match &self.handler {
                Some(handler) => handler.click_to_call(request, &self.stack),
                None => no_handler(request),
            },
            Command::InitialSync => match &self.handler {
                Some(handler) => handler.initial_sync(request, &self.stack),
                None => no_handler(request),
            },
        }
    }
}

fn no_handler(request: &XmlRequest) -> CommandResponse {
    CommandResponse::error(400, format!("No handler registered for {}.", request.tag))
}

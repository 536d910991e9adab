use super::Relay;
use crate::config::UdpRelayConfig;
use crate::parsing::lineproto::{self, Precision};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_UDP_MTU: usize = 1024;
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// A relay for line protocol datagrams: every packet is parsed and fanned
/// out to all UDP backends, without buffering or retry.
pub struct UdpRelay {
    name: String,
    bind_addr: String,
    precision: Precision,
    read_buffer: usize,
    outputs: Vec<UdpBackend>,
    closing: AtomicBool,
    cancel: CancellationToken,
}

struct UdpBackend {
    name: String,
    location: String,
    mtu: usize,
}

impl UdpRelay {
    pub fn new(cfg: &UdpRelayConfig) -> Result<UdpRelay> {
        let name = match &cfg.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("udp://{}", cfg.bind_addr),
        };

        let precision = Precision::from_query(cfg.precision.as_deref());

        let outputs = cfg
            .outputs
            .iter()
            .map(|output| UdpBackend {
                name: output
                    .name
                    .clone()
                    .unwrap_or_else(|| output.location.clone()),
                location: output.location.clone(),
                mtu: if output.mtu > 0 {
                    output.mtu
                } else {
                    DEFAULT_UDP_MTU
                },
            })
            .collect();

        Ok(UdpRelay {
            name,
            bind_addr: cfg.bind_addr.clone(),
            precision,
            read_buffer: if cfg.read_buffer > 0 {
                cfg.read_buffer
            } else {
                RECV_BUFFER_SIZE
            },
            outputs,
            closing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    async fn forward(&self, socket: &UdpSocket, datagram: &[u8]) {
        let Ok(text) = std::str::from_utf8(datagram) else {
            warn!(relay = %self.name, "dropping non UTF-8 datagram");
            return;
        };

        let points = match lineproto::parse_points(text) {
            Ok(points) => points,
            Err(err) => {
                warn!(relay = %self.name, error = %err, "unable to parse points");
                return;
            }
        };
        if points.is_empty() {
            return;
        }

        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as i64)
            .unwrap_or_default();

        let mut lines = Vec::with_capacity(points.len());
        for point in &points {
            let mut line = String::new();
            lineproto::write_points(
                std::slice::from_ref(point),
                self.precision,
                now_nanos,
                &mut line,
            );
            lines.push(line);
        }

        for output in &self.outputs {
            // Pack as many whole lines per packet as the backend MTU allows.
            let mut packet = String::new();
            for line in &lines {
                if !packet.is_empty() && packet.len() + line.len() > output.mtu {
                    self.send(socket, output, &packet).await;
                    packet.clear();
                }
                packet.push_str(line);
            }
            if !packet.is_empty() {
                self.send(socket, output, &packet).await;
            }
        }
    }

    async fn send(&self, socket: &UdpSocket, output: &UdpBackend, packet: &str) {
        if let Err(err) = socket.send_to(packet.as_bytes(), &output.location).await {
            warn!(
                relay = %self.name,
                backend = %output.name,
                error = %err,
                "problem sending datagram to backend"
            );
        }
    }
}

#[async_trait]
impl Relay for UdpRelay {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(&self) -> Result<()> {
        let socket = UdpSocket::bind(&self.bind_addr)
            .await
            .with_context(|| format!("could not bind {}", self.bind_addr))?;
        let out_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("could not bind outbound socket")?;

        debug!(relay = %self.name, addr = %self.bind_addr, "starting relay");

        let mut buf = vec![0u8; self.read_buffer];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                received = socket.recv_from(&mut buf) => match received {
                    Ok((len, _)) => self.forward(&out_socket, &buf[..len]).await,
                    Err(err) => {
                        if self.closing.load(Ordering::Acquire) {
                            return Ok(());
                        }
                        warn!(relay = %self.name, error = %err, "problem reading datagram");
                    }
                },
            }
        }
    }

    fn stop(&self) {
        self.closing.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

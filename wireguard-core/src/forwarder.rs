//! Bidirectional tun/UDP packet forwarding, realized as `tokio::select!`
//! arms inside a single spawned task (specification §5's concrete runtime
//! binding): the tun reader, the UDP reader, and the timer all suspend on
//! the same task rather than racing across separately spawned ones.
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant as TokioInstant;
use tracing::{trace, warn};
use wireguard_types::{DataHeader, MSG_COOKIE, MSG_DATA, MSG_FIRST, MSG_SECOND};
use zerocopy::{AsBytes, FromBytes};

use crate::error::CoreError;
use crate::peer::Peer;
use crate::stats::{Stats, TunnelState};

/// The platform collaborator the forwarder reads packets from and writes
/// decrypted packets to. A real tun device and an in-memory duplex pipe
/// (for tests) both satisfy this.
pub trait TunIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> TunIo for T {}

const MAX_PACKET: usize = 2048;

/// Runs until `shutdown` fires. `socket` must already be connected to the
/// peer's endpoint (single-peer topology, specification §1's non-goal of
/// multi-peer routing), so sends/receives never need to carry an address.
pub async fn run<T: TunIo>(
    peer: Arc<Mutex<Peer>>,
    mut tun: T,
    socket: Arc<UdpSocket>,
    stats: Arc<Stats>,
    state_tx: watch::Sender<TunnelState>,
    mut shutdown: watch::Receiver<()>,
) {
    let mut tun_buf = vec![0u8; MAX_PACKET];
    let mut udp_buf = vec![0u8; MAX_PACKET];

    loop {
        let deadline = peer.lock().await.timers.next_deadline();
        let timer = sleep_until_opt(deadline);

        tokio::select! {
            _ = shutdown.changed() => {
                trace!("forwarder shutting down");
                break;
            }
            _ = timer => {
                let mut guard = peer.lock().await;
                let result = guard.on_timer_tick(&stats);
                let state = guard.state().clone();
                drop(guard);
                let _ = state_tx.send(state);

                match result {
                    Ok(Some(bytes)) => send_or_log(&socket, &bytes).await,
                    Ok(None) => {}
                    Err(err) => warn!(%err, "peer timer tick failed"),
                }
            }
            result = tun.read(&mut tun_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => handle_outbound(&peer, &socket, &stats, &state_tx, &tun_buf[..n]).await,
                    Err(err) => warn!(%err, "tun read failed"),
                }
            }
            result = socket.recv(&mut udp_buf) => {
                match result {
                    Ok(n) => handle_inbound(&peer, &socket, &mut tun, &stats, &state_tx, &mut udp_buf[..n]).await,
                    Err(err) => warn!(%err, "udp recv failed"),
                }
            }
        }
    }

    let mut guard = peer.lock().await;
    guard.retire();
    let _ = tun.shutdown().await;
}

async fn sleep_until_opt(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(instant) => tokio::time::sleep_until(TokioInstant::from_std(instant)).await,
        None => std::future::pending().await,
    }
}

async fn send_or_log(socket: &UdpSocket, bytes: &[u8]) {
    if let Err(err) = socket.send(bytes).await {
        warn!(%err, "udp send failed");
    }
}

async fn handle_outbound(peer: &Arc<Mutex<Peer>>, socket: &UdpSocket, stats: &Arc<Stats>, state_tx: &watch::Sender<TunnelState>, packet: &[u8]) {
    if !destination_allowed(peer, packet).await {
        stats.record_tx_dropped();
        return;
    }

    let mut guard = peer.lock().await;
    let outcome = guard.encrypt_outbound(packet, stats);
    let state = guard.state().clone();
    drop(guard);
    let _ = state_tx.send(state);

    match outcome {
        Ok(Some((header, tag, mut ciphertext))) => {
            let mut datagram = Vec::with_capacity(DataHeader::LEN + ciphertext.len() + 16);
            datagram.extend_from_slice(header.as_bytes());
            datagram.append(&mut ciphertext);
            datagram.extend_from_slice(&tag.0);
            send_or_log(socket, &datagram).await;
        }
        Ok(None) => {
            // No session yet; a handshake was started (or one is already
            // in flight) and this packet is dropped rather than queued.
            stats.record_tx_dropped();
        }
        Err(err) => {
            warn!(%err, "failed to encrypt outbound packet");
            stats.record_tx_dropped();
        }
    }
}

async fn destination_allowed(peer: &Arc<Mutex<Peer>>, packet: &[u8]) -> bool {
    let Some(dest) = ip_destination(packet) else {
        return false;
    };
    peer.lock().await.is_addr_allowed(dest)
}

fn ip_destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::from(<[u8; 4]>::try_from(&packet[16..20]).ok()?)),
        6 if packet.len() >= 40 => Some(IpAddr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?)),
        _ => None,
    }
}

fn ip_source(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => Some(IpAddr::from(<[u8; 4]>::try_from(&packet[12..16]).ok()?)),
        6 if packet.len() >= 40 => Some(IpAddr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?)),
        _ => None,
    }
}

async fn handle_inbound<T: TunIo>(
    peer: &Arc<Mutex<Peer>>,
    socket: &UdpSocket,
    tun: &mut T,
    stats: &Arc<Stats>,
    state_tx: &watch::Sender<TunnelState>,
    datagram: &mut [u8],
) {
    stats.record_rx(datagram.len());

    let Some(msg_type) = datagram.get(0..4).map(|b| u32::from_le_bytes(b.try_into().unwrap())) else {
        return;
    };

    let mut guard = peer.lock().await;
    let result = match msg_type {
        MSG_FIRST => guard.handle_initiation(datagram, stats).map(|r| r.map(Outcome::Reply)),
        MSG_SECOND => guard.handle_response(datagram).map(|()| None),
        MSG_COOKIE => guard.handle_cookie_reply(datagram).map(|()| None),
        MSG_DATA => handle_data_message(&mut *guard, datagram).map(|r| r.map(Outcome::ToTun)),
        _ => Ok(None),
    };
    let state = guard.state().clone();
    drop(guard);
    let _ = state_tx.send(state);

    match result {
        Ok(Some(Outcome::Reply(bytes))) => send_or_log(socket, &bytes).await,
        Ok(Some(Outcome::ToTun(packet))) => {
            if !packet.is_empty() && packet_endpoints_allowed(peer, &packet).await {
                if let Err(err) = tun.write_all(&packet).await {
                    warn!(%err, "tun write failed");
                }
            }
        }
        Ok(None) => {}
        Err(err) => {
            warn!(%err, "failed to process inbound datagram");
            stats.record_rx_dropped();
            let _ = state_tx.send(TunnelState::from_error(&err));
        }
    }
}

enum Outcome {
    Reply(Vec<u8>),
    ToTun(Vec<u8>),
}

fn handle_data_message(peer: &mut Peer, datagram: &mut [u8]) -> Result<Option<Vec<u8>>, CoreError> {
    if datagram.len() < DataHeader::LEN + 16 {
        return Ok(None);
    }
    let (header_bytes, rest) = datagram.split_at_mut(DataHeader::LEN);
    let header = DataHeader::ref_from(header_bytes).ok_or(wireguard_crypto::CryptoError::AeadTagMismatch)?;
    let receiver = header.receiver.get();
    let counter = header.counter.get();

    let (ciphertext, tag_bytes) = rest.split_at_mut(rest.len() - 16);
    let tag = wireguard_crypto::Tag(<[u8; 16]>::try_from(&*tag_bytes).expect("checked length above"));

    let packet = peer.handle_data(receiver, counter, ciphertext, &tag)?;
    Ok(Some(packet))
}

async fn packet_endpoints_allowed(peer: &Arc<Mutex<Peer>>, packet: &[u8]) -> bool {
    let guard = peer.lock().await;
    let src_ok = ip_source(packet).map_or(true, |addr| guard.is_addr_allowed(addr));
    let dst_ok = ip_destination(packet).map_or(true, |addr| guard.is_addr_allowed(addr));
    src_ok && dst_ok
}

//! Tor link protocol over the bridge duplex
//!
//! One `TorLink` owns the bridge connection. It performs the link handshake
//! (VERSIONS → CERTS → AUTH_CHALLENGE → NETINFO), then spawns a reader task
//! that demultiplexes inbound cells to circuits by ID and a writer task that
//! serializes the outbound cell queue.
//!
//! Circuits never own the link: each circuit carries a [`CellSender`] handle
//! to the outbound queue, and the link's table maps circuit IDs to inbound
//! queues. Dropping a circuit removes its table entry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::StreamExt;
use rand::Rng;

use super::cell::{Cell, CellCommand, CELL_LEN, PAYLOAD_LEN};
use super::certs::{validate_certs, CertsCell, LinkIdentity};
use crate::error::{Result, TorError};
use crate::runtime;
use crate::transport::BridgeStream;

/// Originator-side circuit IDs always have the MSB set.
const CIRCUIT_ID_MSB: u32 = 0x8000_0000;

/// The only link protocol version we speak.
const LINK_VERSION: u16 = 5;

pub type CircuitId = u32;

/// Event delivered to a circuit's inbound queue.
#[derive(Debug)]
pub enum LinkEvent {
    Cell(Cell),
    /// The link died; every circuit over it is dead too.
    Closed(TorError),
}

/// Handle to the link's outbound cell queue.
#[derive(Clone)]
pub struct CellSender {
    tx: mpsc::UnboundedSender<Cell>,
}

impl CellSender {
    pub fn send(&self, cell: Cell) -> Result<()> {
        self.tx
            .unbounded_send(cell)
            .map_err(|_| TorError::PeerDisconnected)
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests(tx: mpsc::UnboundedSender<Cell>) -> Self {
        Self { tx }
    }
}

/// Link handshake states (tor-spec §4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Initial,
    Versioned,
    Handshaking,
    Handshaked,
}

struct LinkShared {
    circuits: RefCell<HashMap<CircuitId, mpsc::UnboundedSender<LinkEvent>>>,
    outbound: RefCell<Option<mpsc::UnboundedSender<Cell>>>,
    closed: RefCell<Option<TorError>>,
    close_listeners: RefCell<Vec<Box<dyn Fn(&TorError)>>>,
}

impl LinkShared {
    fn close(&self, error: TorError) {
        if self.closed.borrow().is_some() {
            return;
        }
        log::warn!("link closed: {}", error);
        *self.closed.borrow_mut() = Some(error.clone());

        // Stop the writer by dropping its queue, then fail every circuit.
        self.outbound.borrow_mut().take();
        for (_, queue) in self.circuits.borrow_mut().drain() {
            let _ = queue.unbounded_send(LinkEvent::Closed(error.clone()));
        }
        for listener in self.close_listeners.borrow().iter() {
            listener(&error);
        }
    }
}

/// One Tor link over one bridge connection.
pub struct TorLink {
    shared: Rc<LinkShared>,
    identity: LinkIdentity,
}

impl TorLink {
    /// Run the link handshake over the bridge and start the reader/writer
    /// tasks. The handshake must reach `Handshaked` within `timeout_ms`.
    pub async fn open(bridge: BridgeStream, timeout_ms: u32) -> Result<Rc<TorLink>> {
        let mut bridge = bridge;
        let identity =
            runtime::with_deadline("link handshake", timeout_ms, handshake(&mut bridge)).await?;

        log::info!(
            "link handshake complete, bridge identity {}",
            hex::encode(identity.rsa_identity)
        );

        let (outbound_tx, outbound_rx) = mpsc::unbounded::<Cell>();
        let shared = Rc::new(LinkShared {
            circuits: RefCell::new(HashMap::new()),
            outbound: RefCell::new(Some(outbound_tx)),
            closed: RefCell::new(None),
            close_listeners: RefCell::new(Vec::new()),
        });

        let (read_half, write_half) = bridge.split();
        spawn_writer(write_half, outbound_rx);
        spawn_reader(read_half, Rc::clone(&shared));

        Ok(Rc::new(TorLink { shared, identity }))
    }

    /// Identity of the bridge, as validated from its CERTS cell.
    pub fn identity(&self) -> &LinkIdentity {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Register a callback invoked once when the link dies.
    pub fn on_close(&self, listener: impl Fn(&TorError) + 'static) {
        if let Some(err) = self.shared.closed.borrow().as_ref() {
            listener(err);
            return;
        }
        self.shared
            .close_listeners
            .borrow_mut()
            .push(Box::new(listener));
    }

    /// Allocate a circuit ID and register its inbound queue.
    ///
    /// IDs are uniformly random with the high bit forced (originator side);
    /// zero and collisions are rejected and re-drawn.
    pub fn register_circuit(
        &self,
    ) -> Result<(CircuitId, CellSender, mpsc::UnboundedReceiver<LinkEvent>)> {
        if let Some(err) = self.shared.closed.borrow().as_ref() {
            return Err(err.clone());
        }

        let mut circuits = self.shared.circuits.borrow_mut();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate = rng.gen::<u32>() | CIRCUIT_ID_MSB;
            if candidate != 0 && !circuits.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = mpsc::unbounded();
        circuits.insert(id, tx);

        let sender = CellSender {
            tx: self
                .shared
                .outbound
                .borrow()
                .as_ref()
                .ok_or(TorError::PeerDisconnected)?
                .clone(),
        };
        Ok((id, sender, rx))
    }

    /// Remove a circuit's table entry. Idempotent.
    pub fn unregister_circuit(&self, id: CircuitId) {
        self.shared.circuits.borrow_mut().remove(&id);
    }

    /// Tear the link down, failing every registered circuit.
    pub fn close(&self) {
        self.shared.close(TorError::TransportClosed {
            reason: "closed by client".into(),
        });
    }
}

fn spawn_writer(
    mut write_half: futures::io::WriteHalf<BridgeStream>,
    mut outbound: mpsc::UnboundedReceiver<Cell>,
) {
    runtime::spawn(async move {
        while let Some(cell) = outbound.next().await {
            let bytes = cell.to_bytes();
            if let Err(e) = write_half.write_all(&bytes).await {
                log::warn!("link write failed: {}", e);
                break;
            }
            if let Err(e) = write_half.flush().await {
                log::warn!("link flush failed: {}", e);
                break;
            }
        }
        log::debug!("link writer task exiting");
    });
}

fn spawn_reader(mut read_half: futures::io::ReadHalf<BridgeStream>, shared: Rc<LinkShared>) {
    runtime::spawn(async move {
        loop {
            let cell = match read_cell(&mut read_half).await {
                Ok(cell) => cell,
                Err(e) => {
                    shared.close(e);
                    break;
                }
            };

            if cell.circuit_id == 0 {
                match cell.command {
                    CellCommand::Padding | CellCommand::Vpadding => continue,
                    other => {
                        shared.close(TorError::LinkProtocol(format!(
                            "unexpected circuitless cell {:?} after handshake",
                            other
                        )));
                        break;
                    }
                }
            }

            let circuits = shared.circuits.borrow();
            match circuits.get(&cell.circuit_id) {
                Some(queue) => {
                    let _ = queue.unbounded_send(LinkEvent::Cell(cell));
                }
                None => {
                    log::warn!("dropping cell for unknown circuit {:#010x}", cell.circuit_id);
                }
            }
        }
        log::debug!("link reader task exiting");
    });
}

/// Read one post-negotiation cell (4-byte circuit ID framing).
async fn read_cell<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Cell> {
    let mut header = [0u8; 5];
    read_exact_or_disconnect(stream, &mut header).await?;

    let circuit_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let command = CellCommand::from_u8(header[4])
        .ok_or_else(|| TorError::LinkProtocol(format!("unknown cell command {}", header[4])))?;

    let payload = if command.is_variable() {
        let mut len_bytes = [0u8; 2];
        read_exact_or_disconnect(stream, &mut len_bytes).await?;
        let len = u16::from_be_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        read_exact_or_disconnect(stream, &mut payload).await?;
        payload
    } else {
        let mut payload = vec![0u8; PAYLOAD_LEN];
        read_exact_or_disconnect(stream, &mut payload).await?;
        payload
    };

    Ok(Cell::new(circuit_id, command, payload))
}

async fn read_exact_or_disconnect<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<()> {
    stream.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TorError::PeerDisconnected
        } else {
            TorError::TransportClosed {
                reason: e.to_string(),
            }
        }
    })
}

/// Run the client side of the link handshake.
///
/// Offers link protocol version 5 only; the bridge must agree. The cell
/// sequence is fixed, and any out-of-order cell is a protocol error.
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<LinkIdentity>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut state = LinkState::Initial;
    log::debug!("link state → {:?}", state);

    // VERSIONS goes out with the legacy 2-byte circuit ID framing.
    let versions = Cell::versions_to_legacy_bytes(&[LINK_VERSION]);
    stream
        .write_all(&versions)
        .await
        .map_err(|e| TorError::TransportClosed { reason: e.to_string() })?;
    stream
        .flush()
        .await
        .map_err(|e| TorError::TransportClosed { reason: e.to_string() })?;
    state = LinkState::Versioned;
    log::debug!("link state → {:?}", state);

    // The bridge's VERSIONS response also uses the legacy framing.
    let mut header = [0u8; 5];
    read_exact_or_disconnect(stream, &mut header).await?;
    if header[2] != CellCommand::Versions as u8 {
        return Err(TorError::LinkProtocol(format!(
            "expected VERSIONS, got command {}",
            header[2]
        )));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    read_exact_or_disconnect(stream, &mut payload).await?;

    let offered: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    if !offered.contains(&LINK_VERSION) {
        return Err(TorError::InvalidVersion(format!(
            "bridge offers {:?}, need {}",
            offered, LINK_VERSION
        )));
    }
    log::debug!("negotiated link protocol v{}", LINK_VERSION);

    // From here on, 4-byte circuit IDs.
    let mut identity = None;
    while state != LinkState::Handshaked {
        let cell = read_cell(stream).await?;
        if cell.circuit_id != 0 {
            return Err(TorError::LinkProtocol(
                "circuit-bearing cell during handshake".into(),
            ));
        }

        match (state, cell.command) {
            (LinkState::Versioned, CellCommand::Certs) => {
                let certs = CertsCell::parse(&cell.payload)?;
                identity = Some(validate_certs(&certs)?);
                state = LinkState::Handshaking;
                log::debug!("link state → {:?}", state);
            }
            (LinkState::Handshaking, CellCommand::AuthChallenge) => {
                // We never authenticate as a relay; the challenge is ignored.
            }
            (LinkState::Handshaking, CellCommand::Netinfo) => {
                send_netinfo(stream).await?;
                send_padding_negotiate_stop(stream).await?;
                state = LinkState::Handshaked;
                log::debug!("link state → {:?}", state);
            }
            (_, command) => {
                return Err(TorError::LinkProtocol(format!(
                    "unexpected {:?} in state {:?}",
                    command, state
                )));
            }
        }
    }

    identity.ok_or_else(|| TorError::LinkProtocol("handshake finished without CERTS".into()))
}

async fn send_netinfo<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    let mut payload = Vec::with_capacity(16);
    let timestamp = (runtime::now_ms() / 1000) as u32;
    payload.extend_from_slice(&timestamp.to_be_bytes());
    // Other address: IPv4, unknown
    payload.extend_from_slice(&[0x04, 4, 0, 0, 0, 0]);
    // One of ours, equally unknown behind the pluggable transport
    payload.push(1);
    payload.extend_from_slice(&[0x04, 4, 0, 0, 0, 0]);

    let cell = Cell::new(0, CellCommand::Netinfo, payload);
    write_cell(stream, &cell).await
}

async fn send_padding_negotiate_stop<S: AsyncWrite + Unpin>(stream: &mut S) -> Result<()> {
    // version 0, command STOP, timeouts zeroed
    let payload = vec![0, 1, 0, 0, 0, 0];
    let cell = Cell::new(0, CellCommand::PaddingNegotiate, payload);
    write_cell(stream, &cell).await
}

async fn write_cell<S: AsyncWrite + Unpin>(stream: &mut S, cell: &Cell) -> Result<()> {
    let bytes = cell.to_bytes();
    debug_assert!(cell.command.is_variable() || bytes.len() == CELL_LEN);
    stream
        .write_all(&bytes)
        .await
        .map_err(|e| TorError::TransportClosed { reason: e.to_string() })?;
    stream
        .flush()
        .await
        .map_err(|e| TorError::TransportClosed { reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use sha1::{Digest as _, Sha1};
    use std::io::Result as IoResult;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Duplex with a scripted inbound side, recording everything written.
    struct ScriptedDuplex {
        inbound: Vec<u8>,
        position: usize,
        outbound: Vec<u8>,
    }

    impl ScriptedDuplex {
        fn new(inbound: Vec<u8>) -> Self {
            Self {
                inbound,
                position: 0,
                outbound: Vec::new(),
            }
        }
    }

    impl AsyncRead for ScriptedDuplex {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<IoResult<usize>> {
            let remaining = &self.inbound[self.position..];
            let n = buf.len().min(remaining.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            self.position += n;
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for ScriptedDuplex {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<IoResult<usize>> {
            self.outbound.extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn der(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        match body.len() {
            n if n < 0x80 => out.push(n as u8),
            n if n <= 0xff => {
                out.push(0x81);
                out.push(n as u8);
            }
            n => {
                out.push(0x82);
                out.extend_from_slice(&(n as u16).to_be_bytes());
            }
        }
        out.extend_from_slice(body);
        out
    }

    /// Minimal X.509 shell around an RSA public key blob.
    fn fake_rsa_cert(rsa_key: &[u8]) -> Vec<u8> {
        let mut bit_string = vec![0u8]; // unused-bits count
        bit_string.extend_from_slice(rsa_key);

        let spki = der(
            0x30,
            &[der(0x30, &der(0x06, &[0x2a])), der(0x03, &bit_string)].concat(),
        );
        let tbs_fields = [
            der(0x02, &[1]),         // serial
            der(0x30, &[]),          // signature alg
            der(0x30, &[]),          // issuer
            der(0x30, &[]),          // validity
            der(0x30, &[]),          // subject
            spki,
        ]
        .concat();
        let tbs = der(0x30, &tbs_fields);
        der(0x30, &tbs)
    }

    fn certs_cell_payload(rsa_cert: &[u8]) -> Vec<u8> {
        let mut payload = vec![1u8];
        payload.push(2); // RSA identity cert type
        payload.extend_from_slice(&(rsa_cert.len() as u16).to_be_bytes());
        payload.extend_from_slice(rsa_cert);
        payload
    }

    fn scripted_handshake_inbound(rsa_key: &[u8]) -> Vec<u8> {
        let mut inbound = Vec::new();

        // VERSIONS reply (legacy framing): versions 4 and 5
        inbound.extend_from_slice(&[0, 0, 7, 0, 4, 0, 4, 0, 5]);

        // CERTS
        let certs = Cell::new(
            0,
            CellCommand::Certs,
            certs_cell_payload(&fake_rsa_cert(rsa_key)),
        );
        inbound.extend_from_slice(&certs.to_bytes());

        // AUTH_CHALLENGE
        let challenge = Cell::new(0, CellCommand::AuthChallenge, vec![0u8; 38]);
        inbound.extend_from_slice(&challenge.to_bytes());

        // NETINFO
        let netinfo = Cell::new(0, CellCommand::Netinfo, vec![0u8; 12]);
        inbound.extend_from_slice(&netinfo.to_bytes());

        inbound
    }

    #[test]
    fn handshake_reaches_handshaked_and_extracts_identity() {
        let rsa_key = [0xabu8; 140];
        let mut duplex = ScriptedDuplex::new(scripted_handshake_inbound(&rsa_key));

        let identity = block_on(handshake(&mut duplex)).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(rsa_key);
        let expected: [u8; 20] = hasher.finalize().into();
        assert_eq!(identity.rsa_identity, expected);

        // Client sent VERSIONS, NETINFO, PADDING_NEGOTIATE
        assert_eq!(duplex.outbound[2], CellCommand::Versions as u8);
        let post_versions = &duplex.outbound[7..];
        assert_eq!(post_versions[4], CellCommand::Netinfo as u8);
        let post_netinfo = &post_versions[CELL_LEN..];
        assert_eq!(post_netinfo[4], CellCommand::PaddingNegotiate as u8);
        // STOP command
        assert_eq!(post_netinfo[6], 1);
    }

    #[test]
    fn handshake_rejects_missing_version_5() {
        // VERSIONS reply offering only v4
        let inbound = vec![0, 0, 7, 0, 2, 0, 4];
        let mut duplex = ScriptedDuplex::new(inbound);

        match block_on(handshake(&mut duplex)) {
            Err(TorError::InvalidVersion(_)) => {}
            other => panic!("expected InvalidVersion, got {:?}", other),
        }
    }

    #[test]
    fn handshake_rejects_out_of_order_cells() {
        let mut inbound = Vec::new();
        inbound.extend_from_slice(&[0, 0, 7, 0, 2, 0, 5]);
        // NETINFO before CERTS
        let netinfo = Cell::new(0, CellCommand::Netinfo, vec![0u8; 12]);
        inbound.extend_from_slice(&netinfo.to_bytes());

        let mut duplex = ScriptedDuplex::new(inbound);
        match block_on(handshake(&mut duplex)) {
            Err(TorError::LinkProtocol(_)) => {}
            other => panic!("expected LinkProtocol, got {:?}", other),
        }
    }

    #[test]
    fn eof_maps_to_peer_disconnected() {
        let mut duplex = ScriptedDuplex::new(vec![0, 0, 7, 0, 2, 0, 5]);
        // Stream ends right after VERSIONS.
        match block_on(handshake(&mut duplex)) {
            Err(TorError::PeerDisconnected) => {}
            other => panic!("expected PeerDisconnected, got {:?}", other),
        }
    }
}

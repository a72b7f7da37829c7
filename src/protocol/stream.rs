//! Streams: byte-oriented substreams inside a circuit
//!
//! A `TorStream` is a handle onto the circuit's per-stream slot. Reads drain
//! the inbound byte queue in cell-arrival order; writes chunk into
//! RELAY_DATA cells of at most 498 bytes and block while either the stream
//! or circuit package window is exhausted.

use std::cell::RefCell;
use std::rc::Rc;
use std::task::Poll;

use futures::future::poll_fn;

use super::cell::MAX_RELAY_DATA;
use super::circuit::{CircuitInner, CircuitState, StreamState};
use crate::error::{Result, TorError};

/// RELAY_END reason used for an orderly local close.
const END_REASON_DONE: u8 = 6;

/// A bidirectional byte stream through a circuit.
pub struct TorStream {
    inner: Rc<RefCell<CircuitInner>>,
    id: u16,
    closed: bool,
}

/// Wait until the relay answers our BEGIN for `stream_id`.
pub(crate) async fn wait_connected(
    inner: &Rc<RefCell<CircuitInner>>,
    stream_id: u16,
) -> Result<()> {
    let inner = Rc::clone(inner);
    poll_fn(move |cx| {
        let mut inner = inner.borrow_mut();
        if inner.state == CircuitState::Destroyed {
            return Poll::Ready(Err(inner.error.clone().unwrap_or(TorError::Closed)));
        }
        let slot = match inner.streams.get_mut(&stream_id) {
            Some(slot) => slot,
            None => return Poll::Ready(Err(TorError::UnknownStream(stream_id))),
        };
        match slot.connect_result {
            Some(Ok(())) => Poll::Ready(Ok(())),
            Some(Err(reason)) => Poll::Ready(Err(TorError::relay_ended(reason))),
            None => {
                slot.connect_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    })
    .await
}

impl TorStream {
    pub(crate) fn new(inner: Rc<RefCell<CircuitInner>>, id: u16) -> Self {
        Self {
            inner,
            id,
            closed: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.id
    }

    /// Read up to `buf.len()` bytes, blocking until data, EOF, or error.
    ///
    /// Returns 0 once the stream ended with reason DONE; other END reasons
    /// surface as `RelayEnded` after the buffered data is drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let inner = Rc::clone(&self.inner);
        let id = self.id;
        poll_fn(move |cx| {
            let mut inner = inner.borrow_mut();

            let circuit_error = inner.error.clone();
            let slot = match inner.streams.get_mut(&id) {
                Some(slot) => slot,
                None => {
                    return Poll::Ready(Err(circuit_error.unwrap_or(TorError::UnknownStream(id))))
                }
            };

            if !slot.incoming.is_empty() {
                let n = buf.len().min(slot.incoming.len());
                for (dst, byte) in buf.iter_mut().zip(slot.incoming.drain(..n)) {
                    *dst = byte;
                }
                return Poll::Ready(Ok(n));
            }

            if slot.state == StreamState::Closed {
                return match slot.end_reason {
                    Some(END_REASON_DONE) => Poll::Ready(Ok(0)),
                    Some(reason) => Poll::Ready(Err(TorError::relay_ended(reason))),
                    // No END seen: the circuit went down under the stream.
                    None => match circuit_error {
                        Some(error) => Poll::Ready(Err(error)),
                        None => Poll::Ready(Ok(0)),
                    },
                };
            }

            slot.read_waker = Some(cx.waker().clone());
            Poll::Pending
        })
        .await
    }

    /// Read until EOF. A transfer error after some data was received is
    /// logged and the partial body returned.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; MAX_RELAY_DATA];
        loop {
            match self.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&buf[..n]),
                Err(e) if !out.is_empty() => {
                    log::warn!("read error after {} bytes: {}", out.len(), e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Write all of `data`, chunked into relay cells, honoring both the
    /// stream and circuit package windows.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TorError::relay_ended(END_REASON_DONE));
        }

        for chunk in data.chunks(MAX_RELAY_DATA) {
            let inner = Rc::clone(&self.inner);
            let id = self.id;
            poll_fn(move |cx| {
                let mut inner = inner.borrow_mut();
                if inner.state == CircuitState::Destroyed {
                    return Poll::Ready(Err(inner.error.clone().unwrap_or(TorError::Closed)));
                }
                match inner.streams.get(&id) {
                    None => return Poll::Ready(Err(TorError::UnknownStream(id))),
                    Some(slot) if slot.state == StreamState::Closed => {
                        let reason = slot.end_reason.unwrap_or(END_REASON_DONE);
                        return Poll::Ready(Err(TorError::relay_ended(reason)));
                    }
                    Some(_) => {}
                }

                if inner.stream_can_send(id) {
                    Poll::Ready(inner.stream_send(id, chunk.to_vec()))
                } else {
                    if let Some(slot) = inner.streams.get_mut(&id) {
                        slot.write_waker = Some(cx.waker().clone());
                    }
                    Poll::Pending
                }
            })
            .await?;
        }
        Ok(())
    }

    /// Send RELAY_END(DONE) and half-close our side. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut inner = self.inner.borrow_mut();
        let _ = inner.stream_send_end(self.id, END_REASON_DONE);
        if let Some(slot) = inner.streams.get_mut(&self.id) {
            if slot.state == StreamState::Open || slot.state == StreamState::Connecting {
                slot.state = StreamState::HalfClosed;
            }
        }
        Ok(())
    }
}

impl Drop for TorStream {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        if !self.closed && inner.state == CircuitState::Open {
            let _ = inner.stream_send_end(self.id, END_REASON_DONE);
        }
        // The slot is only dropped once the handle goes away, so late cells
        // for a closed stream are distinguishable from unknown streams.
        inner.streams.remove(&self.id);
    }
}

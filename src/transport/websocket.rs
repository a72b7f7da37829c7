//! WebSocket byte-duplex
//!
//! Implements `AsyncRead`/`AsyncWrite` over a browser WebSocket. Incoming
//! frames are buffered and handed to the reader in arrival order; writes are
//! buffered and flushed as binary frames.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::io::{self, Result as IoResult};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use futures::io::{AsyncRead, AsyncWrite};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{BinaryType, ErrorEvent, MessageEvent, WebSocket};

use crate::error::{Result, TorError};
use crate::runtime;

#[derive(Debug, Clone, Copy, PartialEq)]
enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

struct Shared {
    state: SocketState,
    recv_buffer: VecDeque<u8>,
    send_buffer: VecDeque<u8>,
    read_waker: Option<Waker>,
    open_waker: Option<Waker>,
    error: Option<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: SocketState::Connecting,
            recv_buffer: VecDeque::new(),
            send_buffer: VecDeque::new(),
            read_waker: None,
            open_waker: None,
            error: None,
        }
    }

    fn wake_all(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
        if let Some(waker) = self.open_waker.take() {
            waker.wake();
        }
    }
}

/// Reliable byte-duplex to the bridge.
pub struct BridgeStream {
    ws: WebSocket,
    shared: Rc<RefCell<Shared>>,
}

impl BridgeStream {
    /// Open the bridge WebSocket and wait for it to reach OPEN.
    ///
    /// Fails with `TransportConnect` if the socket errors, closes before
    /// opening, or the deadline expires.
    pub async fn connect(url: &str, timeout_ms: u32) -> Result<Self> {
        log::info!("connecting to bridge {}", url);

        let ws = WebSocket::new(url).map_err(|e| TorError::TransportConnect {
            cause: format!("WebSocket creation failed: {:?}", e),
        })?;
        ws.set_binary_type(BinaryType::Arraybuffer);

        let shared = Rc::new(RefCell::new(Shared::new()));
        Self::install_handlers(&ws, &shared);

        let stream = Self { ws, shared };
        runtime::with_deadline("bridge connect", timeout_ms, stream.wait_open()).await?;

        log::info!("bridge connected");
        Ok(stream)
    }

    fn install_handlers(ws: &WebSocket, shared: &Rc<RefCell<Shared>>) {
        {
            let shared = Rc::clone(shared);
            let onopen = Closure::wrap(Box::new(move |_event: JsValue| {
                let mut inner = shared.borrow_mut();
                inner.state = SocketState::Open;
                inner.wake_all();
            }) as Box<dyn FnMut(JsValue)>);
            ws.set_onopen(Some(onopen.as_ref().unchecked_ref()));
            onopen.forget();
        }

        {
            let shared = Rc::clone(shared);
            let onmessage = Closure::wrap(Box::new(move |event: MessageEvent| {
                if let Ok(buffer) = event.data().dyn_into::<js_sys::ArrayBuffer>() {
                    let data = js_sys::Uint8Array::new(&buffer).to_vec();
                    log::trace!("bridge received {} bytes", data.len());

                    let mut inner = shared.borrow_mut();
                    inner.recv_buffer.extend(data);
                    if let Some(waker) = inner.read_waker.take() {
                        waker.wake();
                    }
                }
            }) as Box<dyn FnMut(MessageEvent)>);
            ws.set_onmessage(Some(onmessage.as_ref().unchecked_ref()));
            onmessage.forget();
        }

        {
            let shared = Rc::clone(shared);
            let onerror = Closure::wrap(Box::new(move |event: ErrorEvent| {
                let mut inner = shared.borrow_mut();
                inner.error = Some(format!("WebSocket error: {}", event.message()));
                inner.state = SocketState::Closed;
                inner.wake_all();
            }) as Box<dyn FnMut(ErrorEvent)>);
            ws.set_onerror(Some(onerror.as_ref().unchecked_ref()));
            onerror.forget();
        }

        {
            let shared = Rc::clone(shared);
            let onclose = Closure::wrap(Box::new(move |_event: JsValue| {
                let mut inner = shared.borrow_mut();
                inner.state = SocketState::Closed;
                inner.wake_all();
            }) as Box<dyn FnMut(JsValue)>);
            ws.set_onclose(Some(onclose.as_ref().unchecked_ref()));
            onclose.forget();
        }
    }

    /// Future resolving once the socket is OPEN.
    fn wait_open(&self) -> impl Future<Output = Result<()>> {
        let shared = Rc::clone(&self.shared);
        futures::future::poll_fn(move |cx| {
            let mut inner = shared.borrow_mut();
            if let Some(err) = &inner.error {
                return Poll::Ready(Err(TorError::TransportConnect { cause: err.clone() }));
            }
            match inner.state {
                SocketState::Open => Poll::Ready(Ok(())),
                SocketState::Closing | SocketState::Closed => {
                    Poll::Ready(Err(TorError::TransportConnect {
                        cause: "closed before handshake completed".into(),
                    }))
                }
                SocketState::Connecting => {
                    inner.open_waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        })
    }

    fn flush_send_buffer(&self) -> IoResult<()> {
        let mut inner = self.shared.borrow_mut();

        if inner.send_buffer.is_empty() {
            return Ok(());
        }
        match inner.state {
            SocketState::Open => {}
            SocketState::Connecting => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "not yet open"));
            }
            _ => {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
            }
        }

        let data: Vec<u8> = inner.send_buffer.drain(..).collect();
        drop(inner);

        log::trace!("bridge sending {} bytes", data.len());
        let array = js_sys::Uint8Array::from(&data[..]);
        self.ws
            .send_with_array_buffer(&array.buffer())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("send failed: {:?}", e)))
    }
}

impl AsyncRead for BridgeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let mut inner = self.shared.borrow_mut();

        if let Some(err) = &inner.error {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err.clone())));
        }
        if !inner.recv_buffer.is_empty() {
            let to_read = buf.len().min(inner.recv_buffer.len());
            for (slot, byte) in buf.iter_mut().zip(inner.recv_buffer.drain(..to_read)) {
                *slot = byte;
            }
            return Poll::Ready(Ok(to_read));
        }
        if inner.state == SocketState::Closed {
            return Poll::Ready(Ok(0)); // EOF
        }

        inner.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for BridgeStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<IoResult<usize>> {
        let mut inner = self.shared.borrow_mut();

        if let Some(err) = &inner.error {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err.clone())));
        }
        match inner.state {
            SocketState::Open | SocketState::Connecting => {
                inner.send_buffer.extend(buf);
                Poll::Ready(Ok(buf.len()))
            }
            _ => Poll::Ready(Err(io::Error::new(io::ErrorKind::NotConnected, "closed"))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        match self.flush_send_buffer() {
            Ok(()) => Poll::Ready(Ok(())),
            Err(e) if e.kind() == io::ErrorKind::NotConnected
                && self.shared.borrow().state == SocketState::Connecting =>
            {
                self.shared.borrow_mut().open_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let _ = self.flush_send_buffer();

        let mut inner = self.shared.borrow_mut();
        if inner.state != SocketState::Closed {
            inner.state = SocketState::Closing;
            let _ = self.ws.close();
        }
        Poll::Ready(Ok(()))
    }
}

impl std::fmt::Debug for BridgeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.borrow();
        f.debug_struct("BridgeStream")
            .field("state", &inner.state)
            .field("recv_buffered", &inner.recv_buffer.len())
            .field("send_buffered", &inner.send_buffer.len())
            .finish()
    }
}

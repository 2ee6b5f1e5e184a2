//! Shared loopback servers for integration tests.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const LOOPBACK: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// HTTP/1.1 origin with keep-alive. Routes:
/// - `/plain`: `Content-Length` body `hello`
/// - `/chunked`: chunked body `hello`
/// - `/close`: `hello` then `Connection: close`
pub struct MockOrigin {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl MockOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve_origin(socket));
            }
        });
        Self { addr, accepted }
    }

    /// TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve_origin(socket: TcpStream) {
    let mut reader = BufReader::new(socket);
    loop {
        let mut request_line = String::new();
        match reader.read_line(&mut request_line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) if line == "\r\n" => break,
                Ok(_) => {}
            }
        }

        let path = request_line.split_whitespace().nth(1).unwrap_or("/");
        let (response, close): (&[u8], bool) = match path {
            "/plain" => (b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello", false),
            "/chunked" => (
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
                false,
            ),
            "/close" => (
                b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                true,
            ),
            _ => (b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", false),
        };
        if reader.get_mut().write_all(response).await.is_err() {
            return;
        }
        if close {
            let _ = reader.get_mut().shutdown().await;
            return;
        }
    }
}

/// What the mock proxy does after answering a CONNECT with 200.
#[derive(Clone, Copy)]
pub enum TunnelMode {
    /// Echo tunnel bytes back.
    Echo,
    /// Forward to 127.0.0.1 on the requested port.
    Loopback,
}

/// HTTP CONNECT proxy that records every request head verbatim.
pub struct MockConnectProxy {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockConnectProxy {
    /// `early` is written right after the 200 response head.
    pub async fn start(status: u16, mode: TunnelMode, early: &'static [u8]) -> Self {
        let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_proxy(socket, status, mode, early, log.clone()));
            }
        });
        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_proxy(
    mut socket: TcpStream,
    status: u16,
    mode: TunnelMode,
    early: &'static [u8],
    log: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    // Byte at a time so nothing past the head is consumed.
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        match socket.read(&mut byte).await {
            Ok(1) => head.push(byte[0]),
            _ => return,
        }
    }
    log.lock().unwrap().push(head.clone());

    if status != 200 {
        let response = format!("HTTP/1.1 {status} Denied\r\nContent-Length: 0\r\n\r\n");
        let _ = socket.write_all(response.as_bytes()).await;
        return;
    }

    let mut upstream = match mode {
        TunnelMode::Echo => None,
        TunnelMode::Loopback => {
            let text = String::from_utf8_lossy(&head);
            let authority = text.split_whitespace().nth(1).unwrap_or_default();
            let port: u16 = authority
                .rsplit_once(':')
                .and_then(|(_, p)| p.parse().ok())
                .unwrap_or(80);
            match TcpStream::connect((LOOPBACK, port)).await {
                Ok(stream) => Some(stream),
                Err(_) => {
                    let _ = socket
                        .write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n")
                        .await;
                    return;
                }
            }
        }
    };

    let mut established = b"HTTP/1.1 200 Connection established\r\n\r\n".to_vec();
    established.extend_from_slice(early);
    if socket.write_all(&established).await.is_err() {
        return;
    }

    match upstream.as_mut() {
        Some(upstream) => {
            let _ = tokio::io::copy_bidirectional(&mut socket, upstream).await;
        }
        None => {
            let (mut read, mut write) = socket.split();
            let _ = tokio::io::copy(&mut read, &mut write).await;
        }
    }
}

/// A loopback port with nothing listening on it.
pub async fn refused_port() -> u16 {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Accepts TCP connections and never writes; a stand-in for a hung proxy or origin.
pub async fn silent_listener() -> u16 {
    let listener = TcpListener::bind((LOOPBACK, 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    port
}

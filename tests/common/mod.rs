//! Shared test harness: an in-process scripted RESP server.
//!
//! The mock understands just enough commands for the integration scenarios
//! (SET/GET against a shared store, a never-replying BLPOP for flow-control
//! tests, the subscribe lifecycle, and a push-frame trigger). It serves one
//! connection at a time, which matches the single-connection client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use redis_mux::protocol::{RespDecoder, RespFrame};
use redis_mux::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

pub struct MockRedis {
    addr: SocketAddr,
    store: Store,
    task: JoinHandle<()>,
}

impl MockRedis {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self::from_listener(listener, Store::default())
    }

    /// Rebind on a specific address with an existing store, for restart
    /// scenarios. Retries while the previous listener's port is released.
    pub async fn start_on(addr: SocketAddr, store: Store) -> Self {
        for _ in 0..100 {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Self::from_listener(listener, store),
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        panic!("could not rebind mock server on {addr}");
    }

    fn from_listener(listener: TcpListener, store: Store) -> Self {
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(serve(listener, store.clone()));
        Self { addr, store, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn store(&self) -> Store {
        self.store.clone()
    }

    /// Kill the server, dropping the listener and any live connection.
    pub async fn stop(self) -> (SocketAddr, Store) {
        self.task.abort();
        let _ = self.task.await;
        (self.addr, self.store)
    }
}

async fn serve(listener: TcpListener, store: Store) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let _ = handle_conn(stream, store.clone()).await;
    }
}

async fn handle_conn(mut stream: TcpStream, store: Store) -> std::io::Result<()> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut channels: Vec<Bytes> = Vec::new();
    let mut blocked = false;
    loop {
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
        loop {
            let frame = {
                let mut cursor = Cursor::new(&buf[..]);
                match RespDecoder::decode(&mut cursor) {
                    Ok(Some(frame)) => {
                        let consumed = cursor.position() as usize;
                        buf.advance(consumed);
                        frame
                    }
                    Ok(None) => break,
                    Err(_) => return Ok(()),
                }
            };
            let args = command_args(frame);
            // A blocking command stalls the whole connection, like a real
            // server: later commands are read but nothing is answered.
            if blocked {
                continue;
            }
            if args
                .first()
                .is_some_and(|name| name.eq_ignore_ascii_case(b"blpop"))
            {
                blocked = true;
                continue;
            }
            respond(&mut stream, &args, &mut channels, &store).await?;
        }
    }
}

fn command_args(frame: RespFrame) -> Vec<Bytes> {
    match frame {
        RespFrame::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                RespFrame::Bulk(b) | RespFrame::Status(b) => Some(b),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

async fn respond(
    stream: &mut TcpStream,
    args: &[Bytes],
    channels: &mut Vec<Bytes>,
    store: &Store,
) -> std::io::Result<()> {
    let Some(name) = args.first() else {
        return stream.write_all(b"-ERR protocol error\r\n").await;
    };
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    match name.as_str() {
        "ping" => stream.write_all(b"+PONG\r\n").await,
        "set" if args.len() >= 3 => {
            store
                .lock()
                .unwrap()
                .insert(args[1].to_vec(), args[2].to_vec());
            stream.write_all(b"+OK\r\n").await
        }
        "get" if args.len() >= 2 => {
            let value = {
                let map = store.lock().unwrap();
                map.get(args[1].as_ref()).cloned()
            };
            match value {
                Some(v) => {
                    stream
                        .write_all(format!("${}\r\n", v.len()).as_bytes())
                        .await?;
                    stream.write_all(&v).await?;
                    stream.write_all(b"\r\n").await
                }
                None => stream.write_all(b"$-1\r\n").await,
            }
        }
        "subscribe" => {
            for channel in &args[1..] {
                channels.push(channel.clone());
                write_sub_frame(stream, b"subscribe", channel, channels.len() as i64).await?;
            }
            Ok(())
        }
        "unsubscribe" => {
            let mut remaining = channels.len() as i64;
            let drained: Vec<Bytes> = channels.drain(..).collect();
            for channel in drained {
                remaining -= 1;
                write_sub_frame(stream, b"unsubscribe", &channel, remaining).await?;
            }
            Ok(())
        }
        // Emits an out-of-band RESP3 push frame before the reply.
        "pushme" => {
            stream
                .write_all(b">2\r\n$10\r\ninvalidate\r\n$3\r\nfoo\r\n")
                .await?;
            stream.write_all(b"+OK\r\n").await
        }
        _ => stream.write_all(b"-ERR unknown command\r\n").await,
    }
}

async fn write_sub_frame(
    stream: &mut TcpStream,
    kind: &[u8],
    channel: &Bytes,
    count: i64,
) -> std::io::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(b"*3\r\n");
    out.extend_from_slice(format!("${}\r\n", kind.len()).as_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!("${}\r\n", channel.len()).as_bytes());
    out.extend_from_slice(channel);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(format!(":{count}\r\n").as_bytes());
    stream.write_all(&out).await
}

/// Build a command argument vector from string parts.
pub fn cmd(parts: &[&str]) -> Vec<Bytes> {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_bytes()))
        .collect()
}

/// Poll a condition on the local task until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition was not reached in time");
}

/// Wait for the client to report an established connection.
pub async fn wait_connected(client: &Client) {
    wait_until(|| client.is_connected()).await;
}

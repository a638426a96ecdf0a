//! Test servers for exercising the client against real sockets.
//!
//! `FakeServer` is a small memcached-compatible server running on its own
//! tokio runtime thread. A few reserved keys make it misbehave on purpose:
//! - `__server_error__`: retrieval answers `SERVER_ERROR out of memory`
//! - `__garbage__`: retrieval answers `BOGUS`
//! - `__bad_header__`: retrieval answers a VALUE header with a missing field
//!
//! `scripted_server` replays canned reply bytes in small pieces, and
//! `late_tail_server` leaves unsolicited bytes behind on its first connection.

use crate::connection::{probe, Liveness};
use crate::protocol::{find_crlf, parse_number, tokens};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const BUFFER_SIZE: usize = 16 * 1024;
const WAIT_DEADLINE: Duration = Duration::from_secs(5);

struct Item {
    flags: u32,
    data: Vec<u8>,
    cas: u64,
}

#[derive(Default)]
struct State {
    items: Mutex<HashMap<Vec<u8>, Item>>,
    cas_counter: AtomicU64,
    gets: AtomicU64,
    connections: AtomicU64,
}

impl State {
    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process memcached-compatible server.
pub struct FakeServer {
    port: u16,
    state: Arc<State>,
    kick: broadcast::Sender<()>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(State::default());
        let (kick, _) = broadcast::channel(8);

        let accept_state = Arc::clone(&state);
        let accept_kick = kick.clone();
        thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::from_std(listener).unwrap();
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        continue;
                    };
                    accept_state.connections.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&accept_state);
                    let kick = accept_kick.subscribe();
                    tokio::spawn(handle_connection(stream, state, kick));
                }
            });
        });

        Self { port, state, kick }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Close every open client connection from the server side.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    /// Block until `n` retrieval commands have been processed.
    pub fn wait_for_gets(&self, n: u64) {
        let deadline = Instant::now() + WAIT_DEADLINE;
        while self.state.gets.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "timed out waiting for get");
            thread::sleep(Duration::from_millis(5));
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<State>,
    mut kick: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        // Answer every complete command already buffered
        while let Some(step) = process(&buffer, &state) {
            if step.close {
                return;
            }
            if !step.response.is_empty() && stream.write_all(&step.response).await.is_err() {
                return;
            }
            buffer.advance(step.consumed);
        }

        tokio::select! {
            read = stream.read_buf(&mut buffer) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
            _ = kick.recv() => return,
        }
    }
}

struct Step {
    consumed: usize,
    response: Vec<u8>,
    close: bool,
}

impl Step {
    fn reply(consumed: usize, response: impl Into<Vec<u8>>) -> Option<Self> {
        Some(Self {
            consumed,
            response: response.into(),
            close: false,
        })
    }
}

/// Execute the first complete command in `buffer`; `None` if incomplete.
fn process(buffer: &[u8], state: &State) -> Option<Step> {
    let line_end = find_crlf(buffer)?;
    let line = &buffer[..line_end];
    let command_bytes = line_end + 2;

    let parts: Vec<&[u8]> = tokens(line).collect();
    let Some(verb) = parts.first() else {
        return Step::reply(command_bytes, &b"ERROR\r\n"[..]);
    };
    let verb = verb.to_ascii_lowercase();
    let noreply = parts.len() > 1
        && parts
            .last()
            .is_some_and(|t| t.eq_ignore_ascii_case(b"noreply"));
    let silence = |consumed: usize, response: &[u8]| {
        Step::reply(consumed, if noreply { &[][..] } else { response })
    };

    match verb.as_slice() {
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            // <command> <key> <flags> <exptime> <bytes> [<cas unique>] [noreply]
            let (Some(key), Some(flags), Some(len)) = (
                parts.get(1),
                parts.get(2).and_then(|t| parse_number(t)),
                parts.get(4).and_then(|t| parse_number(t)),
            ) else {
                return Step::reply(command_bytes, &b"ERROR\r\n"[..]);
            };

            let total = command_bytes + len + 2;
            if buffer.len() < total {
                return None;
            }
            if &buffer[command_bytes + len..total] != b"\r\n" {
                return Step::reply(total, &b"CLIENT_ERROR bad data chunk\r\n"[..]);
            }
            let data = buffer[command_bytes..command_bytes + len].to_vec();
            let cas_unique = parts.get(5).and_then(|t| parse_number(t)).map(|n| n as u64);

            let response = store(state, &verb, key, flags as u32, data, cas_unique);
            silence(total, response)
        }

        b"get" | b"gets" => {
            let mut response = Vec::new();
            let mut terminated = false;
            let items = state.items.lock().unwrap();
            for key in &parts[1..] {
                match *key {
                    b"__server_error__" => {
                        response.extend_from_slice(b"SERVER_ERROR out of memory\r\n");
                        terminated = true;
                        break;
                    }
                    b"__garbage__" => {
                        response.extend_from_slice(b"BOGUS\r\n");
                        terminated = true;
                        break;
                    }
                    b"__bad_header__" => response.extend_from_slice(b"VALUE x 0\r\n"),
                    _ => {
                        if let Some(item) = items.get(*key) {
                            let header = if verb == b"gets" {
                                format!(" {} {} {}\r\n", item.flags, item.data.len(), item.cas)
                            } else {
                                format!(" {} {}\r\n", item.flags, item.data.len())
                            };
                            response.extend_from_slice(b"VALUE ");
                            response.extend_from_slice(key);
                            response.extend_from_slice(header.as_bytes());
                            response.extend_from_slice(&item.data);
                            response.extend_from_slice(b"\r\n");
                        }
                    }
                }
            }
            drop(items);
            if !terminated {
                response.extend_from_slice(b"END\r\n");
            }
            state.gets.fetch_add(1, Ordering::SeqCst);
            Step::reply(command_bytes, response)
        }

        b"delete" => {
            let Some(key) = parts.get(1) else {
                return Step::reply(command_bytes, &b"ERROR\r\n"[..]);
            };
            let removed = state.items.lock().unwrap().remove(*key).is_some();
            let response: &[u8] = if removed { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" };
            silence(command_bytes, response)
        }

        b"incr" | b"decr" => {
            let (Some(key), Some(delta)) = (parts.get(1), parts.get(2).and_then(|t| parse_number(t)))
            else {
                return Step::reply(command_bytes, &b"ERROR\r\n"[..]);
            };
            let mut items = state.items.lock().unwrap();
            let response = match items.get_mut(*key) {
                None => b"NOT_FOUND\r\n".to_vec(),
                Some(item) => match std::str::from_utf8(&item.data).ok().and_then(|s| s.parse::<u64>().ok()) {
                    None => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec(),
                    Some(current) => {
                        let value = if verb == b"incr" {
                            current.wrapping_add(delta as u64)
                        } else {
                            current.saturating_sub(delta as u64)
                        };
                        item.data = value.to_string().into_bytes();
                        item.cas = state.next_cas();
                        format!("{}\r\n", value).into_bytes()
                    }
                },
            };
            drop(items);
            silence(command_bytes, response.as_slice())
        }

        b"flush_all" => {
            state.items.lock().unwrap().clear();
            silence(command_bytes, &b"OK\r\n"[..])
        }

        b"stats" => {
            if parts.len() > 1 {
                return Step::reply(command_bytes, &b"ERROR\r\n"[..]);
            }
            let items = state.items.lock().unwrap().len();
            let response = format!(
                "STAT curr_items {}\r\nSTAT cmd_get {}\r\nSTAT total_connections {}\r\nEND\r\n",
                items,
                state.gets.load(Ordering::SeqCst),
                state.connections.load(Ordering::SeqCst),
            );
            Step::reply(command_bytes, response)
        }

        b"version" => Step::reply(command_bytes, &b"VERSION fake-memcached\r\n"[..]),

        b"quit" => Some(Step {
            consumed: command_bytes,
            response: Vec::new(),
            close: true,
        }),

        _ => Step::reply(command_bytes, &b"ERROR\r\n"[..]),
    }
}

fn store(
    state: &State,
    verb: &[u8],
    key: &[u8],
    flags: u32,
    data: Vec<u8>,
    cas_unique: Option<u64>,
) -> &'static [u8] {
    let mut items = state.items.lock().unwrap();
    let exists = items.contains_key(key);

    match verb {
        b"add" if exists => return b"NOT_STORED\r\n",
        b"replace" | b"append" | b"prepend" if !exists => return b"NOT_STORED\r\n",
        b"cas" => match items.get(key) {
            None => return b"NOT_FOUND\r\n",
            Some(item) if Some(item.cas) != cas_unique => return b"EXISTS\r\n",
            Some(_) => {}
        },
        _ => {}
    }

    let cas = state.next_cas();
    if let (b"append" | b"prepend", Some(item)) = (verb, items.get_mut(key)) {
        if verb == b"append" {
            item.data.extend_from_slice(&data);
        } else {
            let mut joined = data;
            joined.extend_from_slice(&item.data);
            item.data = joined;
        }
        item.cas = cas;
        return b"STORED\r\n";
    }

    items.insert(key.to_vec(), Item { flags, data, cas });
    b"STORED\r\n"
}

/// Accept one connection, read the request, then write `reply` in pieces of
/// `step` bytes. With `close` the socket is dropped right after; otherwise
/// it stays open until the client goes away.
pub fn scripted_server(reply: &'static [u8], step: usize, close: bool) -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_nodelay(true).unwrap();

        let mut request = [0u8; 1024];
        let _ = stream.read(&mut request);

        for chunk in reply.chunks(step.max(1)) {
            if stream.write_all(chunk).is_err() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        if close {
            return;
        }
        let mut sink = [0u8; 1024];
        while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
    });

    port
}

/// Accept a connection, answer its request with `reply`, then write `tail`
/// a moment later without being asked. The next connection gets `next` for
/// its request. Both sockets stay open until the client goes away.
pub fn late_tail_server(reply: &'static [u8], tail: &'static [u8], next: &'static [u8]) -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        let mut request = [0u8; 1024];

        let (mut first, _) = listener.accept().unwrap();
        let _ = first.read(&mut request);
        first.write_all(reply).unwrap();
        thread::sleep(Duration::from_millis(20));
        first.write_all(tail).unwrap();

        let Ok((mut second, _)) = listener.accept() else {
            return;
        };
        let _ = second.read(&mut request);
        let _ = second.write_all(next);
        while matches!(second.read(&mut request), Ok(n) if n > 0) {}
        drop(first);
    });

    port
}

/// Poll the socket until the probe reports `want`.
pub fn wait_for_liveness(stream: &std::net::TcpStream, want: Liveness) {
    let deadline = Instant::now() + WAIT_DEADLINE;
    while probe(stream) != want {
        assert!(Instant::now() < deadline, "timed out waiting for {:?}", want);
        thread::sleep(Duration::from_millis(5));
    }
}

/// Cloneable in-memory writer for capturing echoed exchanges.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

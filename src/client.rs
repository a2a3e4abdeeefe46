//! Per-connection state: the raw query buffer, the inline/bulk parser state
//! machine, argv, and the outbound reply queue with its partial-write cursor.

use std::collections::LinkedList;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use once_cell::sync::Lazy;

use crate::cmd::{dispatch_command, lookup_command};
use crate::obj::{create_object, RedisObject, StringStorageType};
use crate::server::server_read;
use crate::util::{log, timestamp, LogLevel};

/// Hard cap on the inline query line before it must contain an LF (§4.2).
pub const QUERY_BUF_LIMIT: usize = 1024;
/// Bulk payload length bounds (§6 defaults).
pub const BULK_LEN_MAX: i64 = 1024 * 1024 * 1024;
/// Maximum number of argv entries per command (§6).
pub const MAX_ARGV: usize = 16;

/// All live clients, keyed by fd. A `None` marks a slot whose client is
/// scheduled for destruction but hasn't been reaped from the event loop yet.
pub static CLIENTS: Lazy<RwLock<Vec<Arc<RwLock<RedisClient>>>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn clients_read() -> RwLockReadGuard<'static, Vec<Arc<RwLock<RedisClient>>>> {
    CLIENTS.read().unwrap()
}
pub fn clients_write() -> RwLockWriteGuard<'static, Vec<Arc<RwLock<RedisClient>>>> {
    CLIENTS.write().unwrap()
}

/// fds whose client has already been torn down this tick; `before_sleep`
/// sweeps these out of `CLIENTS` once the event loop is done dispatching.
pub static PENDING_CLOSE: Lazy<RwLock<Vec<i32>>> = Lazy::new(|| RwLock::new(Vec::new()));

pub fn pending_close_read() -> RwLockReadGuard<'static, Vec<i32>> {
    PENDING_CLOSE.read().unwrap()
}
pub fn pending_close_write() -> RwLockWriteGuard<'static, Vec<i32>> {
    PENDING_CLOSE.write().unwrap()
}

/// Look up a live client by its socket fd. Used by the accept/read/write
/// event handlers, which are only ever handed a bare fd by the event loop.
pub fn find_client(fd: i32) -> Option<Arc<RwLock<RedisClient>>> {
    clients_read().iter().find(|c| c.read().unwrap().fd == fd).cloned()
}

/// Parser framing state (§4.2).
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    AwaitLine,
    ReadBulk,
}

pub struct RedisClient {
    fd: i32,
    pub db_index: usize,
    pub query_buf: Vec<u8>,
    pub argv: Vec<Arc<RwLock<RedisObject>>>,
    pub state: ParseState,
    /// -1 while in inline framing; otherwise the number of bytes (payload +
    /// CRLF) still to be consumed off the query buffer for the bulk tail.
    pub bulk_len: i64,
    pub reply: LinkedList<Arc<RwLock<RedisObject>>>,
    pub reply_cursor: usize,
    pub last_interaction: u64,
    /// Set by QUIT: once the reply queue drains, the writable handler closes
    /// the connection instead of uninstalling itself.
    pub close_after_reply: bool,
}

impl RedisClient {
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn create(fd: i32) -> Arc<RwLock<RedisClient>> {
        let client = RedisClient {
            fd,
            db_index: 0,
            query_buf: Vec::new(),
            argv: Vec::new(),
            state: ParseState::AwaitLine,
            bulk_len: -1,
            reply: LinkedList::new(),
            reply_cursor: 0,
            last_interaction: timestamp().as_secs(),
            close_after_reply: false,
        };
        let client = Arc::new(RwLock::new(client));
        clients_write().push(client.clone());
        client
    }

    pub fn has_reply(&self) -> bool {
        !self.reply.is_empty()
    }

    fn reset_after_command(&mut self) {
        self.argv.clear();
        self.bulk_len = -1;
    }

    /// Clear argv, and if a reply has been queued, register the fd for
    /// writing. Called after every command dispatch (successful or not).
    pub fn finish_dispatch(client: &Arc<RwLock<RedisClient>>) {
        let mut c = client.write().unwrap();
        c.reset_after_command();
        let has_reply = c.has_reply();
        let fd = c.fd;
        drop(c);
        if has_reply {
            install_writable(fd);
        }
    }

    /// Append a raw byte string to the reply queue, wrapped in a fresh STRING
    /// object.
    pub fn reply_bytes(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.reply.push_back(create_object(RedisObject::String { ptr: StringStorageType::Bytes(bytes) }));
    }

    pub fn reply_str(&mut self, s: &str) {
        self.reply_bytes(s.as_bytes().to_vec());
    }

    pub fn reply_shared(&mut self, obj: Arc<RwLock<RedisObject>>) {
        self.reply.push_back(obj);
    }

    /// Destroy this client: release argv/reply references, close the fd,
    /// unregister from the event loop and the live-client list.
    pub fn destroy(fd: i32) {
        crate::eventloop::delete_file_event(fd, crate::eventloop::Mask::ReadWritable);
        unsafe { libc::close(fd); }
        pending_close_write().push(fd);
        log(LogLevel::Verbose, &format!("Closed connection on fd {}", fd));
    }

    /// Feed newly read bytes into the query buffer and run the parser until
    /// it can make no further progress without more I/O.
    pub fn feed(client: &Arc<RwLock<RedisClient>>, bytes: &[u8]) {
        {
            let mut c = client.write().unwrap();
            c.query_buf.extend_from_slice(bytes);
            c.last_interaction = timestamp().as_secs();
        }
        Self::process_input_buffer(client);
    }

    fn process_input_buffer(client: &Arc<RwLock<RedisClient>>) {
        loop {
            let fd = client.read().unwrap().fd;
            let state = client.read().unwrap().state;
            match state {
                ParseState::AwaitLine => {
                    let line = {
                        let c = client.read().unwrap();
                        find_lf(&c.query_buf)
                    };
                    let Some(line_end) = line else {
                        let too_long = client.read().unwrap().query_buf.len() > QUERY_BUF_LIMIT;
                        if too_long {
                            log(LogLevel::Verbose, "Protocol error: too big inline request");
                            RedisClient::destroy(fd);
                        }
                        return;
                    };
                    let mut c = client.write().unwrap();
                    let mut line: Vec<u8> = c.query_buf.drain(..=line_end).collect();
                    // Strip the terminating LF and an optional preceding CR.
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let tokens: Vec<Vec<u8>> = line.split(|b| *b == b' ').filter(|t| !t.is_empty()).map(|t| t.to_vec()).collect();
                    if tokens.is_empty() {
                        drop(c);
                        if client.read().unwrap().query_buf.is_empty() {
                            return;
                        }
                        continue;
                    }
                    if tokens.len() > MAX_ARGV {
                        log(LogLevel::Verbose, "Protocol error: too many arguments");
                        RedisClient::destroy(fd);
                        return;
                    }

                    let cmd_name = tokens[0].to_ascii_lowercase();
                    let is_bulk = lookup_command(&cmd_name).map(|cmd| cmd.is_bulk()).unwrap_or(false);

                    if is_bulk {
                        if tokens.len() < 2 {
                            c.reply_str("-ERR wrong number of arguments\r\n");
                            drop(c);
                            RedisClient::finish_dispatch(client);
                            continue;
                        }
                        let len_tok = tokens.last().unwrap();
                        let Ok(len_str) = std::str::from_utf8(len_tok) else {
                            c.reply_str("-ERR invalid bulk write count\r\n");
                            drop(c);
                            RedisClient::finish_dispatch(client);
                            continue;
                        };
                        let parsed: Result<i64, _> = len_str.parse();
                        match parsed {
                            Ok(n) if n >= 0 && n <= BULK_LEN_MAX => {
                                c.argv = tokens[..tokens.len() - 1].iter()
                                    .map(|t| create_object(RedisObject::String { ptr: StringStorageType::Bytes(t.clone()) }))
                                    .collect();
                                c.bulk_len = n + 2;
                                c.state = ParseState::ReadBulk;
                                drop(c);
                                continue;
                            },
                            _ => {
                                c.reply_str("-ERR invalid bulk write count\r\n");
                                drop(c);
                                RedisClient::finish_dispatch(client);
                                continue;
                            },
                        }
                    } else {
                        c.argv = tokens.into_iter()
                            .map(|t| create_object(RedisObject::String { ptr: StringStorageType::Bytes(t) }))
                            .collect();
                        drop(c);
                        if !dispatch_command(client) {
                            return; // client was destroyed (e.g. QUIT)
                        }
                        continue;
                    }
                },
                ParseState::ReadBulk => {
                    let ready = {
                        let c = client.read().unwrap();
                        c.query_buf.len() as i64 >= c.bulk_len
                    };
                    if !ready {
                        return;
                    }
                    let mut c = client.write().unwrap();
                    let total = c.bulk_len as usize;
                    let payload: Vec<u8> = c.query_buf.drain(..total).collect();
                    let data = payload[..total - 2].to_vec();
                    c.argv.push(create_object(RedisObject::String { ptr: StringStorageType::Bytes(data) }));
                    c.state = ParseState::AwaitLine;
                    c.bulk_len = -1;
                    drop(c);
                    if !dispatch_command(client) {
                        return;
                    }
                    continue;
                },
            }
        }
    }
}

fn find_lf(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

fn install_writable(fd: i32) {
    let _ = crate::eventloop::create_file_event(fd, crate::eventloop::Mask::Writable, Arc::new(crate::handler::send_reply_to_client));
}

/// Validate the client-selected DB index, used by SELECT/MOVE.
pub fn valid_db_index(idx: i64) -> bool {
    idx >= 0 && idx < server_read().dbnum() as i64
}

//! Event loop glue: the accept/read/write file-event handlers and the
//! once-a-second `server_cron` time event, plus the `before_sleep` hook that
//! reaps clients destroyed during the last tick.

use std::any::Any;
use std::sync::Arc;

use crate::client::{clients_read, clients_write, find_client, pending_close_read, pending_close_write, RedisClient};
use crate::eventloop::{create_file_event, delete_file_event, Mask};
use crate::net::{accept, nonblock, tcp_no_delay};
use crate::rdb::{mark_save_success, reap_background_save, rdb_save_background};
use crate::server::{server_read, server_write};
use crate::util::{log, timestamp, LogLevel};
use crate::zmalloc::MemCounter;

/// Default placeholder handler for unused event-loop slots.
pub fn proc_holder(_fd: i32, _mask: Mask) {}

/// Drop every client whose fd was queued for destruction during the last
/// pass over the event loop (§4.3/§4.9).
pub fn before_sleep() {
    if pending_close_read().is_empty() {
        return;
    }
    let dead: Vec<i32> = pending_close_write().drain(..).collect();
    if dead.is_empty() {
        return;
    }
    clients_write().retain(|c| !dead.contains(&c.read().unwrap().fd()));
}

/// Accept a new connection, make it nonblocking, register a reader and bump
/// the connection counter (§4.1).
pub fn accept_handler(fd: i32, _mask: Mask) {
    let (client_fd, _ip, _port) = match accept(fd) {
        Ok(r) => r,
        Err(e) => {
            log(LogLevel::Warning, &format!("Accepting client connection: {}", e));
            return;
        },
    };

    if let Err(e) = nonblock(client_fd) {
        log(LogLevel::Warning, &e);
        unsafe { libc::close(client_fd); }
        return;
    }
    let _ = tcp_no_delay(client_fd);

    let client = RedisClient::create(client_fd);
    if let Err(e) = create_file_event(client_fd, Mask::Readable, Arc::new(read_query_from_client)) {
        log(LogLevel::Warning, &format!("Creating client read event: {}", e));
        RedisClient::destroy(client_fd);
        return;
    }
    let _ = client;
    server_write().stat_numconnections += 1;
    log(LogLevel::Verbose, &format!("Accepted connection on fd {}", client_fd));
}

const READ_CHUNK: usize = 16 * 1024;

/// Read whatever is available on `fd` and feed it to the client's parser.
pub fn read_query_from_client(fd: i32, _mask: Mask) {
    let Some(client) = find_client(fd) else { return; };

    let mut buf = vec![0u8; READ_CHUNK];
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };

    if n > 0 {
        RedisClient::feed(&client, &buf[..n as usize]);
        return;
    }
    if n == 0 {
        log(LogLevel::Verbose, &format!("Client closed connection on fd {}", fd));
        RedisClient::destroy(fd);
        return;
    }
    let errno = crate::util::error();
    if errno == libc::EAGAIN || errno == libc::EINTR {
        return;
    }
    log(LogLevel::Verbose, &format!("Reading from client fd {}: errno {}", fd, errno));
    RedisClient::destroy(fd);
}

/// Max number of reply list nodes drained in one writable-event turn, so one
/// very chatty client can't starve the rest of the event loop (§4.4).
const MAX_WRITES_PER_EVENT: usize = 64;

/// Drain as much of the client's reply queue as the socket will currently
/// accept, honoring the partial-write cursor on the head node (§4.4).
pub fn send_reply_to_client(fd: i32, _mask: Mask) {
    let Some(client) = find_client(fd) else { return; };

    for _ in 0..MAX_WRITES_PER_EVENT {
        let head = { client.read().unwrap().reply.front().cloned() };
        let Some(node) = head else {
            delete_file_event(fd, Mask::Writable);
            if client.read().unwrap().close_after_reply {
                RedisClient::destroy(fd);
            }
            return;
        };

        let payload = node.read().unwrap().as_bytes();
        let cursor = client.read().unwrap().reply_cursor;
        if cursor >= payload.len() {
            let mut c = client.write().unwrap();
            c.reply.pop_front();
            c.reply_cursor = 0;
            drop(c);
            crate::obj::recycle_object(node);
            continue;
        }

        let remaining = &payload[cursor..];
        let n = unsafe { libc::write(fd, remaining.as_ptr() as *const libc::c_void, remaining.len()) };

        if n > 0 {
            let mut c = client.write().unwrap();
            c.reply_cursor += n as usize;
            c.last_interaction = timestamp().as_secs();
            let done = c.reply_cursor >= payload.len();
            if done {
                c.reply.pop_front();
                c.reply_cursor = 0;
            }
            drop(c);
            if done {
                crate::obj::recycle_object(node);
            }
            continue;
        }
        if n == 0 {
            return;
        }
        let errno = crate::util::error();
        if errno == libc::EAGAIN || errno == libc::EINTR {
            return;
        }
        log(LogLevel::Verbose, &format!("Writing to client fd {}: errno {}", fd, errno));
        RedisClient::destroy(fd);
        return;
    }
}

/// Once-a-second housekeeping (§4.9): shrink underused DB tables, close idle
/// clients, reap a finished BGSAVE child and, failing that, kick off a new
/// one if the configured save rules are satisfied. Re-arms itself for 1000ms.
pub fn server_cron(_id: u128, _client_data: Option<Arc<dyn Any + Sync + Send>>) -> i32 {
    let loops = server_read().cron_loops() + 1;
    server_write().set_cron_loops(loops);

    for db in server_read().dbs.iter() {
        let mut db = db.write().unwrap();
        db.maybe_shrink();
    }

    if loops % 10 == 0 {
        let max_idle = server_read().max_idle_time();
        if max_idle > 0 {
            let now = timestamp().as_secs();
            let idle: Vec<i32> = clients_read().iter().filter_map(|c| {
                let c = c.read().unwrap();
                if now.saturating_sub(c.last_interaction) > max_idle as u64 {
                    Some(c.fd())
                } else {
                    None
                }
            }).collect();
            for fd in idle {
                log(LogLevel::Verbose, &format!("Closing idle client fd {}", fd));
                RedisClient::destroy(fd);
            }
        }
    }

    if server_read().bg_save_child_pid != -1 {
        if let Some(success) = reap_background_save() {
            if success {
                log(LogLevel::Notice, "Background saving completed successfully");
                mark_save_success();
            } else {
                log(LogLevel::Warning, "Background saving failed");
            }
        }
    } else {
        let dirty = server_read().dirty;
        let since_save = timestamp().as_secs().saturating_sub(server_read().last_save);
        let due = server_read().save_params().iter().any(|p| dirty >= p.changes && since_save >= p.seconds);
        if due {
            log(LogLevel::Notice, &format!("{} changes in {} seconds. Saving...", dirty, since_save));
            match rdb_save_background() {
                Ok(()) => {},
                Err(e) => log(LogLevel::Warning, &format!("Can't save in background: {}", e)),
            }
        }
    }

    log(LogLevel::Debug, &format!("{} clients connected, {} bytes in use", clients_read().len(), MemCounter::used_memory()));

    1000
}

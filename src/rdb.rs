//! RDB-0000 snapshot codec: a full-database dump using fixed 4-byte
//! big-endian length fields throughout — no variable-length size encoding
//! and no payload compression, trading the original format's on-disk
//! compactness for a small, auditable, exactly-specified layout.

use std::fs::{rename, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::process::exit;
use std::sync::{Arc, RwLock};

use libc::{fork, waitpid, WNOHANG};

use crate::obj::{create_object, ListStorageType, RedisObject, SetStorageType, StringStorageType};
use crate::server::{server_read, server_write, RedisDB};
use crate::util::{log, timestamp, LogLevel};

const MAGIC: &[u8; 9] = b"REDIS0000";
const OP_SELECTDB: u8 = 254;
const OP_EOF: u8 = 255;
const TYPE_STRING: u8 = 0;
const TYPE_LIST: u8 = 1;
const TYPE_SET: u8 = 2;

fn write_u32(w: &mut impl Write, n: u32) -> std::io::Result<()> {
    w.write_all(&n.to_be_bytes())
}

fn write_bytes(w: &mut impl Write, b: &[u8]) -> std::io::Result<()> {
    write_u32(w, b.len() as u32)?;
    w.write_all(b)
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_bytes(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_object(w: &mut impl Write, key: &[u8], obj: &RedisObject) -> std::io::Result<()> {
    w.write_all(&[obj.type_code()])?;
    write_bytes(w, key)?;
    match obj {
        RedisObject::String { ptr } => write_bytes(w, &ptr.as_bytes())?,
        RedisObject::List { l } => {
            write_u32(w, l.len() as u32)?;
            for e in l.iter() {
                write_bytes(w, &e.as_bytes())?;
            }
        },
        RedisObject::Set { s } => {
            write_u32(w, s.len() as u32)?;
            for e in s.iter() {
                write_bytes(w, &e.as_bytes())?;
            }
        },
    }
    Ok(())
}

/// Serialize every non-empty database to `filename`, via a temp file
/// atomically renamed into place on success (§4.7).
pub fn write_snapshot(filename: &str) -> Result<(), String> {
    let tmp_name = format!("temp-{}.{}.rdb", std::process::id(), rand::random::<u32>());
    {
        let f = File::create(&tmp_name).map_err(|e| e.to_string())?;
        let mut w = BufWriter::with_capacity(1024, f);
        w.write_all(MAGIC).map_err(|e| e.to_string())?;

        let dbs = server_read().dbs.clone();
        for (idx, db) in dbs.iter().enumerate() {
            let db = db.read().unwrap();
            if db.dict.is_empty() {
                continue;
            }
            w.write_all(&[OP_SELECTDB]).map_err(|e| e.to_string())?;
            write_u32(&mut w, idx as u32).map_err(|e| e.to_string())?;
            for (key, value) in db.dict.iter() {
                write_object(&mut w, key, &value.read().unwrap()).map_err(|e| e.to_string())?;
            }
        }
        w.write_all(&[OP_EOF]).map_err(|e| e.to_string())?;
        w.flush().map_err(|e| e.to_string())?;
    }

    match rename(&tmp_name, filename) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_name);
            Err(e.to_string())
        },
    }
}

/// Shared success outcome: both the synchronous SAVE path and the
/// BGSAVE-reaping path in `handler::server_cron` call this so they cannot
/// drift (§4.8).
pub fn mark_save_success() {
    let mut s = server_write();
    s.dirty = 0;
    s.last_save = timestamp().as_secs();
}

/// Synchronous SAVE: write the snapshot in-process and apply the success
/// outcome directly.
pub fn rdb_save() -> Result<(), String> {
    let filename = server_read().db_filename.clone();
    write_snapshot(&filename)?;
    mark_save_success();
    Ok(())
}

/// BGSAVE: fork a child that writes the snapshot and exits; the parent
/// records the child pid and returns immediately. The cron reaps the child
/// and applies the success outcome (§4.8).
pub fn rdb_save_background() -> Result<(), String> {
    if server_read().bg_save_child_pid != -1 {
        return Err("Background save already in progress".to_string());
    }

    let filename = server_read().db_filename.clone();
    let listen_fd = server_read().fd;

    match unsafe { fork() } {
        -1 => Err("can't fork background save child".to_string()),
        0 => {
            unsafe { libc::close(listen_fd); }
            match write_snapshot(&filename) {
                Ok(()) => exit(0),
                Err(e) => {
                    log(LogLevel::Warning, &format!("Background saving failed: {}", e));
                    exit(1)
                },
            }
        },
        pid => {
            server_write().bg_save_child_pid = pid;
            Ok(())
        },
    }
}

/// Non-blockingly reap a finished BGSAVE child, if any. Returns `Some(true)`
/// on a successful save, `Some(false)` on a failed one, `None` if no child
/// has exited yet.
pub fn reap_background_save() -> Option<bool> {
    let pid = server_read().bg_save_child_pid;
    if pid == -1 {
        return None;
    }
    let mut status: i32 = 0;
    let reaped = unsafe { waitpid(pid, &mut status, WNOHANG) };
    if reaped <= 0 {
        return None;
    }
    server_write().bg_save_child_pid = -1;
    let exited_ok = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
    Some(exited_ok)
}

/// Load a snapshot at startup. Any structural problem (bad magic, short
/// read, unknown opcode) is fatal — load is only ever attempted before the
/// server starts serving (§4.7, §7 category 5).
pub fn rdb_load(filename: &str) -> Result<(), String> {
    let f = match File::open(filename) {
        Ok(f) => f,
        Err(_) => return Ok(()), // no snapshot on disk yet; start empty
    };
    let mut r = BufReader::with_capacity(1024, f);

    let mut magic = [0u8; 9];
    r.read_exact(&mut magic).map_err(|e| e.to_string())?;
    if &magic != MAGIC {
        return Err("Wrong signature trying to load DB from file".to_string());
    }

    let dbs = server_read().dbs.clone();
    let mut current: Option<Arc<RwLock<RedisDB>>> = None;

    loop {
        let mut op = [0u8; 1];
        if r.read_exact(&mut op).is_err() {
            return Err("Unexpected EOF reading RDB opcode".to_string());
        }
        match op[0] {
            OP_EOF => break,
            OP_SELECTDB => {
                let idx = read_u32(&mut r).map_err(|e| e.to_string())? as usize;
                let db = dbs.get(idx).ok_or_else(|| format!("RDB refers to out-of-range db {}", idx))?;
                current = Some(db.clone());
            },
            TYPE_STRING | TYPE_LIST | TYPE_SET => {
                let db = current.as_ref().ok_or("RDB record before any SELECTDB")?;
                let key = read_bytes(&mut r).map_err(|e| e.to_string())?;
                let value = match op[0] {
                    TYPE_STRING => {
                        let bytes = read_bytes(&mut r).map_err(|e| e.to_string())?;
                        RedisObject::String { ptr: StringStorageType::Bytes(bytes) }
                    },
                    TYPE_LIST => {
                        let count = read_u32(&mut r).map_err(|e| e.to_string())?;
                        let mut l = ListStorageType::new();
                        for _ in 0..count {
                            let bytes = read_bytes(&mut r).map_err(|e| e.to_string())?;
                            l.push_back(RedisObject::String { ptr: StringStorageType::Bytes(bytes) });
                        }
                        RedisObject::List { l }
                    },
                    _ => {
                        let count = read_u32(&mut r).map_err(|e| e.to_string())?;
                        let mut s = SetStorageType::new();
                        for _ in 0..count {
                            let bytes = read_bytes(&mut r).map_err(|e| e.to_string())?;
                            s.insert(RedisObject::String { ptr: StringStorageType::Bytes(bytes) });
                        }
                        RedisObject::Set { s }
                    },
                };
                db.write().unwrap().set(key, create_object(value));
            },
            other => return Err(format!("Unknown RDB opcode {}", other)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock as StdRwLock;

    #[test]
    fn save_and_load_roundtrip() {
        {
            let mut s = server_write();
            s.dbs = vec![Arc::new(StdRwLock::new(RedisDB::new())), Arc::new(StdRwLock::new(RedisDB::new()))];
        }
        {
            let dbs = server_read().dbs.clone();
            let mut db0 = dbs[0].write().unwrap();
            db0.set(b"greeting".to_vec(), create_object(RedisObject::String { ptr: StringStorageType::Bytes(b"hello".to_vec()) }));
            let mut l = ListStorageType::new();
            l.push_back(RedisObject::String { ptr: StringStorageType::Bytes(b"a".to_vec()) });
            l.push_back(RedisObject::String { ptr: StringStorageType::Bytes(b"b".to_vec()) });
            db0.set(b"mylist".to_vec(), create_object(RedisObject::List { l }));
        }

        let path = std::env::temp_dir().join(format!("rredis-test-dump-{}.rdb", std::process::id()));
        write_snapshot(path.to_str().unwrap()).unwrap();

        {
            let mut s = server_write();
            s.dbs = vec![Arc::new(StdRwLock::new(RedisDB::new())), Arc::new(StdRwLock::new(RedisDB::new()))];
        }
        rdb_load(path.to_str().unwrap()).unwrap();

        let dbs = server_read().dbs.clone();
        let db0 = dbs[0].read().unwrap();
        let greeting = db0.lookup(b"greeting").unwrap();
        assert_eq!(greeting.read().unwrap().as_bytes(), b"hello".to_vec());
        let mylist = db0.lookup(b"mylist").unwrap();
        assert_eq!(mylist.read().unwrap().list().unwrap().len(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn load_missing_file_is_a_noop() {
        let result = rdb_load("/nonexistent/path/definitely-not-here.rdb");
        assert!(result.is_ok());
    }
}

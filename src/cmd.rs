//! Command table, dispatcher and every command handler.

use std::collections::{HashMap, HashSet};
use std::ops::BitOr;
use std::process::exit;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;

use crate::client::{valid_db_index, RedisClient};
use crate::obj::{
    create_object, try_object_encoding, ListStorageType, RedisObject, SetStorageType, StringStorageType,
    C_ONE, C_ZERO, EMPTY_MULTI_BULK, NO_KEY_ERR, NULL_BULK, NULL_MULTI_BULK, OK, OUT_OF_RANGE_ERR,
    PONG, SAME_OBJECT_ERR, WRONG_TYPE_ERR,
};
use crate::rdb::{rdb_save, rdb_save_background};
use crate::server::{server_read, server_write, RedisDB};
use crate::util::string_match;

/// Command table entry: name, handler, arity (positive = exact, negative =
/// minimum variadic) and whether the last argument is framed as bulk (§4.3).
pub struct RedisCommand {
    name: &'static str,
    proc: CommandProc,
    arity: i32,
    flags: CmdFlags,
}
impl RedisCommand {
    pub fn name(&self) -> &str {
        self.name
    }
    pub fn arity(&self) -> i32 {
        self.arity
    }
    pub fn is_bulk(&self) -> bool {
        self.flags.is_bulk()
    }
}

type CommandProc = Arc<dyn Fn(&Arc<RwLock<RedisClient>>) -> () + Sync + Send>;

pub struct CmdFlags(u8);
impl CmdFlags {
    fn bulk() -> CmdFlags {
        CmdFlags(1)
    }
    fn inline() -> CmdFlags {
        CmdFlags(2)
    }
    pub fn is_bulk(&self) -> bool {
        (self.0 & Self::bulk().0) != 0
    }
}
impl BitOr for CmdFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        CmdFlags(self.0 | rhs.0)
    }
}

static CMD_TABLE: Lazy<HashMap<&'static str, Arc<RedisCommand>>> = Lazy::new(|| {
    HashMap::from([
        ("ping", Arc::new(RedisCommand { name: "ping", proc: Arc::new(ping_command), arity: 1, flags: CmdFlags::inline() })),

        ("exists", Arc::new(RedisCommand { name: "exists", proc: Arc::new(exists_command), arity: 2, flags: CmdFlags::inline() })),
        ("del", Arc::new(RedisCommand { name: "del", proc: Arc::new(del_command), arity: -2, flags: CmdFlags::inline() })),
        ("type", Arc::new(RedisCommand { name: "type", proc: Arc::new(type_command), arity: 2, flags: CmdFlags::inline() })),
        ("keys", Arc::new(RedisCommand { name: "keys", proc: Arc::new(keys_command), arity: 2, flags: CmdFlags::inline() })),
        ("randomkey", Arc::new(RedisCommand { name: "randomkey", proc: Arc::new(randomkey_command), arity: 1, flags: CmdFlags::inline() })),
        ("rename", Arc::new(RedisCommand { name: "rename", proc: Arc::new(rename_command), arity: 3, flags: CmdFlags::inline() })),
        ("renamenx", Arc::new(RedisCommand { name: "renamenx", proc: Arc::new(renamenx_command), arity: 3, flags: CmdFlags::inline() })),
        ("dbsize", Arc::new(RedisCommand { name: "dbsize", proc: Arc::new(dbsize_command), arity: 1, flags: CmdFlags::inline() })),
        ("select", Arc::new(RedisCommand { name: "select", proc: Arc::new(select_command), arity: 2, flags: CmdFlags::inline() })),
        ("move", Arc::new(RedisCommand { name: "move", proc: Arc::new(move_command), arity: 3, flags: CmdFlags::inline() })),
        ("flushdb", Arc::new(RedisCommand { name: "flushdb", proc: Arc::new(flushdb_command), arity: 1, flags: CmdFlags::inline() })),
        ("flushall", Arc::new(RedisCommand { name: "flushall", proc: Arc::new(flushall_command), arity: 1, flags: CmdFlags::inline() })),

        ("set", Arc::new(RedisCommand { name: "set", proc: Arc::new(set_command), arity: 3, flags: CmdFlags::bulk() })),
        ("get", Arc::new(RedisCommand { name: "get", proc: Arc::new(get_command), arity: 2, flags: CmdFlags::inline() })),
        ("getset", Arc::new(RedisCommand { name: "getset", proc: Arc::new(getset_command), arity: 3, flags: CmdFlags::bulk() })),
        ("mget", Arc::new(RedisCommand { name: "mget", proc: Arc::new(mget_command), arity: -2, flags: CmdFlags::inline() })),
        ("setnx", Arc::new(RedisCommand { name: "setnx", proc: Arc::new(setnx_command), arity: 3, flags: CmdFlags::bulk() })),
        ("mset", Arc::new(RedisCommand { name: "mset", proc: Arc::new(mset_command), arity: -3, flags: CmdFlags::bulk() })),
        ("msetnx", Arc::new(RedisCommand { name: "msetnx", proc: Arc::new(msetnx_command), arity: -3, flags: CmdFlags::bulk() })),
        ("incr", Arc::new(RedisCommand { name: "incr", proc: Arc::new(incr_command), arity: 2, flags: CmdFlags::inline() })),
        ("incrby", Arc::new(RedisCommand { name: "incrby", proc: Arc::new(incrby_command), arity: 3, flags: CmdFlags::inline() })),
        ("decr", Arc::new(RedisCommand { name: "decr", proc: Arc::new(decr_command), arity: 2, flags: CmdFlags::inline() })),
        ("decrby", Arc::new(RedisCommand { name: "decrby", proc: Arc::new(decrby_command), arity: 3, flags: CmdFlags::inline() })),

        ("lpush", Arc::new(RedisCommand { name: "lpush", proc: Arc::new(lpush_command), arity: 3, flags: CmdFlags::bulk() })),
        ("rpush", Arc::new(RedisCommand { name: "rpush", proc: Arc::new(rpush_command), arity: 3, flags: CmdFlags::bulk() })),
        ("llen", Arc::new(RedisCommand { name: "llen", proc: Arc::new(llen_command), arity: 2, flags: CmdFlags::inline() })),
        ("lrange", Arc::new(RedisCommand { name: "lrange", proc: Arc::new(lrange_command), arity: 4, flags: CmdFlags::inline() })),
        ("ltrim", Arc::new(RedisCommand { name: "ltrim", proc: Arc::new(ltrim_command), arity: 4, flags: CmdFlags::inline() })),
        ("lindex", Arc::new(RedisCommand { name: "lindex", proc: Arc::new(lindex_command), arity: 3, flags: CmdFlags::inline() })),
        ("lset", Arc::new(RedisCommand { name: "lset", proc: Arc::new(lset_command), arity: 4, flags: CmdFlags::bulk() })),
        ("lrem", Arc::new(RedisCommand { name: "lrem", proc: Arc::new(lrem_command), arity: 4, flags: CmdFlags::bulk() })),
        ("lpop", Arc::new(RedisCommand { name: "lpop", proc: Arc::new(lpop_command), arity: 2, flags: CmdFlags::inline() })),
        ("rpop", Arc::new(RedisCommand { name: "rpop", proc: Arc::new(rpop_command), arity: 2, flags: CmdFlags::inline() })),
        ("rpoplpush", Arc::new(RedisCommand { name: "rpoplpush", proc: Arc::new(rpoplpush_command), arity: 3, flags: CmdFlags::inline() })),

        ("sadd", Arc::new(RedisCommand { name: "sadd", proc: Arc::new(sadd_command), arity: 3, flags: CmdFlags::bulk() })),
        ("srem", Arc::new(RedisCommand { name: "srem", proc: Arc::new(srem_command), arity: 3, flags: CmdFlags::bulk() })),
        ("spop", Arc::new(RedisCommand { name: "spop", proc: Arc::new(spop_command), arity: 2, flags: CmdFlags::inline() })),
        ("smove", Arc::new(RedisCommand { name: "smove", proc: Arc::new(smove_command), arity: 4, flags: CmdFlags::bulk() })),
        ("scard", Arc::new(RedisCommand { name: "scard", proc: Arc::new(scard_command), arity: 2, flags: CmdFlags::inline() })),
        ("sismember", Arc::new(RedisCommand { name: "sismember", proc: Arc::new(sismember_command), arity: 3, flags: CmdFlags::bulk() })),
        ("sinter", Arc::new(RedisCommand { name: "sinter", proc: Arc::new(sinter_command), arity: -2, flags: CmdFlags::inline() })),
        ("sinterstore", Arc::new(RedisCommand { name: "sinterstore", proc: Arc::new(sinterstore_command), arity: -3, flags: CmdFlags::inline() })),
        ("sunion", Arc::new(RedisCommand { name: "sunion", proc: Arc::new(sunion_command), arity: -2, flags: CmdFlags::inline() })),
        ("sunionstore", Arc::new(RedisCommand { name: "sunionstore", proc: Arc::new(sunionstore_command), arity: -3, flags: CmdFlags::inline() })),
        ("sdiff", Arc::new(RedisCommand { name: "sdiff", proc: Arc::new(sdiff_command), arity: -2, flags: CmdFlags::inline() })),
        ("sdiffstore", Arc::new(RedisCommand { name: "sdiffstore", proc: Arc::new(sdiffstore_command), arity: -3, flags: CmdFlags::inline() })),
        ("smembers", Arc::new(RedisCommand { name: "smembers", proc: Arc::new(sinter_command), arity: 2, flags: CmdFlags::inline() })),
        ("srandmember", Arc::new(RedisCommand { name: "srandmember", proc: Arc::new(srandmember_command), arity: 2, flags: CmdFlags::inline() })),

        ("save", Arc::new(RedisCommand { name: "save", proc: Arc::new(save_command), arity: 1, flags: CmdFlags::inline() })),
        ("bgsave", Arc::new(RedisCommand { name: "bgsave", proc: Arc::new(bgsave_command), arity: 1, flags: CmdFlags::inline() })),
        ("lastsave", Arc::new(RedisCommand { name: "lastsave", proc: Arc::new(lastsave_command), arity: 1, flags: CmdFlags::inline() })),
        ("shutdown", Arc::new(RedisCommand { name: "shutdown", proc: Arc::new(shutdown_command), arity: 1, flags: CmdFlags::inline() })),
    ])
});

/// Case-insensitive command lookup by raw argv[0] bytes.
pub fn lookup_command(name: &[u8]) -> Option<Arc<RedisCommand>> {
    let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
    CMD_TABLE.get(name.as_str()).cloned()
}

/// Resolve argv[0], check arity, execute, and release argv/arm the writable
/// handler. Returns `false` if the client was destroyed (QUIT).
pub fn dispatch_command(client: &Arc<RwLock<RedisClient>>) -> bool {
    let argv = client.read().unwrap().argv.clone();
    if argv.is_empty() {
        RedisClient::finish_dispatch(client);
        return true;
    }
    let cmd_name = argv[0].read().unwrap().as_bytes().to_ascii_lowercase();

    if cmd_name == b"quit" {
        let fd = client.read().unwrap().fd();
        RedisClient::destroy(fd);
        return false;
    }

    match lookup_command(&cmd_name) {
        None => {
            client.write().unwrap().reply_str("-ERR unknown command\r\n");
        },
        Some(cmd) => {
            let argc = argv.len() as i32;
            let arity_ok = if cmd.arity >= 0 { argc == cmd.arity } else { argc >= -cmd.arity };
            if !arity_ok {
                client.write().unwrap().reply_str("-ERR wrong number of arguments\r\n");
            } else {
                call(client, &cmd);
            }
        },
    }
    RedisClient::finish_dispatch(client);
    true
}

fn call(client: &Arc<RwLock<RedisClient>>, cmd: &Arc<RedisCommand>) {
    server_write().stat_numcommands += 1;
    (cmd.proc)(client);
}

// ---------------------------------------------------------------------
// Reply helpers shared by every command (§4.4, §6).
// ---------------------------------------------------------------------

fn reply_ok(client: &Arc<RwLock<RedisClient>>) {
    client.write().unwrap().reply_shared(OK.clone());
}

fn reply_err(client: &Arc<RwLock<RedisClient>>, msg: &str) {
    client.write().unwrap().reply_str(&format!("-ERR {}\r\n", msg));
}

fn reply_nil(client: &Arc<RwLock<RedisClient>>) {
    client.write().unwrap().reply_shared(NULL_BULK.clone());
}

fn reply_nil_multi(client: &Arc<RwLock<RedisClient>>) {
    client.write().unwrap().reply_shared(NULL_MULTI_BULK.clone());
}

fn reply_wrong_type(client: &Arc<RwLock<RedisClient>>) {
    client.write().unwrap().reply_shared(WRONG_TYPE_ERR.clone());
}

fn reply_integer(client: &Arc<RwLock<RedisClient>>, n: i64) {
    let mut c = client.write().unwrap();
    match n {
        0 => c.reply_shared(C_ZERO.clone()),
        1 => c.reply_shared(C_ONE.clone()),
        _ => c.reply_str(&format!("{}\r\n", n)),
    }
}

/// Render a STRING object as a reply fragment. Integer-encoded values still
/// go out as a length-prefixed bulk (the encoding is an internal storage
/// detail, invisible on the wire); raw byte values use the length-prefixed
/// bulk form with a doubled trailing CRLF, per the end-to-end scenarios in
/// §8.
fn reply_bulk_object(client: &Arc<RwLock<RedisClient>>, obj: &RedisObject) {
    match obj.string() {
        Some(StringStorageType::Integer(n)) => {
            let digits = n.to_string();
            client.write().unwrap().reply_str(&format!("{}\r\n{}\r\n", digits.len(), digits));
        },
        Some(StringStorageType::Bytes(b)) => {
            let mut c = client.write().unwrap();
            c.reply_str(&format!("{}\r\n", b.len()));
            c.reply_bytes(b.clone());
            c.reply_str("\r\n\r\n");
        },
        None => reply_wrong_type(client),
    }
}

fn reply_multi_bulk(client: &Arc<RwLock<RedisClient>>, items: &[RedisObject]) {
    client.write().unwrap().reply_str(&format!("{}\r\n", items.len()));
    for it in items {
        reply_bulk_object(client, it);
    }
}

fn argv_of(client: &Arc<RwLock<RedisClient>>) -> Vec<Arc<RwLock<RedisObject>>> {
    client.read().unwrap().argv.clone()
}

fn arg_bytes(argv: &[Arc<RwLock<RedisObject>>], i: usize) -> Vec<u8> {
    argv[i].read().unwrap().as_bytes()
}

fn parse_i64(b: &[u8]) -> Option<i64> {
    std::str::from_utf8(b).ok()?.parse().ok()
}

fn current_db(client: &Arc<RwLock<RedisClient>>) -> Arc<RwLock<RedisDB>> {
    let idx = client.read().unwrap().db_index;
    server_read().dbs[idx].clone()
}

fn touch_dirty() {
    server_write().dirty += 1;
}

fn delete_if_empty(db: &Arc<RwLock<RedisDB>>, key: &[u8], obj: &Arc<RwLock<RedisObject>>) {
    let empty = match &*obj.read().unwrap() {
        RedisObject::List { l } => l.len() == 0,
        RedisObject::Set { s } => s.len() == 0,
        _ => false,
    };
    if empty {
        db.write().unwrap().delete(key);
    }
}

/// Inclusive [start, end] window over a container of length `len`, with
/// negative indices counting from the tail (§4.6). `None` means the window
/// is empty (start>end, start past the end, or the container is empty).
fn clamp_range(len: i64, start: i64, end: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end };
    if start > end || start >= len {
        return None;
    }
    let end = end.min(len - 1);
    Some((start as usize, end as usize))
}

// ---------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------

fn ping_command(client: &Arc<RwLock<RedisClient>>) {
    client.write().unwrap().reply_shared(PONG.clone());
}

// ---------------------------------------------------------------------
// Type-agnostic (§4.6)
// ---------------------------------------------------------------------

fn exists_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let exists = db.read().unwrap().exists(&key);
    reply_integer(client, exists as i64);
}

fn del_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let db = current_db(client);
    let mut count = 0i64;
    for i in 1..argv.len() {
        let key = arg_bytes(&argv, i);
        if db.write().unwrap().delete(&key) {
            count += 1;
        }
    }
    if count > 0 {
        touch_dirty();
    }
    reply_integer(client, count);
}

fn type_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        Some(obj) => {
            let name = obj.read().unwrap().type_name();
            client.write().unwrap().reply_str(&format!("+{}\r\n", name));
        },
        None => client.write().unwrap().reply_str("+none\r\n"),
    }
}

fn keys_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let pattern = arg_bytes(&argv, 1);
    let db = current_db(client);
    let matches: Vec<Vec<u8>> = db.read().unwrap().dict.keys().filter(|k| string_match(&pattern, k, false)).cloned().collect();
    if matches.is_empty() {
        client.write().unwrap().reply_str("0\r\n\r\n");
        return;
    }
    let mut joined: Vec<u8> = Vec::new();
    for (i, k) in matches.iter().enumerate() {
        if i > 0 {
            joined.push(b' ');
        }
        joined.extend_from_slice(k);
    }
    let mut c = client.write().unwrap();
    c.reply_str(&format!("{}\r\n", joined.len()));
    c.reply_bytes(joined);
    c.reply_str("\r\n");
}

fn randomkey_command(client: &Arc<RwLock<RedisClient>>) {
    let db = current_db(client);
    match db.read().unwrap().random_key() {
        Some(k) => reply_bulk_object(client, &RedisObject::String { ptr: StringStorageType::Bytes(k) }),
        None => reply_nil(client),
    }
}

fn rename_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let src = arg_bytes(&argv, 1);
    let dst = arg_bytes(&argv, 2);
    if src == dst {
        reply_err(client, "source and destination objects are the same");
        return;
    }
    let db = current_db(client);
    let value = match db.read().unwrap().lookup(&src) {
        Some(v) => v,
        None => {
            reply_err(client, "no such key");
            return;
        },
    };
    let mut dbw = db.write().unwrap();
    dbw.set(dst, value);
    dbw.delete(&src);
    drop(dbw);
    touch_dirty();
    reply_ok(client);
}

fn renamenx_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let src = arg_bytes(&argv, 1);
    let dst = arg_bytes(&argv, 2);
    if src == dst {
        client.write().unwrap().reply_shared(SAME_OBJECT_ERR.clone());
        return;
    }
    let db = current_db(client);
    let value = match db.read().unwrap().lookup(&src) {
        Some(v) => v,
        None => {
            client.write().unwrap().reply_shared(NO_KEY_ERR.clone());
            return;
        },
    };
    if db.read().unwrap().exists(&dst) {
        reply_integer(client, 0);
        return;
    }
    let mut dbw = db.write().unwrap();
    dbw.set(dst, value);
    dbw.delete(&src);
    drop(dbw);
    touch_dirty();
    reply_integer(client, 1);
}

fn move_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let dst_idx = match parse_i64(&arg_bytes(&argv, 2)) {
        Some(n) => n,
        None => {
            reply_err(client, "index out of range");
            return;
        },
    };
    if !valid_db_index(dst_idx) {
        client.write().unwrap().reply_shared(OUT_OF_RANGE_ERR.clone());
        return;
    }
    let src_idx = client.read().unwrap().db_index as i64;
    if dst_idx == src_idx {
        client.write().unwrap().reply_shared(SAME_OBJECT_ERR.clone());
        return;
    }
    let src_db = server_read().dbs[src_idx as usize].clone();
    let dst_db = server_read().dbs[dst_idx as usize].clone();
    let value = match src_db.read().unwrap().lookup(&key) {
        Some(v) => v,
        None => {
            reply_integer(client, 0);
            return;
        },
    };
    if dst_db.read().unwrap().exists(&key) {
        reply_integer(client, 0);
        return;
    }
    dst_db.write().unwrap().set(key.clone(), value);
    src_db.write().unwrap().delete(&key);
    touch_dirty();
    reply_integer(client, 1);
}

fn dbsize_command(client: &Arc<RwLock<RedisClient>>) {
    let db = current_db(client);
    let n = db.read().unwrap().dict.len();
    reply_integer(client, n as i64);
}

fn select_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let idx = match parse_i64(&arg_bytes(&argv, 1)) {
        Some(n) => n,
        None => {
            reply_err(client, "invalid DB index");
            return;
        },
    };
    if !valid_db_index(idx) {
        reply_err(client, "invalid DB index");
        return;
    }
    client.write().unwrap().db_index = idx as usize;
    reply_ok(client);
}

fn flushdb_command(client: &Arc<RwLock<RedisClient>>) {
    let db = current_db(client);
    db.write().unwrap().flush();
    touch_dirty();
    reply_ok(client);
}

fn flushall_command(client: &Arc<RwLock<RedisClient>>) {
    server_write().flush_all();
    touch_dirty();
    reply_ok(client);
}

// ---------------------------------------------------------------------
// Strings (§4.6)
// ---------------------------------------------------------------------

fn set_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let value = try_object_encoding(argv[2].clone());
    db.write().unwrap().set(key, value);
    touch_dirty();
    reply_ok(client);
}

fn get_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_nil(client),
        Some(obj) => {
            let g = obj.read().unwrap();
            if g.is_string() {
                reply_bulk_object(client, &g);
            } else {
                drop(g);
                reply_wrong_type(client);
            }
        },
    }
}

fn getset_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let old = db.read().unwrap().lookup(&key);
    let old_string = old.as_ref().and_then(|o| {
        let g = o.read().unwrap();
        if g.is_string() {
            Some(g.clone())
        } else {
            None
        }
    });
    let new_val = try_object_encoding(argv[2].clone());
    db.write().unwrap().set(key, new_val);
    touch_dirty();
    match old_string {
        Some(v) => reply_bulk_object(client, &v),
        None => reply_nil(client),
    }
}

fn mget_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let db = current_db(client);
    client.write().unwrap().reply_str(&format!("{}\r\n", argv.len() - 1));
    for i in 1..argv.len() {
        let key = arg_bytes(&argv, i);
        match db.read().unwrap().lookup(&key) {
            Some(obj) => {
                let g = obj.read().unwrap();
                if g.is_string() {
                    reply_bulk_object(client, &g);
                } else {
                    drop(g);
                    client.write().unwrap().reply_shared(NULL_BULK.clone());
                }
            },
            None => client.write().unwrap().reply_shared(NULL_BULK.clone()),
        }
    }
}

fn setnx_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    if db.read().unwrap().exists(&key) {
        reply_integer(client, 0);
        return;
    }
    db.write().unwrap().set(key, try_object_encoding(argv[2].clone()));
    touch_dirty();
    reply_integer(client, 1);
}

fn mset_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    if (argv.len() - 1) % 2 != 0 {
        reply_err(client, "wrong number of arguments for MSET");
        return;
    }
    let db = current_db(client);
    let mut i = 1;
    while i + 1 < argv.len() {
        let key = arg_bytes(&argv, i);
        let val = try_object_encoding(argv[i + 1].clone());
        db.write().unwrap().set(key, val);
        i += 2;
    }
    touch_dirty();
    reply_ok(client);
}

fn msetnx_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    if (argv.len() - 1) % 2 != 0 {
        reply_err(client, "wrong number of arguments for MSETNX");
        return;
    }
    let db = current_db(client);
    let mut i = 1;
    let mut any_exists = false;
    while i + 1 < argv.len() {
        let key = arg_bytes(&argv, i);
        if db.read().unwrap().exists(&key) {
            any_exists = true;
            break;
        }
        i += 2;
    }
    if any_exists {
        reply_integer(client, 0);
        return;
    }
    let mut i = 1;
    while i + 1 < argv.len() {
        let key = arg_bytes(&argv, i);
        let val = try_object_encoding(argv[i + 1].clone());
        db.write().unwrap().set(key, val);
        i += 2;
    }
    touch_dirty();
    reply_integer(client, 1);
}

fn incr_by(client: &Arc<RwLock<RedisClient>>, delta: i64) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let current = match db.read().unwrap().lookup(&key) {
        None => 0i64,
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.string() {
                Some(StringStorageType::Integer(n)) => *n,
                Some(StringStorageType::Bytes(b)) => match parse_i64(b) {
                    Some(n) => n,
                    None => {
                        drop(g);
                        reply_err(client, "value is not an integer or out of range");
                        return;
                    },
                },
                None => {
                    drop(g);
                    reply_wrong_type(client);
                    return;
                },
            }
        },
    };
    let new_val = match current.checked_add(delta) {
        Some(n) => n,
        None => {
            reply_err(client, "increment or decrement would overflow");
            return;
        },
    };
    db.write().unwrap().set(key, create_object(RedisObject::String { ptr: StringStorageType::Integer(new_val) }));
    touch_dirty();
    reply_integer(client, new_val);
}

fn incr_command(client: &Arc<RwLock<RedisClient>>) {
    incr_by(client, 1);
}

fn decr_command(client: &Arc<RwLock<RedisClient>>) {
    incr_by(client, -1);
}

fn incrby_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    match parse_i64(&arg_bytes(&argv, 2)) {
        Some(delta) => incr_by(client, delta),
        None => reply_err(client, "value is not an integer or out of range"),
    }
}

fn decrby_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    match parse_i64(&arg_bytes(&argv, 2)) {
        Some(delta) => incr_by(client, -delta),
        None => reply_err(client, "value is not an integer or out of range"),
    }
}

// ---------------------------------------------------------------------
// Lists (§4.6)
// ---------------------------------------------------------------------

fn push(client: &Arc<RwLock<RedisClient>>, front: bool) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let value = argv[2].read().unwrap().clone();
    match db.read().unwrap().lookup(&key) {
        None => {
            let mut l = ListStorageType::new();
            if front {
                l.push_front(value);
            } else {
                l.push_back(value);
            }
            db.write().unwrap().set(key, create_object(RedisObject::List { l }));
        },
        Some(obj) => {
            let mut g = obj.write().unwrap();
            match g.list_mut() {
                Some(l) => {
                    if front {
                        l.push_front(value);
                    } else {
                        l.push_back(value);
                    }
                },
                None => {
                    drop(g);
                    reply_wrong_type(client);
                    return;
                },
            }
        },
    }
    touch_dirty();
    reply_ok(client);
}

fn lpush_command(client: &Arc<RwLock<RedisClient>>) {
    push(client, true);
}

fn rpush_command(client: &Arc<RwLock<RedisClient>>) {
    push(client, false);
}

fn llen_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_integer(client, 0),
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.list() {
                Some(l) => reply_integer(client, l.len() as i64),
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
            }
        },
    }
}

fn lrange_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let (Some(start), Some(end)) = (parse_i64(&arg_bytes(&argv, 2)), parse_i64(&arg_bytes(&argv, 3))) else {
        reply_err(client, "value is not an integer or out of range");
        return;
    };
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => {
            client.write().unwrap().reply_shared(EMPTY_MULTI_BULK.clone());
        },
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.list() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(l) => match clamp_range(l.len() as i64, start, end) {
                    None => {
                        drop(g);
                        client.write().unwrap().reply_shared(EMPTY_MULTI_BULK.clone());
                    },
                    Some((s, e)) => {
                        let items = l.range(s, e);
                        drop(g);
                        reply_multi_bulk(client, &items);
                    },
                },
            }
        },
    }
}

fn ltrim_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let (Some(start), Some(end)) = (parse_i64(&arg_bytes(&argv, 2)), parse_i64(&arg_bytes(&argv, 3))) else {
        reply_err(client, "value is not an integer or out of range");
        return;
    };
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_ok(client),
        Some(obj) => {
            let emptied;
            {
                let mut g = obj.write().unwrap();
                match g.list_mut() {
                    None => {
                        drop(g);
                        reply_wrong_type(client);
                        return;
                    },
                    Some(l) => {
                        match clamp_range(l.len() as i64, start, end) {
                            None => *l = ListStorageType::new(),
                            Some((s, e)) => l.retain_range(s, e),
                        }
                        emptied = l.len() == 0;
                    },
                }
            }
            if emptied {
                db.write().unwrap().delete(&key);
            }
            touch_dirty();
            reply_ok(client);
        },
    }
}

fn lindex_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let Some(idx) = parse_i64(&arg_bytes(&argv, 2)) else {
        reply_err(client, "value is not an integer or out of range");
        return;
    };
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_nil(client),
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.list() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(l) => {
                    let len = l.len() as i64;
                    let real = if idx < 0 { len + idx } else { idx };
                    if real < 0 || real >= len {
                        drop(g);
                        reply_nil(client);
                    } else {
                        let e = l.index(real as usize).unwrap();
                        drop(g);
                        reply_bulk_object(client, &e);
                    }
                },
            }
        },
    }
}

fn lset_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let Some(idx) = parse_i64(&arg_bytes(&argv, 2)) else {
        reply_err(client, "value is not an integer or out of range");
        return;
    };
    let value = argv[3].read().unwrap().clone();
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_err(client, "no such key"),
        Some(obj) => {
            let mut g = obj.write().unwrap();
            match g.list_mut() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(l) => {
                    let len = l.len() as i64;
                    let real = if idx < 0 { len + idx } else { idx };
                    if real < 0 || real >= len {
                        drop(g);
                        client.write().unwrap().reply_shared(OUT_OF_RANGE_ERR.clone());
                    } else {
                        l.set(real as usize, value);
                        drop(g);
                        touch_dirty();
                        reply_ok(client);
                    }
                },
            }
        },
    }
}

fn lrem_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let Some(count) = parse_i64(&arg_bytes(&argv, 2)) else {
        reply_err(client, "value is not an integer or out of range");
        return;
    };
    let target = RedisObject::String { ptr: StringStorageType::Bytes(arg_bytes(&argv, 3)) };
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_integer(client, 0),
        Some(obj) => {
            let removed;
            let emptied;
            {
                let mut g = obj.write().unwrap();
                match g.list_mut() {
                    None => {
                        drop(g);
                        reply_wrong_type(client);
                        return;
                    },
                    Some(l) => {
                        removed = if count >= 0 { l.remove_head(count, &target) } else { l.remove_tail(-count, &target) };
                        emptied = l.len() == 0;
                    },
                }
            }
            if emptied {
                db.write().unwrap().delete(&key);
            }
            if removed > 0 {
                touch_dirty();
            }
            reply_integer(client, removed);
        },
    }
}

fn pop(client: &Arc<RwLock<RedisClient>>, front: bool) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_nil(client),
        Some(obj) => {
            let value;
            let emptied;
            {
                let mut g = obj.write().unwrap();
                match g.list_mut() {
                    None => {
                        drop(g);
                        reply_wrong_type(client);
                        return;
                    },
                    Some(l) => {
                        value = if front { l.pop_front() } else { l.pop_back() };
                        emptied = l.len() == 0;
                    },
                }
            }
            match value {
                None => reply_nil(client),
                Some(v) => {
                    if emptied {
                        db.write().unwrap().delete(&key);
                    }
                    touch_dirty();
                    reply_bulk_object(client, &v);
                },
            }
        },
    }
}

fn lpop_command(client: &Arc<RwLock<RedisClient>>) {
    pop(client, true);
}

fn rpop_command(client: &Arc<RwLock<RedisClient>>) {
    pop(client, false);
}

fn rpoplpush_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let src_key = arg_bytes(&argv, 1);
    let dst_key = arg_bytes(&argv, 2);
    let same = src_key == dst_key;
    let db = current_db(client);

    let src_obj = match db.read().unwrap().lookup(&src_key) {
        Some(o) => o,
        None => {
            reply_nil(client);
            return;
        },
    };
    if !src_obj.read().unwrap().is_list() {
        reply_wrong_type(client);
        return;
    }
    if !same {
        if let Some(dst_obj) = db.read().unwrap().lookup(&dst_key) {
            if !dst_obj.read().unwrap().is_list() {
                reply_wrong_type(client);
                return;
            }
        }
    }

    let value = src_obj.write().unwrap().list_mut().unwrap().pop_back();
    let Some(value) = value else {
        reply_nil(client);
        return;
    };

    if same {
        src_obj.write().unwrap().list_mut().unwrap().push_front(value.clone());
    } else {
        match db.read().unwrap().lookup(&dst_key) {
            Some(dst_obj) => {
                dst_obj.write().unwrap().list_mut().unwrap().push_front(value.clone());
            },
            None => {
                let mut l = ListStorageType::new();
                l.push_front(value.clone());
                db.write().unwrap().set(dst_key, create_object(RedisObject::List { l }));
            },
        }
        delete_if_empty(&db, &src_key, &src_obj);
    }
    touch_dirty();
    reply_bulk_object(client, &value);
}

// ---------------------------------------------------------------------
// Sets (§4.6)
// ---------------------------------------------------------------------

enum SetLookup {
    Missing,
    WrongType,
    Found(SetStorageType),
}

fn lookup_set_strict(db: &RedisDB, key: &[u8]) -> SetLookup {
    match db.lookup(key) {
        None => SetLookup::Missing,
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.set() {
                Some(s) => SetLookup::Found(s.clone()),
                None => SetLookup::WrongType,
            }
        },
    }
}

/// Gather sets for union/diff, treating a missing key as an empty set but
/// still failing hard on a wrong-typed one.
fn collect_sets_lenient(db: &RedisDB, keys: &[Vec<u8>]) -> Result<Vec<SetStorageType>, ()> {
    let mut sets = Vec::with_capacity(keys.len());
    for k in keys {
        match lookup_set_strict(db, k) {
            SetLookup::Missing => sets.push(SetStorageType::new()),
            SetLookup::WrongType => return Err(()),
            SetLookup::Found(s) => sets.push(s),
        }
    }
    Ok(sets)
}

fn store_set_result(client: &Arc<RwLock<RedisClient>>, db: &Arc<RwLock<RedisDB>>, dst: &[u8], items: Vec<RedisObject>) {
    let count = items.len();
    if count == 0 {
        db.write().unwrap().delete(dst);
    } else {
        let mut s = SetStorageType::new();
        for it in items {
            s.insert(it);
        }
        db.write().unwrap().set(dst.to_vec(), create_object(RedisObject::Set { s }));
    }
    touch_dirty();
    reply_integer(client, count as i64);
}

fn sadd_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let member = RedisObject::String { ptr: StringStorageType::Bytes(arg_bytes(&argv, 2)) };
    let added = match db.read().unwrap().lookup(&key) {
        None => {
            let mut s = SetStorageType::new();
            s.insert(member);
            db.write().unwrap().set(key, create_object(RedisObject::Set { s }));
            true
        },
        Some(obj) => {
            let mut g = obj.write().unwrap();
            match g.set_mut() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                    return;
                },
                Some(s) => s.insert(member),
            }
        },
    };
    if added {
        touch_dirty();
    }
    reply_integer(client, added as i64);
}

fn srem_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let member = RedisObject::String { ptr: StringStorageType::Bytes(arg_bytes(&argv, 2)) };
    match db.read().unwrap().lookup(&key) {
        None => reply_integer(client, 0),
        Some(obj) => {
            let removed;
            let emptied;
            {
                let mut g = obj.write().unwrap();
                match g.set_mut() {
                    None => {
                        drop(g);
                        reply_wrong_type(client);
                        return;
                    },
                    Some(s) => {
                        removed = s.remove(&member);
                        emptied = s.len() == 0;
                    },
                }
            }
            if emptied {
                db.write().unwrap().delete(&key);
            }
            if removed {
                touch_dirty();
            }
            reply_integer(client, removed as i64);
        },
    }
}

fn sismember_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    let member = RedisObject::String { ptr: StringStorageType::Bytes(arg_bytes(&argv, 2)) };
    match db.read().unwrap().lookup(&key) {
        None => reply_integer(client, 0),
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.set() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(s) => reply_integer(client, s.contains(&member) as i64),
            }
        },
    }
}

fn scard_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_integer(client, 0),
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.set() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(s) => reply_integer(client, s.len() as i64),
            }
        },
    }
}

/// Gather n set handles, sort ascending by cardinality, iterate the
/// smallest testing membership in the rest (§4.6).
fn sinter_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let keys: Vec<Vec<u8>> = (1..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let mut sets = Vec::with_capacity(keys.len());
    for k in &keys {
        match lookup_set_strict(&dbg, k) {
            SetLookup::Missing => {
                drop(dbg);
                reply_nil_multi(client);
                return;
            },
            SetLookup::WrongType => {
                drop(dbg);
                reply_wrong_type(client);
                return;
            },
            SetLookup::Found(s) => sets.push(s),
        }
    }
    drop(dbg);
    sets.sort_by_key(|s| s.len());
    let (smallest, rest) = sets.split_first().unwrap();
    let result: Vec<RedisObject> = smallest.iter().filter(|m| rest.iter().all(|s| s.contains(m))).cloned().collect();
    reply_multi_bulk(client, &result);
}

fn sinterstore_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let dst = arg_bytes(&argv, 1);
    let keys: Vec<Vec<u8>> = (2..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let mut sets = Vec::with_capacity(keys.len());
    let mut empty_result = false;
    for k in &keys {
        match lookup_set_strict(&dbg, k) {
            SetLookup::Missing => empty_result = true,
            SetLookup::WrongType => {
                drop(dbg);
                reply_wrong_type(client);
                return;
            },
            SetLookup::Found(s) => sets.push(s),
        }
    }
    drop(dbg);
    let result: Vec<RedisObject> = if empty_result || sets.is_empty() {
        Vec::new()
    } else {
        sets.sort_by_key(|s| s.len());
        let (smallest, rest) = sets.split_first().unwrap();
        smallest.iter().filter(|m| rest.iter().all(|s| s.contains(m))).cloned().collect()
    };
    store_set_result(client, &db, &dst, result);
}

fn sunion_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let keys: Vec<Vec<u8>> = (1..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let sets = match collect_sets_lenient(&dbg, &keys) {
        Ok(s) => s,
        Err(()) => {
            drop(dbg);
            reply_wrong_type(client);
            return;
        },
    };
    drop(dbg);
    let mut seen: HashSet<RedisObject> = HashSet::new();
    for s in &sets {
        for m in s.iter() {
            seen.insert(m.clone());
        }
    }
    let result: Vec<RedisObject> = seen.into_iter().collect();
    reply_multi_bulk(client, &result);
}

fn sunionstore_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let dst = arg_bytes(&argv, 1);
    let keys: Vec<Vec<u8>> = (2..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let sets = match collect_sets_lenient(&dbg, &keys) {
        Ok(s) => s,
        Err(()) => {
            drop(dbg);
            reply_wrong_type(client);
            return;
        },
    };
    drop(dbg);
    let mut seen: HashSet<RedisObject> = HashSet::new();
    for s in &sets {
        for m in s.iter() {
            seen.insert(m.clone());
        }
    }
    let result: Vec<RedisObject> = seen.into_iter().collect();
    store_set_result(client, &db, &dst, result);
}

fn sdiff_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let keys: Vec<Vec<u8>> = (1..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let sets = match collect_sets_lenient(&dbg, &keys) {
        Ok(s) => s,
        Err(()) => {
            drop(dbg);
            reply_wrong_type(client);
            return;
        },
    };
    drop(dbg);
    let (first, rest) = sets.split_first().unwrap();
    let result: Vec<RedisObject> = first.iter().filter(|m| !rest.iter().any(|s| s.contains(m))).cloned().collect();
    reply_multi_bulk(client, &result);
}

fn sdiffstore_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let dst = arg_bytes(&argv, 1);
    let keys: Vec<Vec<u8>> = (2..argv.len()).map(|i| arg_bytes(&argv, i)).collect();
    let db = current_db(client);
    let dbg = db.read().unwrap();
    let sets = match collect_sets_lenient(&dbg, &keys) {
        Ok(s) => s,
        Err(()) => {
            drop(dbg);
            reply_wrong_type(client);
            return;
        },
    };
    drop(dbg);
    let result: Vec<RedisObject> = if sets.is_empty() {
        Vec::new()
    } else {
        let (first, rest) = sets.split_first().unwrap();
        first.iter().filter(|m| !rest.iter().any(|s| s.contains(m))).cloned().collect()
    };
    store_set_result(client, &db, &dst, result);
}

fn spop_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_nil(client),
        Some(obj) => {
            let member;
            let emptied;
            {
                let mut g = obj.write().unwrap();
                match g.set_mut() {
                    None => {
                        drop(g);
                        reply_wrong_type(client);
                        return;
                    },
                    Some(s) => {
                        member = s.get_random_key();
                        if let Some(ref m) = member {
                            s.remove(m);
                        }
                        emptied = s.len() == 0;
                    },
                }
            }
            match member {
                None => reply_nil(client),
                Some(m) => {
                    if emptied {
                        db.write().unwrap().delete(&key);
                    }
                    touch_dirty();
                    reply_bulk_object(client, &m);
                },
            }
        },
    }
}

fn smove_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let src = arg_bytes(&argv, 1);
    let dst = arg_bytes(&argv, 2);
    let member = RedisObject::String { ptr: StringStorageType::Bytes(arg_bytes(&argv, 3)) };
    let db = current_db(client);

    let src_obj = match db.read().unwrap().lookup(&src) {
        Some(o) => o,
        None => {
            reply_integer(client, 0);
            return;
        },
    };
    if !src_obj.read().unwrap().is_set() {
        reply_wrong_type(client);
        return;
    }
    if let Some(dst_obj) = db.read().unwrap().lookup(&dst) {
        if !dst_obj.read().unwrap().is_set() {
            reply_wrong_type(client);
            return;
        }
    }

    let removed = src_obj.write().unwrap().set_mut().unwrap().remove(&member);
    if !removed {
        reply_integer(client, 0);
        return;
    }
    delete_if_empty(&db, &src, &src_obj);

    match db.read().unwrap().lookup(&dst) {
        Some(dst_obj) => {
            dst_obj.write().unwrap().set_mut().unwrap().insert(member);
        },
        None => {
            let mut s = SetStorageType::new();
            s.insert(member);
            db.write().unwrap().set(dst, create_object(RedisObject::Set { s }));
        },
    }
    touch_dirty();
    reply_integer(client, 1);
}

fn srandmember_command(client: &Arc<RwLock<RedisClient>>) {
    let argv = argv_of(client);
    let key = arg_bytes(&argv, 1);
    let db = current_db(client);
    match db.read().unwrap().lookup(&key) {
        None => reply_nil(client),
        Some(obj) => {
            let g = obj.read().unwrap();
            match g.set() {
                None => {
                    drop(g);
                    reply_wrong_type(client);
                },
                Some(s) => match s.get_random_key() {
                    Some(m) => {
                        drop(g);
                        reply_bulk_object(client, &m);
                    },
                    None => {
                        drop(g);
                        reply_nil(client);
                    },
                },
            }
        },
    }
}

// ---------------------------------------------------------------------
// Persistence (§4.7, §4.8)
// ---------------------------------------------------------------------

fn save_command(client: &Arc<RwLock<RedisClient>>) {
    match rdb_save() {
        Ok(()) => reply_ok(client),
        Err(e) => reply_err(client, &e),
    }
}

fn bgsave_command(client: &Arc<RwLock<RedisClient>>) {
    match rdb_save_background() {
        Ok(()) => client.write().unwrap().reply_str("+Background saving started\r\n"),
        Err(e) => reply_err(client, &e),
    }
}

fn lastsave_command(client: &Arc<RwLock<RedisClient>>) {
    let ts = server_read().last_save;
    reply_integer(client, ts as i64);
}

fn shutdown_command(client: &Arc<RwLock<RedisClient>>) {
    match rdb_save() {
        Ok(()) => exit(1),
        Err(e) => reply_err(client, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Reset the global keyspace to `n` empty databases. Mirrors the
    /// convention in server.rs/rdb.rs tests: the server state is a process
    /// singleton, so each test rebuilds the slice of dbs it needs.
    fn reset_dbs(n: usize) {
        server_write().dbs = (0..n).map(|_| Arc::new(RwLock::new(RedisDB::new()))).collect();
    }

    static NEXT_FD: AtomicI32 = AtomicI32::new(-2);

    fn test_client() -> Arc<RwLock<RedisClient>> {
        let fd = NEXT_FD.fetch_sub(1, Ordering::SeqCst);
        RedisClient::create(fd)
    }

    fn set_argv(client: &Arc<RwLock<RedisClient>>, args: &[&[u8]]) {
        let mut c = client.write().unwrap();
        c.argv = args.iter().map(|a| create_object(RedisObject::String { ptr: StringStorageType::Bytes(a.to_vec()) })).collect();
    }

    fn drain_reply(client: &Arc<RwLock<RedisClient>>) -> Vec<u8> {
        let mut c = client.write().unwrap();
        let mut out = Vec::new();
        while let Some(node) = c.reply.pop_front() {
            out.extend_from_slice(&node.read().unwrap().as_bytes());
        }
        out
    }

    #[test]
    fn set_then_get_roundtrips() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"set", b"foo", b"hello"]);
        set_command(&client);
        assert_eq!(drain_reply(&client), b"+OK\r\n".to_vec());

        set_argv(&client, &[b"get", b"foo"]);
        get_command(&client);
        assert_eq!(drain_reply(&client), b"5\r\nhello\r\n\r\n".to_vec());
    }

    #[test]
    fn setnx_only_installs_once() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"setnx", b"k", b"v1"]);
        setnx_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());

        set_argv(&client, &[b"setnx", b"k", b"v2"]);
        setnx_command(&client);
        assert_eq!(drain_reply(&client), b"0\r\n".to_vec());

        set_argv(&client, &[b"get", b"k"]);
        get_command(&client);
        assert_eq!(drain_reply(&client), b"2\r\nv1\r\n\r\n".to_vec());
    }

    #[test]
    fn incr_and_incrby_accumulate() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"incr", b"n"]);
        incr_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());

        set_argv(&client, &[b"incrby", b"n", b"10"]);
        incrby_command(&client);
        assert_eq!(drain_reply(&client), b"11\r\n".to_vec());

        set_argv(&client, &[b"get", b"n"]);
        get_command(&client);
        assert_eq!(drain_reply(&client), b"2\r\n11\r\n".to_vec());
    }

    #[test]
    fn keys_with_no_match_emits_zero_length_and_crlf() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"keys", b"*"]);
        keys_command(&client);
        assert_eq!(drain_reply(&client), b"0\r\n\r\n".to_vec());
    }

    #[test]
    fn lpush_and_rpush_order_differently() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"lpush", b"l", b"a"]);
        lpush_command(&client);
        drain_reply(&client);
        set_argv(&client, &[b"lpush", b"l", b"b"]);
        lpush_command(&client);
        drain_reply(&client);

        set_argv(&client, &[b"lrange", b"l", b"0", b"-1"]);
        lrange_command(&client);
        assert_eq!(drain_reply(&client), b"2\r\n1\r\nb\r\n\r\n1\r\na\r\n\r\n".to_vec());
    }

    #[test]
    fn sadd_is_idempotent_and_scard_tracks_it() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"sadd", b"s", b"a"]);
        sadd_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());

        set_argv(&client, &[b"sadd", b"s", b"a"]);
        sadd_command(&client);
        assert_eq!(drain_reply(&client), b"0\r\n".to_vec());

        set_argv(&client, &[b"scard", b"s"]);
        scard_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());
    }

    #[test]
    fn sinter_intersects_across_sets() {
        reset_dbs(1);
        let client = test_client();
        for (key, members) in [("s1", ["a", "b", "c"]), ("s2", ["b", "c", "d"]), ("s3", ["b", "c", "e"])] {
            for m in members {
                set_argv(&client, &[b"sadd", key.as_bytes(), m.as_bytes()]);
                sadd_command(&client);
                drain_reply(&client);
            }
        }
        set_argv(&client, &[b"sinter", b"s1", b"s2", b"s3"]);
        sinter_command(&client);
        let reply = drain_reply(&client);
        // Count line is "2\r\n"; members "b" and "c" each show up as a bulk pair.
        assert!(reply.starts_with(b"2\r\n"));
        assert!(reply.windows(5).any(|w| w == b"1\r\nb\r"));
        assert!(reply.windows(5).any(|w| w == b"1\r\nc\r"));
        assert!(!reply.windows(5).any(|w| w == b"1\r\na\r"));
    }

    #[test]
    fn renamenx_rejects_same_key_with_sentinel() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"set", b"a", b"1"]);
        set_command(&client);
        drain_reply(&client);

        set_argv(&client, &[b"renamenx", b"a", b"a"]);
        renamenx_command(&client);
        assert_eq!(drain_reply(&client), b"-3\r\n".to_vec());
    }

    #[test]
    fn del_and_exists_track_key_presence() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"set", b"k", b"v"]);
        set_command(&client);
        drain_reply(&client);

        set_argv(&client, &[b"exists", b"k"]);
        exists_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());

        set_argv(&client, &[b"del", b"k"]);
        del_command(&client);
        assert_eq!(drain_reply(&client), b"1\r\n".to_vec());

        set_argv(&client, &[b"exists", b"k"]);
        exists_command(&client);
        assert_eq!(drain_reply(&client), b"0\r\n".to_vec());
    }

    #[test]
    fn dispatch_rejects_unknown_commands_and_bad_arity() {
        reset_dbs(1);
        let client = test_client();
        set_argv(&client, &[b"bogus"]);
        assert!(dispatch_command(&client));
        assert_eq!(drain_reply(&client), b"-ERR unknown command\r\n".to_vec());

        set_argv(&client, &[b"get"]);
        assert!(dispatch_command(&client));
        assert_eq!(drain_reply(&client), b"-ERR wrong number of arguments\r\n".to_vec());
    }
}

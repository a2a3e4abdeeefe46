//! Server-wide state: the `RedisServer` singleton (config, counters and
//! listening socket), the `RedisDB` keyspace, and the config-file loader.

use std::collections::HashMap;
use std::env::set_current_dir;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read};
use std::process::{exit, id};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use libc::{close, dup2, fclose, fopen, fork, fprintf, getpid, open, pid_t, setsid, signal, FILE, O_RDWR, SIGHUP, SIGPIPE, SIG_IGN, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use once_cell::sync::Lazy;
use rand::Rng;

use crate::eventloop::{create_file_event, create_time_event, Mask};
use crate::handler::{accept_handler, server_cron};
use crate::net::tcp_server;
use crate::obj::RedisObject;
use crate::util::{log, oom, timestamp, LogLevel};

const DEFAULT_DBNUM: i32 = 16;
const DEFAULT_PORT: u16 = 6379;
const DEFAULT_MAX_IDLE_TIME: i32 = 60 * 5;
/// A DB's hash table is shrunk once its capacity exceeds this floor and the
/// fill factor drops below 10% (§4.9).
pub const DB_SHRINK_FLOOR: usize = 16384;

static REDIS_VERSION: &str = "1.0.0";

pub static SERVER: Lazy<Arc<RwLock<RedisServer>>> = Lazy::new(|| Arc::new(RwLock::new(RedisServer::new())));

pub fn server_read() -> RwLockReadGuard<'static, RedisServer> {
    SERVER.read().unwrap()
}
pub fn server_write() -> RwLockWriteGuard<'static, RedisServer> {
    SERVER.write().unwrap()
}

pub struct SaveParam {
    pub seconds: u64,
    pub changes: u64,
}

/// One logical keyspace. Keys are plain byte vectors rather than Value
/// Objects: `HashMap` needs an owned `Eq + Hash` key and a raw byte vector
/// is the idiomatic fit (see DESIGN.md); stored values keep the full
/// refcounted Value Object representation.
pub struct RedisDB {
    pub dict: HashMap<Vec<u8>, Arc<RwLock<RedisObject>>>,
}

impl RedisDB {
    pub fn new() -> RedisDB {
        RedisDB { dict: HashMap::new() }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<Arc<RwLock<RedisObject>>> {
        self.dict.get(key).cloned()
    }

    pub fn set(&mut self, key: Vec<u8>, value: Arc<RwLock<RedisObject>>) {
        self.dict.insert(key, value);
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.dict.remove(key).is_some()
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.dict.contains_key(key)
    }

    pub fn random_key(&self) -> Option<Vec<u8>> {
        if self.dict.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.dict.len());
        self.dict.keys().nth(idx).cloned()
    }

    pub fn flush(&mut self) -> usize {
        let n = self.dict.len();
        self.dict.clear();
        n
    }

    /// Reclaim excess hash-table capacity once usage falls below 10% of
    /// capacity and that capacity exceeds `DB_SHRINK_FLOOR` (§4.9).
    pub fn maybe_shrink(&mut self) {
        let cap = self.dict.capacity();
        if cap > DB_SHRINK_FLOOR && self.dict.len() * 10 < cap {
            self.dict.shrink_to_fit();
        }
    }
}

pub struct RedisServer {
    port: u16,
    bind_addr: String,
    pub fd: i32,
    pub dbs: Vec<Arc<RwLock<RedisDB>>>,
    dbnum: i32,
    pub dirty: u64,
    cron_loops: u64,
    pub last_save: u64,
    stat_starttime: u64,
    pub stat_numcommands: u64,
    pub stat_numconnections: u64,
    verbosity: LogLevel,
    max_idle_time: i32,
    pub daemonize: bool,
    pid_file: String,
    save_params: Vec<SaveParam>,
    log_file: String,
    pub db_filename: String,
    pub bg_save_child_pid: pid_t,
}

impl RedisServer {
    pub fn new() -> RedisServer {
        let now = timestamp().as_secs();
        RedisServer {
            port: DEFAULT_PORT,
            bind_addr: String::new(),
            fd: -1,
            dbs: Vec::new(),
            dbnum: DEFAULT_DBNUM,
            dirty: 0,
            cron_loops: 0,
            last_save: now,
            stat_starttime: now,
            stat_numcommands: 0,
            stat_numconnections: 0,
            verbosity: LogLevel::Notice,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            daemonize: false,
            pid_file: "/var/run/rredis.pid".to_string(),
            save_params: vec![
                SaveParam { seconds: 3600, changes: 1 },
                SaveParam { seconds: 300, changes: 100 },
                SaveParam { seconds: 60, changes: 10000 },
            ],
            log_file: String::new(),
            db_filename: "dump.rdb".to_string(),
            bg_save_child_pid: -1,
        }
    }

    /// Wire up the listening socket, the keyspace, and the recurring event
    /// loop registrations. Called once after config load has fixed the
    /// final port/bind/dbnum.
    pub fn init_server(&mut self) {
        unsafe {
            signal(SIGHUP, SIG_IGN);
            signal(SIGPIPE, SIG_IGN);
        }

        match tcp_server(self.port, &self.bind_addr) {
            Ok(fd) => self.fd = fd,
            Err(e) => {
                log(LogLevel::Warning, &format!("Opening TCP port: {}", e));
                exit(1);
            },
        }

        self.dbs = (0..self.dbnum).map(|_| Arc::new(RwLock::new(RedisDB::new()))).collect();

        create_time_event(1, Arc::new(server_cron), None, None);
        if let Err(e) = create_file_event(self.fd, Mask::Readable, Arc::new(accept_handler)) {
            oom(&e);
        }
    }

    pub fn reset_server_save_params(&mut self) {
        self.save_params.clear();
    }

    fn append_save_param(&mut self, seconds: u64, changes: u64) {
        self.save_params.push(SaveParam { seconds, changes });
    }

    pub fn save_params(&self) -> &[SaveParam] {
        &self.save_params
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn dbnum(&self) -> i32 {
        self.dbnum
    }

    pub fn verbosity(&self) -> &LogLevel {
        &self.verbosity
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn max_idle_time(&self) -> i32 {
        self.max_idle_time
    }

    pub fn cron_loops(&self) -> u64 {
        self.cron_loops
    }

    pub fn set_cron_loops(&mut self, loops: u64) {
        self.cron_loops = loops;
    }

    pub fn stat_starttime(&self) -> u64 {
        self.stat_starttime
    }

    /// Drop every key in every DB. Used by the FLUSHALL command.
    pub fn flush_all(&mut self) -> usize {
        self.dbs.iter().map(|db| db.write().unwrap().flush()).sum()
    }

    /// Parse a whitespace-tokenized, `#`-commented directive-per-line config
    /// file (§6). Unknown directives or bad arity are fatal at startup.
    pub fn load_server_config(&mut self, filename: &str) {
        let reader: Box<dyn Read> = if filename == "-" {
            Box::new(io::stdin())
        } else {
            match File::open(filename) {
                Ok(f) => Box::new(f),
                Err(e) => {
                    log(LogLevel::Warning, &format!("Fatal error, can't open config file '{}': {}", filename, e));
                    exit(1);
                },
            }
        };

        fn fatal(err: &str, line: &str, line_num: usize) -> ! {
            eprintln!("*** FATAL CONFIG FILE ERROR ***");
            eprintln!("Reading the configuration file, at line {}", line_num);
            eprintln!(">>> '{}'", line);
            eprintln!("{}", err);
            exit(1);
        }

        let mut line_num = 0usize;
        for line in BufReader::new(reader).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => fatal("Directive parsing failed", "", line_num),
            };
            line_num += 1;
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }

            let argv: Vec<&str> = trimmed.split_whitespace().collect();
            let argc = argv.len();

            match argv[0].to_ascii_lowercase().as_str() {
                "timeout" if argc == 2 => match argv[1].parse::<i32>() {
                    Ok(t) if t >= 0 => self.max_idle_time = t,
                    _ => fatal("Invalid timeout value", trimmed, line_num),
                },
                "port" if argc == 2 => match argv[1].parse::<u16>() {
                    Ok(p) if p >= 1 => self.port = p,
                    _ => fatal("Invalid port", trimmed, line_num),
                },
                "bind" if argc == 2 => self.bind_addr = argv[1].to_string(),
                "save" if argc == 3 => match (argv[1].parse::<u64>(), argv[2].parse::<u64>()) {
                    (Ok(seconds), Ok(changes)) if seconds >= 1 => self.append_save_param(seconds, changes),
                    _ => fatal("Invalid save parameters", trimmed, line_num),
                },
                "dir" if argc == 2 => {
                    if let Err(e) = set_current_dir(argv[1]) {
                        log(LogLevel::Warning, &format!("Can't chdir to '{}': {}", argv[1], e));
                        exit(1);
                    }
                },
                "loglevel" if argc == 2 => {
                    self.verbosity = match argv[1].to_ascii_lowercase().as_str() {
                        "debug" => LogLevel::Debug,
                        "verbose" => LogLevel::Verbose,
                        "notice" => LogLevel::Notice,
                        "warning" => LogLevel::Warning,
                        _ => fatal("Invalid log level. Must be one of debug, verbose, notice or warning", trimmed, line_num),
                    };
                },
                "logfile" if argc == 2 => match argv[1] {
                    "stdout" => self.log_file.clear(),
                    filename => {
                        if let Err(e) = OpenOptions::new().create(true).append(true).open(filename) {
                            fatal(&format!("Can't open the log file: {}", e), trimmed, line_num);
                        }
                        self.log_file = filename.to_string();
                    },
                },
                "databases" if argc == 2 => match argv[1].parse::<i32>() {
                    Ok(n) if n >= 1 => self.dbnum = n,
                    _ => fatal("Invalid number of databases", trimmed, line_num),
                },
                "pidfile" if argc == 2 => self.pid_file = argv[1].to_string(),
                "daemonize" if argc == 2 => match crate::util::yes_no_to_bool(argv[1]) {
                    Ok(b) => self.daemonize = b,
                    Err(e) => fatal(&e, trimmed, line_num),
                },
                "dbfilename" if argc == 2 => self.db_filename = argv[1].to_string(),
                "include" if argc == 2 => self.load_server_config(argv[1]),
                _ => fatal("Bad directive or wrong number of arguments", trimmed, line_num),
            }
        }
    }

    /// Fork into the background, detach from the controlling terminal, and
    /// write the pid file. Stdio is redirected to /dev/null so a logfile of
    /// "stdout" goes nowhere once daemonized, matching the historical quirk.
    pub fn daemonize(&self) {
        unsafe {
            if fork() != 0 {
                exit(0);
            }
            setsid();

            let devnull = open(b"/dev/null\0".as_ptr() as *const i8, O_RDWR, 0);
            if devnull != -1 {
                dup2(devnull, STDIN_FILENO);
                dup2(devnull, STDOUT_FILENO);
                dup2(devnull, STDERR_FILENO);
                if devnull > STDERR_FILENO {
                    close(devnull);
                }
            }

            let mut pid_file_cstr = self.pid_file.clone();
            pid_file_cstr.push('\0');
            let fp: *mut FILE = fopen(pid_file_cstr.as_ptr() as *const i8, b"w\0".as_ptr() as *const i8);
            if !fp.is_null() {
                fprintf(fp, b"%d\n\0".as_ptr() as *const i8, getpid());
                fclose(fp);
            }
        }
    }
}

pub fn print_logo() {
    log(LogLevel::Notice, "                _._                                                  ");
    log(LogLevel::Notice, "           _.-``__ ''-._                                             ");
    log(LogLevel::Notice, &format!("      _.-``    `.  `_.  ''-._           Rudis {}", REDIS_VERSION));
    log(LogLevel::Notice, "  .-`` .-```.  ```\\/    _.,_ ''-._                                   ");
    log(LogLevel::Notice, " (    '      ,       .-`  | `,    )     Re-implementation in Rust!");
    log(LogLevel::Notice, &format!(" |`-._`-...-` __...-.``-._|'` _.-'|     Port: {}", server_read().port()));
    log(LogLevel::Notice, &format!(" |    `-._   `._    /     _.-'    |     PID: {}", id()));
    log(LogLevel::Notice, "  `-._    `-._  `-./  _.-'    _.-'                                   ");
    log(LogLevel::Notice, " |`-._`-._    `-.__.-'    _.-'_.-'|                                  ");
    log(LogLevel::Notice, "  `-._    `-._`-.__.-'_.-'    _.-'                                   ");
    log(LogLevel::Notice, "      `-._    `-.__.-'    _.-'                                       ");
    log(LogLevel::Notice, "          `-._        _.-'                                           ");
    log(LogLevel::Notice, "              `-.__.-'                                               ");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn db_shrink_is_a_noop_under_the_floor() {
        let mut db = RedisDB::new();
        db.dict.insert(
            b"k".to_vec(),
            crate::obj::create_object(RedisObject::String { ptr: crate::obj::StringStorageType::Bytes(b"v".to_vec()) }),
        );
        db.maybe_shrink();
        assert_eq!(db.dict.len(), 1);
    }

    #[test]
    fn db_lookup_set_delete_roundtrip() {
        let mut db = RedisDB::new();
        assert!(db.lookup(b"k").is_none());
        db.set(b"k".to_vec(), crate::obj::create_object(RedisObject::String { ptr: crate::obj::StringStorageType::Bytes(b"v".to_vec()) }));
        assert!(db.exists(b"k"));
        assert!(db.delete(b"k"));
        assert!(!db.exists(b"k"));
    }

    #[test]
    fn config_parses_known_directives() {
        let path = std::env::temp_dir().join(format!("rredis-test-config-{}.conf", std::process::id()));
        {
            let mut f = File::create(&path).unwrap();
            writeln!(f, "port 7000").unwrap();
            writeln!(f, "databases 4").unwrap();
            writeln!(f, "timeout 30").unwrap();
            writeln!(f, "# comment").unwrap();
        }
        let mut server = RedisServer::new();
        server.reset_server_save_params();
        server.load_server_config(path.to_str().unwrap());
        assert_eq!(server.port(), 7000);
        assert_eq!(server.dbnum(), 4);
        assert_eq!(server.max_idle_time(), 30);
        let _ = std::fs::remove_file(&path);
    }
}

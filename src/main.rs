use rredis::{
    eventloop::{ae_main, set_before_sleep_proc},
    handler::before_sleep,
    rdb::rdb_load,
    server::{print_logo, server_read, server_write},
    util::{log, LogLevel},
};
use std::{env, process::exit, sync::Arc, time::Instant};

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() == 2 {
        server_write().reset_server_save_params();
        server_write().load_server_config(&args[1]);
    } else if args.len() > 2 {
        eprintln!("Usage: ./rredis-server [/path/to/rredis.conf]");
        exit(1);
    } else {
        log(LogLevel::Warning, "Warning: no config file specified, using the default config. In order to specify a config file use 'rredis-server /path/to/rredis.conf'");
    }
    if server_read().daemonize {
        server_read().daemonize();
    }

    server_write().init_server();
    print_logo();

    let start = Instant::now();
    let filename = server_read().db_filename.clone();
    match rdb_load(&filename) {
        Ok(()) => log(LogLevel::Notice, &format!("DB loaded from disk: {} seconds", start.elapsed().as_secs())),
        Err(e) => {
            log(LogLevel::Warning, &format!("Error loading DB from disk: {}", e));
            exit(1);
        },
    }

    log(
        LogLevel::Notice,
        &format!(
            "The server is now ready to accept connections on port {}",
            server_read().port()
        ),
    );
    set_before_sleep_proc(Some(Arc::new(before_sleep)));
    ae_main();
}

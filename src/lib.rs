pub mod eventloop;
pub mod ioevent;
pub mod handler;
pub mod net;
pub mod server;
pub mod client;
pub mod cmd;
pub mod rdb;
pub mod obj;
pub mod zmalloc;
pub mod util;

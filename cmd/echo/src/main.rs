//! TCP echo server on the weft runtime
//!
//! One fiber accepts; every connection gets its own fiber reading and
//! echoing until the peer goes away. Blocking-style calls throughout - the
//! reactor turns them into epoll waits.
//!
//! ```text
//! cargo run --bin echo -- 127.0.0.1:7777
//! ncat 127.0.0.1 7777
//! ```

use std::net::SocketAddr;
use weft::{io, winfo, wwarn, IoManager};

fn serve(listener: i32) {
    loop {
        let conn = match io::accept(listener) {
            Ok(fd) => fd,
            Err(e) => {
                wwarn!("accept failed: {}", e);
                continue;
            }
        };
        winfo!("connection on fd {}", conn);

        let iom = IoManager::current().expect("accept fiber runs on the reactor");
        iom.schedule(move || {
            let mut buf = [0u8; 4096];
            loop {
                let n = match io::read(conn, &mut buf) {
                    Ok(0) => break, // peer closed
                    Ok(n) => n,
                    Err(e) => {
                        wwarn!("read on fd {} failed: {}", conn, e);
                        break;
                    }
                };
                let mut sent = 0;
                while sent < n {
                    match io::write(conn, &buf[sent..n]) {
                        Ok(m) => sent += m,
                        Err(e) => {
                            wwarn!("write on fd {} failed: {}", conn, e);
                            return;
                        }
                    }
                }
            }
            let _ = io::close(conn);
            winfo!("fd {} done", conn);
        });
    }
}

fn main() {
    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:7777".to_string())
        .parse()
        .expect("usage: echo <ip:port>");

    let iom = IoManager::new(4, false, "echo");
    iom.schedule(move || {
        let listener = io::socket(libc::AF_INET, libc::SOCK_STREAM, 0).expect("socket");
        io::bind(listener, &addr).expect("bind");
        io::listen(listener, 128).expect("listen");
        winfo!("echo server listening on {}", addr);
        serve(listener);
    });

    // the accept loop never returns; park the main thread
    loop {
        std::thread::park();
    }
}

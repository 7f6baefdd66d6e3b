use corio::tcp::TcpListener;

const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
const DEFAULT_LISTEN_PORT: u16 = 5555;

fn main() {
    env_logger::init();

    corio::run(|| {
        let listener =
            TcpListener::bind(DEFAULT_LISTEN_HOST, DEFAULT_LISTEN_PORT).expect("bind");

        println!(
            "Starting tcp echo server on {:?}",
            listener.local_addr().unwrap()
        );

        loop {
            let Some(conn) = listener.accept() else {
                break;
            };

            corio::start(move || {
                let mut buf = [0u8; 1024 * 16];
                loop {
                    match conn.recv_up_to(&mut buf) {
                        Some(0) | None => break, // eof or error
                        Some(size) => {
                            if !conn.send(&buf[0..size]) {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
}

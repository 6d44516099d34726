//! C4 — consumes inbound messages, dispatches to handlers, and
//! terminates cleanly on shutdown or peer close.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread;

use crate::connection::ConnectionContext;
use crate::protocol::Decoder;

const READ_CHUNK: usize = 1024;

pub fn spawn<P>(ctx: Arc<ConnectionContext<P>>, socket: Arc<TcpStream>, run_id: u64)
where
    P: Clone + Send + Sync + 'static,
{
    thread::spawn(move || run(ctx, socket, run_id));
}

fn run<P>(ctx: Arc<ConnectionContext<P>>, socket: Arc<TcpStream>, run_id: u64)
where
    P: Clone + Send + Sync + 'static,
{
    let mut decoder = Decoder::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut unexpected = false;

    loop {
        if !run_id_still_current(&ctx, run_id) {
            break;
        }
        match (&*socket).read(&mut buf) {
            Ok(0) => {
                unexpected = true;
                break;
            }
            Ok(n) => {
                for event in decoder.feed(&buf[..n]) {
                    (ctx.dispatch)(event);
                }
            }
            Err(e) if is_timeout(&e) => continue,
            Err(e) => {
                log::warn!("link daemon read error (run_id={run_id}): {e}");
                continue;
            }
        }
    }

    // If our run_id is still the one on record, no one else has
    // disconnected or reconnected in the meantime, so this loop is the
    // one that owns clearing the connection out of state.
    if run_id_still_current(&ctx, run_id) {
        ctx.shared.update(|current| {
            let mut next = current.clone();
            next.connection = None;
            next.link_bpm = None;
            next.link_peers = None;
            next
        });
    }
    let _ = socket.shutdown(Shutdown::Both);
    ctx.listeners.notify_disconnection(unexpected);
}

fn run_id_still_current<P>(ctx: &ConnectionContext<P>, run_id: u64) -> bool {
    ctx.shared
        .load()
        .connection
        .as_ref()
        .map(|c| c.run_id)
        == Some(run_id)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::Listeners;
    use crate::protocol::Event;
    use crate::state::{ClientState, ConnectionHandle, SharedState};
    use std::io::Write;
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct DummySnapshot;

    fn paired_sockets() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        (client, server)
    }

    #[test]
    fn unexpected_close_notifies_disconnection_listeners_with_true() {
        let (client, server) = paired_sockets();
        let shared: Arc<SharedState<DummySnapshot>> =
            Arc::new(SharedState::new(ClientState::new(17000, 1)));
        let socket = Arc::new(client);
        let run_id = shared
            .update({
                let socket = socket.clone();
                move |s| {
                    let mut next = s.clone();
                    next.last = s.last + 1;
                    next.connection = Some(ConnectionHandle {
                        socket: socket.clone(),
                        run_id: next.last,
                    });
                    next
                }
            })
            .last;

        let listeners = Arc::new(Listeners::new());
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        listeners.add_disconnection_listener(Arc::new(move |unexpected| {
            flag2.store(unexpected, Ordering::SeqCst);
        }));

        let ctx = Arc::new(ConnectionContext {
            shared: shared.clone(),
            listeners,
            dispatch: Arc::new(|_: Event| {}),
        });

        drop(server); // triggers a 0-byte read on the client side
        run(ctx, socket, run_id);

        assert!(flag.load(Ordering::SeqCst));
        assert!(!shared.load().is_connected());
    }

    #[test]
    fn stale_run_id_exits_without_touching_newer_connection_state() {
        let (client, _server) = paired_sockets();
        let shared: Arc<SharedState<DummySnapshot>> =
            Arc::new(SharedState::new(ClientState::new(17000, 1)));
        let socket = Arc::new(client);

        // Simulate a newer connection already having replaced this one.
        shared.update(|s| {
            let mut next = s.clone();
            next.last = s.last + 1;
            next.link_bpm = Some(140.0);
            next.connection = Some(ConnectionHandle {
                socket: socket.clone(),
                run_id: next.last,
            });
            next
        });
        let stale_run_id = 0; // never assigned; guaranteed stale

        let listeners = Arc::new(Listeners::new());
        let ctx = Arc::new(ConnectionContext {
            shared: shared.clone(),
            listeners,
            dispatch: Arc::new(|_: Event| {}),
        });

        run(ctx, socket, stale_run_id);

        // The newer connection's state must be untouched.
        assert!(shared.load().is_connected());
        assert_eq!(shared.load().link_bpm, Some(140.0));
    }

    #[test]
    fn dispatches_decoded_events_to_the_callback() {
        let (client, mut server) = paired_sockets();
        let shared: Arc<SharedState<DummySnapshot>> =
            Arc::new(SharedState::new(ClientState::new(17000, 1)));
        let socket = Arc::new(client);
        let run_id = shared
            .update({
                let socket = socket.clone();
                move |s| {
                    let mut next = s.clone();
                    next.last = s.last + 1;
                    next.connection = Some(ConnectionHandle {
                        socket: socket.clone(),
                        run_id: next.last,
                    });
                    next
                }
            })
            .last;

        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let listeners = Arc::new(Listeners::new());
        let ctx = Arc::new(ConnectionContext {
            shared: shared.clone(),
            listeners,
            dispatch: Arc::new(move |event| seen2.lock().unwrap().push(event)),
        });

        server
            .write_all(b"status { :bpm 120.0 :peers 1 }\n")
            .unwrap();

        let shared_for_thread = shared.clone();
        let runner = thread::spawn(move || run(ctx, socket, run_id));

        // Give the read loop a moment to decode, then disconnect it.
        thread::sleep(Duration::from_millis(100));
        crate::connection::disconnect(&shared_for_thread);
        runner.join().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Event::Status { bpm: 120.0, peers: 1 }]
        );
    }
}

//! C3 — opens/closes the TCP session to the Link daemon, spawns the
//! read loop, handles timeouts, and publishes (dis)connection events.

use std::net::{SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::listeners::Listeners;
use crate::protocol::{Command, Event};
use crate::read_loop;
use crate::state::{send_line, ClientState, ConnectionHandle, SharedState};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const WATCHDOG_DELAY: Duration = Duration::from_secs(1);

/// Everything the read loop and watchdog need, independent of the
/// concrete `DjLinkEngine` the rest of the engine is parameterized
/// over. Built fresh for each `connect` call and handed to the
/// spawned threads; holding no reference back to the engine that
/// created it avoids a reference cycle through the dispatch closure.
pub struct ConnectionContext<P> {
    pub shared: Arc<SharedState<P>>,
    pub listeners: Arc<Listeners>,
    pub dispatch: Arc<dyn Fn(Event) + Send + Sync>,
}

/// §4.2. Returns `true` if a session is now open (including "already
/// connected"), `false` if this attempt failed (in which case
/// `failure_fn` has already been invoked).
pub fn connect<P>(
    ctx: Arc<ConnectionContext<P>>,
    failure_fn: Arc<dyn Fn(String) + Send + Sync>,
) -> bool
where
    P: Clone + Send + Sync + 'static,
{
    if ctx.shared.load().is_connected() {
        return true;
    }

    let port = ctx.shared.load().port;
    let addr: SocketAddr = match format!("127.0.0.1:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            invoke_failure(&failure_fn, format!("Unable to connect: invalid port {port}: {e}"));
            return false;
        }
    };

    let stream = match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
        Ok(stream) => stream,
        Err(e) => {
            invoke_failure(
                &failure_fn,
                format!("Unable to connect to link daemon at {addr}: {e}"),
            );
            return false;
        }
    };
    if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
        invoke_failure(
            &failure_fn,
            format!("Unable to connect to link daemon at {addr}: {e}"),
        );
        return false;
    }

    let socket = Arc::new(stream);
    let socket_for_state = socket.clone();
    let snapshot = ctx.shared.update(move |current| {
        let mut next: ClientState<P> = current.clone();
        next.last = current.last + 1;
        next.connection = Some(ConnectionHandle {
            socket: socket_for_state.clone(),
            run_id: next.last,
        });
        next
    });
    let run_id = snapshot.last;

    read_loop::spawn(ctx.clone(), socket.clone(), run_id);
    spawn_watchdog(ctx, socket, failure_fn);

    true
}

/// Caller-initiated disconnect. Unconditionally clears the connection
/// record; the read loop observes the mismatch on its own and closes
/// the socket (§4.3). Calling this with no live connection is a no-op,
/// which is what lets the watchdog call it safely on an
/// already-torn-down session (§5, cancellation).
pub fn disconnect<P>(shared: &SharedState<P>)
where
    P: Clone + Send + Sync + 'static,
{
    shared.update(|current| {
        let mut next = current.clone();
        next.connection = None;
        next.link_bpm = None;
        next.link_peers = None;
        next
    });
}

fn spawn_watchdog<P>(
    ctx: Arc<ConnectionContext<P>>,
    socket: Arc<TcpStream>,
    failure_fn: Arc<dyn Fn(String) + Send + Sync>,
) where
    P: Clone + Send + Sync + 'static,
{
    thread::spawn(move || {
        thread::sleep(WATCHDOG_DELAY);
        let state = ctx.shared.load();
        if state.link_bpm.is_none() {
            invoke_failure(
                &failure_fn,
                format!(
                    "Did not receive a status message from the link daemon within {:?}",
                    WATCHDOG_DELAY
                ),
            );
            disconnect(&ctx.shared);
            return;
        }
        if let Err(e) = send_line(&socket, &Command::Version.to_string()) {
            log::warn!("link daemon: failed to send version probe after connect: {e}");
        }
        if let Err(e) = send_line(&socket, &Command::EnableStartStopSync.to_string()) {
            log::warn!("link daemon: failed to enable start/stop sync: {e}");
        }
    });
}

fn invoke_failure(failure_fn: &Arc<dyn Fn(String) + Send + Sync>, message: String) {
    let f = failure_fn.clone();
    let msg = message.clone();
    if catch_unwind(AssertUnwindSafe(move || f(msg))).is_err() {
        log::error!("connection failure callback panicked: {message}");
    }
}

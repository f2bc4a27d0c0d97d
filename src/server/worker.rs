//! The worker thread loop.
//!
//! ```text
//!  [-----------]  lock   [------------]  accepted   [------------]
//!  [ check die ] ======> [ try accept ] =========> [ serve conn ]
//!  [-----------]         [------------]            [------------]
//!       /\   lock or accept timeout ||                   ||
//!       \\==============================<===============//
//! ```

use crate::{
    events::InfoKind,
    server::{
        connection::HttpConnection,
        daemon::{Command, Shared},
        transport::Connection,
    },
    sync::pool::Worker,
};
use std::{sync::Arc, thread, time::Duration};

/// Pause after an accept error so a broken listener does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn run(shared: &Shared, me: &Arc<Worker<Command>>) {
    let name = me.name();
    let services = &shared.services;
    services.context.registry.register(name);
    services.info(InfoKind::ThreadStarted, name, None);
    tracing::info!(thread = %name, "worker started");

    loop {
        if let Some(Command::Die) = me.queue().next_event() {
            break;
        }
        let Some(guard) = shared.tcplock.try_lock_for(shared.limits.lock_timeout) else {
            continue;
        };
        // A die may have arrived while queued on the lock.
        if let Some(Command::Die) = me.queue().next_event() {
            break;
        }

        let accepted = shared.listener.try_accept(shared.limits.accept_timeout);
        drop(guard);

        match accepted {
            Ok(Some(conn)) => serve(shared, conn, name),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(thread = %name, %err, "accept failed");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }

    services.info(InfoKind::ThreadStopped, name, None);
    services.context.registry.unregister(name);
    tracing::info!(thread = %name, "worker stopped");
}

fn serve(shared: &Shared, conn: Connection, thread: &str) {
    let ip = conn.peer().ip.clone();
    let load = shared.load.increment();
    shared
        .services
        .info(InfoKind::ConnectionAccepted, thread, Some((load, &ip)));
    tracing::debug!(thread, %ip, load, "connection accepted");

    let served = HttpConnection::new(shared, conn).run();

    let load = shared.load.decrement();
    shared
        .services
        .info(InfoKind::ConnectionClosed, thread, Some((load, &ip)));
    tracing::debug!(thread, %ip, load, served, "connection closed");
}

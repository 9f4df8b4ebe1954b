use std::sync::Arc;

use council_sync::EventRouter;

use crate::connection::ConnectionManager;

/// Wire the event router in as the connection's synchronous frame handler.
///
/// The router then runs inside the driver task, once per decoded frame, in
/// delivery order — the ordering obligation the projections depend on. The
/// connection's watch slot stays available for passive observers.
pub fn attach_router(conn: &ConnectionManager, router: EventRouter) {
    let router = Arc::new(router);
    conn.set_handler(Arc::new(move |msg| router.route(msg)));
}

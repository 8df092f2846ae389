//! Wires every gateway subsystem together and supervises them as a set of
//! cancellable, auto-restarting tasks under one root context.

use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::{
    error::GatewayError,
    event_sink::EventSinkService,
    log_sink::LogSink,
    machine_map::MachineMap,
    pending_cleanup::PendingCleanup,
    peer_pool::PeerPool,
    provisioning::ProvisioningService,
    stats_loop::StatsLoop,
};

const TASK_RESTART_BACKOFF: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The live set of gateway subsystems, already wired to their shared stores
/// and to each other (peer pool, machine map). Constructing one does not
/// start anything; call [`Gateway::run`] under a root [`CancellationToken`].
pub struct Gateway {
    pool: Arc<PeerPool>,
    provisioning: ProvisioningService,
    event_sink: EventSinkService,
    log_sink: Arc<LogSink>,
    pending_cleanup: Arc<PendingCleanup>,
    stats: Arc<StatsLoop>,
    machines: Arc<MachineMap>,
    grpc_bind: SocketAddr,
    log_bind: SocketAddr,
}

impl Gateway {
    #[must_use]
    pub fn new(
        pool: Arc<PeerPool>,
        provisioning: ProvisioningService,
        event_sink: EventSinkService,
        log_sink: Arc<LogSink>,
        pending_cleanup: Arc<PendingCleanup>,
        stats: Arc<StatsLoop>,
        machines: Arc<MachineMap>,
        grpc_bind: SocketAddr,
        log_bind: SocketAddr,
    ) -> Self {
        Self {
            pool,
            provisioning,
            event_sink,
            log_sink,
            pending_cleanup,
            stats,
            machines,
            grpc_bind,
            log_bind,
        }
    }

    /// Runs every subsystem until `cancel` fires, then waits up to
    /// `handler shutdown + 5s` for them to return before giving up.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let mut tasks: JoinSet<Result<(), GatewayError>> = JoinSet::new();

        let pool = Arc::clone(&self.pool);
        let handler_cancel = cancel.clone();
        tasks.spawn(supervise("wg handler", handler_cancel.clone(), move || {
            let pool = Arc::clone(&pool);
            let cancel = handler_cancel.clone();
            async move { pool.handler().run(cancel).await }
        }));

        let stats = Arc::clone(&self.stats);
        let stats_cancel = cancel.clone();
        tasks.spawn(supervise("peer stats loop", stats_cancel.clone(), move || {
            let stats = Arc::clone(&stats);
            let cancel = stats_cancel.clone();
            async move { stats.run(cancel).await }
        }));

        let log_sink = Arc::clone(&self.log_sink);
        let log_bind = self.log_bind;
        let log_cancel = cancel.clone();
        tasks.spawn(supervise("log sink", log_cancel.clone(), move || {
            let log_sink = Arc::clone(&log_sink);
            let cancel = log_cancel.clone();
            async move { log_sink.run(log_bind, cancel).await }
        }));

        let pending_cleanup = Arc::clone(&self.pending_cleanup);
        let pending_cancel = cancel.clone();
        tasks.spawn(supervise("pending machine cleanup", pending_cancel.clone(), move || {
            let pending_cleanup = Arc::clone(&pending_cleanup);
            let cancel = pending_cancel.clone();
            async move { pending_cleanup.run(cancel).await }
        }));

        let machines = Arc::clone(&self.machines);
        let machines_cancel = cancel.clone();
        tasks.spawn(supervise("machine map watch", machines_cancel.clone(), move || {
            let machines = Arc::clone(&machines);
            let cancel = machines_cancel.clone();
            async move { machines.run(cancel).await }
        }));

        let provisioning = self.provisioning.clone();
        let event_sink = self.event_sink.clone();
        let grpc_bind = self.grpc_bind;
        let grpc_cancel = cancel.clone();
        tasks.spawn(supervise("grpc server", grpc_cancel.clone(), move || {
            let provisioning = provisioning.clone();
            let event_sink = event_sink.clone();
            let cancel = grpc_cancel.clone();
            async move {
                Server::builder()
                    .add_service(siderolink_proto::provision_service_server::ProvisionServiceServer::new(
                        provisioning,
                    ))
                    .add_service(siderolink_proto::event_sink_service_server::EventSinkServiceServer::new(
                        event_sink,
                    ))
                    .serve_with_shutdown(grpc_bind, cancel.cancelled())
                    .await
                    .map_err(|err| GatewayError::Internal(err.to_string()))
            }
        }));

        cancel.cancelled().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(result) = tasks.join_next().await {
                if let Ok(Err(err)) = result {
                    error!(%err, "gateway subsystem returned an error during shutdown");
                }
            }
        })
        .await
        {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!("gateway subsystems did not shut down within the grace period, aborting");
                tasks.abort_all();
                Ok(())
            }
        }
    }
}

/// Restarts `task` after `TASK_RESTART_BACKOFF` whenever it returns an
/// error, stopping for good once `cancel` fires.
async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, mut task: F) -> Result<(), GatewayError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), GatewayError>> + Send,
{
    loop {
        match task().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if cancel.is_cancelled() {
                    return Ok(());
                }
                error!(subsystem = name, %err, "subsystem task failed, restarting after backoff");
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(TASK_RESTART_BACKOFF) => {}
                }
            }
        }
    }
}

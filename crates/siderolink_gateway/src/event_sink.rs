//! gRPC event sink: a streaming RPC that dispatches `MachineStatusEvent`s
//! into `MachineStatusSnapshot` resources keyed by the source machine.

use std::net::IpAddr;

use siderolink_common::{Metadata, ObjectStore, model::MachineStatusSnapshot};
use tonic::{Request, Response, Status, Streaming};

use crate::{error::GatewayError, machine_map::MachineMap};

const SNAPSHOT_NAMESPACE: &str = "default";

#[derive(Clone)]
pub struct EventSinkService {
    snapshots: std::sync::Arc<dyn ObjectStore<MachineStatusSnapshot>>,
    machines: std::sync::Arc<MachineMap>,
}

impl EventSinkService {
    #[must_use]
    pub fn new(
        snapshots: std::sync::Arc<dyn ObjectStore<MachineStatusSnapshot>>,
        machines: std::sync::Arc<MachineMap>,
    ) -> Self {
        Self { snapshots, machines }
    }

    /// Creates or updates (with one retry on conflict) the snapshot for
    /// `machine_id`, independent of the gRPC framing.
    async fn handle_machine_status(
        &self,
        machine_id: &str,
        stage: String,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), GatewayError> {
        let body = MachineStatusSnapshot { stage, last_event_at: now };
        match self.snapshots.get(SNAPSHOT_NAMESPACE, machine_id).await {
            Ok(existing) => {
                match self.snapshots.update(existing.meta, body.clone()).await {
                    Ok(_) => Ok(()),
                    Err(err) if err.is_conflict() => {
                        let current = self
                            .snapshots
                            .get(SNAPSHOT_NAMESPACE, machine_id)
                            .await
                            .map_err(GatewayError::from_store)?;
                        self.snapshots
                            .update(current.meta, body)
                            .await
                            .map(|_| ())
                            .map_err(GatewayError::from_store)
                    }
                    Err(err) => Err(GatewayError::from_store(err)),
                }
            }
            Err(err) if err.is_not_found() => self
                .snapshots
                .create(Metadata::new(SNAPSHOT_NAMESPACE, machine_id), body)
                .await
                .map(|_| ())
                .map_err(GatewayError::from_store),
            Err(err) => Err(GatewayError::from_store(err)),
        }
    }

    async fn resolve_machine_id(&self, addr: IpAddr) -> Option<String> {
        match self.machines.resolve(addr).await {
            Ok(id) => id,
            Err(err) => {
                warn!(%addr, %err, "failed to resolve machine id for event source");
                None
            }
        }
    }
}

impl siderolink_proto::event_sink_service_server::EventSinkService for EventSinkService {
    async fn event_sink(
        &self,
        request: Request<Streaming<siderolink_proto::Event>>,
    ) -> Result<Response<siderolink_proto::EventSinkResponse>, Status> {
        let Some(addr) = request.remote_addr() else {
            return Err(Status::failed_precondition("event stream has no peer address"));
        };
        let Some(machine_id) = self.resolve_machine_id(addr.ip()).await else {
            return Err(Status::not_found("unknown event source machine"));
        };

        let mut stream = request.into_inner();
        while let Some(event) = stream.message().await? {
            let Some(payload) = event.payload else { continue };
            match payload {
                siderolink_proto::event::Payload::MachineStatus(status) => {
                    if let Err(err) = self
                        .handle_machine_status(&machine_id, status.stage, chrono::Utc::now())
                        .await
                    {
                        error!(%machine_id, %err, "failed to record machine status event");
                    }
                }
                siderolink_proto::event::Payload::Sequence(seq) => {
                    debug!(%machine_id, sequence = %seq.sequence, status = %seq.status, "sequence event");
                }
                siderolink_proto::event::Payload::Other(_) => {}
            }
        }

        Ok(Response::new(siderolink_proto::EventSinkResponse {}))
    }
}

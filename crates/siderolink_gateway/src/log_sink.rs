//! TCP log sink: newline-delimited JSON per connection, dispatched to a
//! per-machine log store resolved via the `MachineMap`.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::{error::GatewayError, machine_map::MachineMap};

const MAX_LINE_BYTES: usize = 16 * 1024;

/// Write contract for the machine log store, itself out of scope for this
/// component: bounded in-memory buffering with eventual persistence.
#[trait_variant::make(LogStore: Send)]
pub trait LocalLogStore: Send + Sync + 'static {
    async fn write_line(&self, machine_id: &str, line: &[u8]) -> Result<(), GatewayError>;
}

pub struct LogSink {
    store: Arc<dyn LogStore>,
    machines: Arc<MachineMap>,
}

impl LogSink {
    #[must_use]
    pub fn new(store: Arc<dyn LogStore>, machines: Arc<MachineMap>) -> Self {
        Self { store, machines }
    }

    /// Accepts connections on `bind_addr` until `cancel` fires.
    pub async fn run(&self, bind_addr: SocketAddr, cancel: CancellationToken) -> Result<(), GatewayError> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|err| GatewayError::Internal(format!("failed to bind log sink on {bind_addr}: {err}")))?;
        info!(%bind_addr, "log sink listening");

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(%err, "log sink accept failed");
                            continue;
                        }
                    };
                    let store = Arc::clone(&self.store);
                    let machines = Arc::clone(&self.machines);
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, store, machines, cancel).await {
                            warn!(%peer, %err, "log sink connection ended with an error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    store: Arc<dyn LogStore>,
    machines: Arc<MachineMap>,
    cancel: CancellationToken,
) -> Result<(), GatewayError> {
    let Some(machine_id) = machines
        .resolve(peer.ip())
        .await
        .map_err(GatewayError::from_store)?
    else {
        debug!(%peer, "dropping log connection from unresolvable address");
        return Ok(());
    };

    let mut lines = BufReader::new(stream).lines();
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            next = lines.next_line() => next,
        };
        let Some(line) = next.map_err(|err| GatewayError::Internal(err.to_string()))? else {
            return Ok(());
        };
        if line.is_empty() {
            continue;
        }
        let mut bytes = line.into_bytes();
        bytes.truncate(MAX_LINE_BYTES);
        store.write_line(&machine_id, &bytes).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;

    #[derive(Default)]
    struct RecordingStore {
        lines: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
        calls: AtomicUsize,
    }

    impl LocalLogStore for RecordingStore {
        async fn write_line(&self, machine_id: &str, line: &[u8]) -> Result<(), GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.lines.lock().unwrap().push((machine_id.to_string(), line.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn empty_lines_are_dropped_and_long_lines_are_truncated() {
        use siderolink_common::{Metadata, store::memory::InMemoryStore, ObjectStore};
        use siderolink_common::model::{Machine, MACHINE_ADDRESS_LABEL};

        let machine_store: Arc<InMemoryStore<Machine>> = Arc::new(InMemoryStore::new());
        let addr: std::net::IpAddr = "127.0.0.1".parse().unwrap();
        machine_store
            .create(
                Metadata::new("default", "m1").with_label(MACHINE_ADDRESS_LABEL, &addr.to_string()),
                Machine { address: addr },
            )
            .await
            .unwrap();
        let machines = Arc::new(MachineMap::new(machine_store, "default"));
        let store = Arc::new(RecordingStore::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();
        let store_for_conn = Arc::clone(&store);
        let machines_for_conn = Arc::clone(&machines);
        tokio::spawn(async move {
            let (stream, _peer) = listener.accept().await.unwrap();
            let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
            let _ = handle_connection(
                stream,
                peer,
                store_for_conn,
                machines_for_conn,
                CancellationToken::new(),
            )
            .await;
        });

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        let long_line = "x".repeat(MAX_LINE_BYTES + 100);
        client.write_all(format!("\n{long_line}\n").as_bytes()).await.unwrap();
        drop(client);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let lines = store.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].1.len(), MAX_LINE_BYTES);
    }
}

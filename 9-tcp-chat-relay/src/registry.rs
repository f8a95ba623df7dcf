use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::SocketAddr,
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, StreamExt, stream::FuturesUnordered};
use tokio::{
    net::TcpStream,
    sync::{Mutex, Notify},
    time::timeout,
};
use tracing::debug;

pub type ConnectionId = u64;

/// One accepted client. Dropping the last handle to its stream closes the socket.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    stream: Arc<TcpStream>,
    peer: SocketAddr,
    name: Option<String>,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Display name, known once the peer has sent a labelled message.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Result of the single read performed for a ready connection.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were written to the front of the caller's buffer.
    Data(usize),
    EndOfStream,
    Failed(io::Error),
}

#[derive(Default)]
struct Connections {
    by_id: BTreeMap<ConnectionId, Connection>,
    last_serviced: Option<ConnectionId>,
}

/// The set of live connections shared by the accept task and the dispatch loop.
pub struct ConnectionRegistry {
    connections: Mutex<Connections>,
    next_id: AtomicU64,
    arrivals: Notify,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(Connections::default()),
            next_id: AtomicU64::new(1),
            arrivals: Notify::new(),
        }
    }

    fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn add(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionId {
        let id = self.next_id();
        let connection = Connection {
            id,
            stream: Arc::new(stream),
            peer,
            name: None,
        };

        self.connections.lock().await.by_id.insert(id, connection);
        self.arrivals.notify_one();
        id
    }

    /// Waits up to `limit` for a connection to be added. Returns `false` on timeout.
    ///
    /// An arrival that happened while nobody was waiting is remembered, so the
    /// next call returns immediately.
    pub async fn wait_for_arrival(&self, limit: Duration) -> bool {
        timeout(limit, self.arrivals.notified()).await.is_ok()
    }

    pub async fn build_readiness_set(&self) -> ReadinessTargets {
        let connections = self.connections.lock().await;
        let targets = connections
            .by_id
            .values()
            .map(|connection| (connection.id, Arc::clone(&connection.stream)))
            .collect();
        ReadinessTargets { targets }
    }

    /// Deregisters `id`. Removing an absent id is a no-op.
    pub async fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.lock().await.by_id.remove(&id)
    }

    /// Deregisters and closes every connection, returning how many there were.
    pub async fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut self.connections.lock().await.by_id);
        let closed = drained.len();
        drop(drained);
        closed
    }

    /// Services exactly one connection from `ready`, reading at most `buffer.len()` bytes.
    ///
    /// Scanning resumes after the connection serviced last time, so one busy
    /// peer cannot starve the others. The read never blocks: a connection that
    /// turns out to have nothing to read is skipped.
    pub async fn read_next_ready_message(
        &self,
        ready: &ReadySet,
        buffer: &mut [u8],
    ) -> Option<(ConnectionId, ReadOutcome)> {
        let mut connections = self.connections.lock().await;
        let start = connections.last_serviced;
        let candidates: Vec<ConnectionId> = match start {
            Some(after) => connections
                .by_id
                .range((Bound::Excluded(after), Bound::Unbounded))
                .chain(connections.by_id.range(..=after))
                .map(|(id, _)| *id)
                .filter(|id| ready.contains(*id))
                .collect(),
            None => connections
                .by_id
                .keys()
                .copied()
                .filter(|id| ready.contains(*id))
                .collect(),
        };

        for id in candidates {
            let Some(connection) = connections.by_id.get(&id) else {
                continue;
            };
            let outcome = match connection.stream.try_read(buffer) {
                Ok(0) => ReadOutcome::EndOfStream,
                Ok(n) => ReadOutcome::Data(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    debug!(id, "stale readiness, skipping");
                    continue;
                }
                Err(err) => ReadOutcome::Failed(err),
            };
            connections.last_serviced = Some(id);
            return Some((id, outcome));
        }

        None
    }

    /// Records the sender label as the connection's display name unless one is already known.
    pub async fn learn_name(&self, id: ConnectionId, label: &str) {
        let mut connections = self.connections.lock().await;
        if let Some(connection) = connections.by_id.get_mut(&id) {
            if connection.name.is_none() {
                connection.name = Some(label.to_string());
            }
        }
    }

    pub async fn name_of(&self, id: ConnectionId) -> Option<String> {
        let connections = self.connections.lock().await;
        connections
            .by_id
            .get(&id)
            .and_then(|connection| connection.name.clone())
    }

    pub async fn stream(&self, id: ConnectionId) -> Option<Arc<TcpStream>> {
        let connections = self.connections.lock().await;
        connections
            .by_id
            .get(&id)
            .map(|connection| Arc::clone(&connection.stream))
    }

    /// Every registered stream except `sender`'s, for fan-out delivery.
    pub async fn peers_except(&self, sender: ConnectionId) -> Vec<(ConnectionId, Arc<TcpStream>)> {
        let connections = self.connections.lock().await;
        connections
            .by_id
            .values()
            .filter(|connection| connection.id != sender)
            .map(|connection| (connection.id, Arc::clone(&connection.stream)))
            .collect()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.by_id.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.by_id.is_empty()
    }
}

/// Snapshot of registered streams to wait on, taken under the registry lock.
#[derive(Debug)]
pub struct ReadinessTargets {
    targets: Vec<(ConnectionId, Arc<TcpStream>)>,
}

impl ReadinessTargets {
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.targets.iter().map(|(id, _)| *id)
    }

    /// Largest registered id, or `None` when there is nothing to wait on.
    pub fn max_id(&self) -> Option<ConnectionId> {
        self.ids().max()
    }

    /// Waits up to `limit` for any target to become readable.
    ///
    /// Once one target is ready, every other target that is already ready is
    /// collected too. An elapsed timeout yields an empty set, as does an empty
    /// snapshot, which returns without waiting at all.
    pub async fn wait(self, limit: Duration) -> io::Result<ReadySet> {
        if self.targets.is_empty() {
            return Ok(ReadySet::default());
        }

        let mut pending: FuturesUnordered<_> = self
            .targets
            .into_iter()
            .map(|(id, stream)| async move { stream.readable().await.map(|()| id) })
            .collect();

        let first = match timeout(limit, pending.next()).await {
            Ok(Some(result)) => result?,
            Ok(None) | Err(_) => return Ok(ReadySet::default()),
        };

        let mut ready = ReadySet::default();
        ready.insert(first);
        while let Some(Some(result)) = pending.next().now_or_never() {
            ready.insert(result?);
        }
        Ok(ready)
    }
}

/// Connections reported readable by one readiness wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadySet {
    ids: BTreeSet<ConnectionId>,
}

impl ReadySet {
    pub fn insert(&mut self, id: ConnectionId) {
        self.ids.insert(id);
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

}

impl FromIterator<ConnectionId> for ReadySet {
    fn from_iter<I: IntoIterator<Item = ConnectionId>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    const BUFFER: usize = crate::message::DEFAULT_MAX_MESSAGE;
    const WAIT: Duration = Duration::from_secs(5);

    async fn accepted_pair(listener: &TcpListener) -> (TcpStream, SocketAddr, TcpStream) {
        let client = TcpStream::connect(listener.local_addr().expect("local addr"))
            .await
            .expect("connect");
        let (server_side, peer) = listener.accept().await.expect("accept");
        (server_side, peer, client)
    }

    #[tokio::test]
    async fn empty_registry_has_no_max_id() {
        let registry = ConnectionRegistry::new();
        let targets = registry.build_readiness_set().await;
        assert!(targets.is_empty());
        assert_eq!(targets.max_id(), None);

        let ready = targets
            .wait(Duration::from_secs(60))
            .await
            .expect("empty wait");
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn readiness_set_tracks_adds_and_removes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = ConnectionRegistry::new();

        let (a, peer_a, _client_a) = accepted_pair(&listener).await;
        let (b, peer_b, _client_b) = accepted_pair(&listener).await;
        let id_a = registry.add(a, peer_a).await;
        let id_b = registry.add(b, peer_b).await;
        assert!(id_b > id_a);

        let targets = registry.build_readiness_set().await;
        assert_eq!(targets.len(), 2);
        assert_eq!(targets.ids().collect::<Vec<_>>(), vec![id_a, id_b]);
        assert_eq!(targets.max_id(), Some(id_b));
        drop(targets);

        let removed = registry.remove(id_b).await.expect("registered");
        assert_eq!(removed.id(), id_b);
        assert_eq!(removed.peer(), peer_b);
        let targets = registry.build_readiness_set().await;
        assert_eq!(targets.ids().collect::<Vec<_>>(), vec![id_a]);
        assert_eq!(targets.max_id(), Some(id_a));
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_closes_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = ConnectionRegistry::new();
        let (stream, peer, mut client) = accepted_pair(&listener).await;
        let id = registry.add(stream, peer).await;

        assert!(registry.remove(id).await.is_some());
        assert!(registry.remove(id).await.is_none());
        assert!(registry.is_empty().await);

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.expect("read after close");
        assert_eq!(n, 0, "peer should observe end-of-stream");
    }

    /// Waits and reads until a connection is serviced; readiness can be stale.
    async fn next_outcome(
        registry: &ConnectionRegistry,
        buffer: &mut [u8],
    ) -> (ConnectionId, ReadOutcome) {
        timeout(WAIT, async {
            loop {
                let ready = registry
                    .build_readiness_set()
                    .await
                    .wait(WAIT)
                    .await
                    .expect("readiness wait");
                if let Some(serviced) = registry.read_next_ready_message(&ready, buffer).await {
                    return serviced;
                }
            }
        })
        .await
        .expect("a connection should be serviced")
    }

    #[tokio::test]
    async fn reads_data_then_end_of_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = ConnectionRegistry::new();
        let (stream, peer, mut client) = accepted_pair(&listener).await;
        let id = registry.add(stream, peer).await;

        client.write_all(b"alice:hi").await.expect("write");
        let mut buffer = [0u8; BUFFER];
        match next_outcome(&registry, &mut buffer).await {
            (got, ReadOutcome::Data(n)) => {
                assert_eq!(got, id);
                assert_eq!(&buffer[..n], b"alice:hi");
            }
            other => panic!("unexpected read: {other:?}"),
        }

        drop(client);
        let (got, outcome) = next_outcome(&registry, &mut buffer).await;
        assert_eq!(got, id);
        assert!(matches!(outcome, ReadOutcome::EndOfStream));
    }

    #[tokio::test]
    async fn scanning_resumes_after_last_serviced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = ConnectionRegistry::new();
        let mut clients = Vec::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (stream, peer, client) = accepted_pair(&listener).await;
            ids.push(registry.add(stream, peer).await);
            clients.push(client);
        }
        // Keep every connection readable by never draining more than one byte each time.
        for client in &mut clients {
            client.write_all(b"xxxx").await.expect("write");
        }

        let mut buffer = [0u8; 1];
        let mut order = Vec::new();
        for _ in 0..3 {
            let (id, outcome) = next_outcome(&registry, &mut buffer).await;
            assert!(matches!(outcome, ReadOutcome::Data(1)));
            order.push(id);
        }
        order.sort_unstable();
        assert_eq!(order, ids, "each connection is serviced once per round");
    }

    #[tokio::test]
    async fn unregistered_ids_in_ready_set_are_ignored() {
        let registry = ConnectionRegistry::new();
        let ready: ReadySet = [7, 9].into_iter().collect();
        let mut buffer = [0u8; BUFFER];
        assert!(
            registry
                .read_next_ready_message(&ready, &mut buffer)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn first_label_becomes_the_name() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = ConnectionRegistry::new();
        let (stream, peer, _client) = accepted_pair(&listener).await;
        let id = registry.add(stream, peer).await;

        registry.learn_name(id, "alice").await;
        registry.learn_name(id, "mallory").await;
        assert_eq!(registry.name_of(id).await.as_deref(), Some("alice"));

        let connection = registry.remove(id).await.expect("registered");
        assert_eq!(connection.name(), Some("alice"));
    }

    #[tokio::test]
    async fn arrival_wakes_a_waiter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let registry = Arc::new(ConnectionRegistry::new());
        assert!(!registry.wait_for_arrival(Duration::from_millis(20)).await);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_for_arrival(Duration::from_secs(5)).await })
        };
        let (stream, peer, _client) = accepted_pair(&listener).await;
        registry.add(stream, peer).await;
        assert!(waiter.await.expect("join"));
    }
}

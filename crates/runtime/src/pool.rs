//! Pool of long-lived agent connections, at most one per session.
//!
//! Each session has a slot guarded by its own async mutex. Looking up or
//! creating the pooled connection happens under that lock, so concurrent
//! callers for the same session wait for a single dial instead of racing to
//! create duplicates. Callers for other sessions are never blocked.
//!
//! A pooled connection remembers which relay clients use it. When the last
//! of them goes away ([`ConnectionPool::release_owner`]) the connection is
//! closed and dropped from the pool.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::connection::AgentConnection;

/// Identifies the relay client that asked for a pooled connection.
pub type OwnerId = u64;

struct PooledConnection {
	connection: Arc<AgentConnection>,
	owners: HashSet<OwnerId>,
}

type Slot = Arc<AsyncMutex<Option<PooledConnection>>>;

#[derive(Default)]
pub struct ConnectionPool {
	slots: Mutex<HashMap<String, Slot>>,
}

impl ConnectionPool {
	pub fn new() -> Self {
		Self::default()
	}

	fn slot(&self, session: &str) -> Slot {
		Arc::clone(self.slots.lock().entry(session.to_string()).or_default())
	}

	/// Returns the pooled connection for `session`, dialing with `connect` if
	/// there is none or the existing one has closed.
	pub async fn get_or_connect<F, Fut, E>(&self, session: &str, owner: OwnerId, connect: F) -> Result<Arc<AgentConnection>, E>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<Arc<AgentConnection>, E>>,
	{
		let slot = self.slot(session);
		let result = {
			let mut entry = slot.lock().await;
			if let Some(pooled) = entry.as_mut().filter(|pooled| !pooled.connection.is_closed()) {
				pooled.owners.insert(owner);
				Ok(Arc::clone(&pooled.connection))
			} else {
				match connect().await {
					Ok(connection) => {
						debug!(target = "droidplane.pool", %session, endpoint = connection.endpoint(), "pooled agent connection created");
						*entry = Some(PooledConnection {
							connection: Arc::clone(&connection),
							owners: HashSet::from([owner]),
						});
						Ok(connection)
					}
					Err(err) => {
						*entry = None;
						Err(err)
					}
				}
			}
		};
		drop(slot);
		if result.is_err() {
			self.prune(session);
		}
		result
	}

	/// Returns the pooled connection without dialing.
	pub async fn get(&self, session: &str) -> Option<Arc<AgentConnection>> {
		let slot = self.slots.lock().get(session).cloned()?;
		let entry = slot.lock().await;
		entry.as_ref().filter(|pooled| !pooled.connection.is_closed()).map(|pooled| Arc::clone(&pooled.connection))
	}

	/// Closes and removes the session's pooled connection.
	pub async fn invalidate(&self, session: &str) -> bool {
		let Some(slot) = self.slots.lock().remove(session) else {
			return false;
		};
		let pooled = slot.lock().await.take();
		match pooled {
			Some(pooled) => {
				pooled.connection.close().await;
				debug!(target = "droidplane.pool", %session, "pooled agent connection invalidated");
				true
			}
			None => false,
		}
	}

	/// Removes `connection` if it is still the session's pooled connection.
	pub async fn evict(&self, session: &str, connection: &Arc<AgentConnection>) {
		let Some(slot) = self.slots.lock().get(session).cloned() else {
			return;
		};
		let evicted = {
			let mut entry = slot.lock().await;
			let same = entry.as_ref().is_some_and(|pooled| Arc::ptr_eq(&pooled.connection, connection));
			if same { entry.take() } else { None }
		};
		drop(slot);
		if let Some(pooled) = evicted {
			pooled.connection.close().await;
			debug!(target = "droidplane.pool", %session, "failed pooled agent connection evicted");
			self.prune(session);
		}
	}

	/// Drops `owner` from every pooled connection, closing those nobody uses anymore.
	///
	/// Returns the number of connections closed.
	pub async fn release_owner(&self, owner: OwnerId) -> usize {
		let slots: Vec<(String, Slot)> = self.slots.lock().iter().map(|(session, slot)| (session.clone(), Arc::clone(slot))).collect();
		let mut closed = 0;
		for (session, slot) in slots {
			let released = {
				let mut entry = slot.lock().await;
				let unused = match entry.as_mut() {
					Some(pooled) => pooled.owners.remove(&owner) && pooled.owners.is_empty(),
					None => false,
				};
				if unused { entry.take() } else { None }
			};
			drop(slot);
			if let Some(pooled) = released {
				pooled.connection.close().await;
				closed += 1;
				debug!(target = "droidplane.pool", %session, owner, "pooled agent connection released");
				self.prune(&session);
			}
		}
		closed
	}

	/// Closes every pooled connection.
	pub async fn close_all(&self) {
		let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
		for slot in slots {
			if let Some(pooled) = slot.lock().await.take() {
				pooled.connection.close().await;
			}
		}
	}

	/// Number of live pooled connections.
	pub async fn len(&self) -> usize {
		let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
		let mut live = 0;
		for slot in slots {
			if slot.lock().await.as_ref().is_some_and(|pooled| !pooled.connection.is_closed()) {
				live += 1;
			}
		}
		live
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// Forgets an empty slot nobody else is holding.
	fn prune(&self, session: &str) {
		let mut slots = self.slots.lock();
		let removable = slots
			.get(session)
			.is_some_and(|slot| Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|entry| entry.is_none()));
		if removable {
			slots.remove(session);
		}
	}
}

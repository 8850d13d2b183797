//! Session id to last known pod address.
//!
//! Not a source of truth. Entries expire after a TTL, are dropped when a
//! session is deleted, and consumers invalidate an entry when connecting to
//! it fails.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct CachedAddress {
	address: String,
	pod_name: Option<String>,
	stored_at: Instant,
}

#[derive(Debug)]
pub struct AddressCache {
	ttl: Duration,
	entries: Mutex<HashMap<String, CachedAddress>>,
}

impl AddressCache {
	/// A zero `ttl` disables caching.
	pub fn new(ttl: Duration) -> Self {
		Self {
			ttl,
			entries: Mutex::new(HashMap::new()),
		}
	}

	/// Fresh `(address, pod_name)` for the session.
	pub fn get(&self, session_id: &str) -> Option<(String, Option<String>)> {
		let mut entries = self.entries.lock();
		let fresh = entries.get(session_id).is_some_and(|entry| entry.stored_at.elapsed() < self.ttl);
		if !fresh {
			entries.remove(session_id);
			return None;
		}
		entries.get(session_id).map(|entry| (entry.address.clone(), entry.pod_name.clone()))
	}

	pub fn insert(&self, session_id: &str, address: &str, pod_name: Option<&str>) {
		if self.ttl.is_zero() {
			return;
		}
		self.entries.lock().insert(
			session_id.to_string(),
			CachedAddress {
				address: address.to_string(),
				pod_name: pod_name.map(str::to_string),
				stored_at: Instant::now(),
			},
		);
	}

	pub fn invalidate(&self, session_id: &str) -> bool {
		self.entries.lock().remove(session_id).is_some()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

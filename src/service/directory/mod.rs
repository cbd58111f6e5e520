mod data;

use std::sync::{Arc, Mutex, MutexGuard};

use asmux_core::{Result, Server, debug};
use lru_cache::LruCache;
use ruma::RoomId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use self::data::Data;
use crate::service;

const CACHE_CAPACITY: usize = 4096;

/// A bridge instance registered with the proxy.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Appservice {
	pub id: Uuid,
	pub owner: String,
	pub prefix: String,
	pub bot: String,
	pub address: String,
	pub hs_token: String,
	pub as_token: String,
	pub push: bool,
	pub push_key: Option<Json<PushKey>>,
	pub config_password_hash: Option<Vec<u8>>,
	pub config_password_expiry: Option<i64>,
	pub login_token: Option<String>,
}

impl Appservice {
	#[must_use]
	pub fn name(&self) -> String { format!("{}/{}", self.owner, self.prefix) }

	/// The externally visible token: `{id}-{as_token}`.
	#[must_use]
	pub fn real_as_token(&self) -> String { format!("{}-{}", self.id, self.as_token) }

	/// `@{owner}{mxid_suffix}`; owner-authored PDUs are exempt from stale
	/// eviction.
	#[must_use]
	pub fn owner_mxid(&self, mxid_suffix: &str) -> String {
		format!("@{}{}", self.owner, mxid_suffix)
	}

	#[must_use]
	pub fn push_key(&self) -> Option<&PushKey> { self.push_key.as_deref() }
}

/// Bridge-supplied push descriptor, stored verbatim.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PushKey {
	pub url: String,
	#[serde(default)]
	pub app_id: String,
	pub pushkey: String,
	#[serde(flatten)]
	pub data: serde_json::Map<String, Value>,
}

#[derive(Clone, Debug, sqlx::FromRow)]
pub struct User {
	pub id: String,
	pub api_token: String,
	pub login_token: String,
}

/// Mapping from a Matrix room to the appservice that owns it.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct Room {
	pub id: String,
	pub owner: Uuid,
	pub deleted: bool,
}

/// Cached lookups for appservices, users and rooms. The relational store
/// is authoritative; these caches are strictly a latency optimisation and
/// are invalidated through the replication pub/sub.
pub struct Service {
	db: Data,
	server: Arc<Server>,
	services: Arc<crate::OnceServices>,

	appservices_by_id: Mutex<LruCache<Uuid, Arc<Appservice>>>,
	appservices_by_owner: Mutex<LruCache<(String, String), Arc<Appservice>>>,
	users_by_id: Mutex<LruCache<String, Arc<User>>>,
	users_by_token: Mutex<LruCache<String, Arc<User>>>,
	rooms: Mutex<LruCache<String, Room>>,
}

impl crate::Service for Service {
	fn build(args: &crate::Args<'_>) -> Result<Arc<Self>> {
		Ok(Arc::new(Self {
			db: Data::new(args.db),
			server: args.server.clone(),
			services: args.services.clone(),
			appservices_by_id: Mutex::new(LruCache::new(CACHE_CAPACITY)),
			appservices_by_owner: Mutex::new(LruCache::new(CACHE_CAPACITY)),
			users_by_id: Mutex::new(LruCache::new(CACHE_CAPACITY)),
			users_by_token: Mutex::new(LruCache::new(CACHE_CAPACITY)),
			rooms: Mutex::new(LruCache::new(CACHE_CAPACITY)),
		}))
	}

	fn name(&self) -> &str { service::make_name(std::module_path!()) }
}

impl Service {
	pub async fn get_appservice(&self, id: Uuid) -> Result<Option<Arc<Appservice>>> {
		if let Some(az) = lock(&self.appservices_by_id).get_mut(&id) {
			return Ok(Some(az.clone()));
		}

		let Some(az) = self.db.get_appservice(id).await? else {
			return Ok(None);
		};

		Ok(Some(self.cache_appservice(az)))
	}

	pub async fn find_appservice(
		&self,
		owner: &str,
		prefix: &str,
	) -> Result<Option<Arc<Appservice>>> {
		let key = (owner.to_owned(), prefix.to_owned());
		if let Some(az) = lock(&self.appservices_by_owner).get_mut(&key) {
			return Ok(Some(az.clone()));
		}

		let Some(az) = self.db.find_appservice(owner, prefix).await? else {
			return Ok(None);
		};

		Ok(Some(self.cache_appservice(az)))
	}

	pub async fn get_many(&self, ids: &[Uuid]) -> Result<Vec<Arc<Appservice>>> {
		let rows = self.db.get_many_appservices(ids).await?;

		Ok(rows
			.into_iter()
			.map(|az| self.cache_appservice(az))
			.collect())
	}

	pub async fn get_user(&self, id: &str) -> Result<Option<Arc<User>>> {
		if let Some(user) = lock(&self.users_by_id).get_mut(id) {
			return Ok(Some(user.clone()));
		}

		let Some(user) = self.db.get_user(id).await? else {
			return Ok(None);
		};

		Ok(Some(self.cache_user(user)))
	}

	pub async fn find_user_by_api_token(&self, api_token: &str) -> Result<Option<Arc<User>>> {
		if let Some(user) = lock(&self.users_by_token).get_mut(api_token) {
			return Ok(Some(user.clone()));
		}

		let Some(user) = self.db.find_user_by_api_token(api_token).await? else {
			return Ok(None);
		};

		Ok(Some(self.cache_user(user)))
	}

	pub async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>> {
		if let Some(room) = lock(&self.rooms).get_mut(room_id.as_str()) {
			return Ok(Some(room.clone()));
		}

		let Some(room) = self.db.get_room(room_id).await? else {
			return Ok(None);
		};

		lock(&self.rooms).insert(room.id.clone(), room.clone());
		Ok(Some(room))
	}

	/// Registers `appservice` as the owner of `room_id`. Returns `None`
	/// when the room already exists, including soft-deleted rows, so stale
	/// traffic keeps dropping silently.
	pub async fn register_room(
		&self,
		room_id: &RoomId,
		appservice: &Appservice,
	) -> Result<Option<Room>> {
		if !self.db.insert_room(room_id, appservice.id).await? {
			return Ok(None);
		}

		debug!(
			appservice = %appservice.name(),
			id = %appservice.id,
			"Registered as the owner of {room_id}",
		);

		let room = Room {
			id: room_id.as_str().to_owned(),
			owner: appservice.id,
			deleted: false,
		};

		lock(&self.rooms).insert(room.id.clone(), room.clone());
		self.services
			.replication()
			.publish_room_invalidation(room_id.as_str())
			.await;

		Ok(Some(room))
	}

	/// Stores (or clears) the push descriptor for an appservice. An empty
	/// `pushkey` clears it, per the bridge protocol.
	pub async fn set_push_key(
		&self,
		appservice: &Appservice,
		push_key: Option<PushKey>,
	) -> Result {
		let push_key = push_key.filter(|key| !key.pushkey.is_empty());
		self.db
			.set_push_key(appservice.id, push_key.as_ref())
			.await?;

		let mut updated = appservice.clone();
		updated.push_key = push_key.map(Json);
		self.cache_appservice(updated);

		self.services
			.replication()
			.publish_appservice_invalidation(appservice.id)
			.await;

		Ok(())
	}

	pub fn invalidate_appservice(&self, id: Uuid) {
		let az = lock(&self.appservices_by_id).remove(&id);
		if let Some(az) = az {
			lock(&self.appservices_by_owner).remove(&(az.owner.clone(), az.prefix.clone()));
		}
	}

	pub fn invalidate_room(&self, room_id: &str) { lock(&self.rooms).remove(room_id); }

	pub fn invalidate_user(&self, user_id: &str) {
		let user = lock(&self.users_by_id).remove(user_id);
		if let Some(user) = user {
			lock(&self.users_by_token).remove(&user.api_token);
		}
	}

	/// Drops every cache; used when the invalidation pub/sub fails and
	/// entries can no longer be trusted.
	pub fn clear_caches(&self) {
		lock(&self.appservices_by_id).clear();
		lock(&self.appservices_by_owner).clear();
		lock(&self.users_by_id).clear();
		lock(&self.users_by_token).clear();
		lock(&self.rooms).clear();
	}

	pub fn mxid_prefix(&self) -> String { self.server.config.mxid_prefix() }

	pub fn mxid_suffix(&self) -> String { self.server.config.mxid_suffix() }

	fn cache_appservice(&self, az: Appservice) -> Arc<Appservice> {
		let az = Arc::new(az);
		lock(&self.appservices_by_id).insert(az.id, az.clone());
		lock(&self.appservices_by_owner)
			.insert((az.owner.clone(), az.prefix.clone()), az.clone());

		az
	}

	fn cache_user(&self, user: User) -> Arc<User> {
		let user = Arc::new(user);
		lock(&self.users_by_id).insert(user.id.clone(), user.clone());
		lock(&self.users_by_token).insert(user.api_token.clone(), user.clone());

		user
	}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().expect("directory cache lock poisoned")
}

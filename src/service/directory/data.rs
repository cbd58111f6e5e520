use asmux_core::Result;
use ruma::RoomId;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Appservice, PushKey, Room, User};

pub(crate) struct Data {
	db: PgPool,
}

const APPSERVICE_SELECT: &str = r#"
	SELECT appservice.id, appservice.owner, appservice.prefix, appservice.bot,
	       appservice.address, appservice.hs_token, appservice.as_token,
	       appservice.push, appservice.push_key,
	       appservice.config_password_hash, appservice.config_password_expiry,
	       "user".login_token
	FROM appservice JOIN "user" ON "user".id = appservice.owner
"#;

impl Data {
	pub(super) fn new(db: &PgPool) -> Self { Self { db: db.clone() } }

	pub(super) async fn get_appservice(&self, id: Uuid) -> Result<Option<Appservice>> {
		let row = sqlx::query_as::<_, Appservice>(&format!(
			"{APPSERVICE_SELECT} WHERE appservice.id = $1"
		))
		.bind(id)
		.fetch_optional(&self.db)
		.await?;

		Ok(row)
	}

	pub(super) async fn find_appservice(
		&self,
		owner: &str,
		prefix: &str,
	) -> Result<Option<Appservice>> {
		let row = sqlx::query_as::<_, Appservice>(&format!(
			"{APPSERVICE_SELECT} WHERE appservice.owner = $1 AND appservice.prefix = $2"
		))
		.bind(owner)
		.bind(prefix)
		.fetch_optional(&self.db)
		.await?;

		Ok(row)
	}

	pub(super) async fn get_many_appservices(&self, ids: &[Uuid]) -> Result<Vec<Appservice>> {
		let rows = sqlx::query_as::<_, Appservice>(&format!(
			"{APPSERVICE_SELECT} WHERE appservice.id = ANY($1)"
		))
		.bind(ids)
		.fetch_all(&self.db)
		.await?;

		Ok(rows)
	}

	pub(super) async fn set_push_key(
		&self,
		id: Uuid,
		push_key: Option<&PushKey>,
	) -> Result {
		sqlx::query("UPDATE appservice SET push_key = $2 WHERE id = $1")
			.bind(id)
			.bind(push_key.map(sqlx::types::Json))
			.execute(&self.db)
			.await?;

		Ok(())
	}

	pub(super) async fn get_user(&self, id: &str) -> Result<Option<User>> {
		let row = sqlx::query_as::<_, User>(
			r#"SELECT id, api_token, login_token FROM "user" WHERE id = $1"#,
		)
		.bind(id)
		.fetch_optional(&self.db)
		.await?;

		Ok(row)
	}

	pub(super) async fn find_user_by_api_token(&self, api_token: &str) -> Result<Option<User>> {
		let row = sqlx::query_as::<_, User>(
			r#"SELECT id, api_token, login_token FROM "user" WHERE api_token = $1"#,
		)
		.bind(api_token)
		.fetch_optional(&self.db)
		.await?;

		Ok(row)
	}

	pub(super) async fn get_room(&self, room_id: &RoomId) -> Result<Option<Room>> {
		let row = sqlx::query_as::<_, Room>(
			"SELECT id, owner, deleted FROM room WHERE id = $1 AND deleted = false",
		)
		.bind(room_id.as_str())
		.fetch_optional(&self.db)
		.await?;

		Ok(row)
	}

	/// Inserts the room mapping unless the id already exists; a conflict
	/// (including with a soft-deleted row) registers nothing.
	pub(super) async fn insert_room(&self, room_id: &RoomId, owner: Uuid) -> Result<bool> {
		let done = sqlx::query(
			"INSERT INTO room (id, owner, deleted) VALUES ($1, $2, false) \
			 ON CONFLICT (id) DO NOTHING",
		)
		.bind(room_id.as_str())
		.bind(owner)
		.execute(&self.db)
		.await?;

		Ok(done.rows_affected() > 0)
	}
}

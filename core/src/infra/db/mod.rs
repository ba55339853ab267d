//! Database infrastructure using SeaORM
//!
//! Every node owns one sqlite database (`sync.db` in the data dir) holding
//! the queues, metadata, conflict log, liveness sessions, message ledger and
//! dead letters. The CMS's own storage is not touched here.

use sea_orm::{
	ConnectOptions, ConnectionTrait, Database as SeaDatabase, DatabaseConnection, DbErr, Statement,
};
use sea_orm_migration::MigratorTrait;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod entities;
pub mod migration;

/// Database wrapper for a sync node
pub struct Database {
	conn: DatabaseConnection,
}

impl AsRef<DatabaseConnection> for Database {
	fn as_ref(&self) -> &DatabaseConnection {
		&self.conn
	}
}

impl Database {
	/// Open (creating if necessary) the sync database at `path`.
	pub async fn open(path: &Path) -> Result<Self, DbErr> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)
				.map_err(|e| DbErr::Custom(format!("Failed to create directory: {}", e)))?;
		}

		let db_url = format!("sqlite://{}?mode=rwc", path.display());

		let mut opt = ConnectOptions::new(db_url);
		opt.max_connections(10)
			.min_connections(1)
			.connect_timeout(Duration::from_secs(30))
			.idle_timeout(Duration::from_secs(30))
			.sqlx_logging(false);

		let conn = SeaDatabase::connect(opt).await?;
		apply_pragmas(&conn).await;

		info!("Opened sync database at {:?}", path);

		Ok(Self { conn })
	}

	/// Run migrations
	pub async fn migrate(&self) -> Result<(), DbErr> {
		migration::Migrator::up(&self.conn, None).await?;
		info!("Database migrations completed");
		Ok(())
	}

	/// Get the database connection
	pub fn conn(&self) -> &DatabaseConnection {
		&self.conn
	}
}

/// SQLite PRAGMAs for concurrent writers (queue workers + request path).
async fn apply_pragmas(conn: &DatabaseConnection) {
	for pragma in [
		"PRAGMA journal_mode=WAL",
		"PRAGMA synchronous=NORMAL",
		"PRAGMA temp_store=MEMORY",
		"PRAGMA busy_timeout=5000",
	] {
		let _ = conn
			.execute(Statement::from_string(
				sea_orm::DatabaseBackend::Sqlite,
				pragma,
			))
			.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn open_and_migrate_fresh_database() {
		let temp = tempfile::tempdir().unwrap();
		let db = Database::open(&temp.path().join("sync.db")).await.unwrap();
		db.migrate().await.unwrap();

		// Second migrate is a no-op
		db.migrate().await.unwrap();
	}
}

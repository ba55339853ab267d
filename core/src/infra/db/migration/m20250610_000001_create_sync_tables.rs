use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
	async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.create_table(
				Table::create()
					.table(SyncMetadata::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(SyncMetadata::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(SyncMetadata::ContentType).string().not_null())
					.col(ColumnDef::new(SyncMetadata::EntityId).string().not_null())
					.col(
						ColumnDef::new(SyncMetadata::SyncVersion)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(
						ColumnDef::new(SyncMetadata::ModifiedByLocation)
							.string()
							.not_null(),
					)
					.col(ColumnDef::new(SyncMetadata::LastSyncedAt).timestamp_with_time_zone())
					.col(
						ColumnDef::new(SyncMetadata::SyncStatus)
							.string()
							.not_null()
							.default("pending"),
					)
					.col(
						ColumnDef::new(SyncMetadata::ConflictFlag)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(SyncMetadata::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(SyncMetadata::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_sync_metadata_entity")
					.table(SyncMetadata::Table)
					.col(SyncMetadata::ContentType)
					.col(SyncMetadata::EntityId)
					.unique()
					.to_owned(),
			)
			.await?;

		for table in [QueueTable::Outbound, QueueTable::Broadcast] {
			manager
				.create_table(
					Table::create()
						.table(table.iden())
						.if_not_exists()
						.col(
							ColumnDef::new(Queue::Id)
								.integer()
								.not_null()
								.auto_increment()
								.primary_key(),
						)
						.col(ColumnDef::new(Queue::ShipId).string().not_null())
						.col(ColumnDef::new(Queue::ContentType).string().not_null())
						.col(ColumnDef::new(Queue::ContentId).string().not_null())
						.col(ColumnDef::new(Queue::Operation).string().not_null())
						.col(
							ColumnDef::new(Queue::LocalVersion)
								.big_integer()
								.not_null()
								.default(0),
						)
						.col(ColumnDef::new(Queue::Data).json())
						.col(ColumnDef::new(Queue::Locale).string())
						.col(
							ColumnDef::new(Queue::Status)
								.string()
								.not_null()
								.default("pending"),
						)
						.col(
							ColumnDef::new(Queue::RetryCount)
								.integer()
								.not_null()
								.default(0),
						)
						.col(ColumnDef::new(Queue::ErrorMessage).string())
						.col(
							ColumnDef::new(Queue::CreatedAt)
								.timestamp_with_time_zone()
								.not_null(),
						)
						.col(ColumnDef::new(Queue::SentAt).timestamp_with_time_zone())
						.to_owned(),
				)
				.await?;

			manager
				.create_index(
					Index::create()
						.name(&format!("idx_{}_status", table.name()))
						.table(table.iden())
						.col(Queue::Status)
						.to_owned(),
				)
				.await?;

			manager
				.create_index(
					Index::create()
						.name(&format!("idx_{}_key", table.name()))
						.table(table.iden())
						.col(Queue::ContentType)
						.col(Queue::ContentId)
						.col(Queue::Locale)
						.to_owned(),
				)
				.await?;
		}

		manager
			.create_table(
				Table::create()
					.table(ConflictLog::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ConflictLog::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(ConflictLog::ContentType).string().not_null())
					.col(ColumnDef::new(ConflictLog::EntityId).string().not_null())
					.col(ColumnDef::new(ConflictLog::LocalData).json().not_null())
					.col(ColumnDef::new(ConflictLog::RemoteData).json().not_null())
					.col(
						ColumnDef::new(ConflictLog::ConflictingFields)
							.json()
							.not_null(),
					)
					.col(ColumnDef::new(ConflictLog::ConflictType).string().not_null())
					.col(
						ColumnDef::new(ConflictLog::Status)
							.string()
							.not_null()
							.default("pending"),
					)
					.col(ColumnDef::new(ConflictLog::Resolution).string())
					.col(ColumnDef::new(ConflictLog::MergedData).json())
					.col(
						ColumnDef::new(ConflictLog::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(ConflictLog::ResolvedAt).timestamp_with_time_zone())
					.col(ColumnDef::new(ConflictLog::ResolvedBy).string())
					.to_owned(),
			)
			.await?;

		manager
			.create_index(
				Index::create()
					.name("idx_conflict_log_entity")
					.table(ConflictLog::Table)
					.col(ConflictLog::ContentType)
					.col(ConflictLog::EntityId)
					.col(ConflictLog::Status)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(PeerSession::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(PeerSession::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(
						ColumnDef::new(PeerSession::PeerId)
							.string()
							.not_null()
							.unique_key(),
					)
					.col(
						ColumnDef::new(PeerSession::LastSeenAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(PeerSession::IsOnline)
							.boolean()
							.not_null()
							.default(false),
					)
					.col(
						ColumnDef::new(PeerSession::OnlineThresholdSecs)
							.big_integer()
							.not_null()
							.default(300),
					)
					.col(ColumnDef::new(PeerSession::LastSyncAt).timestamp_with_time_zone())
					.col(ColumnDef::new(PeerSession::LastSyncStatus).string())
					.col(
						ColumnDef::new(PeerSession::TotalSyncs)
							.big_integer()
							.not_null()
							.default(0),
					)
					.col(ColumnDef::new(PeerSession::Metadata).json())
					.col(
						ColumnDef::new(PeerSession::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(
						ColumnDef::new(PeerSession::UpdatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(ProcessedMessage::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(ProcessedMessage::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(
						ColumnDef::new(ProcessedMessage::MessageId)
							.string()
							.not_null()
							.unique_key(),
					)
					.col(
						ColumnDef::new(ProcessedMessage::ProcessedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.to_owned(),
			)
			.await?;

		manager
			.create_table(
				Table::create()
					.table(DeadLetter::Table)
					.if_not_exists()
					.col(
						ColumnDef::new(DeadLetter::Id)
							.integer()
							.not_null()
							.auto_increment()
							.primary_key(),
					)
					.col(ColumnDef::new(DeadLetter::MessageId).string().not_null())
					.col(ColumnDef::new(DeadLetter::Payload).json().not_null())
					.col(ColumnDef::new(DeadLetter::Reason).string().not_null())
					.col(
						ColumnDef::new(DeadLetter::CreatedAt)
							.timestamp_with_time_zone()
							.not_null(),
					)
					.col(ColumnDef::new(DeadLetter::ResolvedAt).timestamp_with_time_zone())
					.to_owned(),
			)
			.await?;

		Ok(())
	}

	async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
		manager
			.drop_table(Table::drop().table(DeadLetter::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ProcessedMessage::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(PeerSession::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(ConflictLog::Table).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(QueueTable::Broadcast.iden()).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(QueueTable::Outbound.iden()).to_owned())
			.await?;
		manager
			.drop_table(Table::drop().table(SyncMetadata::Table).to_owned())
			.await?;
		Ok(())
	}
}

/// The two queue tables share one column set.
#[derive(Copy, Clone)]
enum QueueTable {
	Outbound,
	Broadcast,
}

impl QueueTable {
	fn name(self) -> &'static str {
		match self {
			QueueTable::Outbound => "outbound_queue",
			QueueTable::Broadcast => "broadcast_queue",
		}
	}

	fn iden(self) -> Alias {
		Alias::new(self.name())
	}
}

#[derive(DeriveIden)]
enum SyncMetadata {
	Table,
	Id,
	ContentType,
	EntityId,
	SyncVersion,
	ModifiedByLocation,
	LastSyncedAt,
	SyncStatus,
	ConflictFlag,
	CreatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum Queue {
	Id,
	ShipId,
	ContentType,
	ContentId,
	Operation,
	LocalVersion,
	Data,
	Locale,
	Status,
	RetryCount,
	ErrorMessage,
	CreatedAt,
	SentAt,
}

#[derive(DeriveIden)]
enum ConflictLog {
	Table,
	Id,
	ContentType,
	EntityId,
	LocalData,
	RemoteData,
	ConflictingFields,
	ConflictType,
	Status,
	Resolution,
	MergedData,
	CreatedAt,
	ResolvedAt,
	ResolvedBy,
}

#[derive(DeriveIden)]
enum PeerSession {
	Table,
	Id,
	PeerId,
	LastSeenAt,
	IsOnline,
	OnlineThresholdSecs,
	LastSyncAt,
	LastSyncStatus,
	TotalSyncs,
	Metadata,
	CreatedAt,
	UpdatedAt,
}

#[derive(DeriveIden)]
enum ProcessedMessage {
	Table,
	Id,
	MessageId,
	ProcessedAt,
}

#[derive(DeriveIden)]
enum DeadLetter {
	Table,
	Id,
	MessageId,
	Payload,
	Reason,
	CreatedAt,
	ResolvedAt,
}

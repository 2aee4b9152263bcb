//! PostgreSQL-backed message ledger

use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, warn};

pub mod models;

pub use models::*;

use crate::ledger::{
    check_nonce_free, BuildDraft, BuildError, Ledger, SignatureInsert, TxAssembler,
};
use crate::types::{
    ledger_int, ChainType, MessageStatus, MessageType, SignatureStatus, SyncTaskStatus,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn insert_message(&self, message: &NewMessage) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (chain_id, message_type, from_chain_id, from_sender,
                from_message_bridge, from_id, to_chain_id, to_message_bridge,
                to_contract_address, to_bytes, signatures, status, event_id, block_time,
                block_number, log_index, tx_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            ON CONFLICT (tx_hash, log_index) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(message.chain_id)
        .bind(message.message_type.as_str())
        .bind(message.from_chain_id)
        .bind(&message.from_sender)
        .bind(&message.from_message_bridge)
        .bind(&message.from_id)
        .bind(message.to_chain_id)
        .bind(&message.to_message_bridge)
        .bind(&message.to_contract_address)
        .bind(&message.to_bytes)
        .bind(&message.signatures)
        .bind(message.status.as_str())
        .bind(message.event_id)
        .bind(message.block_time)
        .bind(message.block_number)
        .bind(message.log_index)
        .bind(&message.tx_hash)
        .fetch_optional(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to insert message for tx {}", message.tx_hash))?;

        Ok(row.map(|r| r.get("id")))
    }

    async fn get_message(&self, id: i64) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get message {}", id))
    }

    async fn validating_calls(&self, chain_id: i64, weight: i32, limit: i64) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"SELECT * FROM messages
               WHERE chain_id = $1 AND message_type = $2 AND status = $3 AND signatures_count < $4
               ORDER BY signatures_count ASC, id ASC
               LIMIT $5"#,
        )
        .bind(chain_id)
        .bind(MessageType::Call.as_str())
        .bind(MessageStatus::Validating.as_str())
        .bind(weight)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get validating messages")
    }

    async fn mark_message_invalid(&self, id: i64, expected: MessageStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(MessageStatus::Invalid.as_str())
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to mark message {} invalid", id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_message_signature(
        &self,
        message_id: i64,
        signer: &str,
        signature: &str,
    ) -> Result<SignatureInsert> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin signature transaction")?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM message_signatures WHERE message_id = $1 AND signer = $2)",
        )
        .bind(message_id)
        .bind(signer)
        .fetch_one(&mut *tx)
        .await
        .wrap_err("Failed to check existing signature")?;
        if exists {
            return Ok(SignatureInsert::Duplicate);
        }

        // a concurrent insert of the same pair lands here as a no-op
        let inserted = sqlx::query(
            r#"INSERT INTO message_signatures (message_id, signer, signature)
               VALUES ($1, $2, $3)
               ON CONFLICT (message_id, signer) DO NOTHING"#,
        )
        .bind(message_id)
        .bind(signer)
        .bind(signature)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to insert message signature")?
        .rows_affected();
        if inserted == 0 {
            return Ok(SignatureInsert::Duplicate);
        }

        let updated = sqlx::query(
            r#"UPDATE messages SET signatures_count = signatures_count + 1, updated_at = NOW()
               WHERE id = $1"#,
        )
        .bind(message_id)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to increment signatures_count")?
        .rows_affected();
        if updated == 0 {
            return Err(eyre!("message {} not found", message_id));
        }

        tx.commit()
            .await
            .wrap_err("Failed to commit message signature")?;
        Ok(SignatureInsert::Inserted)
    }

    async fn promote_ready(&self, chain_id: i64, weight: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"UPDATE messages SET status = $4, updated_at = NOW()
               WHERE chain_id = $1 AND message_type = $2 AND status = $3
                 AND signatures_count >= $5"#,
        )
        .bind(chain_id)
        .bind(MessageType::Call.as_str())
        .bind(MessageStatus::Validating.as_str())
        .bind(MessageStatus::Pending.as_str())
        .bind(weight)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to promote messages")?;

        Ok(result.rows_affected())
    }

    async fn ready_calls(&self, to_chain_id: i64, weight: i32, limit: i64) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"SELECT * FROM messages
               WHERE to_chain_id = $1 AND message_type = $2 AND signatures_count >= $3
                 AND status = $4
               ORDER BY id ASC
               LIMIT $5"#,
        )
        .bind(to_chain_id)
        .bind(MessageType::Call.as_str())
        .bind(weight)
        .bind(MessageStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get messages ready to build")
    }

    async fn message_signatures(&self, message_id: i64) -> Result<Vec<MessageSignature>> {
        sqlx::query_as::<_, MessageSignature>(
            "SELECT * FROM message_signatures WHERE message_id = $1 ORDER BY id ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to get signatures for message {}", message_id))
    }

    async fn commit_build(
        &self,
        draft: BuildDraft<'_>,
        assembler: &dyn TxAssembler,
    ) -> Result<Signature> {
        let message = draft.message;
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin build transaction")?;

        // FOR UPDATE locks nothing for an address without history
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(draft.address)
            .execute(&mut *tx)
            .await
            .wrap_err("Failed to lock builder address")?;

        let latest = sqlx::query_as::<_, Signature>(
            r#"SELECT * FROM signatures
               WHERE address = $1 AND status <> $2
               ORDER BY nonce DESC
               LIMIT 1
               FOR UPDATE"#,
        )
        .bind(draft.address)
        .bind(SignatureStatus::Invalid.as_str())
        .fetch_optional(&mut *tx)
        .await
        .wrap_err("Failed to read latest signature")?;

        check_nonce_free(latest.as_ref(), draft.address)?;

        let status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM messages WHERE id = $1 FOR UPDATE",
        )
        .bind(message.id)
        .fetch_optional(&mut *tx)
        .await
        .wrap_err("Failed to lock message")?;
        if status.as_deref() != Some(MessageStatus::Pending.as_str()) {
            return Err(BuildError::MessageNotPending(message.id).into());
        }

        let nonce = assembler.chain_nonce().await?;
        let signed = assembler.sign(nonce).await?;
        let nonce = ledger_int(nonce, "nonce")?;

        let signature = sqlx::query_as::<_, Signature>(
            r#"
            INSERT INTO signatures (chain_id, refer_id, message_type, address, nonce, data,
                value, signature, status, tx_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(message.to_chain_id)
        .bind(&message.from_id)
        .bind(MessageType::Send.as_str())
        .bind(draft.address)
        .bind(nonce)
        .bind(&signed.data)
        .bind("0")
        .bind(&signed.raw)
        .bind(SignatureStatus::Pending.as_str())
        .bind(&signed.tx_hash)
        .fetch_one(&mut *tx)
        .await
        .wrap_err("Failed to insert signature")?;

        let updated = sqlx::query(
            r#"UPDATE messages SET status = $3, signatures = $4, updated_at = NOW()
               WHERE id = $1 AND status = $2"#,
        )
        .bind(message.id)
        .bind(MessageStatus::Pending.as_str())
        .bind(MessageStatus::Broadcast.as_str())
        .bind(draft.signatures_json)
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to mark message broadcast")?
        .rows_affected();
        if updated == 0 {
            return Err(BuildError::MessageNotPending(message.id).into());
        }

        tx.commit().await.wrap_err("Failed to commit build")?;
        Ok(signature)
    }

    async fn pending_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>> {
        signatures_with_status(&self.pool, chain_id, SignatureStatus::Pending, limit).await
    }

    async fn broadcast_signatures(&self, chain_id: i64, limit: i64) -> Result<Vec<Signature>> {
        signatures_with_status(&self.pool, chain_id, SignatureStatus::Broadcast, limit).await
    }

    async fn mark_signature(
        &self,
        id: i64,
        expected: SignatureStatus,
        next: SignatureStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE signatures SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(id)
        .bind(expected.as_str())
        .bind(next.as_str())
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update signature {}", id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_sends(&self, to_chain_id: i64, limit: i64) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            r#"SELECT * FROM messages
               WHERE to_chain_id = $1 AND message_type = $2 AND status = $3
               ORDER BY id ASC
               LIMIT $4"#,
        )
        .bind(to_chain_id)
        .bind(MessageType::Send.as_str())
        .bind(MessageStatus::Pending.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get pending send messages")
    }

    async fn confirm_send(&self, send: &Message) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin confirmation transaction")?;

        let call_id: Option<i64> = sqlx::query_scalar(
            r#"SELECT id FROM messages
               WHERE message_type = $1 AND from_chain_id = $2 AND from_id = $3
               ORDER BY id ASC
               LIMIT 1
               FOR UPDATE"#,
        )
        .bind(MessageType::Call.as_str())
        .bind(send.from_chain_id)
        .bind(&send.from_id)
        .fetch_optional(&mut *tx)
        .await
        .wrap_err("Failed to find originating call")?;

        let Some(call_id) = call_id else {
            debug!(
                send_id = send.id,
                from_chain_id = send.from_chain_id,
                from_id = %send.from_id,
                "Originating call not ingested yet"
            );
            return Ok(false);
        };

        let call_updated = sqlx::query(
            "UPDATE messages SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(call_id)
        .bind(MessageStatus::Broadcast.as_str())
        .bind(MessageStatus::Valid.as_str())
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to mark call valid")?
        .rows_affected();
        if call_updated == 0 {
            warn!(
                call_id,
                send_id = send.id,
                "Paired call was not in broadcast state; leaving its status unchanged"
            );
        }

        let send_updated = sqlx::query(
            "UPDATE messages SET status = $3, updated_at = NOW() WHERE id = $1 AND status = $2",
        )
        .bind(send.id)
        .bind(MessageStatus::Pending.as_str())
        .bind(MessageStatus::Valid.as_str())
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to mark send valid")?
        .rows_affected();

        sqlx::query(
            r#"UPDATE signatures
               SET status = $3, block_number = $4, block_time = $5, updated_at = NOW()
               WHERE chain_id = $1 AND refer_id = $2 AND status IN ($6, $7)"#,
        )
        .bind(send.chain_id)
        .bind(&send.from_id)
        .bind(SignatureStatus::Success.as_str())
        .bind(send.block_number)
        .bind(send.block_time)
        .bind(SignatureStatus::Pending.as_str())
        .bind(SignatureStatus::Broadcast.as_str())
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to settle delivering transactions")?;

        tx.commit()
            .await
            .wrap_err("Failed to commit confirmation")?;
        Ok(send_updated > 0)
    }

    async fn ensure_sync_task(&self, task: &NewSyncTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_tasks (chain_type, chain_id, latest_block, start_block, end_block,
                handle_num, status)
            SELECT $1, $2, $3, $3, $4, $5, $6
            WHERE NOT EXISTS (SELECT 1 FROM sync_tasks WHERE chain_type = $1 AND chain_id = $2)
            "#,
        )
        .bind(task.chain_type.as_str())
        .bind(task.chain_id)
        .bind(task.start_block)
        .bind(task.end_block)
        .bind(task.handle_num)
        .bind(SyncTaskStatus::Pending.as_str())
        .execute(&self.pool)
        .await
        .wrap_err("Failed to create sync task")?;
        Ok(())
    }

    async fn active_sync_tasks(&self, chain_type: ChainType, chain_id: i64) -> Result<Vec<SyncTask>> {
        sqlx::query_as::<_, SyncTask>(
            r#"SELECT * FROM sync_tasks
               WHERE chain_type = $1 AND chain_id = $2 AND status = $3
               ORDER BY id ASC"#,
        )
        .bind(chain_type.as_str())
        .bind(chain_id)
        .bind(SyncTaskStatus::Pending.as_str())
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get sync tasks")
    }

    async fn save_sync_progress(&self, id: i64, latest_block: i64, status: SyncTaskStatus) -> Result<()> {
        sqlx::query(
            "UPDATE sync_tasks SET latest_block = $2, status = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(latest_block)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to save progress for sync task {}", id))?;
        Ok(())
    }
}

async fn signatures_with_status(
    pool: &PgPool,
    chain_id: i64,
    status: SignatureStatus,
    limit: i64,
) -> Result<Vec<Signature>> {
    sqlx::query_as::<_, Signature>(
        r#"SELECT * FROM signatures
           WHERE chain_id = $1 AND status = $2
           ORDER BY id ASC
           LIMIT $3"#,
    )
    .bind(chain_id)
    .bind(status.as_str())
    .bind(limit)
    .fetch_all(pool)
    .await
    .wrap_err_with(|| format!("Failed to get {} signatures", status))
}

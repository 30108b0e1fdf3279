//! Block checkpoints: periodic Merkle-rooted snapshots of the event log.
//!
//! Each checkpoint covers every event appended since the previous one,
//! chains to it by hash, and materializes its Merkle tree in the
//! `merkle_nodes` table so per-event inclusion proofs are O(log n) reads.

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{Postgres, QueryBuilder, Transaction};

use crate::error::LedgerError;
use crate::hash::{
    MerkleProof, build_merkle_tree, digests_equal, generate_merkle_proof,
    sha256_hex,
};
use crate::store::{Block, BlockId, EventId, LedgerCtx, LedgerEvent};

const EVENT_BATCH: i64 = 1_000;

/// Build the next checkpoint, covering all events appended since the last
/// one. Returns `None` when there is nothing new.
#[tracing::instrument(skip(ctx))]
pub async fn create_checkpoint(
    ctx: &LedgerCtx,
) -> Result<Option<Block>, LedgerError> {
    let mut tx = ctx.pool.begin().await?;
    // A consistent snapshot of the event range for the whole build.
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    // Serializes concurrent builders; the worker lease normally ensures
    // there is only one.
    let prev_block = sqlx::query_as::<_, Block>(
        "SELECT * FROM ledger_blocks
        WHERE ledger_id = $1
        ORDER BY block_sequence DESC
        LIMIT 1
        FOR UPDATE",
    )
    .bind(ctx.ledger_id)
    .fetch_optional(&mut *tx)
    .await?;
    let last_to = prev_block.as_ref().map(|b| b.to_event_sequence).unwrap_or(0);

    let mut events_hasher = Sha256::new();
    let mut leaves: Vec<String> = Vec::new();
    let mut leaf_events: Vec<EventId> = Vec::new();
    let mut from_sequence: Option<i64> = None;
    let mut to_sequence = last_to;
    loop {
        let batch = sqlx::query_as::<_, LedgerEvent>(
            "SELECT * FROM ledger_events
            WHERE ledger_id = $1 AND sequence_number > $2
            ORDER BY sequence_number
            LIMIT $3",
        )
        .bind(ctx.ledger_id)
        .bind(to_sequence)
        .bind(EVENT_BATCH)
        .fetch_all(&mut *tx)
        .await?;
        if batch.is_empty() {
            break;
        }
        for event in batch {
            let digest = hex::decode(&event.hash).map_err(|_| {
                LedgerError::ChainIntegrityViolation(format!(
                    "event {} hash is not valid hex",
                    event.id
                ))
            })?;
            events_hasher.update(&digest);
            leaves.push(event.hash);
            leaf_events.push(event.id);
            from_sequence.get_or_insert(event.sequence_number);
            to_sequence = event.sequence_number;
        }
    }
    let Some(from_sequence) = from_sequence else {
        return Ok(None);
    };

    let events_hash = hex::encode(events_hasher.finalize());
    let tree = build_merkle_tree(&leaves)?;
    let block_hash =
        chained_block_hash(prev_block.as_ref(), &events_hash)?;
    let block_sequence =
        prev_block.as_ref().map(|b| b.block_sequence + 1).unwrap_or(1);

    let block = sqlx::query_as::<_, Block>(
        "INSERT INTO ledger_blocks (
            ledger_id, block_sequence, from_event_sequence,
            to_event_sequence, event_count, events_hash, merkle_root,
            tree_depth, block_hash, prev_block_id, prev_block_hash
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(block_sequence)
    .bind(from_sequence)
    .bind(to_sequence)
    .bind(leaves.len() as i64)
    .bind(&events_hash)
    .bind(&tree.root)
    .bind(tree.depth as i32)
    .bind(&block_hash)
    .bind(prev_block.as_ref().map(|b| b.id))
    .bind(prev_block.as_ref().map(|b| b.block_hash.as_str()))
    .fetch_one(&mut *tx)
    .await?;

    insert_tree_nodes(ctx, &mut tx, &block.id, &tree.levels, &leaf_events)
        .await?;

    tx.commit().await?;
    tracing::info!(
        block_sequence,
        event_count = leaves.len(),
        "created block checkpoint"
    );
    Ok(Some(block))
}

fn chained_block_hash(
    prev_block: Option<&Block>,
    events_hash: &str,
) -> Result<String, LedgerError> {
    let mut bytes = match prev_block {
        Some(prev) => hex::decode(&prev.block_hash).map_err(|_| {
            LedgerError::ChainIntegrityViolation(
                "stored block hash is not valid hex".into(),
            )
        })?,
        None => Vec::new(),
    };
    bytes.extend_from_slice(&hex::decode(events_hash).map_err(|_| {
        LedgerError::ChainIntegrityViolation(
            "events hash is not valid hex".into(),
        )
    })?);
    Ok(sha256_hex(&bytes))
}

async fn insert_tree_nodes(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    block_id: &BlockId,
    levels: &[Vec<String>],
    leaf_events: &[EventId],
) -> Result<(), LedgerError> {
    struct Node<'a> {
        level: i32,
        position: i64,
        hash: &'a str,
        event_id: Option<EventId>,
    }
    let mut nodes = Vec::new();
    for (level, hashes) in levels.iter().enumerate() {
        for (position, hash) in hashes.iter().enumerate() {
            nodes.push(Node {
                level: level as i32,
                position: position as i64,
                hash,
                event_id: (level == 0)
                    .then(|| leaf_events[position]),
            });
        }
    }
    let chunk_size = ctx.advanced.batch_max_size.max(1);
    for chunk in nodes.chunks(chunk_size) {
        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO merkle_nodes (
                block_id, level, position, hash, event_id
            ) ",
        );
        builder.push_values(chunk, |mut row, node| {
            row.push_bind(block_id)
                .push_bind(node.level)
                .push_bind(node.position)
                .push_bind(node.hash)
                .push_bind(node.event_id);
        });
        builder.build().execute(&mut **tx).await?;
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockVerification {
    pub valid: bool,
    pub block_sequence: i64,
    pub failure: Option<String>,
}

/// Recompute a stored checkpoint from its events and check the chain
/// linkage to the previous block.
pub async fn verify_block(
    ctx: &LedgerCtx,
    block_sequence: i64,
) -> Result<BlockVerification, LedgerError> {
    let block = get_block(ctx, block_sequence).await?;
    let fail = |failure: &str| BlockVerification {
        valid: false,
        block_sequence,
        failure: Some(failure.to_string()),
    };

    let mut events_hasher = Sha256::new();
    let mut leaves = Vec::new();
    let mut cursor = block.from_event_sequence - 1;
    while cursor < block.to_event_sequence {
        let batch = sqlx::query_as::<_, LedgerEvent>(
            "SELECT * FROM ledger_events
            WHERE ledger_id = $1
              AND sequence_number > $2 AND sequence_number <= $3
            ORDER BY sequence_number
            LIMIT $4",
        )
        .bind(ctx.ledger_id)
        .bind(cursor)
        .bind(block.to_event_sequence)
        .bind(EVENT_BATCH)
        .fetch_all(&ctx.pool)
        .await?;
        if batch.is_empty() {
            break;
        }
        for event in batch {
            let digest = hex::decode(&event.hash).map_err(|_| {
                LedgerError::ChainIntegrityViolation(format!(
                    "event {} hash is not valid hex",
                    event.id
                ))
            })?;
            events_hasher.update(&digest);
            leaves.push(event.hash);
            cursor = event.sequence_number;
        }
    }

    if leaves.len() as i64 != block.event_count {
        return Ok(fail("event count mismatch"));
    }
    let events_hash = hex::encode(events_hasher.finalize());
    if !digests_equal(&events_hash, &block.events_hash) {
        return Ok(fail("events hash mismatch"));
    }
    let tree = build_merkle_tree(&leaves)?;
    if !digests_equal(&tree.root, &block.merkle_root) {
        return Ok(fail("merkle root mismatch"));
    }

    let prev_block = match block.prev_block_id {
        Some(prev_id) => Some(
            sqlx::query_as::<_, Block>(
                "SELECT * FROM ledger_blocks WHERE id = $1",
            )
            .bind(prev_id)
            .fetch_optional(&ctx.pool)
            .await?
            .ok_or(LedgerError::NotFound("previous block"))?,
        ),
        None => None,
    };
    if let (Some(prev), Some(stored_prev_hash)) =
        (&prev_block, &block.prev_block_hash)
    {
        if !digests_equal(&prev.block_hash, stored_prev_hash)
            || prev.block_sequence + 1 != block.block_sequence
        {
            return Ok(fail("previous block linkage mismatch"));
        }
    }
    let expected_block_hash =
        chained_block_hash(prev_block.as_ref(), &events_hash)?;
    if !digests_equal(&expected_block_hash, &block.block_hash) {
        return Ok(fail("block hash mismatch"));
    }

    Ok(BlockVerification {
        valid: true,
        block_sequence,
        failure: None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnchorCheck {
    pub matches: bool,
    pub block_hash: String,
    pub merkle_root: String,
}

/// Compare an externally anchored hash against the stored block hash.
pub async fn verify_external_anchor(
    ctx: &LedgerCtx,
    block_sequence: i64,
    external_hash: &str,
) -> Result<AnchorCheck, LedgerError> {
    let block = get_block(ctx, block_sequence).await?;
    Ok(AnchorCheck {
        matches: digests_equal(&block.block_hash, external_hash),
        block_hash: block.block_hash,
        merkle_root: block.merkle_root,
    })
}

/// Inclusion proof for a checkpointed event, built from the materialized
/// leaf level of its block.
pub async fn generate_event_proof(
    ctx: &LedgerCtx,
    event_id: &EventId,
) -> Result<MerkleProof, LedgerError> {
    let leaf: Option<(BlockId, i64)> = sqlx::query_as(
        "SELECT block_id, position FROM merkle_nodes
        WHERE event_id = $1 AND level = 0",
    )
    .bind(event_id)
    .fetch_optional(&ctx.pool)
    .await?;
    let (block_id, position) =
        leaf.ok_or(LedgerError::NotFound("checkpointed event"))?;

    let leaves: Vec<String> = sqlx::query_scalar(
        "SELECT hash FROM merkle_nodes
        WHERE block_id = $1 AND level = 0
        ORDER BY position",
    )
    .bind(block_id)
    .fetch_all(&ctx.pool)
    .await?;

    generate_merkle_proof(&leaves, position as usize)
}

pub async fn get_block(
    ctx: &LedgerCtx,
    block_sequence: i64,
) -> Result<Block, LedgerError> {
    sqlx::query_as::<_, Block>(
        "SELECT * FROM ledger_blocks
        WHERE ledger_id = $1 AND block_sequence = $2",
    )
    .bind(ctx.ledger_id)
    .bind(block_sequence)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(LedgerError::NotFound("block"))
}

pub async fn latest_block(
    ctx: &LedgerCtx,
) -> Result<Option<Block>, LedgerError> {
    Ok(sqlx::query_as::<_, Block>(
        "SELECT * FROM ledger_blocks
        WHERE ledger_id = $1
        ORDER BY block_sequence DESC
        LIMIT 1",
    )
    .bind(ctx.ledger_id)
    .fetch_optional(&ctx.pool)
    .await?)
}

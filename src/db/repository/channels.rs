//! Channel repository with batched upserts

use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::db::models::ChannelRow;
use crate::models::Channel;

/// Upper bound of rows per statement (14 binds per row, 65535 binds max)
pub const MAX_ROWS_PER_STATEMENT: usize = 4000;

/// Upsert a batch of channels in a single multi-row statement.
/// Rows are sent unordered; the primary key decides insert vs update.
pub async fn upsert_batch(
    pool: &PgPool,
    playlist_id: Uuid,
    channels: &[Channel],
) -> Result<u64, sqlx::Error> {
    let mut affected = 0;

    for chunk in channels.chunks(MAX_ROWS_PER_STATEMENT) {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO channels (playlist_id, channel_id, native_id, name, logo, group_name, \
             channel_number, cmd, secret, sample_url, visible, custom_name, custom_logo, custom_order) ",
        );

        builder.push_values(chunk, |mut row, channel| {
            row.push_bind(playlist_id)
                .push_bind(channel.channel_id.clone())
                .push_bind(channel.native_id.clone())
                .push_bind(channel.name.clone())
                .push_bind(channel.logo.clone())
                .push_bind(channel.group.clone())
                .push_bind(channel.number)
                .push_bind(channel.cmd.clone())
                .push_bind(channel.secret.clone())
                .push_bind(channel.sample_url.clone())
                .push_bind(channel.visible)
                .push_bind(channel.custom_name.clone())
                .push_bind(channel.custom_logo.clone())
                .push_bind(channel.custom_order);
        });

        builder.push(
            r#"
            ON CONFLICT (playlist_id, channel_id) DO UPDATE SET
                native_id = EXCLUDED.native_id,
                name = EXCLUDED.name,
                logo = EXCLUDED.logo,
                group_name = EXCLUDED.group_name,
                channel_number = EXCLUDED.channel_number,
                cmd = EXCLUDED.cmd,
                secret = EXCLUDED.secret,
                sample_url = EXCLUDED.sample_url,
                visible = EXCLUDED.visible,
                custom_name = EXCLUDED.custom_name,
                custom_logo = EXCLUDED.custom_logo,
                custom_order = EXCLUDED.custom_order,
                updated_at = NOW()
            "#,
        );

        let result = builder.build().execute(pool).await?;
        affected += result.rows_affected();
    }

    Ok(affected)
}

/// Delete channels of a playlist that are not in `keep`
pub async fn delete_except(
    pool: &PgPool,
    playlist_id: Uuid,
    keep: &[String],
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM channels WHERE playlist_id = $1 AND NOT (channel_id = ANY($2))",
    )
    .bind(playlist_id)
    .bind(keep)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Get a single channel
pub async fn find(
    pool: &PgPool,
    playlist_id: Uuid,
    channel_id: &str,
) -> Result<Option<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        r#"
        SELECT channel_id, native_id, name, logo, group_name, channel_number, cmd, secret,
               sample_url, visible, custom_name, custom_logo, custom_order
        FROM channels
        WHERE playlist_id = $1 AND channel_id = $2
        "#,
    )
    .bind(playlist_id)
    .bind(channel_id)
    .fetch_optional(pool)
    .await
}

/// All channels of a playlist in display order
pub async fn list_by_playlist(
    pool: &PgPool,
    playlist_id: Uuid,
) -> Result<Vec<ChannelRow>, sqlx::Error> {
    sqlx::query_as::<_, ChannelRow>(
        r#"
        SELECT channel_id, native_id, name, logo, group_name, channel_number, cmd, secret,
               sample_url, visible, custom_name, custom_logo, custom_order
        FROM channels
        WHERE playlist_id = $1
        ORDER BY custom_order NULLS LAST, channel_number NULLS LAST, name
        "#,
    )
    .bind(playlist_id)
    .fetch_all(pool)
    .await
}

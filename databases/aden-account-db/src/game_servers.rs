use anyhow::Result;

use crate::DBGameServer;

#[derive(sqlx::FromRow)]
struct DBGameServerRow {
    server_id: i64,
    hexid: String,
    host: String,
}

impl super::AccountDatabase {
    pub async fn get_all_game_servers(&self) -> Result<Vec<DBGameServer>> {
        let rows = sqlx::query_as::<_, DBGameServerRow>("SELECT CAST(server_id AS SIGNED) AS server_id, hexid, host FROM gameservers")
            .fetch_all(&self.connection_pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| DBGameServer {
                server_id: row.server_id as i32,
                hex_id: row.hexid,
                host: row.host,
            })
            .collect())
    }

    /// Binds `hex_id` to `server_id`, replacing whatever identity the id carried before.
    pub async fn upsert_game_server(&self, server_id: i32, hex_id: &str, host: &str) -> Result<()> {
        sqlx::query("REPLACE INTO gameservers (hexid, server_id, host) VALUES (?, ?, ?)")
            .bind(hex_id)
            .bind(server_id)
            .bind(host)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }
}

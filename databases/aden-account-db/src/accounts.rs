use anyhow::Result;
use std::net::Ipv4Addr;

use crate::{AccountInfo, IpAuthKind, IpAuthRule};

#[derive(sqlx::FromRow)]
struct DBAccount {
    login: String,
    password: String,
    access_level: i64,
    last_server: i64,
}

#[derive(sqlx::FromRow)]
struct DBIpAuth {
    ip: String,
    #[sqlx(rename = "type")]
    kind: String,
}

impl super::AccountDatabase {
    /// A pending `ban_temp` flag whose expiry lies in the future reports the account as level -1.
    pub async fn get_account_by_login(&self, login: &str, now_millis: i64) -> Result<Option<AccountInfo>> {
        let account = sqlx::query_as::<_, DBAccount>(
            "SELECT login, password, \
             CAST(IF(? > value OR value IS NULL, accessLevel, -1) AS SIGNED) AS access_level, \
             CAST(lastServer AS SIGNED) AS last_server \
             FROM accounts LEFT JOIN account_data \
             ON (account_data.account_name = accounts.login AND account_data.var = 'ban_temp') \
             WHERE login = ?",
        )
        .bind(now_millis)
        .bind(login)
        .fetch_optional(&self.connection_pool)
        .await?;

        Ok(account.map(|a| AccountInfo {
            login: a.login,
            password_hash: a.password,
            access_level: a.access_level as i32,
            last_server: a.last_server as i32,
        }))
    }

    pub async fn create_account(&self, login: &str, password_hash: &str, access_level: i32, ip: &str, now_millis: i64) -> Result<()> {
        sqlx::query("INSERT INTO accounts (login, password, lastactive, accessLevel, lastIP) VALUES (?, ?, ?, ?, ?)")
            .bind(login)
            .bind(password_hash)
            .bind(now_millis)
            .bind(access_level)
            .bind(ip)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_last_login(&self, login: &str, last_active_millis: i64, ip: &str) -> Result<()> {
        sqlx::query("UPDATE accounts SET lastactive = ?, lastIP = ? WHERE login = ?")
            .bind(last_active_millis)
            .bind(ip)
            .bind(login)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_access_level(&self, login: &str, access_level: i32) -> Result<()> {
        sqlx::query("UPDATE accounts SET accessLevel = ? WHERE login = ?")
            .bind(access_level)
            .bind(login)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_last_server(&self, login: &str, server_id: i32) -> Result<()> {
        sqlx::query("UPDATE accounts SET lastServer = ? WHERE login = ?")
            .bind(server_id)
            .bind(login)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_last_tracert(&self, login: &str, pc_ip: &str, hops: [&str; 4]) -> Result<()> {
        sqlx::query("UPDATE accounts SET pcIp = ?, hop1 = ?, hop2 = ?, hop3 = ?, hop4 = ? WHERE login = ?")
            .bind(pc_ip)
            .bind(hops[0])
            .bind(hops[1])
            .bind(hops[2])
            .bind(hops[3])
            .bind(login)
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    /// Rows with a malformed address or an unknown type are skipped.
    pub async fn get_account_ip_auth(&self, login: &str) -> Result<Vec<IpAuthRule>> {
        let rows = sqlx::query_as::<_, DBIpAuth>("SELECT ip, type FROM accounts_ipauth WHERE login = ?")
            .bind(login)
            .fetch_all(&self.connection_pool)
            .await?;

        let rules = rows
            .into_iter()
            .filter_map(|row| {
                let address = row.ip.trim().parse::<Ipv4Addr>().ok()?;
                let kind = match row.kind.as_str() {
                    "allow" => IpAuthKind::Allow,
                    "deny" => IpAuthKind::Deny,
                    _ => return None,
                };
                Some(IpAuthRule { address, kind })
            })
            .collect();
        Ok(rules)
    }

    pub async fn set_account_temp_ban(&self, login: &str, expiry_millis: i64) -> Result<()> {
        let value = expiry_millis.to_string();
        sqlx::query("INSERT INTO account_data (account_name, var, value) VALUES (?, 'ban_temp', ?) ON DUPLICATE KEY UPDATE value = ?")
            .bind(login)
            .bind(value.as_str())
            .bind(value.as_str())
            .execute(&self.connection_pool)
            .await?;
        Ok(())
    }

    pub async fn set_account_password(&self, login: &str, password_hash: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET password = ? WHERE login = ?")
            .bind(password_hash)
            .bind(login)
            .execute(&self.connection_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_account_email(&self, login: &str) -> Result<Option<String>> {
        let email: Option<(Option<String>,)> = sqlx::query_as("SELECT email FROM accounts WHERE login = ?")
            .bind(login)
            .fetch_optional(&self.connection_pool)
            .await?;
        Ok(email.and_then(|(e,)| e).filter(|e| !e.is_empty()))
    }
}

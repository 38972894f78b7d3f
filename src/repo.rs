//! Repository of domain queries over the dialect-aware store.
//!
//! Every statement here is written in the canonical dialect (`?`
//! placeholders, the bare `user` identifier, `INSERT OR IGNORE INTO`) and
//! relies on the store to translate for the engine in use. Callers never
//! pre-translate.

use std::collections::BTreeSet;

use chrono::{DateTime, Timelike, Utc};

use crate::db::{Db, StoreError, Value};
use crate::model::{
    ExpiredUserTunnel, FederationBinding, FlowSnapshot, ForwardRecord, NodeBasicInfo, RemoteNode,
    TunnelRecord, User,
};

/// How far back hourly traffic statistics are kept.
const FLOW_STATS_RETENTION_MS: i64 = 48 * 60 * 60 * 1000;

/// Forward status written when the owning user or assignment expires.
const FORWARD_PAUSED: i64 = 0;

pub struct Repository {
    db: Db,
}

impl Repository {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn close(&self) {
        self.db.close();
    }

    // --- Users -----------------------------------------------------

    pub async fn create_user(
        &self,
        name: &str,
        pwd: &str,
        role_id: i64,
        exp_time: i64,
        flow: i64,
        num: i64,
        now: i64,
    ) -> Result<i64, StoreError> {
        self.db
            .exec_returning_id(
                "INSERT INTO user(user, pwd, role_id, exp_time, flow, in_flow, out_flow, \
                 flow_reset_time, num, created_time, status) \
                 VALUES(?, ?, ?, ?, ?, 0, 0, 1, ?, ?, 1)",
                &[
                    name.into(),
                    pwd.into(),
                    role_id.into(),
                    exp_time.into(),
                    flow.into(),
                    num.into(),
                    now.into(),
                ],
            )
            .await
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        let row = self
            .db
            .query_row(
                "SELECT id, user, role_id, exp_time, flow, in_flow, out_flow, \
                 flow_reset_time, status FROM user WHERE id = ?",
                &[user_id.into()],
            )
            .await?;
        row.as_ref().map(User::from_row).transpose()
    }

    pub async fn list_expired_active_user_ids(&self, now_ms: i64) -> Result<Vec<i64>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT id FROM user WHERE status = 1 AND exp_time > 0 AND exp_time <= ? \
                 ORDER BY id ASC",
                &[now_ms.into()],
            )
            .await?;
        rows.iter().map(|r| r.try_i64("id")).collect()
    }

    pub async fn disable_user(&self, user_id: i64) -> Result<(), StoreError> {
        self.db
            .exec("UPDATE user SET status = 0 WHERE id = ?", &[user_id.into()])
            .await?;
        Ok(())
    }

    /// Expire users past their deadline: pause each one's active forwards,
    /// then disable the account. Returns how many users were disabled.
    pub async fn disable_expired_users(&self, now_ms: i64) -> Result<u64, StoreError> {
        let user_ids = self.list_expired_active_user_ids(now_ms).await?;
        for user_id in &user_ids {
            for forward in self.list_active_forwards_by_user(*user_id).await? {
                self.update_forward_status(forward.id, FORWARD_PAUSED, now_ms)
                    .await?;
            }
            self.disable_user(*user_id).await?;
        }
        Ok(user_ids.len() as u64)
    }

    /// Zero the monthly traffic counters for users whose reset day is today.
    /// On the last day of a short month, every reset day at or past it fires,
    /// so a "day 31" user still resets in February.
    pub async fn reset_user_monthly_flow(
        &self,
        current_day: i64,
        last_day: i64,
    ) -> Result<u64, StoreError> {
        if current_day == last_day {
            self.db
                .exec(
                    "UPDATE user SET in_flow = 0, out_flow = 0 \
                     WHERE status = 1 AND flow_reset_time >= ?",
                    &[current_day.into()],
                )
                .await
        } else {
            self.db
                .exec(
                    "UPDATE user SET in_flow = 0, out_flow = 0 \
                     WHERE status = 1 AND flow_reset_time = ?",
                    &[current_day.into()],
                )
                .await
        }
    }

    /// Idempotent group membership insert. Returns true if a row was added.
    pub async fn add_user_to_group(
        &self,
        user_group_id: i64,
        user_id: i64,
        now: i64,
    ) -> Result<bool, StoreError> {
        let affected = self
            .db
            .exec(
                "INSERT OR IGNORE INTO user_group_user(user_group_id, user_id, created_time) \
                 VALUES(?, ?, ?)",
                &[user_group_id.into(), user_id.into(), now.into()],
            )
            .await?;
        Ok(affected > 0)
    }

    // --- Forwards --------------------------------------------------

    pub async fn list_active_forwards_by_user(
        &self,
        user_id: i64,
    ) -> Result<Vec<ForwardRecord>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT id, user_id, user_name, name, tunnel_id, remote_addr, strategy, status \
                 FROM forward WHERE user_id = ? AND status = 1 ORDER BY id ASC",
                &[user_id.into()],
            )
            .await?;
        rows.iter().map(ForwardRecord::from_row).collect()
    }

    pub async fn list_active_forwards_by_user_tunnel(
        &self,
        user_id: i64,
        tunnel_id: i64,
    ) -> Result<Vec<ForwardRecord>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT id, user_id, user_name, name, tunnel_id, remote_addr, strategy, status \
                 FROM forward WHERE user_id = ? AND tunnel_id = ? AND status = 1 ORDER BY id ASC",
                &[user_id.into(), tunnel_id.into()],
            )
            .await?;
        rows.iter().map(ForwardRecord::from_row).collect()
    }

    pub async fn get_forward_record(
        &self,
        forward_id: i64,
    ) -> Result<Option<ForwardRecord>, StoreError> {
        let row = self
            .db
            .query_row(
                "SELECT id, user_id, user_name, name, tunnel_id, remote_addr, strategy, status \
                 FROM forward WHERE id = ?",
                &[forward_id.into()],
            )
            .await?;
        row.as_ref().map(ForwardRecord::from_row).transpose()
    }

    pub async fn update_forward_status(
        &self,
        forward_id: i64,
        status: i64,
        now: i64,
    ) -> Result<(), StoreError> {
        self.db
            .exec(
                "UPDATE forward SET status = ?, updated_time = ? WHERE id = ?",
                &[status.into(), now.into(), forward_id.into()],
            )
            .await?;
        Ok(())
    }

    pub async fn forward_exists(&self, forward_id: i64) -> Result<bool, StoreError> {
        self.count_by_id("forward", forward_id).await
    }

    pub async fn speed_limit_exists(&self, speed_limit_id: i64) -> Result<bool, StoreError> {
        self.count_by_id("speed_limit", speed_limit_id).await
    }

    // --- Tunnels ---------------------------------------------------

    pub async fn get_tunnel_record(
        &self,
        tunnel_id: i64,
    ) -> Result<Option<TunnelRecord>, StoreError> {
        let row = self
            .db
            .query_row(
                "SELECT id, type, status, flow, traffic_ratio FROM tunnel WHERE id = ?",
                &[tunnel_id.into()],
            )
            .await?;
        row.as_ref().map(TunnelRecord::from_row).transpose()
    }

    pub async fn tunnel_exists(&self, tunnel_id: i64) -> Result<bool, StoreError> {
        self.count_by_id("tunnel", tunnel_id).await
    }

    pub async fn list_tunnel_ids_by_name_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<i64>, StoreError> {
        let pattern = format!("{prefix}%");
        let rows = self
            .db
            .query(
                "SELECT id FROM tunnel WHERE name LIKE ? ORDER BY id ASC",
                &[pattern.into()],
            )
            .await?;
        rows.iter().map(|r| r.try_i64("id")).collect()
    }

    /// Next display index for tables ordered by an `inx` column. An empty
    /// table or negative stored indexes both start the sequence at zero.
    pub async fn next_index(&self, table: &str) -> Result<i64, StoreError> {
        if !matches!(table, "node" | "tunnel" | "forward") {
            return Err(StoreError::Config(format!(
                "no index column on table {table:?}"
            )));
        }
        let sql = format!("SELECT COALESCE(MAX(inx), -1) + 1 AS next_inx FROM {table}");
        let row = self.db.query_row(&sql, &[]).await?;
        match row {
            None => Ok(0),
            Some(row) => Ok(row.try_i64("next_inx")?.max(0)),
        }
    }

    /// Create a federation tunnel and its first chain hop atomically,
    /// returning the new tunnel id.
    pub async fn create_federation_tunnel(
        &self,
        name: &str,
        tunnel_type: i64,
        protocol: &str,
        now: i64,
        node_id: i64,
        remote_port: i64,
    ) -> Result<i64, StoreError> {
        let tx = self.db.begin().await?;
        let tunnel_id = tx
            .exec_returning_id(
                "INSERT INTO tunnel(name, type, protocol, flow, created_time, updated_time, \
                 status, traffic_ratio, inx, ip_preference) VALUES(?, ?, ?, 0, ?, ?, 1, 1.0, 0, '')",
                &[
                    name.into(),
                    tunnel_type.into(),
                    protocol.into(),
                    now.into(),
                    now.into(),
                ],
            )
            .await?;
        tx.exec(
            "INSERT INTO chain_tunnel(tunnel_id, chain_type, node_id, port, strategy, inx, protocol) \
             VALUES(?, '1', ?, ?, 'fifo', 0, ?)",
            &[
                tunnel_id.into(),
                node_id.into(),
                remote_port.into(),
                protocol.into(),
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(tunnel_id)
    }

    // --- Nodes -----------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_remote_node(
        &self,
        name: &str,
        secret: &str,
        server_ip: &str,
        port_range: &str,
        now: i64,
        status: i64,
        inx: i64,
        remote_url: Option<&str>,
        remote_token: Option<&str>,
        remote_config: Option<&str>,
    ) -> Result<i64, StoreError> {
        self.db
            .exec_returning_id(
                "INSERT INTO node(name, secret, server_ip, port, http, tls, socks, \
                 created_time, updated_time, status, tcp_listen_addr, udp_listen_addr, inx, \
                 is_remote, remote_url, remote_token, remote_config) \
                 VALUES(?, ?, ?, ?, 0, 0, 0, ?, ?, ?, '[::]', '[::]', ?, 1, ?, ?, ?)",
                &[
                    name.into(),
                    secret.into(),
                    server_ip.into(),
                    port_range.into(),
                    now.into(),
                    now.into(),
                    status.into(),
                    inx.into(),
                    remote_url.into(),
                    remote_token.into(),
                    remote_config.into(),
                ],
            )
            .await
    }

    pub async fn list_remote_nodes(&self) -> Result<Vec<RemoteNode>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT id, name, remote_url, remote_token, remote_config FROM node \
                 WHERE is_remote = 1 ORDER BY id DESC",
                &[],
            )
            .await?;
        rows.iter().map(RemoteNode::from_row).collect()
    }

    pub async fn update_node_remote_config(
        &self,
        node_id: i64,
        config: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let raw = config.to_string();
        self.db
            .exec(
                "UPDATE node SET remote_config = ? WHERE id = ?",
                &[raw.into(), node_id.into()],
            )
            .await?;
        Ok(())
    }

    pub async fn get_node_basic_info(
        &self,
        node_id: i64,
    ) -> Result<Option<NodeBasicInfo>, StoreError> {
        let row = self
            .db
            .query_row(
                "SELECT name, server_ip, status FROM node WHERE id = ?",
                &[node_id.into()],
            )
            .await?;
        row.as_ref().map(NodeBasicInfo::from_row).transpose()
    }

    /// All ports in use on a node, across chain hops and forward bindings,
    /// deduplicated and sorted.
    pub async fn list_used_ports_on_node(&self, node_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut used = BTreeSet::new();
        let rows = self
            .db
            .query(
                "SELECT port FROM chain_tunnel WHERE node_id = ? AND port > 0",
                &[node_id.into()],
            )
            .await?;
        for row in &rows {
            if let Some(port) = row.opt_i64("port")? {
                used.insert(port);
            }
        }
        let rows = self
            .db
            .query(
                "SELECT port FROM forward_port WHERE node_id = ? AND port > 0",
                &[node_id.into()],
            )
            .await?;
        for row in &rows {
            if let Some(port) = row.opt_i64("port")? {
                used.insert(port);
            }
        }
        Ok(used.into_iter().collect())
    }

    pub async fn list_active_bindings_for_node(
        &self,
        node_id: i64,
    ) -> Result<Vec<FederationBinding>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT federation_tunnel_binding.id, federation_tunnel_binding.tunnel_id, \
                 COALESCE(tunnel.name, '') AS tunnel_name, federation_tunnel_binding.chain_type, \
                 federation_tunnel_binding.hop_inx, federation_tunnel_binding.allocated_port, \
                 federation_tunnel_binding.resource_key, federation_tunnel_binding.remote_binding_id, \
                 federation_tunnel_binding.updated_time \
                 FROM federation_tunnel_binding \
                 LEFT JOIN tunnel ON tunnel.id = federation_tunnel_binding.tunnel_id \
                 WHERE federation_tunnel_binding.node_id = ? AND federation_tunnel_binding.status = 1 \
                 ORDER BY federation_tunnel_binding.allocated_port ASC, federation_tunnel_binding.id ASC",
                &[node_id.into()],
            )
            .await?;
        rows.iter().map(FederationBinding::from_row).collect()
    }

    // --- User tunnels ----------------------------------------------

    pub async fn list_expired_active_user_tunnels(
        &self,
        now_ms: i64,
    ) -> Result<Vec<ExpiredUserTunnel>, StoreError> {
        let rows = self
            .db
            .query(
                "SELECT id, user_id, tunnel_id FROM user_tunnel \
                 WHERE status = 1 AND exp_time > 0 AND exp_time <= ? ORDER BY id ASC",
                &[now_ms.into()],
            )
            .await?;
        rows.iter().map(ExpiredUserTunnel::from_row).collect()
    }

    pub async fn disable_user_tunnel(&self, user_tunnel_id: i64) -> Result<(), StoreError> {
        self.db
            .exec(
                "UPDATE user_tunnel SET status = 0 WHERE id = ?",
                &[user_tunnel_id.into()],
            )
            .await?;
        Ok(())
    }

    /// Expire user-tunnel assignments past their deadline: pause the forwards
    /// riding that user/tunnel pair, then disable the assignment. Forwards on
    /// the user's other tunnels stay active.
    pub async fn disable_expired_user_tunnels(&self, now_ms: i64) -> Result<u64, StoreError> {
        let expired = self.list_expired_active_user_tunnels(now_ms).await?;
        for item in &expired {
            for forward in self
                .list_active_forwards_by_user_tunnel(item.user_id, item.tunnel_id)
                .await?
            {
                self.update_forward_status(forward.id, FORWARD_PAUSED, now_ms)
                    .await?;
            }
            self.disable_user_tunnel(item.id).await?;
        }
        Ok(expired.len() as u64)
    }

    pub async fn reset_user_tunnel_monthly_flow(
        &self,
        current_day: i64,
        last_day: i64,
    ) -> Result<u64, StoreError> {
        if current_day == last_day {
            self.db
                .exec(
                    "UPDATE user_tunnel SET in_flow = 0, out_flow = 0 \
                     WHERE status = 1 AND flow_reset_time >= ?",
                    &[current_day.into()],
                )
                .await
        } else {
            self.db
                .exec(
                    "UPDATE user_tunnel SET in_flow = 0, out_flow = 0 \
                     WHERE status = 1 AND flow_reset_time = ?",
                    &[current_day.into()],
                )
                .await
        }
    }

    // --- Flow statistics -------------------------------------------

    pub async fn purge_old_flow_statistics(&self, cutoff_ms: i64) -> Result<u64, StoreError> {
        self.db
            .exec(
                "DELETE FROM statistics_flow WHERE created_time < ?",
                &[cutoff_ms.into()],
            )
            .await
    }

    pub async fn list_user_flow_snapshots(&self) -> Result<Vec<FlowSnapshot>, StoreError> {
        let rows = self
            .db
            .query("SELECT id, in_flow, out_flow FROM user ORDER BY id ASC", &[])
            .await?;
        rows.iter().map(FlowSnapshot::from_row).collect()
    }

    pub async fn last_flow_statistic_total(
        &self,
        user_id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let row = self
            .db
            .query_row(
                "SELECT total_flow FROM statistics_flow WHERE user_id = ? \
                 ORDER BY created_time DESC, id DESC LIMIT 1",
                &[user_id.into()],
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row.try_i64("total_flow")?)),
        }
    }

    pub async fn insert_flow_statistic(
        &self,
        user_id: i64,
        flow: i64,
        total_flow: i64,
        time_label: &str,
        created_time: i64,
    ) -> Result<i64, StoreError> {
        self.db
            .exec_returning_id(
                "INSERT INTO statistics_flow(user_id, flow, total_flow, time, created_time) \
                 VALUES(?, ?, ?, ?, ?)",
                &[
                    user_id.into(),
                    flow.into(),
                    total_flow.into(),
                    time_label.into(),
                    created_time.into(),
                ],
            )
            .await
    }

    /// One run of the hourly statistics pass: purge entries older than the
    /// retention window, then record each user's traffic delta since the
    /// previous sample. A counter that went backwards (node reset) restarts
    /// the series at the current total.
    pub async fn record_hourly_flow_snapshot(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now_ms = now.timestamp_millis();
        self.purge_old_flow_statistics(now_ms - FLOW_STATS_RETENTION_MS)
            .await?;

        let hour_mark = now
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now);
        let hour_label = hour_mark.format("%H:%M").to_string();
        let created_time = hour_mark.timestamp_millis();

        for snapshot in self.list_user_flow_snapshots().await? {
            let current_total = snapshot.total();
            let increment = match self.last_flow_statistic_total(snapshot.user_id).await? {
                Some(last_total) if current_total >= last_total => current_total - last_total,
                Some(_) => current_total,
                None => current_total,
            };
            self.insert_flow_statistic(
                snapshot.user_id,
                increment,
                current_total,
                &hour_label,
                created_time,
            )
            .await?;
        }
        Ok(())
    }

    // --- Helpers ---------------------------------------------------

    async fn count_by_id(&self, table: &str, id: i64) -> Result<bool, StoreError> {
        // Table names come from this module only; ids are bound parameters.
        let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE id = ?");
        let row = self.db.query_row(&sql, &[id.into()]).await?;
        match row {
            None => Ok(false),
            Some(row) => Ok(row.try_i64("n")? > 0),
        }
    }
}

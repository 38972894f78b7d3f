//! Row-mapped records for the tables the repository touches.
//!
//! Each record decodes itself from a [`Row`] by column name, so the same
//! mapping works for both engines. Only the columns the queries actually
//! read are modeled here.

use crate::db::{Row, StoreError};

/// An account row from the `user` table. The table name collides with a
/// PostgreSQL keyword; the rewrite layer quotes it, callers write it bare.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub user: String,
    pub role_id: i64,
    pub exp_time: i64,
    pub flow: i64,
    pub in_flow: i64,
    pub out_flow: i64,
    pub flow_reset_time: i64,
    pub status: i64,
}

impl User {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_i64("id")?,
            user: row.try_text("user")?,
            role_id: row.try_i64("role_id")?,
            exp_time: row.try_i64("exp_time")?,
            flow: row.try_i64("flow")?,
            in_flow: row.try_i64("in_flow")?,
            out_flow: row.try_i64("out_flow")?,
            flow_reset_time: row.try_i64("flow_reset_time")?,
            status: row.try_i64("status")?,
        })
    }
}

/// A forwarding rule as handed to the node-facing side of the system.
#[derive(Debug, Clone)]
pub struct ForwardRecord {
    pub id: i64,
    pub user_id: i64,
    pub user_name: String,
    pub name: String,
    pub tunnel_id: i64,
    pub remote_addr: String,
    pub strategy: String,
    pub status: i64,
}

impl ForwardRecord {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        let mut record = Self {
            id: row.try_i64("id")?,
            user_id: row.try_i64("user_id")?,
            user_name: row.try_text("user_name")?,
            name: row.try_text("name")?,
            tunnel_id: row.try_i64("tunnel_id")?,
            remote_addr: row.try_text("remote_addr")?,
            strategy: row.try_text("strategy")?,
            status: row.try_i64("status")?,
        };
        // Legacy rows predate the strategy column default.
        if record.strategy.trim().is_empty() {
            record.strategy = String::from("fifo");
        }
        Ok(record)
    }
}

/// Tunnel fields needed for quota accounting.
#[derive(Debug, Clone)]
pub struct TunnelRecord {
    pub id: i64,
    pub tunnel_type: i64,
    pub status: i64,
    pub flow: i64,
    pub traffic_ratio: f64,
}

impl TunnelRecord {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        let mut record = Self {
            id: row.try_i64("id")?,
            tunnel_type: row.try_i64("type")?,
            status: row.try_i64("status")?,
            flow: row.try_i64("flow")?,
            traffic_ratio: row.try_f64("traffic_ratio")?,
        };
        if record.flow <= 0 {
            record.flow = 1;
        }
        if record.traffic_ratio <= 0.0 {
            record.traffic_ratio = 1.0;
        }
        Ok(record)
    }
}

/// Name, address and status of a node.
#[derive(Debug, Clone)]
pub struct NodeBasicInfo {
    pub name: String,
    pub server_ip: String,
    pub status: i64,
}

impl NodeBasicInfo {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            name: row.try_text("name")?,
            server_ip: row.try_text("server_ip")?,
            status: row.try_i64("status")?,
        })
    }
}

/// A node managed over its remote control URL.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    pub id: i64,
    pub name: String,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub remote_config: Option<String>,
}

impl RemoteNode {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_i64("id")?,
            name: row.try_text("name")?,
            remote_url: row.opt_text("remote_url")?,
            remote_token: row.opt_text("remote_token")?,
            remote_config: row.opt_text("remote_config")?,
        })
    }

    /// Parse the stored remote configuration blob, if any.
    pub fn config_json(&self) -> Result<Option<serde_json::Value>, StoreError> {
        match &self.remote_config {
            None => Ok(None),
            Some(raw) => serde_json::from_str(raw)
                .map(Some)
                .map_err(|err| StoreError::Scan(format!("remote_config for node {}: {err}", self.id))),
        }
    }
}

/// An active federation binding on a node, joined with its tunnel name.
#[derive(Debug, Clone)]
pub struct FederationBinding {
    pub id: i64,
    pub tunnel_id: i64,
    pub tunnel_name: String,
    pub chain_type: i64,
    pub hop_inx: i64,
    pub allocated_port: i64,
    pub resource_key: String,
    pub remote_binding_id: String,
    pub updated_time: i64,
}

impl FederationBinding {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_i64("id")?,
            tunnel_id: row.try_i64("tunnel_id")?,
            tunnel_name: row.try_text("tunnel_name")?,
            chain_type: row.try_i64("chain_type")?,
            hop_inx: row.try_i64("hop_inx")?,
            allocated_port: row.try_i64("allocated_port")?,
            resource_key: row.try_text("resource_key")?,
            remote_binding_id: row.try_text("remote_binding_id")?,
            updated_time: row.try_i64("updated_time")?,
        })
    }
}

/// A user-to-tunnel assignment that has passed its expiry time.
#[derive(Debug, Clone)]
pub struct ExpiredUserTunnel {
    pub id: i64,
    pub user_id: i64,
    pub tunnel_id: i64,
}

impl ExpiredUserTunnel {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            id: row.try_i64("id")?,
            user_id: row.try_i64("user_id")?,
            tunnel_id: row.try_i64("tunnel_id")?,
        })
    }
}

/// Per-user traffic counters sampled by the hourly statistics job.
#[derive(Debug, Clone)]
pub struct FlowSnapshot {
    pub user_id: i64,
    pub in_flow: i64,
    pub out_flow: i64,
}

impl FlowSnapshot {
    pub fn from_row(row: &Row) -> Result<Self, StoreError> {
        Ok(Self {
            user_id: row.try_i64("id")?,
            in_flow: row.try_i64("in_flow")?,
            out_flow: row.try_i64("out_flow")?,
        })
    }

    pub fn total(&self) -> i64 {
        self.in_flow + self.out_flow
    }
}

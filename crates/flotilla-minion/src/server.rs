//! Config gRPC server — minion side.
//!
//! Serves `GetMinionConfig` / `SetMinionConfig` on every node. `Set`
//! writes the pushed configuration into the local `is_self` minion row
//! and keeps the Etcd singleton's membership current; the controller
//! calls both repeatedly, so both are idempotent.

use std::net::SocketAddr;

use tonic::{Request, Response, Status};
use tracing::{debug, info};

use flotilla_state::{Conn, StoreError, TableType};

use crate::proto;
use crate::proto::minion_server::Minion;
use crate::{role_from_proto, role_to_proto};

/// gRPC implementation of the minion config service.
pub struct ConfigServer {
    conn: Conn,
}

impl ConfigServer {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> proto::minion_server::MinionServer<Self> {
        proto::minion_server::MinionServer::new(self)
    }
}

#[tonic::async_trait]
impl Minion for ConfigServer {
    async fn get_minion_config(
        &self,
        _request: Request<proto::ConfigRequest>,
    ) -> Result<Response<proto::MinionConfig>, Status> {
        let minion = self
            .conn
            .minion_self()
            .map_err(|e| Status::failed_precondition(e.to_string()))?;
        let etcd_members = self.conn.etcd().map(|e| e.etcd_ips).unwrap_or_default();

        debug!(role = %minion.role, "config polled");

        Ok(Response::new(proto::MinionConfig {
            role: role_to_proto(minion.role) as i32,
            private_ip: minion.private_ip,
            blueprint: minion.blueprint,
            provider: minion.provider,
            size: minion.size,
            region: minion.region,
            floating_ip: minion.floating_ip,
            authorized_keys: minion.authorized_keys,
            etcd_members,
        }))
    }

    async fn set_minion_config(
        &self,
        request: Request<proto::MinionConfig>,
    ) -> Result<Response<proto::ConfigReply>, Status> {
        let cfg = request.into_inner();

        self.conn
            .txn(&[TableType::Minion, TableType::Etcd])
            .run(|view| -> Result<(), StoreError> {
                let mut minion = match view.minion_self() {
                    Ok(m) => m,
                    Err(_) => {
                        let mut m = view.insert_minion();
                        m.is_self = true;
                        m
                    }
                };
                minion.role = role_from_proto(cfg.role);
                minion.private_ip = cfg.private_ip.clone();
                minion.blueprint = cfg.blueprint.clone();
                minion.provider = cfg.provider.clone();
                minion.size = cfg.size.clone();
                minion.region = cfg.region.clone();
                minion.floating_ip = cfg.floating_ip.clone();
                minion.authorized_keys = cfg.authorized_keys.clone();
                view.commit_minion(minion);

                let mut etcd = match view.etcd() {
                    Ok(row) => row,
                    Err(_) => {
                        info!("received boot etcd request");
                        view.insert_etcd()
                    }
                };
                etcd.etcd_ips = cfg.etcd_members.clone();
                etcd.etcd_ips.sort();
                view.commit_etcd(etcd);

                Ok(())
            })
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(proto::ConfigReply {}))
    }
}

/// Serve the config RPC until the process exits.
pub async fn serve(conn: Conn, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    info!(%addr, "minion config server starting");
    tonic::transport::Server::builder()
        .add_service(ConfigServer::new(conn).into_service())
        .serve(addr)
        .await
}

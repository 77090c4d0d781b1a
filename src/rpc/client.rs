//! Typed Worker RPC client (spec section 4.1).
//!
//! One client per node, built over a single `tonic::transport::Channel` so
//! all three services (sandbox lifecycle, info, health) share a connection.
//! Every call carries a deadline from the caller's budget and maps RPC
//! failures into [`CoreError`] so the rest of the core never sees a raw
//! `tonic::Status`.

use std::time::Duration;

use tonic::metadata::MetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::error::{CoreError, CoreResult};
use crate::rpc::proto::{
    health_service_client::HealthServiceClient, info_service_client::InfoServiceClient,
    sandbox_service_client::SandboxServiceClient, CopyToStoreRequest, CopyToStoreResponse,
    HealthCheckRequest, HealthStatus, ListCachedBuildsRequest, ListCachedBuildsResponse,
    SandboxCheckpointRequest, SandboxConfig, SandboxCreateRequest, SandboxDeleteRequest,
    SandboxListResponse, SandboxPauseRequest, SandboxUpdateRequest, ServiceInfoResponse,
    ServiceStatus,
};

/// Outcome of a `Create` call, used by the placement engine to decide
/// whether a failure is retryable on a different node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Started,
    AlreadyRunning,
}

/// A connection to a single worker node's RPC surface.
pub struct WorkerRpc {
    node_id: String,
    sandbox: SandboxServiceClient<Channel>,
    info: InfoServiceClient<Channel>,
    health: HealthServiceClient<Channel>,
}

impl WorkerRpc {
    /// Dials `addr` lazily — `tonic::transport::Endpoint::connect_lazy`
    /// never blocks on the network, so node-pool insertion never stalls on
    /// a slow or unreachable peer.
    pub fn connect(node_id: impl Into<String>, addr: impl Into<String>) -> CoreResult<Self> {
        let endpoint: Endpoint = addr
            .into()
            .parse()
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("invalid node address: {e}")))?;
        let channel = endpoint.connect_lazy();
        Ok(Self {
            node_id: node_id.into(),
            sandbox: SandboxServiceClient::new(channel.clone()),
            info: InfoServiceClient::new(channel.clone()),
            health: HealthServiceClient::new(channel),
        })
    }

    fn request_with_deadline<T>(&self, message: T, deadline: Duration) -> Request<T> {
        let mut request = Request::new(message);
        request.set_timeout(deadline);
        request
    }

    fn tag_sandbox<T>(request: &mut Request<T>, sandbox_id: &str, execution_id: &str) {
        if let Ok(v) = MetadataValue::try_from(sandbox_id) {
            request.metadata_mut().insert("x-sandbox-id", v);
        }
        if let Ok(v) = MetadataValue::try_from(execution_id) {
            request.metadata_mut().insert("x-execution-id", v);
        }
    }

    pub async fn create(
        &mut self,
        sandbox: SandboxConfig,
        start_time_unix_ms: i64,
        end_time_unix_ms: i64,
        deadline: Duration,
    ) -> CoreResult<CreateOutcome> {
        let sandbox_id = sandbox.sandbox_id.clone();
        let request = self.request_with_deadline(
            SandboxCreateRequest { sandbox: Some(sandbox), start_time_unix_ms, end_time_unix_ms },
            deadline,
        );
        match self.sandbox.create(request).await {
            Ok(_) => Ok(CreateOutcome::Started),
            Err(status) if status.code() == tonic::Code::AlreadyExists => {
                Ok(CreateOutcome::AlreadyRunning)
            }
            Err(status) => Err(CoreError::from_status(&status, &sandbox_id)),
        }
    }

    pub async fn delete(
        &mut self,
        sandbox_id: &str,
        execution_id: &str,
        deadline: Duration,
    ) -> CoreResult<()> {
        let mut request = self.request_with_deadline(
            SandboxDeleteRequest {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
            },
            deadline,
        );
        Self::tag_sandbox(&mut request, sandbox_id, execution_id);
        self.sandbox
            .delete(request)
            .await
            .map(|_| ())
            .map_err(|status| CoreError::from_status(&status, sandbox_id))
    }

    pub async fn update(
        &mut self,
        sandbox_id: &str,
        execution_id: &str,
        end_time_unix_ms: i64,
        metadata: std::collections::HashMap<String, String>,
        deadline: Duration,
    ) -> CoreResult<()> {
        let request = self.request_with_deadline(
            SandboxUpdateRequest {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
                end_time_unix_ms,
                has_metadata: !metadata.is_empty(),
                metadata,
            },
            deadline,
        );
        self.sandbox
            .update(request)
            .await
            .map(|_| ())
            .map_err(|status| CoreError::from_status(&status, sandbox_id))
    }

    pub async fn pause(
        &mut self,
        sandbox_id: &str,
        execution_id: &str,
        template_id: &str,
        build_id: &str,
        deadline: Duration,
    ) -> CoreResult<()> {
        let mut request = self.request_with_deadline(
            SandboxPauseRequest {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
                template_id: template_id.to_string(),
                build_id: build_id.to_string(),
            },
            deadline,
        );
        Self::tag_sandbox(&mut request, sandbox_id, execution_id);
        self.sandbox
            .pause(request)
            .await
            .map(|_| ())
            .map_err(|status| CoreError::from_status(&status, sandbox_id))
    }

    pub async fn checkpoint(
        &mut self,
        sandbox_id: &str,
        execution_id: &str,
        template_id: &str,
        build_id: &str,
        deadline: Duration,
    ) -> CoreResult<()> {
        let request = self.request_with_deadline(
            SandboxCheckpointRequest {
                sandbox_id: sandbox_id.to_string(),
                execution_id: execution_id.to_string(),
                template_id: template_id.to_string(),
                build_id: build_id.to_string(),
            },
            deadline,
        );
        self.sandbox
            .checkpoint(request)
            .await
            .map(|_| ())
            .map_err(|status| CoreError::from_status(&status, sandbox_id))
    }

    pub async fn copy_to_store(
        &mut self,
        sandbox_id: &str,
        path: &str,
        deadline: Duration,
    ) -> CoreResult<CopyToStoreResponse> {
        let request = self.request_with_deadline(
            CopyToStoreRequest { sandbox_id: sandbox_id.to_string(), path: path.to_string() },
            deadline,
        );
        self.sandbox
            .copy_to_store(request)
            .await
            .map(|resp| resp.into_inner())
            .map_err(|status| CoreError::from_status(&status, sandbox_id))
    }

    pub async fn list(&mut self, deadline: Duration) -> CoreResult<SandboxListResponse> {
        let request = self.request_with_deadline(crate::rpc::proto::SandboxListRequest {}, deadline);
        self.sandbox
            .list(request)
            .await
            .map(|resp| resp.into_inner())
            .map_err(|status| CoreError::from_status(&status, &self.node_id))
    }

    pub async fn list_cached_builds(
        &mut self,
        deadline: Duration,
    ) -> CoreResult<ListCachedBuildsResponse> {
        let request = self.request_with_deadline(ListCachedBuildsRequest {}, deadline);
        self.sandbox
            .list_cached_builds(request)
            .await
            .map(|resp| resp.into_inner())
            .map_err(|status| CoreError::from_status(&status, &self.node_id))
    }

    pub async fn service_info(&mut self, deadline: Duration) -> CoreResult<ServiceInfoResponse> {
        let request =
            self.request_with_deadline(crate::rpc::proto::ServiceInfoRequest {}, deadline);
        self.info
            .service_info(request)
            .await
            .map(|resp| resp.into_inner())
            .map_err(|status| CoreError::from_status(&status, &self.node_id))
    }

    pub async fn service_status_override(
        &mut self,
        status: ServiceStatus,
        deadline: Duration,
    ) -> CoreResult<()> {
        let request = self.request_with_deadline(
            crate::rpc::proto::ServiceStatusOverrideRequest { service_status: status as i32 },
            deadline,
        );
        self.info
            .service_status_override(request)
            .await
            .map(|_| ())
            .map_err(|status| CoreError::from_status(&status, &self.node_id))
    }

    /// True if the node reports `SERVING`. Transport failures are treated
    /// as unhealthy rather than propagated, matching how `Node::Sync`
    /// folds a failed health check into its retry counter (spec section
    /// 4.2).
    pub async fn is_healthy(&mut self, deadline: Duration) -> bool {
        let request = self.request_with_deadline(HealthCheckRequest {}, deadline);
        matches!(
            self.health.check(request).await,
            Ok(resp) if resp.into_inner().status == HealthStatus::Serving as i32
        )
    }

    /// Idempotent: a `WorkerRpc` has no open resources beyond the lazily
    /// connected channel, so repeated calls are simply no-ops. Kept as an
    /// explicit method so callers have a place to hang future cleanup
    /// (e.g. draining an in-flight stream) without changing the call
    /// site.
    pub fn close(&self) {}

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed clients for the three wire services.
//!
//! Thin wrappers over [`TesseraClient`] that build the request envelope,
//! unwrap the response envelope and surface service errors as
//! [`ClientError::Service`].

use std::sync::Arc;

use crate::client::{ClientError, TesseraClient};
use crate::frame::{Frame, FramedStream};
use crate::proto::{controller_proto, runner_proto, verb_proto};

type BiStream = FramedStream<(quinn::SendStream, quinn::RecvStream)>;

fn service_error(error: controller_proto::RpcError) -> ClientError {
    ClientError::Service(format!("{}: {}", error.code, error.message))
}

/// Client for the controller service.
#[derive(Clone)]
pub struct ControllerClient {
    inner: Arc<TesseraClient>,
}

impl ControllerClient {
    pub fn new(inner: Arc<TesseraClient>) -> Self {
        Self { inner }
    }

    pub fn transport(&self) -> Arc<TesseraClient> {
        self.inner.clone()
    }

    async fn call(
        &self,
        request: controller_proto::rpc_request::Request,
    ) -> Result<controller_proto::rpc_response::Response, ClientError> {
        let envelope = controller_proto::RpcRequest {
            request: Some(request),
        };
        let response: controller_proto::RpcResponse = self.inner.request(&envelope).await?;
        match response.response {
            Some(controller_proto::rpc_response::Response::Error(error)) => {
                Err(service_error(error))
            }
            Some(response) => Ok(response),
            None => Err(ClientError::Service("empty response envelope".to_string())),
        }
    }

    pub async fn ping(&self) -> Result<controller_proto::PingResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::Ping(
                controller_proto::PingRequest {},
            ))
            .await?
        {
            controller_proto::rpc_response::Response::Ping(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_schema(&self) -> Result<controller_proto::GetSchemaResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::GetSchema(
                controller_proto::GetSchemaRequest {},
            ))
            .await?
        {
            controller_proto::rpc_response::Response::GetSchema(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_artefact_diffs(
        &self,
        client_digests: Vec<String>,
    ) -> Result<controller_proto::GetArtefactDiffsResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::GetArtefactDiffs(
                controller_proto::GetArtefactDiffsRequest { client_digests },
            ))
            .await?
        {
            controller_proto::rpc_response::Response::GetArtefactDiffs(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn upload_artefact(&self, content: Vec<u8>) -> Result<String, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::UploadArtefact(
                controller_proto::UploadArtefactRequest { content },
            ))
            .await?
        {
            controller_proto::rpc_response::Response::UploadArtefact(r) => Ok(r.digest),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn create_deployment(
        &self,
        request: controller_proto::CreateDeploymentRequest,
    ) -> Result<String, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::CreateDeployment(
                request,
            ))
            .await?
        {
            controller_proto::rpc_response::Response::CreateDeployment(r) => Ok(r.deployment_key),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get_deployment(
        &self,
        deployment_key: String,
    ) -> Result<controller_proto::GetDeploymentResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::GetDeployment(
                controller_proto::GetDeploymentRequest { deployment_key },
            ))
            .await?
        {
            controller_proto::rpc_response::Response::GetDeployment(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    /// Open the artefact download stream; read with
    /// [`FramedStream::read_stream_item`] until `None`.
    pub async fn get_deployment_artefacts(
        &self,
        request: controller_proto::GetDeploymentArtefactsRequest,
    ) -> Result<BiStream, ClientError> {
        let envelope = controller_proto::RpcRequest {
            request: Some(
                controller_proto::rpc_request::Request::GetDeploymentArtefacts(request),
            ),
        };
        self.inner.server_stream(&envelope).await
    }

    pub async fn update_deploy(
        &self,
        deployment_key: String,
        min_replicas: i32,
    ) -> Result<(), ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::UpdateDeploy(
                controller_proto::UpdateDeployRequest {
                    deployment_key,
                    min_replicas,
                },
            ))
            .await?
        {
            controller_proto::rpc_response::Response::UpdateDeploy(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn replace_deploy(
        &self,
        deployment_key: String,
        min_replicas: i32,
    ) -> Result<(), ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::ReplaceDeploy(
                controller_proto::ReplaceDeployRequest {
                    deployment_key,
                    min_replicas,
                },
            ))
            .await?
        {
            controller_proto::rpc_response::Response::ReplaceDeploy(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn status(&self) -> Result<controller_proto::StatusResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::Status(
                controller_proto::StatusRequest {},
            ))
            .await?
        {
            controller_proto::rpc_response::Response::Status(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn process_list(
        &self,
    ) -> Result<controller_proto::ProcessListResponse, ClientError> {
        match self
            .call(controller_proto::rpc_request::Request::ProcessList(
                controller_proto::ProcessListRequest {},
            ))
            .await?
        {
            controller_proto::rpc_response::Response::ProcessList(r) => Ok(r),
            other => Err(unexpected(&other)),
        }
    }

    /// Open the long-lived schema pull stream (one pass; callers wanting
    /// reconnection use [`crate::client::retry_server_stream`] with
    /// [`Self::pull_schema_request`]).
    pub async fn pull_schema(&self) -> Result<BiStream, ClientError> {
        self.inner
            .server_stream(&Self::pull_schema_request())
            .await
    }

    /// The request envelope for the schema pull stream.
    pub fn pull_schema_request() -> controller_proto::RpcRequest {
        controller_proto::RpcRequest {
            request: Some(controller_proto::rpc_request::Request::PullSchema(
                controller_proto::PullSchemaRequest {},
            )),
        }
    }

    /// Open the runner heartbeat client-stream.
    pub async fn register_runner(&self) -> Result<ClientStream, ClientError> {
        Ok(ClientStream {
            stream: self.inner.open_stream().await?,
        })
    }

    /// Open the deployment log client-stream.
    pub async fn stream_deployment_logs(&self) -> Result<ClientStream, ClientError> {
        Ok(ClientStream {
            stream: self.inner.open_stream().await?,
        })
    }
}

/// A client-stream: repeated request frames on one stream (runner heartbeats,
/// deployment logs).
pub struct ClientStream {
    stream: BiStream,
}

impl ClientStream {
    pub async fn send_heartbeat(
        &mut self,
        request: controller_proto::RegisterRunnerRequest,
    ) -> Result<(), ClientError> {
        self.send(controller_proto::rpc_request::Request::RegisterRunner(
            request,
        ))
        .await
    }

    pub async fn send_log(
        &mut self,
        entry: controller_proto::StreamDeploymentLogsRequest,
    ) -> Result<(), ClientError> {
        self.send(controller_proto::rpc_request::Request::DeploymentLog(entry))
            .await
    }

    async fn send(
        &mut self,
        request: controller_proto::rpc_request::Request,
    ) -> Result<(), ClientError> {
        let envelope = controller_proto::RpcRequest {
            request: Some(request),
        };
        self.stream.write_frame(&Frame::request(&envelope)?).await?;
        Ok(())
    }
}

/// Client for a runner's control service.
#[derive(Clone)]
pub struct RunnerClient {
    inner: Arc<TesseraClient>,
}

impl RunnerClient {
    pub fn new(inner: Arc<TesseraClient>) -> Self {
        Self { inner }
    }

    async fn call(
        &self,
        request: runner_proto::rpc_request::Request,
    ) -> Result<runner_proto::rpc_response::Response, ClientError> {
        let envelope = runner_proto::RpcRequest {
            request: Some(request),
        };
        let response: runner_proto::RpcResponse = self.inner.request(&envelope).await?;
        match response.response {
            Some(runner_proto::rpc_response::Response::Error(error)) => {
                Err(ClientError::Service(format!(
                    "{}: {}",
                    error.code, error.message
                )))
            }
            Some(response) => Ok(response),
            None => Err(ClientError::Service("empty response envelope".to_string())),
        }
    }

    pub async fn ping(&self) -> Result<runner_proto::PingResponse, ClientError> {
        match self
            .call(runner_proto::rpc_request::Request::Ping(
                runner_proto::PingRequest {},
            ))
            .await?
        {
            runner_proto::rpc_response::Response::Ping(r) => Ok(r),
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }

    pub async fn reserve(&self, reservation_timeout_ms: u64) -> Result<(), ClientError> {
        match self
            .call(runner_proto::rpc_request::Request::Reserve(
                runner_proto::ReserveRequest {
                    reservation_timeout_ms,
                },
            ))
            .await?
        {
            runner_proto::rpc_response::Response::Reserve(_) => Ok(()),
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }

    pub async fn deploy(&self, deployment_key: String) -> Result<(), ClientError> {
        match self
            .call(runner_proto::rpc_request::Request::Deploy(
                runner_proto::DeployRequest { deployment_key },
            ))
            .await?
        {
            runner_proto::rpc_response::Response::Deploy(_) => Ok(()),
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }

    pub async fn terminate(&self, deployment_key: String) -> Result<(), ClientError> {
        match self
            .call(runner_proto::rpc_request::Request::Terminate(
                runner_proto::TerminateRequest { deployment_key },
            ))
            .await?
        {
            runner_proto::rpc_response::Response::Terminate(_) => Ok(()),
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }
}

/// Client for the verb service.
#[derive(Clone)]
pub struct VerbClient {
    inner: Arc<TesseraClient>,
}

impl VerbClient {
    pub fn new(inner: Arc<TesseraClient>) -> Self {
        Self { inner }
    }

    pub async fn ping(&self) -> Result<verb_proto::PingResponse, ClientError> {
        let envelope = verb_proto::RpcRequest {
            request: Some(verb_proto::rpc_request::Request::Ping(
                verb_proto::PingRequest {},
            )),
        };
        let response: verb_proto::RpcResponse = self.inner.request(&envelope).await?;
        match response.response {
            Some(verb_proto::rpc_response::Response::Ping(r)) => Ok(r),
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }

    /// Call a verb; a verb-level error comes back as [`ClientError::Service`].
    pub async fn call(&self, verb: String, body: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let envelope = verb_proto::RpcRequest {
            request: Some(verb_proto::rpc_request::Request::Call(
                verb_proto::CallRequest { verb, body },
            )),
        };
        let response: verb_proto::RpcResponse = self.inner.request(&envelope).await?;
        match response.response {
            Some(verb_proto::rpc_response::Response::Call(call)) => match call.response {
                Some(verb_proto::call_response::Response::Body(body)) => Ok(body),
                Some(verb_proto::call_response::Response::Error(error)) => Err(
                    ClientError::Service(format!("{}: {}", error.code, error.message)),
                ),
                None => Err(ClientError::Service("empty call response".to_string())),
            },
            _ => Err(ClientError::Service("unexpected response".to_string())),
        }
    }
}

fn unexpected(response: &controller_proto::rpc_response::Response) -> ClientError {
    ClientError::Service(format!("unexpected response variant: {response:?}"))
}
